//! Thin wrapper over the Azure CLI for management-plane calls.

use super::error::{HubError, HubResult};
use crate::traits::CommandExecutor;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

lazy_static! {
    static ref NOT_FOUND_PATTERN: Regex = Regex::new(
        r"(?i)(ResourceNotFound|ResourceGroupNotFound|NotFound\b|could not be found|was not found|does not exist)"
    )
    .expect("static regex");
}

/// Invokes `az <args> -o json` and decodes the JSON result
#[derive(Clone)]
pub struct AzCli {
    executor: Arc<dyn CommandExecutor>,
    az_path: String,
}

impl AzCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, az_path: impl Into<String>) -> Self {
        Self {
            executor,
            az_path: az_path.into(),
        }
    }

    /// Run a command and return its JSON output (`Null` when it prints nothing)
    pub fn invoke(&self, args: &[&str]) -> HubResult<Value> {
        let mut full_args: Vec<&str> = args.to_vec();
        full_args.extend(["-o", "json", "--only-show-errors"]);
        let command_line = format!("az {}", args.join(" "));
        tracing::debug!(command = %command_line, "invoking Azure CLI");

        let output = self.executor.execute(&self.az_path, &full_args)?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            if NOT_FOUND_PATTERN.is_match(&stderr) {
                return Err(HubError::ResourceNotFound(stderr));
            }
            return Err(HubError::Command {
                command: command_line,
                message: if stderr.is_empty() {
                    format!("exit status {:?}", output.status.code())
                } else {
                    stderr
                },
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| HubError::parse(format!("output of '{}'", command_line), e))
    }

    /// Run a command and deserialize its JSON output
    pub fn invoke_as<T: DeserializeOwned>(&self, args: &[&str]) -> HubResult<T> {
        let value = self.invoke(args)?;
        serde_json::from_value(value)
            .map_err(|e| HubError::parse(format!("output of 'az {}'", args.join(" ")), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockCommandExecutor, MockCommandResult};

    #[test]
    fn test_invoke_appends_json_output() {
        let executor = Arc::new(MockCommandExecutor::with_outputs(vec![
            MockCommandResult::ok("az iot hub list", r#"[{"name":"hub1"}]"#),
        ]));
        let az = AzCli::new(executor.clone(), "az");

        let value = az.invoke(&["iot", "hub", "list"]).unwrap();

        assert_eq!(value[0]["name"], "hub1");
        assert_eq!(
            executor.calls(),
            vec!["az iot hub list -o json --only-show-errors".to_string()]
        );
    }

    #[test]
    fn test_invoke_maps_not_found() {
        let executor = Arc::new(MockCommandExecutor::with_outputs(vec![
            MockCommandResult::failed(
                "az identity show",
                "(ResourceNotFound) The Resource 'id1' under resource group 'rg' was not found.",
            ),
        ]));
        let az = AzCli::new(executor, "az");

        let err = az.invoke(&["identity", "show", "--ids", "id1"]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invoke_maps_other_failures() {
        let executor = Arc::new(MockCommandExecutor::with_outputs(vec![
            MockCommandResult::failed("az group export", "AuthorizationFailed"),
        ]));
        let az = AzCli::new(executor, "az");

        let err = az.invoke(&["group", "export"]).unwrap_err();
        assert!(!err.is_not_found());
        match err {
            HubError::Command { command, message } => {
                assert_eq!(command, "az group export");
                assert_eq!(message, "AuthorizationFailed");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_output_is_null() {
        let az = AzCli::new(Arc::new(MockCommandExecutor::new()), "az");
        assert_eq!(az.invoke(&["iot", "hub", "certificate", "delete"]).unwrap(), Value::Null);
    }
}
