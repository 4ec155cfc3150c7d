use anyhow::{Context, Result};
use std::process::{Command, Output};
#[cfg(test)]
use std::sync::Mutex;

/// Trait for executing system commands, allowing for mocking in tests
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with arguments and return its captured output
    fn execute(&self, command: &str, args: &[&str]) -> Result<Output>;
}

/// Real command executor using std::process::Command
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<Output> {
        let output = Command::new(command)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run '{}'. Is it installed and on PATH?", command))?;

        Ok(output)
    }
}

/// Mock command executor for testing
///
/// Results are matched against the full command line (`command arg1 arg2 ...`)
/// by prefix, first match wins and is consumed.
#[cfg(test)]
pub struct MockCommandExecutor {
    outputs: Mutex<Vec<MockCommandResult>>,
    calls: Mutex<Vec<String>>,
}

#[cfg(test)]
#[derive(Clone, Debug)]
pub struct MockCommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
impl MockCommandResult {
    pub fn ok(command: &str, stdout: &str) -> Self {
        Self {
            command: command.to_string(),
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(command: &str, stderr: &str) -> Self {
        Self {
            command: command.to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

#[cfg(test)]
impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::with_outputs(Vec::new())
    }

    pub fn with_outputs(outputs: Vec<MockCommandResult>) -> Self {
        Self {
            outputs: Mutex::new(outputs),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Full command lines executed so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Default for MockCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl CommandExecutor for MockCommandExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<Output> {
        let line = std::iter::once(command)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line.clone());

        let mut outputs = self.outputs.lock().unwrap();
        if let Some(position) = outputs.iter().position(|r| line.starts_with(&r.command)) {
            let mock_result = outputs.remove(position);
            return Ok(Output {
                status: create_exit_status(mock_result.exit_code),
                stdout: mock_result.stdout.into_bytes(),
                stderr: mock_result.stderr.into_bytes(),
            });
        }

        // Default: successful empty output
        Ok(Output {
            status: create_exit_status(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

#[cfg(test)]
fn create_exit_status(code: i32) -> std::process::ExitStatus {
    // ExitStatus can't be constructed directly
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // Raw wait status carries the exit code in the high byte
        std::process::ExitStatus::from_raw(code << 8)
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_executor_matches_by_prefix() {
        let executor = MockCommandExecutor::with_outputs(vec![MockCommandResult::ok(
            "az iot hub list",
            "[]",
        )]);

        let output = executor
            .execute("az", &["iot", "hub", "list", "-o", "json"])
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "[]");
        assert_eq!(executor.calls(), vec!["az iot hub list -o json".to_string()]);
    }

    #[test]
    fn test_mock_executor_failure_exit_code() {
        let executor = MockCommandExecutor::with_outputs(vec![MockCommandResult::failed(
            "az group export",
            "boom",
        )]);

        let output = executor.execute("az", &["group", "export"]).unwrap();
        assert!(!output.status.success());
        assert_eq!(output.status.code(), Some(1));
    }

    #[test]
    fn test_mock_executor_default_success() {
        let executor = MockCommandExecutor::new();
        let output = executor.execute("unknown", &[]).unwrap();
        assert!(output.status.success());
    }
}
