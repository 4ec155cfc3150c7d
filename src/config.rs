//! Layered settings: built-in defaults, then an optional YAML file, then
//! `IOTHUB_STATE_*` environment variables.

use crate::traits::FileSystem;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CONFIG_PATH_ENV: &str = "IOTHUB_STATE_CONFIG";
const CONFIG_DIR: &str = "iothub-state";
const CONFIG_FILE: &str = "config.yaml";

/// Data-plane REST API version
pub const DEFAULT_API_VERSION: &str = "2021-04-12";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// Azure CLI executable used for management-plane calls
    pub az_path: String,
    /// IoT Hub data-plane API version
    pub api_version: String,
    /// Page size when listing configurations
    pub configuration_page_size: usize,
    /// Degree of parallelism for device fetch and replay; 1 is sequential
    pub workers: usize,
    /// Lifetime of generated SAS tokens
    pub sas_ttl_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            az_path: "az".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            configuration_page_size: 100,
            workers: 1,
            sas_ttl_secs: 3600,
        }
    }
}

impl Settings {
    /// Load settings from the config file (if any) and the process environment
    pub fn load(fs: &dyn FileSystem) -> Result<Self> {
        let mut settings = match Self::config_path() {
            Some(path) if fs.is_file(&path) => {
                let raw = fs.read_to_string(&path)?;
                serde_yaml::from_str::<Self>(&raw)
                    .with_context(|| format!("Failed to parse config file: {:?}", path))?
            }
            _ => Self::default(),
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Location of the YAML config file
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Overlay environment values; `lookup` is injected so tests don't touch the real env
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("IOTHUB_STATE_AZ_PATH") {
            self.az_path = value;
        }
        if let Some(value) = lookup("IOTHUB_STATE_API_VERSION") {
            self.api_version = value;
        }
        if let Some(value) = lookup("IOTHUB_STATE_WORKERS") {
            self.workers = value
                .parse()
                .with_context(|| format!("IOTHUB_STATE_WORKERS must be a number, got '{}'", value))?;
        }
        if let Some(value) = lookup("IOTHUB_STATE_CONFIG_PAGE_SIZE") {
            self.configuration_page_size = value.parse().with_context(|| {
                format!(
                    "IOTHUB_STATE_CONFIG_PAGE_SIZE must be a number, got '{}'",
                    value
                )
            })?;
        }
        if let Some(value) = lookup("IOTHUB_STATE_SAS_TTL_SECS") {
            self.sas_ttl_secs = value.parse().with_context(|| {
                format!("IOTHUB_STATE_SAS_TTL_SECS must be a number, got '{}'", value)
            })?;
        }
        Ok(())
    }

    /// Override the worker count from the command line
    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        if let Some(workers) = workers {
            self.workers = workers.max(1);
        }
        self
    }
}
