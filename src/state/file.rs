//! On-disk state file: a versioned JSON envelope around [`HubState`].

use super::model::HubState;
use crate::traits::{FileSystem, Output};
use anyhow::{Context, Result, bail};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Version written into new state files
pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    #[serde(rename = "$schemaVersion", default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
    #[serde(flatten)]
    pub state: HubState,
}

impl StateDocument {
    pub fn new(state: HubState) -> Self {
        Self {
            schema_version: Some(SCHEMA_VERSION.to_string()),
            generated_at: Some(chrono::Utc::now().to_rfc3339()),
            generated_by: Some(whoami::username()),
            state,
        }
    }
}

/// "1.0" -> 1.0.0
fn parse_version(raw: &str) -> Result<Version> {
    let padded = match raw.matches('.').count() {
        0 => format!("{}.0.0", raw),
        1 => format!("{}.0", raw),
        _ => raw.to_string(),
    };
    Version::parse(&padded).with_context(|| format!("Invalid state file schema version '{}'", raw))
}

/// Refuse files from a newer major version; warn on a newer minor
fn check_version(document: &StateDocument, output: &dyn Output) -> Result<()> {
    let Some(raw) = document.schema_version.as_deref() else {
        output.info("State file has no schema version, assuming the current format");
        return Ok(());
    };
    let found = parse_version(raw)?;
    let supported = parse_version(SCHEMA_VERSION)?;

    if found.major > supported.major {
        bail!(
            "State file schema version {} is not supported (this tool reads {})",
            raw,
            SCHEMA_VERSION
        );
    }
    if found.major == supported.major && found.minor > supported.minor {
        output.warning(&format!(
            "State file schema version {} is newer than {}; unknown fields are ignored",
            raw, SCHEMA_VERSION
        ));
    }
    Ok(())
}

pub fn write_state(fs: &dyn FileSystem, path: &Path, state: &HubState) -> Result<()> {
    let document = StateDocument::new(state.clone());
    let raw = serde_json::to_string_pretty(&document).context("Failed to serialize hub state")?;
    fs.write(path, &raw)
        .with_context(|| format!("Failed to write state file: {:?}", path))?;
    tracing::debug!(path = %path.display(), bytes = raw.len(), "state file written");
    Ok(())
}

pub fn read_state(fs: &dyn FileSystem, path: &Path, output: &dyn Output) -> Result<HubState> {
    if !fs.is_file(path) {
        bail!("State file not found: {:?}", path);
    }
    let raw = fs
        .read_to_string(path)
        .with_context(|| format!("Failed to read state file: {:?}", path))?;
    let document: StateDocument = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse state file: {:?}", path))?;
    check_version(&document, output)?;
    Ok(document.state)
}
