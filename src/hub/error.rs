use thiserror::Error;

/// Errors raised while talking to a hub or its surrounding resources
#[derive(Debug, Error)]
pub enum HubError {
    /// Hub (or DPS) could not be located in the subscription
    #[error("{0}")]
    NotFound(String),

    /// No usable shared access policy
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// Mutually exclusive or missing arguments
    #[error("Invalid arguments: {0}")]
    InvalidArgument(String),

    /// A specific remote entity does not exist (HTTP 404, az ResourceNotFound)
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The control-plane deployment of the hub failed
    #[error("Deployment failed: {0}")]
    Deployment(String),

    /// Non-success response from a REST endpoint
    #[error("Request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    /// A CLI invocation exited unsuccessfully
    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    /// A response or document could not be interpreted
    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// Transport-level failure (process spawn, connection, I/O)
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl HubError {
    pub fn parse(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            message: err.to_string(),
        }
    }

    /// Whether the error means the entity is already absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ResourceNotFound(_) | Self::NotFound(_) => true,
            Self::Api { status, .. } => *status == 404,
            _ => false,
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;
