/// Error types for the triage daemon.
use thiserror::Error;

/// API-facing error with an HTTP status.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error: {0}")]
    ServerError(String),
}

impl DaemonError {
    pub fn status(&self) -> u16 {
        match self {
            DaemonError::BadRequest(_) => 400,
            DaemonError::NotFound(_) => 404,
            DaemonError::Unauthorized => 401,
            DaemonError::ServerError(_) => 500,
        }
    }
}

impl From<triage_core::errors::StoreError> for DaemonError {
    fn from(e: triage_core::errors::StoreError) -> Self {
        match e {
            triage_core::errors::StoreError::NotFound(what) => DaemonError::NotFound(what),
            other => DaemonError::ServerError(other.to_string()),
        }
    }
}

impl From<triage_core::errors::RuleError> for DaemonError {
    fn from(e: triage_core::errors::RuleError) -> Self {
        match e {
            triage_core::errors::RuleError::NotFound(id) => {
                DaemonError::NotFound(format!("rule {}", id))
            }
            other => DaemonError::BadRequest(other.to_string()),
        }
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
