/// Error types for the triage orchestration system.
use thiserror::Error;

/// Operator-visible failure taxonomy for failed tasks.
///
/// Every failed task carries exactly one kind; the kind plus a sanitized
/// message is what clients and webhooks see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BadRequest,
    ArtifactFetch,
    DecryptFailure,
    ExtractFailure,
    RuleSelectFailure,
    AgentUnavailable,
    AgentTimeout,
    AgentCrash,
    ParseFailure,
    Cancelled,
    ServerRestart,
}

impl FailureKind {
    /// Stable label used in the persisted `error` column and API payloads.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::BadRequest => "BadRequest",
            FailureKind::ArtifactFetch => "ArtifactFetch",
            FailureKind::DecryptFailure => "DecryptFailure",
            FailureKind::ExtractFailure => "ExtractFailure",
            FailureKind::RuleSelectFailure => "RuleSelectFailure",
            FailureKind::AgentUnavailable => "AgentUnavailable",
            FailureKind::AgentTimeout => "AgentTimeout",
            FailureKind::AgentCrash => "AgentCrash",
            FailureKind::ParseFailure => "ParseFailure",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::ServerRestart => "ServerRestart",
        }
    }

    /// Whether a client may reasonably retry by creating a new task.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            FailureKind::BadRequest | FailureKind::RuleSelectFailure | FailureKind::Cancelled
        )
    }

    /// Parse a label back into a kind (inverse of [`FailureKind::label`]).
    pub fn from_label(label: &str) -> Option<Self> {
        Some(match label {
            "BadRequest" => FailureKind::BadRequest,
            "ArtifactFetch" => FailureKind::ArtifactFetch,
            "DecryptFailure" => FailureKind::DecryptFailure,
            "ExtractFailure" => FailureKind::ExtractFailure,
            "RuleSelectFailure" => FailureKind::RuleSelectFailure,
            "AgentUnavailable" => FailureKind::AgentUnavailable,
            "AgentTimeout" => FailureKind::AgentTimeout,
            "AgentCrash" => FailureKind::AgentCrash,
            "ParseFailure" => FailureKind::ParseFailure,
            "Cancelled" => FailureKind::Cancelled,
            "ServerRestart" => FailureKind::ServerRestart,
            _ => return None,
        })
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Core error type for rule catalog and engine operations.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Rule file parse error in {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Duplicate rule id: {0}")]
    DuplicateId(String),

    #[error("Dependency cycle involving rule: {0}")]
    DependencyCycle(String),

    #[error("Invalid pre-extract pattern '{pattern}' in rule {rule_id}: {message}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        message: String,
    },

    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Catalog has no fallback rule")]
    MissingFallback,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for rule operations.
pub type RuleResult<T> = Result<T, RuleError>;

/// Core error type for workspace materialization.
#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("Artifact fetch failed for '{name}': {message}")]
    FetchFailed { name: String, message: String },

    #[error("Decrypt failed for '{name}': {message}")]
    DecryptFailed { name: String, message: String },

    #[error("Archive entry escapes workspace: {0}")]
    PathTraversal(String),

    #[error("Archive entry '{name}' exceeds per-entry limit ({size} bytes)")]
    EntryTooLarge { name: String, size: u64 },

    #[error("Uncompressed size exceeds workspace ceiling ({0} bytes)")]
    QuotaExceeded(u64),

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Stage deadline exceeded: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for materializer operations.
pub type MaterializeResult<T> = Result<T, MaterializeError>;

impl MaterializeError {
    /// Map a materializer failure onto the operator-visible taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            MaterializeError::FetchFailed { .. } => FailureKind::ArtifactFetch,
            MaterializeError::DecryptFailed { .. } => FailureKind::DecryptFailure,
            MaterializeError::PathTraversal(_)
            | MaterializeError::EntryTooLarge { .. }
            | MaterializeError::QuotaExceeded(_)
            | MaterializeError::UnsupportedFormat(_) => FailureKind::ExtractFailure,
            MaterializeError::Timeout(_) => FailureKind::ArtifactFetch,
            MaterializeError::IoError(_) => FailureKind::ExtractFailure,
        }
    }
}

/// Core error type for agent runner operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Agent timed out after {0} seconds")]
    Timeout(u64),

    #[error("Agent cancelled")]
    Cancelled,

    #[error("Agent exited with status {status}: {stderr_tail}")]
    Crashed { status: i32, stderr_tail: String },

    #[error("No enabled agent provider is available")]
    NoProviderAvailable,

    #[error("Unknown agent provider: {0}")]
    UnknownProvider(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AgentError::Timeout(_) => FailureKind::AgentTimeout,
            AgentError::Cancelled => FailureKind::Cancelled,
            AgentError::Crashed { .. } => FailureKind::AgentCrash,
            AgentError::NoProviderAvailable | AgentError::UnknownProvider(_) => {
                FailureKind::AgentUnavailable
            }
            AgentError::SpawnFailed(_) | AgentError::IoError(_) => FailureKind::AgentCrash,
        }
    }
}

/// Core error type for transcript parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("No structured result block found in transcript")]
    NoStructuredBlock,

    #[error("Structured block is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Result type for parser operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Core error type for the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Pipeline-level failure: a taxonomy kind plus a sanitized message.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct PipelineFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The `error` column format: `<kind>: <message>`.
    pub fn to_error_string(&self) -> String {
        format!("{}: {}", self.kind.label(), self.message)
    }
}

impl From<MaterializeError> for PipelineFailure {
    fn from(e: MaterializeError) -> Self {
        PipelineFailure::new(e.failure_kind(), e.to_string())
    }
}

impl From<AgentError> for PipelineFailure {
    fn from(e: AgentError) -> Self {
        PipelineFailure::new(e.failure_kind(), e.to_string())
    }
}

impl From<ParseError> for PipelineFailure {
    fn from(e: ParseError) -> Self {
        PipelineFailure::new(FailureKind::ParseFailure, e.to_string())
    }
}

/// Result type for pipeline stages.
pub type PipelineResult<T> = Result<T, PipelineFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_label_roundtrip() {
        for kind in [
            FailureKind::BadRequest,
            FailureKind::ArtifactFetch,
            FailureKind::DecryptFailure,
            FailureKind::ExtractFailure,
            FailureKind::RuleSelectFailure,
            FailureKind::AgentUnavailable,
            FailureKind::AgentTimeout,
            FailureKind::AgentCrash,
            FailureKind::ParseFailure,
            FailureKind::Cancelled,
            FailureKind::ServerRestart,
        ] {
            assert_eq!(FailureKind::from_label(kind.label()), Some(kind));
        }
    }

    #[test]
    fn test_retry_hints() {
        assert!(!FailureKind::BadRequest.retryable());
        assert!(!FailureKind::RuleSelectFailure.retryable());
        assert!(FailureKind::AgentTimeout.retryable());
        assert!(FailureKind::ServerRestart.retryable());
    }

    #[test]
    fn test_pipeline_failure_error_string() {
        let failure = PipelineFailure::new(FailureKind::AgentTimeout, "provider exceeded 300s");
        assert_eq!(
            failure.to_error_string(),
            "AgentTimeout: provider exceeded 300s"
        );
    }
}
