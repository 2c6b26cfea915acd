use thiserror::Error;

/// Convenience type alias for Results with QuorumError
pub type Result<T> = std::result::Result<T, QuorumError>;

/// Main error type for Quorum Core
///
/// Every failure in the system is one of these variants. Validation and
/// policy errors surface to the caller immediately; conflicts are retried
/// by the caller with refreshed state; transient dependency errors are
/// retried internally and only surfaced once exhausted.
#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("invalid argument at {path}: {message}")]
    InvalidArgument { path: String, message: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting state for task {task_id}: expected {expected}, found {actual}")]
    ConflictingState {
        task_id: String,
        expected: String,
        actual: String,
    },

    #[error("no eligible agent: {0}")]
    NoEligibleAgent(String),

    #[error("too many in-flight tool calls")]
    Busy,

    #[error("unknown method: {0}")]
    MethodNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no proposals received for task {0}")]
    NoProposals(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage corruption: {0}")]
    StorageCorrupt(String),

    #[error("agent transport error for {agent_id}: {message}")]
    AgentTransport {
        agent_id: String,
        message: String,
        transient: bool,
    },

    #[error("agent call failed: {0}")]
    AgentHttp(#[from] reqwest::Error),

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("configuration parse error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl QuorumError {
    /// Validation helper used by the tool surface: names the offending
    /// parameter path so callers can fix the exact field.
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        QuorumError::InvalidArgument {
            path: path.into(),
            message: message.into(),
        }
    }

    /// JSON-RPC error code for this failure.
    pub fn rpc_code(&self) -> i64 {
        match self {
            QuorumError::TaskNotFound(_) | QuorumError::NotFound(_) => -32001,
            QuorumError::ConflictingState { .. } => -32002,
            QuorumError::NoEligibleAgent(_) => -32003,
            QuorumError::Busy => -32004,
            QuorumError::Unauthorized(_) => -32005,
            QuorumError::NoProposals(_) => -32006,
            QuorumError::InvalidArgument { .. } => -32602,
            QuorumError::MethodNotFound(_) => -32601,
            _ => -32000,
        }
    }

    /// Hint for callers that should retry after a short delay.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            QuorumError::Busy => Some(250),
            QuorumError::ConflictingState { .. } => Some(50),
            _ => None,
        }
    }

    /// Transient failures are retried internally with back-off before
    /// being surfaced as permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            QuorumError::AgentTransport { transient, .. } => *transient,
            QuorumError::Timeout { .. } | QuorumError::Busy => true,
            QuorumError::AgentHttp(e) => e.is_timeout() || e.is_connect(),
            QuorumError::Storage(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }
}
