//! Error taxonomy for the context-compression runtime
//!
//! Parser-level malformed input and threshold crossings are deliberately not
//! represented here: the parser drops offending lines and keeps its state,
//! and threshold changes are emitted as events.

/// Runtime error type
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("summarizer failed: {0}")]
    Summarizer(String),

    #[error("sync item {id} failed after {attempts} attempts: {message}")]
    SyncFailed {
        id: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Runtime result type
pub type Result<T> = std::result::Result<T, ContextError>;

impl ContextError {
    /// Whether the orchestrator recovers from this error locally instead of
    /// surfacing it to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ContextError::Summarizer(_) | ContextError::SyncFailed { .. }
        )
    }
}
