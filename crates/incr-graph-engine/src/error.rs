//! Error types for the execution engine.

use incr_graph_core::EdgeId;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during engine operations.
///
/// Failing user code is not an error: it is captured as `stderr` on the
/// recorded execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A session with this name already exists for the file.
    #[error("session {session:?} already exists for {file}")]
    DuplicateSession { file: String, session: String },

    /// An operation referenced an edge that does not exist.
    #[error("unknown edge: {edge_id}")]
    UnknownEdge { edge_id: EdgeId },

    /// No graph is loaded under this file key.
    #[error("file not loaded: {file}")]
    FileNotFound { file: String },

    /// The referenced session does not exist.
    #[error("session {session:?} not found for {file}")]
    SessionNotFound { file: String, session: String },

    /// The execution runner could not be reached (interpreter missing, process
    /// failed to spawn, ...).
    #[error("execution runner unavailable: {message}")]
    RunnerUnavailable { message: String },

    /// A persisted state snapshot could not be parsed.
    #[error("malformed state snapshot for session {session:?}: {message}")]
    MalformedState { session: String, message: String },

    /// A spawned execution task panicked or was aborted.
    #[error("execution task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (file operations).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Create a runner-unavailable error.
    pub fn runner_unavailable(message: impl Into<String>) -> Self {
        Self::RunnerUnavailable {
            message: message.into(),
        }
    }

    /// Whether the error should be shown to the user rather than only logged.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::DuplicateSession { .. } | Self::RunnerUnavailable { .. }
        )
    }
}
