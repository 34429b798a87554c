// Error types for orchestration

use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Rule violated by a decomposition response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompositionError {
    /// The backend answered without calling the structural tool.
    #[error("decomposition response contained no tool call; expected a call to '{expected}'")]
    NoToolCall {
        /// Name of the required tool
        expected: String,
    },

    /// The backend called some other tool.
    #[error("decomposition called '{actual}' instead of the required tool '{expected}'")]
    WrongTool {
        /// Name of the required tool
        expected: String,
        /// Name the backend actually called
        actual: String,
    },

    /// The structural tool rejected the payload.
    #[error("decomposition payload rejected: {0}")]
    InvalidPayload(String),
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The selected backend cannot make structured tool calls
    #[error("Backend '{selector}' does not support structured tool calls")]
    CapabilityUnsupported {
        /// Selector that was rejected
        selector: String,
    },

    /// No tool is registered or discovered
    #[error("No tools are available for this run")]
    NoToolsAvailable,

    /// Decomposition contract violated
    #[error("Decomposition failed: {0}")]
    Decomposition(#[from] DecompositionError),

    /// Too many concurrent fan-out sessions
    #[error("Concurrent session limit ({limit}) reached")]
    SessionLimitReached {
        /// Configured cap
        limit: usize,
    },

    /// Comparison slots outside 1..=3
    #[error("Comparison requires 1-3 backend slots, got {0}")]
    InvalidSlotCount(usize),

    /// Unknown session id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Operation attempted in the wrong session phase
    #[error("Session is in phase '{actual}', expected '{expected}'")]
    InvalidSessionState {
        /// Phase the operation requires
        expected: String,
        /// Phase the session is in
        actual: String,
    },

    /// Unknown subtask id
    #[error("Subtask not found: {0}")]
    SubtaskNotFound(String),

    /// Tool execution failed
    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(#[from] conductor_abstraction::ModelError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    Config(String),

    /// Orchestration cancelled
    #[error("Orchestration cancelled")]
    Cancelled,

    /// Other error
    #[error("Orchestration error: {0}")]
    Other(String),
}
