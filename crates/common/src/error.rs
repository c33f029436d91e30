//! Unified error type for the adaptive control layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("{0}")]
    Other(String),
}
