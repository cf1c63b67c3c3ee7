//! Unified error types for arbor

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all arbor operations
#[derive(Error, Debug)]
pub enum ArborError {
    // Process errors
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process crashed: {0}")]
    ProcessCrash(String),

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    // Supervision errors
    #[error("Monitor failure: {0}")]
    MonitorFailure(String),

    #[error("Circuit open for {class} (retry in {retry_in_ms}ms)")]
    CircuitOpen { class: String, retry_in_ms: u64 },

    #[error("Bulkhead full for {0}")]
    BulkheadFull(String),

    // Store errors
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Record is terminal and cannot change: {0}")]
    TerminalRecord(String),

    #[error("Run is closed to new workers: {0}")]
    RunClosed(String),

    // Configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl ArborError {
    /// Whether a retry may succeed.
    ///
    /// Spawn failures (missing binary, permissions) and contract violations
    /// are fatal; everything else is worth another attempt.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Spawn(_)
                | Self::Config(_)
                | Self::Cancelled
                | Self::TerminalRecord(_)
                | Self::RunClosed(_)
        )
    }
}

/// Result type alias using ArborError
pub type Result<T> = std::result::Result<T, ArborError>;
