//! Error types for Taskmux.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TaskmuxError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Capture failed for {target}: {message}")]
    CaptureFailed { target: String, message: String },

    #[error("Capture timed out for {target} after {seconds}s")]
    CaptureTimeout { target: String, seconds: u64 },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Input delivery failed for {target}: {message}")]
    InputFailed { target: String, message: String },

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl TaskmuxError {
    /// Capture faults (unreachable pane, timeout) are recoverable per-session
    /// monitoring failures, never fatal.
    pub fn is_capture_fault(&self) -> bool {
        matches!(
            self,
            TaskmuxError::CaptureFailed { .. } | TaskmuxError::CaptureTimeout { .. }
        )
    }
}
