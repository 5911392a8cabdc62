//! Common error types for BatchLoop
//!
//! This module defines all error types used across the BatchLoop system.
//! The enum is `Clone` so a single batched-execution fault can be replayed
//! to every member of the round that produced it.

use thiserror::Error;

/// Main error type for BatchLoop
#[derive(Error, Debug, Clone)]
pub enum BatchLoopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Buffer shape disagreement, local to one caller
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Execution engine fault (batched or fallback)
    #[error("Executor fault: {0}")]
    Executor(String),

    /// Slot allocation failure (worker full or terminating)
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// The scheduler is being torn down
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Request lifecycle misuse
    #[error("Invalid request state transition: {from} -> {to}")]
    InvalidState {
        from: &'static str,
        to: &'static str,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchLoopError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BatchLoopError::Config(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        BatchLoopError::ShapeMismatch(msg.into())
    }

    /// Create an executor fault
    pub fn executor(msg: impl Into<String>) -> Self {
        BatchLoopError::Executor(msg.into())
    }

    /// Create a no-capacity error
    pub fn no_capacity(msg: impl Into<String>) -> Self {
        BatchLoopError::NoCapacity(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BatchLoopError::Internal(msg.into())
    }

    /// Whether this error came from teardown
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, BatchLoopError::ShuttingDown)
    }
}

/// Result type alias for BatchLoop operations
pub type Result<T> = std::result::Result<T, BatchLoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BatchLoopError::executor("device reset");
        assert_eq!(err.to_string(), "Executor fault: device reset");

        let err = BatchLoopError::InvalidState {
            from: "Completed",
            to: "Running",
        };
        assert!(err.to_string().contains("Completed -> Running"));
    }

    #[test]
    fn test_shared_fault_clones() {
        let fault = BatchLoopError::executor("out of device memory");
        let replayed: Vec<BatchLoopError> = (0..4).map(|_| fault.clone()).collect();

        for err in replayed {
            assert!(matches!(err, BatchLoopError::Executor(_)));
        }
    }

    #[test]
    fn test_is_shutting_down() {
        assert!(BatchLoopError::ShuttingDown.is_shutting_down());
        assert!(!BatchLoopError::config("bad").is_shutting_down());
    }
}
