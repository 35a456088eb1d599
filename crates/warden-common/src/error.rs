//! Error types for Warden
//!
//! `LockError` covers every failure the lock coordination engine can report.
//! Acquisition failures are policy-gated by callers, configuration failures
//! are always fatal, and storage failures stay inside the quorum protocol.

/// Lock coordination error types
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("lock coordinator has not been initialized")]
    UninitializedCoordinator,

    #[error("invalid duration type: {0}")]
    InvalidDurationType(String),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("unable to acquire lock '{resource}' after {attempts} attempt(s)")]
    LockAcquisition { resource: String, attempts: u32 },

    #[error("storage node '{node}' error: {message}")]
    Storage { node: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl LockError {
    pub fn storage(node: impl Into<String>, message: impl ToString) -> Self {
        LockError::Storage {
            node: node.into(),
            message: message.to_string(),
        }
    }

    /// True when the lock could not be obtained from the quorum (contention,
    /// unreachable nodes, or a closed store).
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(self, LockError::LockAcquisition { .. })
    }

    /// True for programmer errors that will not go away on retry.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            LockError::UninitializedCoordinator
                | LockError::InvalidDurationType(_)
                | LockError::InvalidSchedule { .. }
                | LockError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
