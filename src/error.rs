//! Unified error handling for hipstrom
//!
//! Errors fall into four families that callers must treat differently:
//! - Resource exhaustion on the device. This is *not* an error value: the
//!   allocator reports it as `Ok(None)` so the task pipeline can requeue.
//! - Driver/runtime failures (`Hip`), fatal for the current operation.
//! - Allocator and pipeline invariant violations (`Internal`), logged loudly.
//! - Kernel-reported execution failures (`TaskFailed`), carried on the task
//!   and raised once the task reaches the ready queue.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::hip_backend::HipError;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for hipstrom
#[derive(Debug, thiserror::Error)]
pub enum StromError {
    // ========== Backend Errors ==========
    /// Device runtime call failed
    #[error("HIP error: {0}")]
    Hip(#[from] HipError),

    /// No device passed the capability gate
    #[error("no supported GPU devices found")]
    NoDevices,

    /// Process-wide device registry was used before initialisation
    #[error("device registry is not initialized")]
    RegistryNotInitialized,

    /// Device index outside the context's device array
    #[error("device index {index} out of range ({count} devices)")]
    DeviceIndexOutOfRange { index: usize, count: usize },

    // ========== Allocator Errors ==========
    /// Request exceeds the per-installation maximum allocation size
    #[error("device memory request of {requested} bytes exceeds the limit of {limit} bytes")]
    AllocationTooLarge { requested: usize, limit: usize },

    /// Host scratch arena reached its ceiling
    #[error("scratch arena exhausted: requested {requested} bytes, ceiling {limit} bytes")]
    ScratchExhausted { requested: usize, limit: usize },

    // ========== Launch Geometry Errors ==========
    /// Kernel cannot be launched within the device's shared memory budget
    #[error("workgroup sizing failed: {0}")]
    WorkgroupSize(String),

    // ========== Task Pipeline Errors ==========
    /// A task reported a failure code from the device or completion callback
    #[error("GPU task failed: {}", .code.error_text())]
    TaskFailed { code: TaskErrorCode },

    /// Waiting for tasks was interrupted by a cancel request
    #[error("operation cancelled while waiting for GPU tasks")]
    Cancelled,

    /// Task state machine was asked for an impossible transition
    #[error("invalid task state: {0}")]
    InvalidTaskState(String),

    // ========== Configuration Errors ==========
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Internal invariant violated (allocator or pipeline bug)
    #[error("internal error: {0}")]
    Internal(String),

    /// Lock poisoned by a panicking thread
    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StromError {
    /// Classify the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            StromError::InvalidConfiguration(_)
            | StromError::AllocationTooLarge { .. }
            | StromError::DeviceIndexOutOfRange { .. } => ErrorCategory::User,

            StromError::ScratchExhausted { .. } | StromError::Cancelled => {
                ErrorCategory::Recoverable
            }

            StromError::Hip(e) if e.is_out_of_memory() => ErrorCategory::Recoverable,

            StromError::Hip(_)
            | StromError::NoDevices
            | StromError::RegistryNotInitialized
            | StromError::WorkgroupSize(_) => ErrorCategory::Backend,

            StromError::TaskFailed { .. } => ErrorCategory::Execution,

            StromError::InvalidTaskState(_)
            | StromError::Internal(_)
            | StromError::LockPoisoned(_)
            | StromError::Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable (temporary condition)
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - User: invalid request or configuration
/// - Recoverable: retry after waiting
/// - Internal: log and report as bug
/// - Backend: driver or device failure
/// - Execution: kernel reported a failure for a batch of rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    Recoverable,
    Internal,
    Backend,
    Execution,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Execution => write!(f, "Execution"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for StromError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StromError::LockPoisoned(err.to_string())
    }
}

/// Result type using `StromError`
pub type StromResult<T> = std::result::Result<T, StromError>;

/// Status code reported by a kernel or a completion callback for one task
///
/// Codes other than `Success` are surfaced to the consumer when the task is
/// fetched from the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskErrorCode {
    #[default]
    Success,
    /// Some rows must be re-evaluated on the CPU
    CpuReCheck,
    /// Kernel hit an internal error
    Internal,
    /// Kernel ran out of device memory
    OutOfMemory,
    /// Kernel ran out of shared memory
    OutOfSharedMemory,
    /// Data store content is corrupted
    DataStoreCorruption,
    /// Data store has no space left for results
    DataStoreNoSpace,
    /// Kernel addressed a data store out of range
    DataStoreOutOfRange,
    /// Kernel-side sanity check failed
    SanityCheckViolation,
    /// Raw status code from the device runtime
    Device(i32),
}

impl TaskErrorCode {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskErrorCode::Success)
    }

    /// Human readable text for this code
    pub fn error_text(&self) -> String {
        match self {
            TaskErrorCode::Success => "success".to_string(),
            TaskErrorCode::CpuReCheck => "CPU re-check required".to_string(),
            TaskErrorCode::Internal => "internal error in GPU kernel".to_string(),
            TaskErrorCode::OutOfMemory => "out of device memory".to_string(),
            TaskErrorCode::OutOfSharedMemory => "out of shared memory".to_string(),
            TaskErrorCode::DataStoreCorruption => "data store corruption".to_string(),
            TaskErrorCode::DataStoreNoSpace => "data store has no space".to_string(),
            TaskErrorCode::DataStoreOutOfRange => "data store access out of range".to_string(),
            TaskErrorCode::SanityCheckViolation => "sanity check violation".to_string(),
            TaskErrorCode::Device(code) => format!("device runtime error {}", code),
        }
    }
}

impl fmt::Display for TaskErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            StromError::AllocationTooLarge {
                requested: 10,
                limit: 5
            }
            .category(),
            ErrorCategory::User
        );
        assert_eq!(StromError::Cancelled.category(), ErrorCategory::Recoverable);
        assert_eq!(
            StromError::Hip(HipError::OutOfMemory("hipMalloc".into())).category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            StromError::Hip(HipError::DeviceError("boom".into())).category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            StromError::TaskFailed {
                code: TaskErrorCode::DataStoreNoSpace
            }
            .category(),
            ErrorCategory::Execution
        );
        assert!(StromError::Internal("x".into()).is_internal_error());
    }

    #[test]
    fn test_task_failed_message_carries_text() {
        let err = StromError::TaskFailed {
            code: TaskErrorCode::OutOfSharedMemory,
        };
        assert_eq!(err.to_string(), "GPU task failed: out of shared memory");

        let err = StromError::TaskFailed {
            code: TaskErrorCode::Device(700),
        };
        assert!(err.to_string().contains("700"));
    }

    #[test]
    fn test_poison_conversion() {
        let lock = std::sync::Mutex::new(0);
        let _ = std::panic::catch_unwind(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison");
        });
        let err: StromError = lock.lock().unwrap_err().into();
        assert!(matches!(err, StromError::LockPoisoned(_)));
    }
}
