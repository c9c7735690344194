//! HIP error types

use thiserror::Error;

/// Errors returned by the device runtime
///
/// `OutOfMemory` is kept apart from every other failure: the allocator turns
/// it into a retry signal instead of aborting the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HipError {
    #[error("HIP initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Out of device memory: {0}")]
    OutOfMemory(String),
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),
    #[error("Memory release failed: {0}")]
    MemoryFreeFailed(String),
    #[error("Context error: {0}")]
    ContextError(String),
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error("Kernel loading failed: {0}")]
    KernelLoadFailed(String),
    #[error("Kernel launch failed: {0}")]
    KernelLaunchFailed(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(i32),
    #[error("Device error: {0}")]
    DeviceError(String),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for HipError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        HipError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// HIP result type
pub type HipResult<T> = Result<T, HipError>;

impl HipError {
    /// Raw allocation could not be satisfied; the caller may back off and retry
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, HipError::OutOfMemory(_))
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Only device memory exhaustion qualifies. Every other driver failure is
    /// fatal for the current operation.
    pub fn is_recoverable(&self) -> bool {
        self.is_out_of_memory()
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_out_of_memory_is_recoverable() {
        assert!(HipError::OutOfMemory("hipMalloc".into()).is_recoverable());
        assert!(HipError::MemoryAllocationFailed("bad ptr".into()).is_permanent());
        assert!(HipError::ContextError("destroyed".into()).is_permanent());
        assert!(HipError::DeviceNotFound(3).is_permanent());
    }
}
