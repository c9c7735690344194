//! Device backends
//!
//! `hip_backend` wraps the ROCm driver; `sim` is an in-process runtime used
//! by the test suite and on hosts without a GPU.

pub mod hip_backend;
pub mod sim;

pub use hip_backend::*;
pub use sim::{CompletionMode, SimCounters, SimDevice, SimKernel, SimRuntime, SimRuntimeBuilder};
