//! hipstrom - asynchronous GPU offload runtime for relational scans
//!
//! Building blocks for pushing scan and join work onto AMD GPUs through
//! the HIP driver API:
//!
//! - [`memory`]: per-device segmented allocator and pinned host scratch arena
//! - [`context`]: reference-counted device context pool, one per resource scope
//! - [`scheduler`]: pipeline of asynchronous tasks with backpressure
//! - [`kernels`]: launch geometry from occupancy and shared-memory limits
//!
//! Without the `rocm` feature the crate runs against the in-process
//! simulator in [`backend::sim`].

#![allow(clippy::too_many_arguments)] // Launch helpers mirror driver signatures
#![allow(clippy::module_inception)]

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod memory;
pub mod scheduler;

pub use backend::hip_backend::{DeviceRegistry, DeviceRuntime, HipError};
#[cfg(feature = "rocm")]
pub use backend::hip_backend::HipRuntime;
pub use backend::sim::SimRuntime;
pub use config::StromConfig;
pub use context::{ContextRegistry, GpuContext, GpuContextRef, ResourceScope};
pub use error::{ErrorCategory, StromError, StromResult, TaskErrorCode};
pub use logging::{init_logging_default, init_with_config, LoggingConfig};
pub use memory::MemoryHead;
pub use scheduler::{GpuTask, GpuTaskState, LaunchContext, TaskOps};
