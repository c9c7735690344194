//! ROCm/HIP backend
//!
//! Driver abstraction ([`DeviceRuntime`]), RAII wrappers for contexts,
//! streams and modules, and the process-wide [`DeviceRegistry`]. The FFI
//! runtime is only built with the `rocm` feature.

pub mod device;
pub mod device_context;
mod error;
pub mod module;
pub mod report;
pub mod runtime;
pub mod stream;

#[cfg(feature = "rocm")]
pub mod ffi;
#[cfg(feature = "rocm")]
pub mod hip_runtime;

pub use device::{
    device_registry, init_device_registry, shutdown_device_registry, DeviceProperties,
    DeviceRegistry,
};
pub use device_context::{context_depth, current_context, verify_context, with_context, ContextGuard};
pub use error::{HipError, HipResult};
#[cfg(feature = "rocm")]
pub use hip_runtime::HipRuntime;
pub use module::{HipKernel, HipModule, KernelResources};
pub use report::DeviceInfoRow;
pub use runtime::{
    CachePreference, ContextHandle, DeviceAttribute, DevicePtr, DeviceRuntime, FunctionAttribute,
    FunctionHandle, HostPtr, LaunchGeometry, ModuleHandle, OccupancyHint, StreamCallback,
    StreamFlags, StreamHandle,
};
pub use stream::HipStream;
