//! Device runtime abstraction
//!
//! Everything above this module talks to the accelerator through
//! [`DeviceRuntime`]. The FFI implementation lives in `hip_runtime` (feature
//! `rocm`); `backend::sim` provides an in-process implementation for hosts
//! without a GPU.
//!
//! Calls that act on "the current context" follow the driver model: the
//! context must have been pushed on the calling thread first (see
//! [`ContextGuard`](super::device_context::ContextGuard)).

use std::ffi::c_void;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::hip_backend::error::HipResult;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// Device memory address
    DevicePtr
);
opaque_handle!(
    /// Pinned host memory address
    HostPtr
);
opaque_handle!(
    /// Driver execution context bound to one device
    ContextHandle
);
opaque_handle!(StreamHandle);
opaque_handle!(ModuleHandle);
opaque_handle!(FunctionHandle);

impl DevicePtr {
    /// Address `bytes` past this one
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn addr(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl HostPtr {
    pub fn offset(&self, bytes: usize) -> HostPtr {
        HostPtr(self.0 + bytes as u64)
    }
}

/// Shared-memory / L1 split requested for a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePreference {
    None,
    PreferShared,
    PreferL1,
    PreferEqual,
}

/// Stream creation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFlags {
    Default,
    /// Stream does not synchronize with the null stream
    NonBlocking,
}

/// Per-kernel attributes queried from a loaded function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionAttribute {
    MaxThreadsPerBlock,
    SharedSizeBytes,
    ConstSizeBytes,
    LocalSizeBytes,
    NumRegs,
}

/// Launch dimensions for one kernel invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchGeometry {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub dynamic_shmem: u32,
}

/// Result of an occupancy query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyHint {
    pub min_grid_size: usize,
    pub block_size: usize,
}

/// Completion callback attached to a stream
///
/// Invoked once, from a driver thread, after all preceding work on the stream
/// has finished. The argument is the stream's status.
pub type StreamCallback = Box<dyn FnOnce(HipResult<()>) + Send + 'static>;

/// Device attributes that can be queried per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceAttribute {
    MaxThreadsPerBlock,
    MaxBlockDimX,
    MaxBlockDimY,
    MaxBlockDimZ,
    MaxGridDimX,
    MaxGridDimY,
    MaxGridDimZ,
    MaxSharedMemoryPerBlock,
    TotalConstantMemory,
    WarpSize,
    MaxPitch,
    MaxRegistersPerBlock,
    ClockRate,
    TextureAlignment,
    MultiprocessorCount,
    KernelExecTimeout,
    Integrated,
    CanMapHostMemory,
    ComputeMode,
    SurfaceAlignment,
    ConcurrentKernels,
    EccEnabled,
    PciBusId,
    PciDeviceId,
    TccDriver,
    MemoryClockRate,
    GlobalMemoryBusWidth,
    L2CacheSize,
    MaxThreadsPerMultiprocessor,
    AsyncEngineCount,
    UnifiedAddressing,
    PciDomainId,
    ComputeCapabilityMajor,
    ComputeCapabilityMinor,
    StreamPrioritiesSupported,
    GlobalL1CacheSupported,
    LocalL1CacheSupported,
    MaxSharedMemoryPerMultiprocessor,
    MaxRegistersPerMultiprocessor,
    ManagedMemory,
    MultiGpuBoard,
    MultiGpuBoardGroupId,
}

/// Driver-level operations used by the allocator, context pool and task
/// pipeline
pub trait DeviceRuntime: Send + Sync + fmt::Debug {
    /// Short identifier used in log lines
    fn name(&self) -> &str;

    fn init(&self) -> HipResult<()>;
    fn driver_version(&self) -> HipResult<i32>;
    fn device_count(&self) -> HipResult<i32>;
    fn device_name(&self, ordinal: i32) -> HipResult<String>;
    fn device_total_mem(&self, ordinal: i32) -> HipResult<usize>;
    fn device_attribute(&self, ordinal: i32, attr: DeviceAttribute) -> HipResult<i32>;

    /// Create a context on `ordinal`. The new context is not left current.
    fn ctx_create(&self, ordinal: i32) -> HipResult<ContextHandle>;
    fn ctx_destroy(&self, ctx: ContextHandle) -> HipResult<()>;
    fn ctx_push_current(&self, ctx: ContextHandle) -> HipResult<()>;
    fn ctx_pop_current(&self) -> HipResult<ContextHandle>;
    /// Block until all work in the current context has finished
    fn ctx_synchronize(&self) -> HipResult<()>;
    fn ctx_set_cache_config(&self, pref: CachePreference) -> HipResult<()>;

    /// Raw device allocation in the current context.
    ///
    /// Exhaustion must be reported as [`HipError::OutOfMemory`](super::HipError::OutOfMemory).
    fn mem_alloc(&self, size: usize) -> HipResult<DevicePtr>;
    fn mem_free(&self, ptr: DevicePtr) -> HipResult<()>;

    /// Page-locked host allocation in the current context
    fn host_alloc(&self, size: usize) -> HipResult<HostPtr>;
    fn host_free(&self, ptr: HostPtr) -> HipResult<()>;

    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: HostPtr,
        len: usize,
        stream: StreamHandle,
    ) -> HipResult<()>;
    fn memcpy_dtoh_async(
        &self,
        dst: HostPtr,
        src: DevicePtr,
        len: usize,
        stream: StreamHandle,
    ) -> HipResult<()>;

    fn stream_create(&self, flags: StreamFlags) -> HipResult<StreamHandle>;
    fn stream_destroy(&self, stream: StreamHandle) -> HipResult<()>;
    fn stream_add_callback(&self, stream: StreamHandle, callback: StreamCallback)
        -> HipResult<()>;

    fn module_load_data(&self, image: &[u8]) -> HipResult<ModuleHandle>;
    fn module_unload(&self, module: ModuleHandle) -> HipResult<()>;
    fn module_get_function(&self, module: ModuleHandle, name: &str) -> HipResult<FunctionHandle>;
    fn func_attribute(&self, func: FunctionHandle, attr: FunctionAttribute) -> HipResult<i32>;

    /// Block size that maximises occupancy when every thread needs
    /// `dynamic_shmem_per_thread` bytes of dynamic shared memory
    fn occupancy_max_potential_block_size(
        &self,
        func: FunctionHandle,
        dynamic_shmem_per_thread: usize,
        block_size_limit: usize,
    ) -> HipResult<OccupancyHint>;

    /// Enqueue a kernel on `stream`
    ///
    /// # Safety
    ///
    /// `args` must point to argument values matching the kernel signature and
    /// stay valid until the call returns.
    unsafe fn launch_kernel(
        &self,
        func: FunctionHandle,
        geometry: LaunchGeometry,
        stream: StreamHandle,
        args: &mut [*mut c_void],
    ) -> HipResult<()>;

    /// Driver text for a raw status code
    fn error_string(&self, code: i32) -> String;
}
