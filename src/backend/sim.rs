//! In-process simulated device runtime
//!
//! `SimRuntime` implements [`DeviceRuntime`] without an accelerator. It keeps
//! the driver rules that the allocator and pipeline depend on (a per-thread
//! context stack, allocations attributed to the current context, streams
//! that complete asynchronously) and counts every raw call so tests can
//! observe what reached the "driver".
//!
//! Stream completion is controlled by [`CompletionMode`]:
//! - `Inline`: callbacks fire inside `stream_add_callback`
//! - `Manual`: callbacks queue until [`SimRuntime::complete_pending`] or a
//!   context synchronize
//! - `Background(delay)`: callbacks fire on a helper thread after `delay`

use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::backend::hip_backend::runtime::{
    CachePreference, ContextHandle, DeviceAttribute, DevicePtr, DeviceRuntime, FunctionAttribute,
    FunctionHandle, HostPtr, LaunchGeometry, ModuleHandle, OccupancyHint, StreamCallback,
    StreamFlags, StreamHandle,
};
use crate::backend::hip_backend::{HipError, HipResult};

const GIB: usize = 1 << 30;
const DEVICE_ADDRESS_STRIDE: u64 = 1 << 40;
const HOST_ADDRESS_BASE: u64 = 0x7f00_0000_0000;
const ALLOC_GRANULARITY: u64 = 4096;

/// When stream callbacks run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Inline,
    Manual,
    Background(Duration),
}

/// One simulated device
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub name: String,
    pub total_mem: usize,
    pub attributes: HashMap<DeviceAttribute, i32>,
}

impl SimDevice {
    /// A device with RDNA3-like limits
    pub fn new(name: impl Into<String>, total_mem: usize) -> Self {
        use DeviceAttribute::*;
        let attributes = [
            (MaxThreadsPerBlock, 1024),
            (MaxBlockDimX, 1024),
            (MaxBlockDimY, 1024),
            (MaxBlockDimZ, 1024),
            (MaxGridDimX, i32::MAX),
            (MaxGridDimY, 65535),
            (MaxGridDimZ, 65535),
            (MaxSharedMemoryPerBlock, 64 * 1024),
            (TotalConstantMemory, 64 * 1024),
            (WarpSize, 32),
            (MaxPitch, i32::MAX),
            (MaxRegistersPerBlock, 65536),
            (ClockRate, 2_500_000),
            (TextureAlignment, 256),
            (MultiprocessorCount, 48),
            (KernelExecTimeout, 0),
            (Integrated, 0),
            (CanMapHostMemory, 1),
            (ComputeMode, 0),
            (SurfaceAlignment, 256),
            (ConcurrentKernels, 1),
            (EccEnabled, 0),
            (PciBusId, 3),
            (PciDeviceId, 0),
            (TccDriver, 0),
            (MemoryClockRate, 1_250_000),
            (GlobalMemoryBusWidth, 384),
            (L2CacheSize, 6 * 1024 * 1024),
            (MaxThreadsPerMultiprocessor, 2048),
            (AsyncEngineCount, 2),
            (UnifiedAddressing, 1),
            (PciDomainId, 0),
            (ComputeCapabilityMajor, 11),
            (ComputeCapabilityMinor, 0),
            (StreamPrioritiesSupported, 1),
            (GlobalL1CacheSupported, 1),
            (LocalL1CacheSupported, 1),
            (MaxSharedMemoryPerMultiprocessor, 128 * 1024),
            (MaxRegistersPerMultiprocessor, 131072),
            (ManagedMemory, 1),
            (MultiGpuBoard, 0),
            (MultiGpuBoardGroupId, 0),
        ]
        .into_iter()
        .collect();

        Self {
            name: name.into(),
            total_mem,
            attributes,
        }
    }

    pub fn with_attribute(mut self, attr: DeviceAttribute, value: i32) -> Self {
        self.attributes.insert(attr, value);
        self
    }

    pub fn with_compute_capability(self, major: i32, minor: i32) -> Self {
        self.with_attribute(DeviceAttribute::ComputeCapabilityMajor, major)
            .with_attribute(DeviceAttribute::ComputeCapabilityMinor, minor)
    }
}

/// Kernel description for `module_get_function`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimKernel {
    pub static_shmem: usize,
    pub max_threads_per_block: usize,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self {
            static_shmem: 0,
            max_threads_per_block: 1024,
        }
    }
}

/// Counts of driver calls that reached the simulator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub raw_allocs: usize,
    pub raw_frees: usize,
    pub host_allocs: usize,
    pub host_frees: usize,
    pub contexts_created: usize,
    pub contexts_destroyed: usize,
    pub streams_created: usize,
    pub streams_destroyed: usize,
    pub modules_loaded: usize,
    pub modules_unloaded: usize,
    pub kernel_launches: usize,
    pub synchronizations: usize,
    pub bytes_htod: usize,
    pub bytes_dtoh: usize,
    /// Device allocations still live when their context was destroyed
    pub implicit_frees: usize,
    /// Host allocations still live when their context was destroyed
    pub unmapped_host_allocs: usize,
}

#[derive(Debug)]
struct SimContext {
    ordinal: i32,
    cache_preference: CachePreference,
}

#[derive(Debug)]
struct SimAllocation {
    ordinal: i32,
    context: ContextHandle,
    size: usize,
}

#[derive(Default)]
struct SimStream {
    context: Option<ContextHandle>,
    pending: Vec<StreamCallback>,
}

#[derive(Debug)]
struct SimFunction {
    ordinal: i32,
    kernel: SimKernel,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    contexts: HashMap<u64, SimContext>,
    thread_stacks: HashMap<ThreadId, Vec<ContextHandle>>,
    allocations: HashMap<u64, SimAllocation>,
    bytes_in_use: Vec<usize>,
    memory_limit: Vec<usize>,
    next_device_addr: Vec<u64>,
    next_host_addr: u64,
    host_allocations: HashMap<u64, (ContextHandle, usize)>,
    streams: HashMap<u64, SimStream>,
    modules: HashMap<u64, i32>,
    functions: HashMap<u64, SimFunction>,
    kernels: HashMap<String, SimKernel>,
    counters: SimCounters,
    alloc_failures: VecDeque<HipError>,
    failing_context_ordinals: Vec<i32>,
    stream_create_failures: usize,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn current_context(&self) -> Option<ContextHandle> {
        self.thread_stacks
            .get(&thread::current().id())
            .and_then(|s| s.last().copied())
    }

    fn require_current(&self) -> HipResult<(ContextHandle, i32)> {
        let ctx = self
            .current_context()
            .ok_or_else(|| HipError::ContextError("no current context on this thread".into()))?;
        let info = self
            .contexts
            .get(&ctx.raw())
            .ok_or_else(|| HipError::ContextError(format!("context {} was destroyed", ctx.raw())))?;
        Ok((ctx, info.ordinal))
    }
}

/// Builder for [`SimRuntime`]
#[derive(Debug, Clone)]
pub struct SimRuntimeBuilder {
    devices: Vec<SimDevice>,
    completion: CompletionMode,
    driver_version: i32,
}

impl Default for SimRuntimeBuilder {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            completion: CompletionMode::Inline,
            driver_version: 60_200_000,
        }
    }
}

impl SimRuntimeBuilder {
    /// Add `count` default 16 GiB devices
    pub fn devices(mut self, count: usize) -> Self {
        for _ in 0..count {
            let i = self.devices.len();
            self.devices
                .push(SimDevice::new(format!("Simulated GPU {}", i), 16 * GIB));
        }
        self
    }

    pub fn device(mut self, device: SimDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn completion(mut self, mode: CompletionMode) -> Self {
        self.completion = mode;
        self
    }

    pub fn driver_version(mut self, version: i32) -> Self {
        self.driver_version = version;
        self
    }

    pub fn build(self) -> SimRuntime {
        let n = self.devices.len();
        let state = SimState {
            bytes_in_use: vec![0; n],
            memory_limit: self.devices.iter().map(|d| d.total_mem).collect(),
            next_device_addr: (0..n as u64)
                .map(|i| (i + 1) * DEVICE_ADDRESS_STRIDE)
                .collect(),
            next_host_addr: HOST_ADDRESS_BASE,
            ..SimState::default()
        };
        SimRuntime {
            devices: self.devices,
            completion: self.completion,
            driver_version: self.driver_version,
            state: Mutex::new(state),
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }
}

/// Simulated device runtime
pub struct SimRuntime {
    devices: Vec<SimDevice>,
    completion: CompletionMode,
    driver_version: i32,
    state: Mutex<SimState>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl std::fmt::Debug for SimRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRuntime")
            .field("devices", &self.devices.len())
            .field("completion", &self.completion)
            .finish()
    }
}

impl SimRuntime {
    pub fn builder() -> SimRuntimeBuilder {
        SimRuntimeBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not take every later call down with it.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn device(&self, ordinal: i32) -> HipResult<&SimDevice> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| self.devices.get(i))
            .ok_or(HipError::DeviceNotFound(ordinal))
    }

    /// Snapshot of the call counters
    pub fn counters(&self) -> SimCounters {
        self.state().counters.clone()
    }

    /// Context on top of the calling thread's stack
    pub fn current_context(&self) -> Option<ContextHandle> {
        self.state().current_context()
    }

    /// Cache preference last applied to `ctx`, if it still exists
    pub fn cache_preference(&self, ctx: ContextHandle) -> Option<CachePreference> {
        self.state().contexts.get(&ctx.raw()).map(|c| c.cache_preference)
    }

    /// Live raw device allocations across all devices
    pub fn live_allocations(&self) -> usize {
        self.state().allocations.len()
    }

    pub fn bytes_in_use(&self, ordinal: usize) -> usize {
        self.state().bytes_in_use.get(ordinal).copied().unwrap_or(0)
    }

    /// Cap the raw memory a device will hand out
    pub fn set_memory_limit(&self, ordinal: usize, bytes: usize) {
        if let Some(limit) = self.state().memory_limit.get_mut(ordinal) {
            *limit = bytes;
        }
    }

    /// Make the next `mem_alloc` fail with `err`
    pub fn fail_next_alloc(&self, err: HipError) {
        self.state().alloc_failures.push_back(err);
    }

    /// Make every `ctx_create` on `ordinal` fail
    pub fn fail_context_create(&self, ordinal: i32) {
        self.state().failing_context_ordinals.push(ordinal);
    }

    pub fn fail_next_stream_create(&self) {
        self.state().stream_create_failures += 1;
    }

    pub fn register_kernel(&self, name: impl Into<String>, kernel: SimKernel) {
        self.state().kernels.insert(name.into(), kernel);
    }

    /// Callbacks queued in `Manual` mode
    pub fn pending_callbacks(&self) -> usize {
        self.state().streams.values().map(|s| s.pending.len()).sum()
    }

    /// Fire every queued callback with a success status
    pub fn complete_pending(&self) -> usize {
        self.complete_pending_with(Ok(()))
    }

    /// Fire every queued callback with `status`
    pub fn complete_pending_with(&self, status: HipResult<()>) -> usize {
        let callbacks = {
            let mut state = self.state();
            let mut handles: Vec<u64> = state.streams.keys().copied().collect();
            handles.sort_unstable();
            let mut callbacks = Vec::new();
            for h in handles {
                if let Some(s) = state.streams.get_mut(&h) {
                    callbacks.append(&mut s.pending);
                }
            }
            callbacks
        };
        let fired = callbacks.len();
        for cb in callbacks {
            cb(status.clone());
        }
        fired
    }

    fn fire(&self, callback: StreamCallback) {
        match self.completion {
            CompletionMode::Inline => callback(Ok(())),
            CompletionMode::Manual => {}
            CompletionMode::Background(delay) => {
                let in_flight = Arc::clone(&self.in_flight);
                {
                    let (count, _) = &*in_flight;
                    *count.lock().unwrap_or_else(|p| p.into_inner()) += 1;
                }
                thread::spawn(move || {
                    thread::sleep(delay);
                    callback(Ok(()));
                    let (count, cond) = &*in_flight;
                    let mut n = count.lock().unwrap_or_else(|p| p.into_inner());
                    *n = n.saturating_sub(1);
                    cond.notify_all();
                });
            }
        }
    }

    fn wait_background(&self) {
        let (count, cond) = &*self.in_flight;
        let mut n = count.lock().unwrap_or_else(|p| p.into_inner());
        while *n > 0 {
            n = cond.wait(n).unwrap_or_else(|p| p.into_inner());
        }
    }
}

impl DeviceRuntime for SimRuntime {
    fn name(&self) -> &str {
        "sim"
    }

    fn init(&self) -> HipResult<()> {
        Ok(())
    }

    fn driver_version(&self) -> HipResult<i32> {
        Ok(self.driver_version)
    }

    fn device_count(&self) -> HipResult<i32> {
        Ok(self.devices.len() as i32)
    }

    fn device_name(&self, ordinal: i32) -> HipResult<String> {
        Ok(self.device(ordinal)?.name.clone())
    }

    fn device_total_mem(&self, ordinal: i32) -> HipResult<usize> {
        Ok(self.device(ordinal)?.total_mem)
    }

    fn device_attribute(&self, ordinal: i32, attr: DeviceAttribute) -> HipResult<i32> {
        self.device(ordinal)?
            .attributes
            .get(&attr)
            .copied()
            .ok_or_else(|| HipError::DeviceError(format!("attribute {:?} not supported", attr)))
    }

    fn ctx_create(&self, ordinal: i32) -> HipResult<ContextHandle> {
        self.device(ordinal)?;
        let mut state = self.state();
        if state.failing_context_ordinals.contains(&ordinal) {
            return Err(HipError::ContextError(format!(
                "simulated context creation failure on device {}",
                ordinal
            )));
        }
        let handle = state.handle();
        state.contexts.insert(
            handle,
            SimContext {
                ordinal,
                cache_preference: CachePreference::None,
            },
        );
        state.counters.contexts_created += 1;
        Ok(ContextHandle(handle))
    }

    fn ctx_destroy(&self, ctx: ContextHandle) -> HipResult<()> {
        let mut state = self.state();
        if state.contexts.remove(&ctx.raw()).is_none() {
            return Err(HipError::ContextError(format!(
                "context {} does not exist",
                ctx.raw()
            )));
        }
        let orphaned: Vec<u64> = state
            .allocations
            .iter()
            .filter(|(_, a)| a.context == ctx)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in orphaned {
            if let Some(a) = state.allocations.remove(&addr) {
                state.bytes_in_use[a.ordinal as usize] -= a.size;
                state.counters.implicit_frees += 1;
            }
        }
        let before = state.host_allocations.len();
        state.host_allocations.retain(|_, (owner, _)| *owner != ctx);
        let unmapped = before - state.host_allocations.len();
        state.counters.unmapped_host_allocs += unmapped;
        state.counters.contexts_destroyed += 1;
        Ok(())
    }

    fn ctx_push_current(&self, ctx: ContextHandle) -> HipResult<()> {
        let mut state = self.state();
        if !state.contexts.contains_key(&ctx.raw()) {
            return Err(HipError::ContextError(format!(
                "cannot push destroyed context {}",
                ctx.raw()
            )));
        }
        state
            .thread_stacks
            .entry(thread::current().id())
            .or_default()
            .push(ctx);
        Ok(())
    }

    fn ctx_pop_current(&self) -> HipResult<ContextHandle> {
        let mut state = self.state();
        state
            .thread_stacks
            .get_mut(&thread::current().id())
            .and_then(|s| s.pop())
            .ok_or_else(|| HipError::ContextError("context stack is empty".into()))
    }

    fn ctx_synchronize(&self) -> HipResult<()> {
        let callbacks = {
            let mut state = self.state();
            let (ctx, _) = state.require_current()?;
            state.counters.synchronizations += 1;
            state
                .streams
                .values_mut()
                .filter(|s| s.context == Some(ctx))
                .flat_map(|s| std::mem::take(&mut s.pending))
                .collect::<Vec<_>>()
        };
        for cb in callbacks {
            cb(Ok(()));
        }
        if matches!(self.completion, CompletionMode::Background(_)) {
            self.wait_background();
        }
        Ok(())
    }

    fn ctx_set_cache_config(&self, pref: CachePreference) -> HipResult<()> {
        let mut state = self.state();
        let (ctx, _) = state.require_current()?;
        if let Some(c) = state.contexts.get_mut(&ctx.raw()) {
            c.cache_preference = pref;
        }
        Ok(())
    }

    fn mem_alloc(&self, size: usize) -> HipResult<DevicePtr> {
        let mut state = self.state();
        let (ctx, ordinal) = state.require_current()?;
        if let Some(err) = state.alloc_failures.pop_front() {
            return Err(err);
        }
        let dev = ordinal as usize;
        if size > state.memory_limit[dev].saturating_sub(state.bytes_in_use[dev]) {
            return Err(HipError::OutOfMemory(format!(
                "device {}: {} bytes requested, {} of {} in use",
                ordinal, size, state.bytes_in_use[dev], state.memory_limit[dev]
            )));
        }
        let addr = state.next_device_addr[dev];
        let span = (size as u64).div_ceil(ALLOC_GRANULARITY).max(1) * ALLOC_GRANULARITY;
        state.next_device_addr[dev] += span;
        state.bytes_in_use[dev] += size;
        state.allocations.insert(
            addr,
            SimAllocation {
                ordinal,
                context: ctx,
                size,
            },
        );
        state.counters.raw_allocs += 1;
        Ok(DevicePtr(addr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> HipResult<()> {
        let mut state = self.state();
        state.require_current()?;
        let a = state.allocations.remove(&ptr.raw()).ok_or_else(|| {
            HipError::MemoryFreeFailed(format!("{} is not a live allocation", ptr))
        })?;
        state.bytes_in_use[a.ordinal as usize] -= a.size;
        state.counters.raw_frees += 1;
        Ok(())
    }

    fn host_alloc(&self, size: usize) -> HipResult<HostPtr> {
        let mut state = self.state();
        let (ctx, _) = state.require_current()?;
        let addr = state.next_host_addr;
        state.next_host_addr += (size as u64).div_ceil(ALLOC_GRANULARITY).max(1) * ALLOC_GRANULARITY;
        state.host_allocations.insert(addr, (ctx, size));
        state.counters.host_allocs += 1;
        Ok(HostPtr(addr))
    }

    fn host_free(&self, ptr: HostPtr) -> HipResult<()> {
        let mut state = self.state();
        state.require_current()?;
        state
            .host_allocations
            .remove(&ptr.raw())
            .ok_or_else(|| HipError::MemoryFreeFailed(format!("{:#x} is not pinned", ptr.raw())))?;
        state.counters.host_frees += 1;
        Ok(())
    }

    fn memcpy_htod_async(
        &self,
        _dst: DevicePtr,
        _src: HostPtr,
        len: usize,
        stream: StreamHandle,
    ) -> HipResult<()> {
        let mut state = self.state();
        if !state.streams.contains_key(&stream.raw()) {
            return Err(HipError::StreamError(format!("unknown stream {}", stream.raw())));
        }
        state.counters.bytes_htod += len;
        Ok(())
    }

    fn memcpy_dtoh_async(
        &self,
        _dst: HostPtr,
        _src: DevicePtr,
        len: usize,
        stream: StreamHandle,
    ) -> HipResult<()> {
        let mut state = self.state();
        if !state.streams.contains_key(&stream.raw()) {
            return Err(HipError::StreamError(format!("unknown stream {}", stream.raw())));
        }
        state.counters.bytes_dtoh += len;
        Ok(())
    }

    fn stream_create(&self, _flags: StreamFlags) -> HipResult<StreamHandle> {
        let mut state = self.state();
        let (ctx, _) = state.require_current()?;
        if state.stream_create_failures > 0 {
            state.stream_create_failures -= 1;
            return Err(HipError::StreamError("simulated stream creation failure".into()));
        }
        let handle = state.handle();
        state.streams.insert(
            handle,
            SimStream {
                context: Some(ctx),
                pending: Vec::new(),
            },
        );
        state.counters.streams_created += 1;
        Ok(StreamHandle(handle))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> HipResult<()> {
        let pending = {
            let mut state = self.state();
            let s = state
                .streams
                .remove(&stream.raw())
                .ok_or_else(|| HipError::StreamError(format!("unknown stream {}", stream.raw())))?;
            state.counters.streams_destroyed += 1;
            s.pending
        };
        // Outstanding work drains before the stream goes away.
        for cb in pending {
            cb(Ok(()));
        }
        Ok(())
    }

    fn stream_add_callback(
        &self,
        stream: StreamHandle,
        callback: StreamCallback,
    ) -> HipResult<()> {
        {
            let mut state = self.state();
            let s = state
                .streams
                .get_mut(&stream.raw())
                .ok_or_else(|| HipError::StreamError(format!("unknown stream {}", stream.raw())))?;
            if self.completion == CompletionMode::Manual {
                s.pending.push(callback);
                return Ok(());
            }
        }
        self.fire(callback);
        Ok(())
    }

    fn module_load_data(&self, image: &[u8]) -> HipResult<ModuleHandle> {
        let mut state = self.state();
        let (_, ordinal) = state.require_current()?;
        if image.is_empty() {
            return Err(HipError::KernelLoadFailed("empty image".into()));
        }
        let handle = state.handle();
        state.modules.insert(handle, ordinal);
        state.counters.modules_loaded += 1;
        Ok(ModuleHandle(handle))
    }

    fn module_unload(&self, module: ModuleHandle) -> HipResult<()> {
        let mut state = self.state();
        state
            .modules
            .remove(&module.raw())
            .ok_or_else(|| HipError::KernelLoadFailed(format!("unknown module {}", module.raw())))?;
        state.counters.modules_unloaded += 1;
        Ok(())
    }

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> HipResult<FunctionHandle> {
        let mut state = self.state();
        let ordinal = *state
            .modules
            .get(&module.raw())
            .ok_or_else(|| HipError::KernelLoadFailed(format!("unknown module {}", module.raw())))?;
        let kernel = *state
            .kernels
            .get(name)
            .ok_or_else(|| HipError::KernelLoadFailed(format!("no kernel named '{}'", name)))?;
        let handle = state.handle();
        state
            .functions
            .insert(handle, SimFunction { ordinal, kernel });
        Ok(FunctionHandle(handle))
    }

    fn func_attribute(&self, func: FunctionHandle, attr: FunctionAttribute) -> HipResult<i32> {
        let state = self.state();
        let f = state
            .functions
            .get(&func.raw())
            .ok_or_else(|| HipError::KernelLoadFailed(format!("unknown function {}", func.raw())))?;
        Ok(match attr {
            FunctionAttribute::MaxThreadsPerBlock => f.kernel.max_threads_per_block as i32,
            FunctionAttribute::SharedSizeBytes => f.kernel.static_shmem as i32,
            FunctionAttribute::ConstSizeBytes
            | FunctionAttribute::LocalSizeBytes
            | FunctionAttribute::NumRegs => 0,
        })
    }

    fn occupancy_max_potential_block_size(
        &self,
        func: FunctionHandle,
        dynamic_shmem_per_thread: usize,
        block_size_limit: usize,
    ) -> HipResult<OccupancyHint> {
        let (ordinal, kernel) = {
            let state = self.state();
            let f = state.functions.get(&func.raw()).ok_or_else(|| {
                HipError::KernelLoadFailed(format!("unknown function {}", func.raw()))
            })?;
            (f.ordinal, f.kernel)
        };
        let attr = |a| self.device_attribute(ordinal, a).map(|v| v.max(0) as usize);
        let warp = attr(DeviceAttribute::WarpSize)?.max(1);
        let shmem = attr(DeviceAttribute::MaxSharedMemoryPerBlock)?;
        let per_sm = attr(DeviceAttribute::MaxThreadsPerMultiprocessor)?;
        let sm_count = attr(DeviceAttribute::MultiprocessorCount)?;

        let mut limit = kernel.max_threads_per_block;
        if block_size_limit > 0 {
            limit = limit.min(block_size_limit);
        }
        let mut block = limit & !(warp - 1);
        while block > warp && kernel.static_shmem + dynamic_shmem_per_thread * block > shmem {
            block -= warp;
        }
        if kernel.static_shmem + dynamic_shmem_per_thread * block > shmem {
            return Err(HipError::KernelLaunchFailed(
                "kernel does not fit in shared memory at any block size".into(),
            ));
        }
        let blocks_per_sm = (per_sm / block.max(1)).max(1);
        Ok(OccupancyHint {
            min_grid_size: sm_count * blocks_per_sm,
            block_size: block,
        })
    }

    unsafe fn launch_kernel(
        &self,
        func: FunctionHandle,
        _geometry: LaunchGeometry,
        stream: StreamHandle,
        _args: &mut [*mut c_void],
    ) -> HipResult<()> {
        let mut state = self.state();
        if !state.functions.contains_key(&func.raw()) {
            return Err(HipError::KernelLaunchFailed(format!(
                "unknown function {}",
                func.raw()
            )));
        }
        if !state.streams.contains_key(&stream.raw()) {
            return Err(HipError::StreamError(format!("unknown stream {}", stream.raw())));
        }
        state.counters.kernel_launches += 1;
        Ok(())
    }

    fn error_string(&self, code: i32) -> String {
        format!("simulated driver error {}", code)
    }
}
