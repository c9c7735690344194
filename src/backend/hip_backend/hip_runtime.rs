//! [`DeviceRuntime`] over the ROCm HIP driver API

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;

use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::ffi;
use crate::backend::hip_backend::runtime::{
    CachePreference, ContextHandle, DeviceAttribute, DevicePtr, DeviceRuntime, FunctionAttribute,
    FunctionHandle, HostPtr, LaunchGeometry, ModuleHandle, OccupancyHint, StreamCallback,
    StreamFlags, StreamHandle,
};

/// `hipDeviceAttribute_t` value for each attribute
fn attribute_id(attr: DeviceAttribute) -> i32 {
    use DeviceAttribute::*;
    match attr {
        EccEnabled => 0,
        AsyncEngineCount => 2,
        CanMapHostMemory => 3,
        ClockRate => 5,
        ComputeMode => 6,
        ConcurrentKernels => 8,
        GlobalL1CacheSupported => 14,
        Integrated => 16,
        MultiGpuBoard => 17,
        KernelExecTimeout => 18,
        L2CacheSize => 19,
        LocalL1CacheSupported => 20,
        ComputeCapabilityMajor => 23,
        ManagedMemory => 24,
        MaxBlockDimX => 26,
        MaxBlockDimY => 27,
        MaxBlockDimZ => 28,
        MaxGridDimX => 29,
        MaxGridDimY => 30,
        MaxGridDimZ => 31,
        MaxThreadsPerBlock => 56,
        MaxThreadsPerMultiprocessor => 57,
        MaxPitch => 58,
        GlobalMemoryBusWidth => 59,
        MemoryClockRate => 60,
        ComputeCapabilityMinor => 61,
        MultiGpuBoardGroupId => 62,
        MultiprocessorCount => 63,
        PciBusId => 67,
        PciDeviceId => 68,
        PciDomainId => 69,
        MaxRegistersPerBlock => 71,
        MaxRegistersPerMultiprocessor => 72,
        MaxSharedMemoryPerBlock => 74,
        MaxSharedMemoryPerMultiprocessor => 76,
        StreamPrioritiesSupported => 78,
        SurfaceAlignment => 79,
        TccDriver => 80,
        TextureAlignment => 81,
        TotalConstantMemory => 83,
        UnifiedAddressing => 85,
        WarpSize => 87,
    }
}

fn error_text(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a static NUL-terminated string.
    unsafe {
        let p = ffi::hipGetErrorString(code);
        if p.is_null() {
            format!("unknown HIP error {}", code)
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    }
}

fn check(code: i32, what: &str, wrap: impl FnOnce(String) -> HipError) -> HipResult<()> {
    match code {
        ffi::HIP_SUCCESS => Ok(()),
        ffi::HIP_ERROR_OUT_OF_MEMORY => Err(HipError::OutOfMemory(format!(
            "{}: {}",
            what,
            error_text(code)
        ))),
        _ => Err(wrap(format!("{} failed: {} (code {})", what, error_text(code), code))),
    }
}

fn as_ptr(raw: u64) -> *mut c_void {
    raw as usize as *mut c_void
}

fn from_ptr(p: *mut c_void) -> u64 {
    p as usize as u64
}

unsafe extern "C" fn stream_callback_trampoline(
    _stream: *mut c_void,
    status: i32,
    user_data: *mut c_void,
) {
    // SAFETY: user_data came from Box::into_raw in stream_add_callback and
    // the driver invokes each callback exactly once.
    let callback = Box::from_raw(user_data as *mut StreamCallback);
    let result = check(status, "stream", HipError::StreamError);
    callback(result);
}

/// Runtime backed by libamdhip64
#[derive(Debug, Default)]
pub struct HipRuntime {
    _private: (),
}

impl HipRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceRuntime for HipRuntime {
    fn name(&self) -> &str {
        "hip"
    }

    fn init(&self) -> HipResult<()> {
        check(unsafe { ffi::hipInit(0) }, "hipInit", HipError::InitializationFailed)
    }

    fn driver_version(&self) -> HipResult<i32> {
        let mut v = 0;
        check(
            unsafe { ffi::hipDriverGetVersion(&mut v) },
            "hipDriverGetVersion",
            HipError::InitializationFailed,
        )?;
        Ok(v)
    }

    fn device_count(&self) -> HipResult<i32> {
        let mut n = 0;
        check(
            unsafe { ffi::hipGetDeviceCount(&mut n) },
            "hipGetDeviceCount",
            HipError::InitializationFailed,
        )?;
        Ok(n)
    }

    fn device_name(&self, ordinal: i32) -> HipResult<String> {
        let mut dev = 0;
        check(unsafe { ffi::hipDeviceGet(&mut dev, ordinal) }, "hipDeviceGet", |_| {
            HipError::DeviceNotFound(ordinal)
        })?;
        let mut buf = [0 as c_char; 256];
        check(
            unsafe { ffi::hipDeviceGetName(buf.as_mut_ptr(), buf.len() as i32, dev) },
            "hipDeviceGetName",
            HipError::DeviceError,
        )?;
        // SAFETY: the driver NUL-terminates within the buffer.
        Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned())
    }

    fn device_total_mem(&self, ordinal: i32) -> HipResult<usize> {
        let mut bytes = 0usize;
        check(
            unsafe { ffi::hipDeviceTotalMem(&mut bytes, ordinal) },
            "hipDeviceTotalMem",
            HipError::DeviceError,
        )?;
        Ok(bytes)
    }

    fn device_attribute(&self, ordinal: i32, attr: DeviceAttribute) -> HipResult<i32> {
        let mut value = 0;
        check(
            unsafe { ffi::hipDeviceGetAttribute(&mut value, attribute_id(attr), ordinal) },
            "hipDeviceGetAttribute",
            HipError::DeviceError,
        )?;
        Ok(value)
    }

    fn ctx_create(&self, ordinal: i32) -> HipResult<ContextHandle> {
        let mut ctx = ptr::null_mut();
        check(
            unsafe { ffi::hipCtxCreate(&mut ctx, 0, ordinal) },
            "hipCtxCreate",
            HipError::ContextError,
        )?;
        // hipCtxCreate leaves the new context current
        let mut popped = ptr::null_mut();
        check(
            unsafe { ffi::hipCtxPopCurrent(&mut popped) },
            "hipCtxPopCurrent",
            HipError::ContextError,
        )?;
        Ok(ContextHandle(from_ptr(ctx)))
    }

    fn ctx_destroy(&self, ctx: ContextHandle) -> HipResult<()> {
        check(
            unsafe { ffi::hipCtxDestroy(as_ptr(ctx.raw())) },
            "hipCtxDestroy",
            HipError::ContextError,
        )
    }

    fn ctx_push_current(&self, ctx: ContextHandle) -> HipResult<()> {
        check(
            unsafe { ffi::hipCtxPushCurrent(as_ptr(ctx.raw())) },
            "hipCtxPushCurrent",
            HipError::ContextError,
        )
    }

    fn ctx_pop_current(&self) -> HipResult<ContextHandle> {
        let mut ctx = ptr::null_mut();
        check(
            unsafe { ffi::hipCtxPopCurrent(&mut ctx) },
            "hipCtxPopCurrent",
            HipError::ContextError,
        )?;
        Ok(ContextHandle(from_ptr(ctx)))
    }

    fn ctx_synchronize(&self) -> HipResult<()> {
        check(
            unsafe { ffi::hipCtxSynchronize() },
            "hipCtxSynchronize",
            HipError::ContextError,
        )
    }

    fn ctx_set_cache_config(&self, pref: CachePreference) -> HipResult<()> {
        let config = match pref {
            CachePreference::None => ffi::HIP_FUNC_CACHE_PREFER_NONE,
            CachePreference::PreferShared => ffi::HIP_FUNC_CACHE_PREFER_SHARED,
            CachePreference::PreferL1 => ffi::HIP_FUNC_CACHE_PREFER_L1,
            CachePreference::PreferEqual => ffi::HIP_FUNC_CACHE_PREFER_EQUAL,
        };
        check(
            unsafe { ffi::hipCtxSetCacheConfig(config) },
            "hipCtxSetCacheConfig",
            HipError::ContextError,
        )
    }

    fn mem_alloc(&self, size: usize) -> HipResult<DevicePtr> {
        let mut p = ptr::null_mut();
        check(
            unsafe { ffi::hipMalloc(&mut p, size) },
            "hipMalloc",
            HipError::MemoryAllocationFailed,
        )?;
        Ok(DevicePtr(from_ptr(p)))
    }

    fn mem_free(&self, ptr: DevicePtr) -> HipResult<()> {
        check(
            unsafe { ffi::hipFree(as_ptr(ptr.raw())) },
            "hipFree",
            HipError::MemoryFreeFailed,
        )
    }

    fn host_alloc(&self, size: usize) -> HipResult<HostPtr> {
        let mut p = ptr::null_mut();
        check(
            unsafe { ffi::hipHostMalloc(&mut p, size, ffi::HIP_HOST_MALLOC_DEFAULT) },
            "hipHostMalloc",
            HipError::MemoryAllocationFailed,
        )?;
        Ok(HostPtr(from_ptr(p)))
    }

    fn host_free(&self, ptr: HostPtr) -> HipResult<()> {
        check(
            unsafe { ffi::hipHostFree(as_ptr(ptr.raw())) },
            "hipHostFree",
            HipError::MemoryFreeFailed,
        )
    }

    fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: HostPtr,
        len: usize,
        stream: StreamHandle,
    ) -> HipResult<()> {
        check(
            unsafe {
                ffi::hipMemcpyHtoDAsync(as_ptr(dst.raw()), as_ptr(src.raw()), len, as_ptr(stream.raw()))
            },
            "hipMemcpyHtoDAsync",
            HipError::StreamError,
        )
    }

    fn memcpy_dtoh_async(
        &self,
        dst: HostPtr,
        src: DevicePtr,
        len: usize,
        stream: StreamHandle,
    ) -> HipResult<()> {
        check(
            unsafe {
                ffi::hipMemcpyDtoHAsync(as_ptr(dst.raw()), as_ptr(src.raw()), len, as_ptr(stream.raw()))
            },
            "hipMemcpyDtoHAsync",
            HipError::StreamError,
        )
    }

    fn stream_create(&self, flags: StreamFlags) -> HipResult<StreamHandle> {
        let flags = match flags {
            StreamFlags::Default => ffi::HIP_STREAM_DEFAULT,
            StreamFlags::NonBlocking => ffi::HIP_STREAM_NON_BLOCKING,
        };
        let mut s = ptr::null_mut();
        check(
            unsafe { ffi::hipStreamCreateWithFlags(&mut s, flags) },
            "hipStreamCreateWithFlags",
            HipError::StreamError,
        )?;
        Ok(StreamHandle(from_ptr(s)))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> HipResult<()> {
        check(
            unsafe { ffi::hipStreamDestroy(as_ptr(stream.raw())) },
            "hipStreamDestroy",
            HipError::StreamError,
        )
    }

    fn stream_add_callback(&self, stream: StreamHandle, callback: StreamCallback) -> HipResult<()> {
        let user_data = Box::into_raw(Box::new(callback)) as *mut c_void;
        let code = unsafe {
            ffi::hipStreamAddCallback(
                as_ptr(stream.raw()),
                stream_callback_trampoline,
                user_data,
                0,
            )
        };
        if code != ffi::HIP_SUCCESS {
            // Never registered, so the trampoline will not reclaim it.
            drop(unsafe { Box::from_raw(user_data as *mut StreamCallback) });
        }
        check(code, "hipStreamAddCallback", HipError::StreamError)
    }

    fn module_load_data(&self, image: &[u8]) -> HipResult<ModuleHandle> {
        let mut m = ptr::null_mut();
        check(
            unsafe { ffi::hipModuleLoadData(&mut m, image.as_ptr() as *const c_void) },
            "hipModuleLoadData",
            HipError::KernelLoadFailed,
        )?;
        Ok(ModuleHandle(from_ptr(m)))
    }

    fn module_unload(&self, module: ModuleHandle) -> HipResult<()> {
        check(
            unsafe { ffi::hipModuleUnload(as_ptr(module.raw())) },
            "hipModuleUnload",
            HipError::KernelLoadFailed,
        )
    }

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> HipResult<FunctionHandle> {
        let cname = CString::new(name)
            .map_err(|e| HipError::KernelLoadFailed(format!("invalid kernel name: {}", e)))?;
        let mut f = ptr::null_mut();
        check(
            unsafe { ffi::hipModuleGetFunction(&mut f, as_ptr(module.raw()), cname.as_ptr()) },
            "hipModuleGetFunction",
            HipError::KernelLoadFailed,
        )?;
        Ok(FunctionHandle(from_ptr(f)))
    }

    fn func_attribute(&self, func: FunctionHandle, attr: FunctionAttribute) -> HipResult<i32> {
        let id = match attr {
            FunctionAttribute::MaxThreadsPerBlock => ffi::HIP_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
            FunctionAttribute::SharedSizeBytes => ffi::HIP_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES,
            FunctionAttribute::ConstSizeBytes => ffi::HIP_FUNC_ATTRIBUTE_CONST_SIZE_BYTES,
            FunctionAttribute::LocalSizeBytes => ffi::HIP_FUNC_ATTRIBUTE_LOCAL_SIZE_BYTES,
            FunctionAttribute::NumRegs => ffi::HIP_FUNC_ATTRIBUTE_NUM_REGS,
        };
        let mut value = 0;
        check(
            unsafe { ffi::hipFuncGetAttribute(&mut value, id, as_ptr(func.raw())) },
            "hipFuncGetAttribute",
            HipError::KernelLoadFailed,
        )?;
        Ok(value)
    }

    fn occupancy_max_potential_block_size(
        &self,
        func: FunctionHandle,
        dynamic_shmem_per_thread: usize,
        block_size_limit: usize,
    ) -> HipResult<OccupancyHint> {
        // The driver takes dynamic shared memory per block, so shrink the
        // limit until the answer is consistent with its own assumption.
        let mut limit = if block_size_limit == 0 {
            self.func_attribute(func, FunctionAttribute::MaxThreadsPerBlock)?.max(1) as usize
        } else {
            block_size_limit
        };
        loop {
            let mut grid = 0;
            let mut block = 0;
            check(
                unsafe {
                    ffi::hipModuleOccupancyMaxPotentialBlockSize(
                        &mut grid,
                        &mut block,
                        as_ptr(func.raw()),
                        dynamic_shmem_per_thread * limit,
                        limit as i32,
                    )
                },
                "hipModuleOccupancyMaxPotentialBlockSize",
                HipError::KernelLaunchFailed,
            )?;
            let block = block.max(0) as usize;
            if dynamic_shmem_per_thread == 0 || block >= limit || block == 0 {
                return Ok(OccupancyHint {
                    min_grid_size: grid.max(0) as usize,
                    block_size: block,
                });
            }
            limit = block;
        }
    }

    unsafe fn launch_kernel(
        &self,
        func: FunctionHandle,
        geometry: LaunchGeometry,
        stream: StreamHandle,
        args: &mut [*mut c_void],
    ) -> HipResult<()> {
        let (gx, gy, gz) = geometry.grid;
        let (bx, by, bz) = geometry.block;
        check(
            ffi::hipModuleLaunchKernel(
                as_ptr(func.raw()),
                gx,
                gy,
                gz,
                bx,
                by,
                bz,
                geometry.dynamic_shmem,
                as_ptr(stream.raw()),
                args.as_mut_ptr(),
                ptr::null_mut(),
            ),
            "hipModuleLaunchKernel",
            HipError::KernelLaunchFailed,
        )
    }

    fn error_string(&self, code: i32) -> String {
        error_text(code)
    }
}
