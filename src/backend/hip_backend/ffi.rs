//! HIP FFI bindings
//!
//! Declarations for the subset of the ROCm HIP driver API used by
//! [`HipRuntime`](super::hip_runtime::HipRuntime). Only compiled with the
//! `rocm` feature.

use std::ffi::{c_char, c_void};

pub type HipStreamCallbackFn =
    unsafe extern "C" fn(stream: *mut c_void, status: i32, user_data: *mut c_void);

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipDriverGetVersion(version: *mut i32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipDeviceGet(device: *mut i32, ordinal: i32) -> i32;
    pub fn hipDeviceGetName(name: *mut c_char, len: i32, device: i32) -> i32;
    pub fn hipDeviceTotalMem(bytes: *mut usize, device: i32) -> i32;
    pub fn hipDeviceGetAttribute(value: *mut i32, attr: i32, device: i32) -> i32;

    pub fn hipCtxCreate(ctx: *mut *mut c_void, flags: u32, device: i32) -> i32;
    pub fn hipCtxDestroy(ctx: *mut c_void) -> i32;
    pub fn hipCtxPushCurrent(ctx: *mut c_void) -> i32;
    pub fn hipCtxPopCurrent(ctx: *mut *mut c_void) -> i32;
    pub fn hipCtxSynchronize() -> i32;
    pub fn hipCtxSetCacheConfig(config: i32) -> i32;

    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipMemcpyHtoDAsync(
        dst: *mut c_void,
        src: *mut c_void,
        count: usize,
        stream: *mut c_void,
    ) -> i32;
    pub fn hipMemcpyDtoHAsync(
        dst: *mut c_void,
        src: *mut c_void,
        count: usize,
        stream: *mut c_void,
    ) -> i32;

    pub fn hipStreamCreateWithFlags(stream: *mut *mut c_void, flags: u32) -> i32;
    pub fn hipStreamDestroy(stream: *mut c_void) -> i32;
    pub fn hipStreamAddCallback(
        stream: *mut c_void,
        callback: HipStreamCallbackFn,
        user_data: *mut c_void,
        flags: u32,
    ) -> i32;

    pub fn hipModuleLoadData(module: *mut *mut c_void, image: *const c_void) -> i32;
    pub fn hipModuleUnload(module: *mut c_void) -> i32;
    pub fn hipModuleGetFunction(
        func: *mut *mut c_void,
        module: *mut c_void,
        name: *const c_char,
    ) -> i32;
    pub fn hipFuncGetAttribute(value: *mut i32, attr: i32, func: *mut c_void) -> i32;
    pub fn hipModuleOccupancyMaxPotentialBlockSize(
        grid_size: *mut i32,
        block_size: *mut i32,
        func: *mut c_void,
        dyn_shared_mem_per_blk: usize,
        block_size_limit: i32,
    ) -> i32;
    pub fn hipModuleLaunchKernel(
        func: *mut c_void,
        grid_dim_x: u32,
        grid_dim_y: u32,
        grid_dim_z: u32,
        block_dim_x: u32,
        block_dim_y: u32,
        block_dim_z: u32,
        shared_mem_bytes: u32,
        stream: *mut c_void,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const c_char;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;
/// `hipErrorOutOfMemory`
pub const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;

pub const HIP_STREAM_DEFAULT: u32 = 0x0;
pub const HIP_STREAM_NON_BLOCKING: u32 = 0x1;

/// `hipHostMallocDefault`
pub const HIP_HOST_MALLOC_DEFAULT: u32 = 0x0;

// hipFuncCache_t
pub const HIP_FUNC_CACHE_PREFER_NONE: i32 = 0;
pub const HIP_FUNC_CACHE_PREFER_SHARED: i32 = 1;
pub const HIP_FUNC_CACHE_PREFER_L1: i32 = 2;
pub const HIP_FUNC_CACHE_PREFER_EQUAL: i32 = 3;

// hipFunction_attribute
pub const HIP_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK: i32 = 0;
pub const HIP_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES: i32 = 1;
pub const HIP_FUNC_ATTRIBUTE_CONST_SIZE_BYTES: i32 = 2;
pub const HIP_FUNC_ATTRIBUTE_LOCAL_SIZE_BYTES: i32 = 3;
pub const HIP_FUNC_ATTRIBUTE_NUM_REGS: i32 = 4;
