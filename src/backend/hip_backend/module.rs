//! HIP module and kernel wrapper

use std::sync::Arc;

use crate::backend::hip_backend::error::{HipError, HipResult};
use crate::backend::hip_backend::runtime::{
    DeviceRuntime, FunctionAttribute, FunctionHandle, ModuleHandle,
};

/// Code object loaded into one device context
///
/// Unloaded on drop; the owning context must still be alive at that point.
#[derive(Debug)]
pub struct HipModule {
    runtime: Arc<dyn DeviceRuntime>,
    handle: ModuleHandle,
}

impl HipModule {
    /// Load a code object image into the current context
    pub fn load_from_data(runtime: Arc<dyn DeviceRuntime>, image: &[u8]) -> HipResult<Self> {
        if image.is_empty() {
            return Err(HipError::KernelLoadFailed(
                "empty code object image".to_string(),
            ));
        }
        let handle = runtime.module_load_data(image)?;
        tracing::debug!(module = handle.raw(), bytes = image.len(), "loaded GPU module");
        Ok(HipModule { runtime, handle })
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    /// Look up a kernel entry point
    pub fn kernel(&self, name: &str) -> HipResult<HipKernel> {
        let func = self.runtime.module_get_function(self.handle, name)?;
        Ok(HipKernel {
            func,
            name: name.to_string(),
        })
    }
}

impl Drop for HipModule {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.module_unload(self.handle) {
            tracing::warn!(module = self.handle.raw(), "failed to unload module: {}", e);
        }
    }
}

/// Kernel entry point within a loaded module
#[derive(Debug, Clone)]
pub struct HipKernel {
    func: FunctionHandle,
    name: String,
}

impl HipKernel {
    pub fn handle(&self) -> FunctionHandle {
        self.func
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static shared memory and thread limit of this kernel
    pub fn resources(&self, runtime: &dyn DeviceRuntime) -> HipResult<KernelResources> {
        let static_shmem = runtime.func_attribute(self.func, FunctionAttribute::SharedSizeBytes)?;
        let max_threads = runtime.func_attribute(self.func, FunctionAttribute::MaxThreadsPerBlock)?;
        Ok(KernelResources {
            static_shmem: static_shmem.max(0) as usize,
            max_threads_per_block: max_threads.max(0) as usize,
        })
    }
}

/// Per-kernel limits relevant to launch sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelResources {
    pub static_shmem: usize,
    pub max_threads_per_block: usize,
}
