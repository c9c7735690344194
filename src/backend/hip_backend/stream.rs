//! HIP stream wrapper

use std::sync::Arc;

use crate::backend::hip_backend::error::HipResult;
use crate::backend::hip_backend::runtime::{
    DeviceRuntime, StreamCallback, StreamFlags, StreamHandle,
};

/// Owned stream, destroyed on drop
///
/// The stream must be created and dropped while its context is current.
/// HipStream does NOT implement Clone: two owners would destroy the same
/// driver stream twice.
#[derive(Debug)]
pub struct HipStream {
    runtime: Arc<dyn DeviceRuntime>,
    handle: StreamHandle,
}

impl HipStream {
    /// Create a non-blocking stream in the current context
    pub fn non_blocking(runtime: Arc<dyn DeviceRuntime>) -> HipResult<Self> {
        let handle = runtime.stream_create(StreamFlags::NonBlocking)?;
        tracing::trace!(stream = handle.raw(), "created non-blocking stream");
        Ok(HipStream { runtime, handle })
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    /// Run `callback` once every operation queued so far has finished
    pub fn add_callback(&self, callback: StreamCallback) -> HipResult<()> {
        self.runtime.stream_add_callback(self.handle, callback)
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.stream_destroy(self.handle) {
            tracing::warn!(stream = self.handle.raw(), "failed to destroy stream: {}", e);
        }
    }
}
