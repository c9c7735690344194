//! Tasks, per-kind callbacks and completion notification

use std::sync::Arc;

use crate::backend::hip_backend::{
    verify_context, DevicePtr, HipError, HipModule, HipResult, HipStream, LaunchGeometry,
};
use crate::context::{DeviceContext, GpuContext};
use crate::error::{StromResult, TaskErrorCode};
use crate::scheduler::queue::SharedQueues;
use crate::scheduler::types::{TaskId, TaskLocation};

/// One unit of asynchronous GPU work
///
/// The payload is whatever the operator needs to describe the chunk (input
/// buffers, result store, kernel parameters). The pipeline owns the device
/// assignment and the stream.
#[derive(Debug)]
pub struct GpuTask<P> {
    id: TaskId,
    device_index: Option<usize>,
    pub(crate) stream: Option<HipStream>,
    error: TaskErrorCode,
    payload: P,
}

impl<P> GpuTask<P> {
    pub(crate) fn new(id: TaskId, payload: P) -> Self {
        Self {
            id,
            device_index: None,
            stream: None,
            error: TaskErrorCode::Success,
            payload,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Device the task was assigned on its first launch attempt
    pub fn device_index(&self) -> Option<usize> {
        self.device_index
    }

    pub(crate) fn assign_device(&mut self, next: impl FnOnce() -> usize) -> usize {
        *self.device_index.get_or_insert_with(next)
    }

    pub fn stream(&self) -> Option<&HipStream> {
        self.stream.as_ref()
    }

    pub fn error(&self) -> TaskErrorCode {
        self.error
    }

    /// Record a kernel-reported failure; surfaced once the task is fetched
    pub fn set_error(&mut self, code: TaskErrorCode) {
        self.error = code;
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Callback table of one operator kind
///
/// All callbacks run on the consumer thread with the queue lock released.
/// `launch` and `complete` run with the task's device context current.
pub trait TaskOps {
    type Payload;
    type Tuple;

    /// Pull one more unit of input; `None` ends the scan
    fn next_chunk(&mut self, context: &GpuContext) -> StromResult<Option<Self::Payload>>;

    /// Submit the task's work on `launch.stream()`
    ///
    /// Return `Ok(false)` when resources are short (for example
    /// [`LaunchContext::mem_alloc`] returned `None`); the task goes back to
    /// the front of the pending queue. A launched task must arrange for
    /// [`LaunchContext::notify_on_completion`].
    fn launch(
        &mut self,
        task: &mut GpuTask<Self::Payload>,
        launch: &LaunchContext<'_>,
    ) -> StromResult<bool>;

    /// Process a task whose device work has finished
    ///
    /// `Ok(true)` makes it ready; `Ok(false)` sends it back to pending for
    /// another launch.
    fn complete(&mut self, task: &mut GpuTask<Self::Payload>, context: &GpuContext)
        -> StromResult<bool>;

    /// Final per-task cleanup, called exactly once per task
    fn release(&mut self, task: GpuTask<Self::Payload>, context: &GpuContext);

    /// Check non-device work on every pipeline pass
    fn poll(&mut self, _context: &GpuContext) -> StromResult<()> {
        Ok(())
    }

    /// Next output row of a fetched task; `None` when it is drained
    fn next_tuple(&mut self, task: &mut GpuTask<Self::Payload>) -> StromResult<Option<Self::Tuple>>;
}

/// Moves a task from running to completed when its stream finishes
///
/// `Send + 'static`: handed to the driver and invoked on its callback thread.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    shared: Arc<SharedQueues>,
    id: TaskId,
}

impl CompletionNotifier {
    pub(crate) fn new(shared: Arc<SharedQueues>, id: TaskId) -> Self {
        Self { shared, id }
    }

    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Record the stream status and wake the consumer
    pub fn notify(self, status: HipResult<()>) {
        {
            let mut queues = self.shared.lock();
            match queues.location(self.id) {
                Some(TaskLocation::Running) => {
                    queues.running.retain(|&t| t != self.id);
                    queues.completed.push_back(self.id);
                    queues.set_location(self.id, TaskLocation::Completed);
                    queues.record_status(self.id, status);
                }
                // Still inside the launch callback; the launch path sees
                // the new location and leaves the task alone.
                Some(TaskLocation::Launching) => {
                    queues.completed.push_back(self.id);
                    queues.set_location(self.id, TaskLocation::Completed);
                    queues.record_status(self.id, status);
                }
                Some(other) => {
                    tracing::warn!(task = %self.id, location = %other, "unexpected completion notification");
                    return;
                }
                None => {
                    tracing::debug!(task = %self.id, "completion for a task that is no longer tracked");
                    return;
                }
            }
        }
        self.shared.latch.set();
    }
}

/// What the launch callback gets to work with
pub struct LaunchContext<'a> {
    pub(crate) context: &'a GpuContext,
    pub(crate) device: &'a DeviceContext,
    pub(crate) stream: &'a HipStream,
    pub(crate) module: Option<&'a HipModule>,
    pub(crate) notifier: CompletionNotifier,
}

impl<'a> LaunchContext<'a> {
    pub fn context(&self) -> &'a GpuContext {
        self.context
    }

    pub fn device(&self) -> &'a DeviceContext {
        self.device
    }

    pub fn device_index(&self) -> usize {
        self.device.index()
    }

    pub fn stream(&self) -> &'a HipStream {
        self.stream
    }

    /// Kernel program loaded on this device
    pub fn module(&self) -> Option<&'a HipModule> {
        self.module
    }

    /// Device memory on the task's device; `None` means starved
    pub fn mem_alloc(&self, bytes: usize) -> StromResult<Option<DevicePtr>> {
        self.context.mem_alloc(self.device.index(), bytes)
    }

    pub fn mem_free(&self, addr: DevicePtr) -> StromResult<()> {
        self.context.mem_free(self.device.index(), addr)
    }

    /// Launch `kernel` from the device's program on the task's stream
    ///
    /// # Safety
    ///
    /// `args` must match the kernel signature; see
    /// [`DeviceRuntime::launch_kernel`](crate::backend::hip_backend::DeviceRuntime::launch_kernel).
    pub unsafe fn launch_kernel(
        &self,
        kernel: &str,
        geometry: LaunchGeometry,
        args: &mut [*mut std::ffi::c_void],
    ) -> StromResult<()> {
        let module = self.module.ok_or_else(|| {
            HipError::KernelLoadFailed("task state has no kernel program".to_string())
        })?;
        // The stream belongs to the task's device context.
        if !verify_context(self.device.context()) {
            return Err(HipError::ContextError(format!(
                "launching {} on device {} with another context current",
                kernel,
                self.device.index()
            ))
            .into());
        }
        let func = module.kernel(kernel)?;
        self.context
            .runtime()
            .launch_kernel(func.handle(), geometry, self.stream.handle(), args)?;
        Ok(())
    }

    /// Move the task to completed once the stream drains
    pub fn notify_on_completion(&self) -> StromResult<()> {
        let notifier = self.notifier.clone();
        self.stream
            .add_callback(Box::new(move |status| notifier.notify(status)))?;
        Ok(())
    }

    /// Notifier for callers that track completion themselves
    pub fn notifier(&self) -> CompletionNotifier {
        self.notifier.clone()
    }
}
