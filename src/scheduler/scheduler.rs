//! Task pipeline driver
//!
//! A [`GpuTaskState`] runs one scan or operator. The consumer calls
//! [`fetch`](GpuTaskState::fetch) (or [`next_tuple`](GpuTaskState::next_tuple))
//! and every call drives the pipeline forward:
//!
//! 1. completed tasks go through `complete` and become ready (failed ones at
//!    the front of the ready queue)
//! 2. pending tasks are launched until one reports starvation
//! 3. more input is pulled while the concurrency ceiling allows
//! 4. otherwise the consumer blocks on the latch, briefly if tasks are
//!    pending on resources, longer if it only waits for the device
//!
//! No worker threads are involved; the device runs asynchronously and
//! completion notifications arrive on driver threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::hip_backend::{ContextGuard, HipModule, HipStream};
use crate::context::{GpuContext, GpuContextRef};
use crate::error::{StromError, StromResult, TaskErrorCode};
use crate::scheduler::latch::{process_latch, Latch};
use crate::scheduler::queue::{QueueStats, SharedQueues};
use crate::scheduler::stats::PerfStats;
use crate::scheduler::task::{CompletionNotifier, GpuTask, LaunchContext, TaskOps};
use crate::scheduler::types::{TaskId, TaskLocation};

/// Outcome of the wait step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitStep {
    /// Something can be done without blocking
    Proceed,
    Wait(Duration, WaitKind),
    /// Nothing is in flight and input is exhausted
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Short,
    Long,
}

/// Pipeline state of one logical scan
pub struct GpuTaskState<O: TaskOps> {
    label: String,
    ops: O,
    context: Option<GpuContextRef>,
    shared: Arc<SharedQueues>,
    tasks: Vec<Option<GpuTask<O::Payload>>>,
    program: Option<Arc<[u8]>>,
    modules: Vec<Option<HipModule>>,
    max_async_tasks: usize,
    short_timeout: Duration,
    long_timeout: Duration,
    perfmon: bool,
    perf: PerfStats,
    current: Option<TaskId>,
    released: bool,
}

impl<O: TaskOps> std::fmt::Debug for GpuTaskState<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTaskState")
            .field("label", &self.label)
            .field("queues", &self.queue_stats())
            .field("asynchronous", &self.is_asynchronous())
            .finish()
    }
}

impl<O: TaskOps> GpuTaskState<O> {
    /// Create a task state on `context`
    ///
    /// With a kernel `program` tasks are launched asynchronously; the
    /// program is loaded on each device the first time a task is launched
    /// there. Without one, [`fetch`](Self::fetch) hands out input chunks
    /// synchronously.
    pub fn new(
        label: impl Into<String>,
        context: GpuContextRef,
        ops: O,
        program: Option<Vec<u8>>,
    ) -> Self {
        let config = context.config().clone();
        let num_devices = context.num_devices();
        Self {
            label: label.into(),
            ops,
            context: Some(context),
            shared: Arc::new(SharedQueues::new(process_latch())),
            tasks: Vec::new(),
            program: program.map(Arc::from),
            modules: (0..num_devices).map(|_| None).collect(),
            max_async_tasks: config.max_async_tasks,
            short_timeout: config.short_poll_timeout,
            long_timeout: config.long_poll_timeout,
            perfmon: config.perfmon,
            perf: PerfStats::new(),
            current: None,
            released: false,
        }
    }

    /// Wait on `latch` instead of the process-wide one
    pub fn with_latch(mut self, latch: Arc<Latch>) -> Self {
        self.shared = Arc::new(SharedQueues::new(latch));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn latch(&self) -> &Arc<Latch> {
        &self.shared.latch
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    pub fn context(&self) -> StromResult<&GpuContext> {
        self.context
            .as_deref()
            .ok_or_else(|| StromError::InvalidTaskState(format!("{} was released", self.label)))
    }

    pub fn is_asynchronous(&self) -> bool {
        self.program.is_some()
    }

    pub fn scan_done(&self) -> bool {
        self.shared.lock().scan_done
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.lock().stats()
    }

    pub fn perf_stats(&self) -> &PerfStats {
        &self.perf
    }

    /// Where `id` currently is, if still tracked
    pub fn task_location(&self, id: TaskId) -> Option<TaskLocation> {
        self.shared.lock().location(id)
    }

    pub fn task(&self, id: TaskId) -> Option<&GpuTask<O::Payload>> {
        self.tasks
            .get(id.slot())
            .and_then(|t| t.as_ref())
            .filter(|t| t.id() == id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut GpuTask<O::Payload>> {
        self.tasks
            .get_mut(id.slot())
            .and_then(|t| t.as_mut())
            .filter(|t| t.id() == id)
    }

    fn store_task(&mut self, task: GpuTask<O::Payload>) {
        let slot = task.id().slot();
        if slot >= self.tasks.len() {
            self.tasks.resize_with(slot + 1, || None);
        }
        self.tasks[slot] = Some(task);
    }

    fn check_interrupt(&self) -> StromResult<()> {
        if self.shared.latch.take_interrupt() {
            tracing::debug!(state = %self.label, "task pipeline interrupted");
            return Err(StromError::Cancelled);
        }
        Ok(())
    }

    /// Next ready task
    ///
    /// Returns `Ok(None)` once input is exhausted and nothing is in flight.
    /// A task carrying a kernel error is reported as
    /// [`StromError::TaskFailed`]; it stays tracked until cleanup.
    pub fn fetch(&mut self) -> StromResult<Option<TaskId>> {
        if self.context.is_none() {
            return Err(StromError::InvalidTaskState(format!(
                "{} was released",
                self.label
            )));
        }
        if self.program.is_none() {
            return self.fetch_synchronous();
        }

        loop {
            self.check_interrupt()?;
            let seen = self.shared.latch.generation();

            if let Some(ctx) = self.context.as_deref() {
                self.ops.poll(ctx)?;
            }
            self.process_completed()?;
            self.launch_pending()?;
            if self.pull_input()? {
                continue;
            }
            if let Some(id) = self.pop_ready()? {
                return Ok(Some(id));
            }

            match self.wait_step() {
                WaitStep::Proceed => continue,
                WaitStep::Stop => return Ok(None),
                WaitStep::Wait(timeout, kind) => {
                    match kind {
                        WaitKind::Short => self.perf.short_waits += 1,
                        WaitKind::Long => self.perf.long_waits += 1,
                    }
                    let started = Instant::now();
                    self.shared.latch.wait(seen, timeout);
                    self.perf.sync_wait_time += started.elapsed();
                }
            }
        }
    }

    /// Fetch and borrow the task in one step
    pub fn fetch_task(&mut self) -> StromResult<Option<&mut GpuTask<O::Payload>>> {
        match self.fetch()? {
            Some(id) => Ok(self.task_mut(id)),
            None => Ok(None),
        }
    }

    fn fetch_synchronous(&mut self) -> StromResult<Option<TaskId>> {
        self.check_interrupt()?;
        if self.shared.lock().scan_done {
            return Ok(None);
        }
        let Some(ctx) = self.context.as_deref() else {
            return Ok(None);
        };
        match self.ops.next_chunk(ctx)? {
            Some(payload) => {
                let id = self.shared.lock().track(TaskLocation::Fetched);
                self.perf.tasks_created += 1;
                self.store_task(GpuTask::new(id, payload));
                Ok(Some(id))
            }
            None => {
                self.shared.lock().scan_done = true;
                Ok(None)
            }
        }
    }

    /// Pull one unit of input if the ceiling allows; returns whether the
    /// queues changed
    fn pull_input(&mut self) -> StromResult<bool> {
        {
            let queues = self.shared.lock();
            if queues.scan_done || queues.in_flight() >= self.max_async_tasks {
                return Ok(false);
            }
        }
        let Some(ctx) = self.context.as_deref() else {
            return Ok(false);
        };
        match self.ops.next_chunk(ctx)? {
            Some(payload) => {
                let id = {
                    let mut queues = self.shared.lock();
                    let id = queues.track(TaskLocation::Pending);
                    queues.pending.push_back(id);
                    id
                };
                self.perf.tasks_created += 1;
                self.store_task(GpuTask::new(id, payload));
                tracing::trace!(state = %self.label, task = %id, "queued input chunk");
            }
            None => {
                self.shared.lock().scan_done = true;
                tracing::debug!(state = %self.label, "scan done");
            }
        }
        Ok(true)
    }

    fn wait_step(&self) -> WaitStep {
        let queues = self.shared.lock();
        if !queues.ready.is_empty() || !queues.completed.is_empty() {
            WaitStep::Proceed
        } else if !queues.pending.is_empty() {
            WaitStep::Wait(self.short_timeout, WaitKind::Short)
        } else if !queues.running.is_empty() {
            WaitStep::Wait(self.long_timeout, WaitKind::Long)
        } else if !queues.scan_done {
            WaitStep::Proceed
        } else {
            WaitStep::Stop
        }
    }

    fn pop_ready(&mut self) -> StromResult<Option<TaskId>> {
        let id = {
            let mut queues = self.shared.lock();
            match queues.ready.pop_front() {
                Some(id) => {
                    queues.set_location(id, TaskLocation::Fetched);
                    id
                }
                None => return Ok(None),
            }
        };
        let code = self.task(id).map(|t| t.error()).unwrap_or_default();
        if !code.is_success() {
            tracing::error!(state = %self.label, task = %id, "GPU task failed: {}", code);
            return Err(StromError::TaskFailed { code });
        }
        Ok(Some(id))
    }

    fn process_completed(&mut self) -> StromResult<()> {
        let Self {
            label,
            ops,
            context,
            shared,
            tasks,
            perf,
            ..
        } = self;
        let Some(ctx) = context.as_deref() else {
            return Ok(());
        };
        let runtime = ctx.runtime().as_ref();

        loop {
            let (id, status) = {
                let mut queues = shared.lock();
                let Some(id) = queues.completed.pop_front() else {
                    return Ok(());
                };
                queues.set_location(id, TaskLocation::Completing);
                (id, queues.take_status(id))
            };
            let Some(task) = tasks
                .get_mut(id.slot())
                .and_then(|t| t.as_mut())
                .filter(|t| t.id() == id)
            else {
                shared.lock().untrack(id);
                return Err(StromError::Internal(format!(
                    "{} completed but has no task object",
                    id
                )));
            };

            if let Some(Err(e)) = status {
                tracing::error!(state = %label, task = %id, "GPU stream reported failure: {}", e);
                task.set_error(if e.is_out_of_memory() {
                    TaskErrorCode::OutOfMemory
                } else {
                    TaskErrorCode::Internal
                });
            }

            let device = ctx.device(task.device_index().unwrap_or(0))?;
            let started = Instant::now();
            let outcome = match ContextGuard::push(runtime, device.context()) {
                Ok(guard) => {
                    let r = ops.complete(task, ctx);
                    drop(guard);
                    r
                }
                Err(e) => Err(e.into()),
            };
            perf.complete_time += started.elapsed();

            match outcome {
                Err(e) => {
                    shared.lock().park_failed(id);
                    return Err(e);
                }
                Ok(true) => {
                    perf.tasks_completed += 1;
                    if let Some(stream) = task.stream.take() {
                        match ContextGuard::push(runtime, device.context()) {
                            Ok(_guard) => drop(stream),
                            Err(e) => {
                                tracing::warn!(task = %id, "cannot push context to destroy stream: {}", e);
                                drop(stream);
                            }
                        }
                    }
                    let failed = !task.error().is_success();
                    let mut queues = shared.lock();
                    if failed {
                        queues.ready.push_front(id);
                    } else {
                        queues.ready.push_back(id);
                    }
                    queues.set_location(id, TaskLocation::Ready);
                }
                Ok(false) => {
                    perf.completion_retries += 1;
                    tracing::trace!(state = %label, task = %id, "task needs another launch");
                    let mut queues = shared.lock();
                    queues.pending.push_front(id);
                    queues.set_location(id, TaskLocation::Pending);
                }
            }
        }
    }

    fn launch_pending(&mut self) -> StromResult<()> {
        let Self {
            label,
            ops,
            context,
            shared,
            tasks,
            program,
            modules,
            perf,
            ..
        } = self;
        let Some(ctx) = context.as_deref() else {
            return Ok(());
        };
        let Some(program) = program.as_ref() else {
            return Ok(());
        };
        let runtime = Arc::clone(ctx.runtime());

        loop {
            let id = {
                let mut queues = shared.lock();
                let Some(id) = queues.pending.pop_front() else {
                    return Ok(());
                };
                queues.set_location(id, TaskLocation::Launching);
                id
            };
            let Some(task) = tasks
                .get_mut(id.slot())
                .and_then(|t| t.as_mut())
                .filter(|t| t.id() == id)
            else {
                shared.lock().untrack(id);
                return Err(StromError::Internal(format!(
                    "{} is pending but has no task object",
                    id
                )));
            };

            let index = task.assign_device(|| ctx.next_device_index());
            let device = ctx.device(index)?;
            let guard = match ContextGuard::push(runtime.as_ref(), device.context()) {
                Ok(guard) => guard,
                Err(e) => {
                    shared.lock().park_failed(id);
                    return Err(e.into());
                }
            };

            let prepared: StromResult<HipStream> = (|| {
                if modules[index].is_none() {
                    let module = HipModule::load_from_data(Arc::clone(&runtime), program)?;
                    tracing::debug!(state = %label, device = index, "loaded GPU program");
                    modules[index] = Some(module);
                }
                match task.stream.take() {
                    Some(stream) => Ok(stream),
                    None => Ok(HipStream::non_blocking(Arc::clone(&runtime))?),
                }
            })();
            let stream = match prepared {
                Ok(stream) => stream,
                Err(e) => {
                    drop(guard);
                    shared.lock().park_failed(id);
                    return Err(e);
                }
            };

            let launch = LaunchContext {
                context: ctx,
                device,
                stream: &stream,
                module: modules[index].as_ref(),
                notifier: CompletionNotifier::new(Arc::clone(shared), id),
            };
            let started = Instant::now();
            let outcome = ops.launch(task, &launch);
            perf.launch_time += started.elapsed();
            drop(launch);
            task.stream = Some(stream);
            drop(guard);

            let mut queues = shared.lock();
            match outcome {
                Err(e) => {
                    queues.park_failed(id);
                    return Err(e);
                }
                Ok(true) => {
                    perf.tasks_launched += 1;
                    if queues.location(id) == Some(TaskLocation::Launching) {
                        queues.running.push_back(id);
                        queues.set_location(id, TaskLocation::Running);
                    }
                    tracing::trace!(state = %label, task = %id, device = index, "launched task");
                }
                Ok(false) => {
                    perf.launch_retries += 1;
                    if queues.location(id) == Some(TaskLocation::Launching) {
                        queues.pending.push_front(id);
                        queues.set_location(id, TaskLocation::Pending);
                    }
                    tracing::trace!(state = %label, task = %id, "launch starved, retrying later");
                    return Ok(());
                }
            }
        }
    }

    /// Release a fetched task through the `release` callback
    pub fn release_task(&mut self, id: TaskId) -> StromResult<()> {
        let location = self.shared.lock().location(id);
        match location {
            Some(TaskLocation::Fetched) | Some(TaskLocation::Failed) => {}
            Some(other) => {
                return Err(StromError::InvalidTaskState(format!(
                    "{} cannot be released while {}",
                    id, other
                )))
            }
            None => {
                return Err(StromError::InvalidTaskState(format!("{} is not tracked", id)));
            }
        }
        if self.current == Some(id) {
            self.current = None;
        }
        self.release_tracked(id);
        Ok(())
    }

    /// Untrack `id` and run its release callback
    fn release_tracked(&mut self, id: TaskId) {
        self.shared.lock().untrack(id);
        let task = match self.tasks.get_mut(id.slot()) {
            Some(slot) if slot.as_ref().map(|t| t.id()) == Some(id) => slot.take(),
            _ => None,
        };
        let (Some(mut task), Some(ctx)) = (task, self.context.as_deref()) else {
            return;
        };
        if let Some(stream) = task.stream.take() {
            let dev = task.device_index().and_then(|i| ctx.device(i).ok());
            match dev.map(|d| ContextGuard::push(ctx.runtime().as_ref(), d.context())) {
                Some(Ok(_guard)) => drop(stream),
                Some(Err(e)) => {
                    tracing::warn!(task = %id, "cannot push context to destroy stream: {}", e);
                    drop(stream);
                }
                None => drop(stream),
            }
        }
        self.ops.release(task, ctx);
        self.perf.tasks_released += 1;
    }

    /// Pull the next output row, fetching and releasing tasks as needed
    pub fn next_tuple(&mut self) -> StromResult<Option<O::Tuple>> {
        loop {
            if let Some(id) = self.current {
                let Self { ops, tasks, .. } = self;
                let tuple = match tasks
                    .get_mut(id.slot())
                    .and_then(|t| t.as_mut())
                    .filter(|t| t.id() == id)
                {
                    Some(task) => ops.next_tuple(task)?,
                    None => None,
                };
                if tuple.is_some() {
                    return Ok(tuple);
                }
                self.current = None;
                self.release_task(id)?;
            }
            match self.fetch()? {
                Some(id) => self.current = Some(id),
                None => return Ok(None),
            }
        }
    }

    /// Synchronize the devices and release every tracked task
    ///
    /// Queues are emptied; the scan-done flag is kept. Problems are logged.
    pub fn cleanup(&mut self) {
        if let Some(ctx) = self.context.as_deref() {
            if self.program.is_some() {
                ctx.synchronize_devices();
            }
        }
        let tracked = self.shared.lock().tracked();
        for id in tracked {
            self.release_tracked(id);
        }
        self.shared.lock().reset();
        self.tasks.clear();
        self.current = None;
    }

    /// Start the scan over
    pub fn rescan(&mut self) {
        self.cleanup();
        self.shared.lock().scan_done = false;
        tracing::debug!(state = %self.label, "rescan");
    }

    /// Clean up, unload the program and give back the context reference
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cleanup();

        if let Some(ctx) = self.context.as_deref() {
            let runtime = ctx.runtime().as_ref();
            for (index, module) in self.modules.iter_mut().enumerate() {
                let Some(module) = module.take() else {
                    continue;
                };
                match ctx.device(index).map(|d| ContextGuard::push(runtime, d.context())) {
                    Ok(Ok(_guard)) => drop(module),
                    Ok(Err(e)) => {
                        tracing::warn!(device = index, "cannot push context to unload program: {}", e);
                        drop(module);
                    }
                    Err(e) => {
                        tracing::warn!(device = index, "program loaded on unknown device: {}", e);
                        drop(module);
                    }
                }
            }
        }
        if self.perfmon {
            self.perf.log(&self.label);
        }
        if let Some(context) = self.context.take() {
            context.release();
        }
    }
}

impl<O: TaskOps> Drop for GpuTaskState<O> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
