//! Task pipeline: liveness, backpressure, retries and error surfacing

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{sim_fixture, test_config, SimFixture, MIB};
use hipstrom::backend::{CompletionMode, DevicePtr};
use hipstrom::context::ResourceScope;
use hipstrom::scheduler::{GpuTask, GpuTaskState, LaunchContext, Latch, TaskOps};
use hipstrom::{ContextRegistry, GpuContext, StromError, StromResult, TaskErrorCode};

#[derive(Debug)]
struct Chunk {
    seq: u32,
    buffer: Option<DevicePtr>,
    emitted: bool,
}

/// Scan over `total` chunks, each needing `buffer_bytes` of device memory
#[derive(Debug, Default)]
struct ScanOps {
    total: u32,
    produced: u32,
    buffer_bytes: usize,
    starve_once: HashSet<u32>,
    relaunch_once: HashSet<u32>,
    fail: HashSet<u32>,
    outstanding: usize,
    max_outstanding: usize,
    releases: Vec<u32>,
}

impl ScanOps {
    fn new(total: u32) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }
}

impl TaskOps for ScanOps {
    type Payload = Chunk;
    type Tuple = u32;

    fn next_chunk(&mut self, _context: &GpuContext) -> StromResult<Option<Chunk>> {
        if self.produced == self.total {
            return Ok(None);
        }
        self.produced += 1;
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
        Ok(Some(Chunk {
            seq: self.produced - 1,
            buffer: None,
            emitted: false,
        }))
    }

    fn launch(&mut self, task: &mut GpuTask<Chunk>, launch: &LaunchContext<'_>) -> StromResult<bool> {
        let seq = task.payload().seq;
        if self.starve_once.remove(&seq) {
            return Ok(false);
        }
        if self.buffer_bytes > 0 && task.payload().buffer.is_none() {
            match launch.mem_alloc(self.buffer_bytes)? {
                Some(ptr) => task.payload_mut().buffer = Some(ptr),
                None => return Ok(false),
            }
        }
        launch.notify_on_completion()?;
        Ok(true)
    }

    fn complete(&mut self, task: &mut GpuTask<Chunk>, context: &GpuContext) -> StromResult<bool> {
        let seq = task.payload().seq;
        if let Some(ptr) = task.payload_mut().buffer.take() {
            context.mem_free(task.device_index().unwrap_or(0), ptr)?;
        }
        if self.relaunch_once.remove(&seq) {
            return Ok(false);
        }
        if self.fail.contains(&seq) {
            task.set_error(TaskErrorCode::CpuReCheck);
        }
        Ok(true)
    }

    fn release(&mut self, task: GpuTask<Chunk>, context: &GpuContext) {
        let index = task.device_index().unwrap_or(0);
        let chunk = task.into_payload();
        if let Some(ptr) = chunk.buffer {
            let _ = context.mem_free(index, ptr);
        }
        self.outstanding -= 1;
        self.releases.push(chunk.seq);
    }

    fn next_tuple(&mut self, task: &mut GpuTask<Chunk>) -> StromResult<Option<u32>> {
        let chunk = task.payload_mut();
        if std::mem::replace(&mut chunk.emitted, true) {
            Ok(None)
        } else {
            Ok(Some(chunk.seq))
        }
    }
}

fn task_state(fx: &SimFixture, ops: ScanOps) -> GpuTaskState<ScanOps> {
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();
    GpuTaskState::new("scan", ctx, ops, Some(b"\x7fELF scan kernels".to_vec()))
        .with_latch(Arc::new(Latch::new()))
}

fn drain(state: &mut GpuTaskState<ScanOps>) -> Vec<u32> {
    let mut rows = Vec::new();
    while let Some(row) = state.next_tuple().unwrap() {
        rows.push(row);
    }
    rows
}

#[test]
fn test_every_chunk_delivered_once_in_order() {
    let fx = sim_fixture(2, CompletionMode::Inline, test_config());
    let mut state = task_state(&fx, ScanOps::new(25));
    assert_eq!(drain(&mut state), (0..25).collect::<Vec<_>>());
    assert_eq!(state.ops().releases.len(), 25);
    assert_eq!(state.ops().outstanding, 0);
}

#[test]
fn test_background_completion_delivers_everything() {
    let fx = sim_fixture(2, CompletionMode::Background(Duration::from_millis(2)), test_config());
    let mut state = task_state(&fx, ScanOps::new(40));
    let mut rows = drain(&mut state);
    rows.sort_unstable();
    assert_eq!(rows, (0..40).collect::<Vec<_>>());
    let perf = state.perf_stats().clone();
    assert_eq!(perf.tasks_created, 40);
    assert_eq!(perf.tasks_launched, 40);
    assert_eq!(perf.tasks_completed, 40);
}

#[test]
fn test_in_flight_never_exceeds_ceiling() {
    let config = test_config().with_max_async_tasks(3);
    let fx = sim_fixture(2, CompletionMode::Background(Duration::from_millis(1)), config);
    let mut state = task_state(&fx, ScanOps::new(30));
    let mut seen = 0;
    while let Some(id) = state.fetch().unwrap() {
        assert!(state.queue_stats().in_flight() <= 3);
        state.release_task(id).unwrap();
        seen += 1;
    }
    assert_eq!(seen, 30);
    assert!(state.ops().max_outstanding <= 3);
}

#[test]
fn test_starved_launch_reaches_ready_once() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let mut ops = ScanOps::new(6);
    ops.starve_once.insert(0);
    ops.starve_once.insert(4);
    let mut state = task_state(&fx, ops);
    let mut rows = drain(&mut state);
    rows.sort_unstable();
    assert_eq!(rows, (0..6).collect::<Vec<_>>());
    assert_eq!(state.perf_stats().launch_retries, 2);
    assert_eq!(state.perf_stats().tasks_launched, 6);
}

#[test]
fn test_memory_starvation_backs_off_until_buffers_return() {
    let config = test_config().with_max_async_tasks(6);
    let fx = sim_fixture(1, CompletionMode::Background(Duration::from_millis(5)), config);
    // One 11 MiB block fits two 4 MiB buffers; a second block never fits.
    fx.sim.set_memory_limit(0, 12 * MIB);
    let mut ops = ScanOps::new(10);
    ops.buffer_bytes = 4 * MIB;
    let mut state = task_state(&fx, ops);

    let mut rows = drain(&mut state);
    rows.sort_unstable();
    assert_eq!(rows, (0..10).collect::<Vec<_>>());
    assert!(state.perf_stats().launch_retries > 0);
    let ctx = state.context().unwrap();
    assert!(ctx.allocator_stats(0).unwrap().backoffs > 0);
    assert_eq!(ctx.allocator_stats(0).unwrap().active_chunks, 0);
}

#[test]
fn test_completion_can_request_relaunch() {
    let fx = sim_fixture(2, CompletionMode::Inline, test_config());
    let mut ops = ScanOps::new(5);
    ops.relaunch_once.insert(2);
    let mut state = task_state(&fx, ops);
    let mut rows = drain(&mut state);
    rows.sort_unstable();
    assert_eq!(rows, vec![0, 1, 2, 3, 4]);
    assert_eq!(state.perf_stats().completion_retries, 1);
    assert_eq!(state.perf_stats().tasks_launched, 6);
}

#[test]
fn test_failed_task_surfaces_before_earlier_successes() {
    // Ceiling above the input size: the whole batch completes in one pass.
    let fx = sim_fixture(1, CompletionMode::Inline, test_config().with_max_async_tasks(8));
    let mut ops = ScanOps::new(3);
    ops.fail.insert(2);
    let mut state = task_state(&fx, ops);

    match state.fetch() {
        Err(StromError::TaskFailed { code }) => assert_eq!(code, TaskErrorCode::CpuReCheck),
        other => panic!("expected the failed task first, got {:?}", other),
    }
    let mut rest = Vec::new();
    while let Some(id) = state.fetch().unwrap() {
        rest.push(state.task(id).unwrap().payload().seq);
        state.release_task(id).unwrap();
    }
    assert_eq!(rest, vec![0, 1]);

    state.cleanup();
    assert!(state.queue_stats().is_empty());
    assert_eq!(state.ops().outstanding, 0);
}

#[test]
fn test_stream_failure_marks_task() {
    let fx = sim_fixture(1, CompletionMode::Manual, test_config());
    let mut state = task_state(&fx, ScanOps::new(1));
    let sim = Arc::clone(&fx.sim);
    let driver = thread::spawn(move || {
        while sim.pending_callbacks() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        sim.complete_pending_with(Err(hipstrom::HipError::OutOfMemory("launch".into())))
    });
    let err = state.fetch().unwrap_err();
    assert_eq!(driver.join().unwrap(), 1);
    assert!(matches!(err, StromError::TaskFailed { code: TaskErrorCode::OutOfMemory }));
}

#[test]
fn test_interrupt_aborts_long_wait() {
    let fx = sim_fixture(1, CompletionMode::Manual, test_config());
    let mut state = task_state(&fx, ScanOps::new(2));
    let latch = Arc::clone(state.latch());
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        latch.interrupt();
    });
    assert!(matches!(state.fetch(), Err(StromError::Cancelled)));
    interrupter.join().unwrap();

    // Cleanup still releases the abandoned tasks.
    state.cleanup();
    assert_eq!(state.ops().releases.len(), 2);
    assert!(state.perf_stats().long_waits >= 1);
}

#[test]
fn test_release_unloads_program_and_context() {
    let fx = sim_fixture(2, CompletionMode::Inline, test_config());
    let mut state = task_state(&fx, ScanOps::new(8));
    drain(&mut state);
    state.release();
    let counters = fx.sim.counters();
    assert_eq!(counters.modules_loaded, counters.modules_unloaded);
    assert_eq!(counters.streams_created, counters.streams_destroyed);
    assert!(fx.pool.is_empty());
}

#[test]
fn test_synchronous_state_needs_no_device_work() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(3)).unwrap();
    let mut state = GpuTaskState::new("cpu fallback", ctx, ScanOps::new(4), None);
    assert!(!state.is_asynchronous());
    assert_eq!(drain(&mut state), vec![0, 1, 2, 3]);
    assert_eq!(fx.sim.counters().streams_created, 0);
}

#[test]
fn test_zero_ceiling_is_rejected_and_one_still_drains() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let zero = test_config().with_max_async_tasks(0);
    let err = ContextRegistry::new(Arc::clone(&fx.devices), zero).unwrap_err();
    assert!(matches!(err, StromError::InvalidConfiguration(_)));

    let fx = sim_fixture(1, CompletionMode::Inline, test_config().with_max_async_tasks(1));
    let mut state = task_state(&fx, ScanOps::new(3));
    assert_eq!(drain(&mut state), vec![0, 1, 2]);
    assert_eq!(state.ops().max_outstanding, 1);
}
