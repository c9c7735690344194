//! Task pipeline throughput benchmarks
//!
//! Drives a `GpuTaskState` over the simulated driver with different
//! completion modes and concurrency ceilings, and reports per-task latency
//! of the consumer loop.
//!
//! Run with: `cargo bench --bench pipeline_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hipstrom::backend::{CompletionMode, DevicePtr, SimRuntime};
use hipstrom::context::ResourceScope;
use hipstrom::scheduler::{GpuTask, GpuTaskState, LaunchContext, Latch, TaskOps};
use hipstrom::{ContextRegistry, DeviceRegistry, GpuContext, StromConfig, StromResult};

const CHUNKS: u32 = 256;
const PROGRAM: &[u8] = b"\x7fELF bench kernels";

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: 2,
        }
    }

    fn run<F>(&self, mut f: F) -> anyhow::Result<BenchmarkResult>
    where
        F: FnMut() -> anyhow::Result<usize>,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f()?);
        }
        let mut durations = Vec::with_capacity(self.iterations);
        let mut rows = 0;
        for _ in 0..self.iterations {
            let start = Instant::now();
            rows += black_box(f()?);
            durations.push(start.elapsed());
        }
        Ok(BenchmarkResult {
            name: self.name.clone(),
            durations,
            rows,
        })
    }
}

struct BenchmarkResult {
    name: String,
    durations: Vec<Duration>,
    rows: usize,
}

impl BenchmarkResult {
    fn report(&self) {
        let mut sorted = self.durations.clone();
        sorted.sort();
        let n = sorted.len().max(1);
        let total: Duration = sorted.iter().sum();
        let avg = total / n as u32;
        let min = sorted.first().copied().unwrap_or_default();
        let max = sorted.last().copied().unwrap_or_default();
        let p95 = sorted[(n * 95 / 100).min(n - 1)];
        let per_task_us = avg.as_secs_f64() * 1e6 / CHUNKS as f64;
        let tasks_per_sec = self.rows as f64 / total.as_secs_f64().max(f64::EPSILON);

        println!("\n=== {} ===", self.name);
        println!("Iterations: {} x {} tasks", n, CHUNKS);
        println!("Average: {:?} ({:.2} us/task)", avg, per_task_us);
        println!("Min:     {:?}", min);
        println!("Max:     {:?}", max);
        println!("P95:     {:?}", p95);
        println!("Throughput: {:.0} tasks/sec", tasks_per_sec);
    }
}

/// Each chunk borrows a device buffer for the life of its launch
struct BenchOps {
    total: u32,
    produced: u32,
    buffer_bytes: usize,
}

impl TaskOps for BenchOps {
    type Payload = (u32, Option<DevicePtr>);
    type Tuple = u32;

    fn next_chunk(&mut self, _context: &GpuContext) -> StromResult<Option<Self::Payload>> {
        if self.produced == self.total {
            return Ok(None);
        }
        self.produced += 1;
        Ok(Some((self.produced - 1, None)))
    }

    fn launch(&mut self, task: &mut GpuTask<Self::Payload>, launch: &LaunchContext<'_>) -> StromResult<bool> {
        match launch.mem_alloc(self.buffer_bytes)? {
            Some(ptr) => task.payload_mut().1 = Some(ptr),
            None => return Ok(false),
        }
        launch.notify_on_completion()?;
        Ok(true)
    }

    fn complete(&mut self, task: &mut GpuTask<Self::Payload>, context: &GpuContext) -> StromResult<bool> {
        if let Some(ptr) = task.payload_mut().1.take() {
            context.mem_free(task.device_index().unwrap_or(0), ptr)?;
        }
        Ok(true)
    }

    fn release(&mut self, task: GpuTask<Self::Payload>, context: &GpuContext) {
        let index = task.device_index().unwrap_or(0);
        if let (_, Some(ptr)) = task.into_payload() {
            let _ = context.mem_free(index, ptr);
        }
    }

    fn next_tuple(&mut self, task: &mut GpuTask<Self::Payload>) -> StromResult<Option<u32>> {
        let (seq, _) = task.payload_mut();
        let row = *seq;
        *seq = u32::MAX;
        Ok((row != u32::MAX).then_some(row))
    }
}

fn pool(devices: usize, mode: CompletionMode, max_async: usize) -> anyhow::Result<ContextRegistry> {
    let config = StromConfig::default()
        .with_chunk_size(4 << 20)
        .with_max_async_tasks(max_async)
        .with_poll_timeouts(Duration::from_millis(5), Duration::from_millis(200));
    let sim = Arc::new(SimRuntime::builder().devices(devices).completion(mode).build());
    let registry = DeviceRegistry::probe(sim, &config)?;
    Ok(ContextRegistry::new(Arc::new(registry), config)?)
}

fn scan(pool: &ContextRegistry, buffer_bytes: usize) -> anyhow::Result<usize> {
    let ops = BenchOps {
        total: CHUNKS,
        produced: 0,
        buffer_bytes,
    };
    let ctx = pool.acquire(ResourceScope(7))?;
    let mut state = GpuTaskState::new("bench", ctx, ops, Some(PROGRAM.to_vec()))
        .with_latch(Arc::new(Latch::new()));
    let mut rows = 0;
    while state.next_tuple()?.is_some() {
        rows += 1;
    }
    anyhow::ensure!(rows == CHUNKS as usize, "scan returned {} of {} rows", rows, CHUNKS);
    state.release();
    Ok(rows)
}

fn benchmark_inline() -> anyhow::Result<()> {
    println!("\n[Inline completion: launch and complete on the consumer thread]");
    for max_async in [1, 8, 32] {
        let pool = pool(1, CompletionMode::Inline, max_async)?;
        let bench = Benchmark::new(&format!("inline, max_async_tasks={}", max_async), 20);
        bench.run(|| scan(&pool, 64 << 10))?.report();
    }
    Ok(())
}

fn benchmark_background() -> anyhow::Result<()> {
    println!("\n[Background completion: driver thread wakes the consumer]");
    for (devices, max_async) in [(1, 4), (2, 16), (4, 32)] {
        let pool = pool(devices, CompletionMode::Background(Duration::from_micros(50)), max_async)?;
        let bench = Benchmark::new(
            &format!("background, devices={} max_async_tasks={}", devices, max_async),
            10,
        );
        bench.run(|| scan(&pool, 256 << 10))?.report();
    }
    Ok(())
}

fn benchmark_large_buffers() -> anyhow::Result<()> {
    println!("\n[Large buffers: several tasks share each 4 MiB block]");
    let pool = pool(1, CompletionMode::Background(Duration::from_micros(100)), 16)?;
    let bench = Benchmark::new("1 MiB buffers, 4 MiB blocks", 10);
    bench.run(|| scan(&pool, 1 << 20))?.report();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    hipstrom::init_logging_default();

    println!("========================================");
    println!("hipstrom Task Pipeline Benchmark Suite");
    println!("========================================");

    benchmark_inline()?;
    benchmark_background()?;
    benchmark_large_buffers()?;

    println!("\n========================================");
    println!("Benchmark Complete");
    println!("========================================");
    Ok(())
}
