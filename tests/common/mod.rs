//! Shared fixtures for integration tests
//!
//! Most tests run against the in-process simulator. With the `rocm`
//! feature, [`ROCM_FIXTURE`] probes the real driver once per test binary
//! and is `None` when no usable GPU is present, so GPU tests skip instead
//! of failing.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hipstrom::backend::{CompletionMode, SimRuntime};
use hipstrom::{ContextRegistry, DeviceRegistry, DeviceRuntime, StromConfig};
pub use serial_test::serial;

pub const MIB: usize = 1 << 20;

/// Simulated devices plus a context pool on top of them
pub struct SimFixture {
    pub sim: Arc<SimRuntime>,
    pub devices: Arc<DeviceRegistry>,
    pub pool: ContextRegistry,
}

/// Small chunks and short waits so tests finish quickly
pub fn test_config() -> StromConfig {
    StromConfig::default()
        .with_chunk_size(MIB)
        .with_max_async_tasks(4)
        .with_poll_timeouts(Duration::from_millis(20), Duration::from_millis(500))
}

pub fn sim_fixture(devices: usize, mode: CompletionMode, config: StromConfig) -> SimFixture {
    let sim = Arc::new(SimRuntime::builder().devices(devices).completion(mode).build());
    let registry = DeviceRegistry::probe(Arc::clone(&sim) as Arc<dyn DeviceRuntime>, &config)
        .expect("simulated devices must probe");
    let devices = Arc::new(registry);
    let pool = ContextRegistry::new(Arc::clone(&devices), config)
        .expect("test config must validate");
    SimFixture { sim, devices, pool }
}

#[cfg(feature = "rocm")]
pub static ROCM_FIXTURE: once_cell::sync::Lazy<Option<Arc<DeviceRegistry>>> =
    once_cell::sync::Lazy::new(|| {
        let runtime = Arc::new(hipstrom::HipRuntime::new()) as Arc<dyn DeviceRuntime>;
        match DeviceRegistry::probe(runtime, &StromConfig::default()) {
            Ok(registry) => Some(Arc::new(registry)),
            Err(e) => {
                eprintln!("WARNING: GPU not available, skipping GPU tests: {}", e);
                None
            }
        }
    });
