//! Device enumeration and the process-wide device registry
//!
//! The registry is built once per process: it initialises the driver,
//! probes every device, drops the ones below the compute-capability gate and
//! derives the installation-wide limits (maximum allocation size, threads
//! per block) that every context shares.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::backend::hip_backend::runtime::{DeviceAttribute, DeviceRuntime};
use crate::config::StromConfig;
use crate::error::{StromError, StromResult};
use crate::memory::calculator::max_alloc_size;

/// Properties of one device that passed the capability gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProperties {
    pub ordinal: i32,
    pub name: String,
    pub total_mem: usize,
    pub compute_major: i32,
    pub compute_minor: i32,
    pub multiprocessor_count: i32,
    pub clock_khz: i32,
    pub memory_clock_khz: i32,
    pub memory_bus_width: i32,
    pub l2_cache_size: i32,
    pub max_threads_per_block: i32,
    pub warp_size: i32,
    pub max_shared_memory_per_block: i32,
}

impl DeviceProperties {
    /// Query every property of `ordinal`
    pub fn query(runtime: &dyn DeviceRuntime, ordinal: i32) -> StromResult<Self> {
        let attr = |a| runtime.device_attribute(ordinal, a);
        Ok(Self {
            ordinal,
            name: runtime.device_name(ordinal)?,
            total_mem: runtime.device_total_mem(ordinal)?,
            compute_major: attr(DeviceAttribute::ComputeCapabilityMajor)?,
            compute_minor: attr(DeviceAttribute::ComputeCapabilityMinor)?,
            multiprocessor_count: attr(DeviceAttribute::MultiprocessorCount)?,
            clock_khz: attr(DeviceAttribute::ClockRate)?,
            memory_clock_khz: attr(DeviceAttribute::MemoryClockRate)?,
            memory_bus_width: attr(DeviceAttribute::GlobalMemoryBusWidth)?,
            l2_cache_size: attr(DeviceAttribute::L2CacheSize)?,
            max_threads_per_block: attr(DeviceAttribute::MaxThreadsPerBlock)?,
            warp_size: attr(DeviceAttribute::WarpSize)?,
            max_shared_memory_per_block: attr(DeviceAttribute::MaxSharedMemoryPerBlock)?,
        })
    }

    /// Compute capability encoded as `major * 10 + minor`
    pub fn capability(&self) -> i32 {
        self.compute_major * 10 + self.compute_minor
    }
}

/// Installed devices and the limits derived from them
#[derive(Debug)]
pub struct DeviceRegistry {
    runtime: Arc<dyn DeviceRuntime>,
    driver_version: i32,
    devices: Vec<DeviceProperties>,
    max_alloc_size: usize,
    max_threads_per_block: usize,
    baseline_capability: i32,
}

impl DeviceRegistry {
    /// Initialise the driver and probe all devices
    ///
    /// Fails with [`StromError::NoDevices`] when no device passes the gate.
    pub fn probe(runtime: Arc<dyn DeviceRuntime>, config: &StromConfig) -> StromResult<Self> {
        runtime.init()?;
        let driver_version = runtime.driver_version()?;
        tracing::info!(
            runtime = runtime.name(),
            "GPU driver version {}.{}",
            driver_version / 10_000_000,
            (driver_version / 100_000) % 100
        );

        let count = runtime.device_count()?;
        let mut devices = Vec::new();
        for ordinal in 0..count {
            if let Some(visible) = &config.visible_devices {
                if !visible.contains(&ordinal) {
                    continue;
                }
            }
            let dev = DeviceProperties::query(runtime.as_ref(), ordinal)?;
            let supported = dev.compute_major >= config.min_compute_major;
            tracing::info!(
                "GPU{} {} ({} SMs, {}MHz, L2 {}KB), RAM {}MB ({}bits, {}MHz), capability {}.{}{}",
                dev.ordinal,
                dev.name,
                dev.multiprocessor_count,
                dev.clock_khz / 1000,
                dev.l2_cache_size >> 10,
                dev.total_mem >> 20,
                dev.memory_bus_width,
                dev.memory_clock_khz / 1000,
                dev.compute_major,
                dev.compute_minor,
                if supported { "" } else { ", NOT SUPPORTED" }
            );
            if supported {
                devices.push(dev);
            }
        }

        if devices.is_empty() {
            tracing::error!("no GPU devices passed the capability check");
            return Err(StromError::NoDevices);
        }

        let baseline_capability = devices.iter().map(|d| d.capability()).min().unwrap_or(0);
        if devices.iter().any(|d| d.capability() != baseline_capability) {
            tracing::warn!(
                "GPUs with mixed compute capability installed; kernels target {}.{}",
                baseline_capability / 10,
                baseline_capability % 10
            );
        }
        let max_threads_per_block = devices
            .iter()
            .map(|d| d.max_threads_per_block.max(0) as usize)
            .min()
            .unwrap_or(0);
        let max_alloc = max_alloc_size(devices.iter().map(|d| d.total_mem));
        tracing::debug!(
            devices = devices.len(),
            max_alloc_size = max_alloc,
            max_threads_per_block,
            "device registry ready"
        );

        Ok(Self {
            runtime,
            driver_version,
            devices,
            max_alloc_size: max_alloc,
            max_threads_per_block,
            baseline_capability,
        })
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn driver_version(&self) -> i32 {
        self.driver_version
    }

    pub fn devices(&self) -> &[DeviceProperties] {
        &self.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Largest single allocation, one third of the smallest device
    pub fn max_alloc_size(&self) -> usize {
        self.max_alloc_size
    }

    /// Smallest `max_threads_per_block` across devices
    pub fn max_threads_per_block(&self) -> usize {
        self.max_threads_per_block
    }

    /// Lowest compute capability installed, as `major * 10 + minor`
    pub fn baseline_capability(&self) -> i32 {
        self.baseline_capability
    }
}

static DEVICE_REGISTRY: Mutex<Option<Arc<DeviceRegistry>>> = Mutex::new(None);

/// Build the process-wide registry, or return the existing one
pub fn init_device_registry(
    runtime: Arc<dyn DeviceRuntime>,
    config: &StromConfig,
) -> StromResult<Arc<DeviceRegistry>> {
    let mut slot = DEVICE_REGISTRY.lock()?;
    if let Some(existing) = slot.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let registry = Arc::new(DeviceRegistry::probe(runtime, config)?);
    *slot = Some(Arc::clone(&registry));
    Ok(registry)
}

/// The process-wide registry
pub fn device_registry() -> StromResult<Arc<DeviceRegistry>> {
    DEVICE_REGISTRY
        .lock()?
        .as_ref()
        .cloned()
        .ok_or(StromError::RegistryNotInitialized)
}

/// Drop the process-wide registry; returns whether one existed
///
/// Contexts already created keep their own reference.
pub fn shutdown_device_registry() -> bool {
    match DEVICE_REGISTRY.lock() {
        Ok(mut slot) => slot.take().is_some(),
        Err(poisoned) => poisoned.into_inner().take().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimDevice, SimRuntime};

    const GIB: usize = 1 << 30;

    #[test]
    fn test_probe_rejects_old_devices() {
        let sim = SimRuntime::builder()
            .device(SimDevice::new("old", 4 * GIB).with_compute_capability(2, 1))
            .device(SimDevice::new("new", 8 * GIB))
            .build();
        let registry = DeviceRegistry::probe(Arc::new(sim), &StromConfig::default()).unwrap();
        assert_eq!(registry.num_devices(), 1);
        assert_eq!(registry.devices()[0].name, "new");
        assert_eq!(registry.devices()[0].ordinal, 1);
    }

    #[test]
    fn test_probe_without_supported_devices_fails() {
        let sim = SimRuntime::builder()
            .device(SimDevice::new("fermi", GIB).with_compute_capability(2, 0))
            .build();
        let err = DeviceRegistry::probe(Arc::new(sim), &StromConfig::default()).unwrap_err();
        assert!(matches!(err, StromError::NoDevices));
    }

    #[test]
    fn test_limits_use_smallest_device() {
        let sim = SimRuntime::builder()
            .device(SimDevice::new("a", 24 * GIB).with_compute_capability(9, 0))
            .device(
                SimDevice::new("b", 6 * GIB)
                    .with_compute_capability(8, 6)
                    .with_attribute(DeviceAttribute::MaxThreadsPerBlock, 512),
            )
            .build();
        let registry = DeviceRegistry::probe(Arc::new(sim), &StromConfig::default()).unwrap();
        assert_eq!(registry.max_alloc_size(), 2 * GIB);
        assert_eq!(registry.max_threads_per_block(), 512);
        assert_eq!(registry.baseline_capability(), 86);
    }

    #[test]
    fn test_visible_devices_filter() {
        let sim = SimRuntime::builder().devices(3).build();
        let config = StromConfig::new().with_visible_devices(vec![2]);
        let registry = DeviceRegistry::probe(Arc::new(sim), &config).unwrap();
        assert_eq!(registry.num_devices(), 1);
        assert_eq!(registry.devices()[0].ordinal, 2);
    }

    #[test]
    #[serial_test::serial]
    fn test_global_registry_lifecycle() {
        shutdown_device_registry();
        assert!(matches!(
            device_registry(),
            Err(StromError::RegistryNotInitialized)
        ));

        let sim: Arc<dyn DeviceRuntime> = Arc::new(SimRuntime::builder().devices(2).build());
        let first = init_device_registry(Arc::clone(&sim), &StromConfig::default()).unwrap();
        let second = init_device_registry(sim, &StromConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &device_registry().unwrap()));

        assert!(shutdown_device_registry());
        assert!(!shutdown_device_registry());
    }
}
