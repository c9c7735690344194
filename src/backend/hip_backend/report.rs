//! Tabular device information
//!
//! One row per (device, attribute): device name, total memory, then a fixed
//! catalog of driver attributes formatted for humans.

use serde::Serialize;

use crate::backend::hip_backend::device::DeviceRegistry;
use crate::backend::hip_backend::runtime::DeviceAttribute;
use crate::error::StromResult;

/// How an attribute value is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrKind {
    Bool,
    Int,
    KBytes,
    MHz,
    ComputeMode,
    Bits,
}

impl AttrKind {
    fn format(self, value: i32) -> String {
        match self {
            AttrKind::Bool => if value != 0 { "True" } else { "False" }.to_string(),
            AttrKind::Int => value.to_string(),
            AttrKind::KBytes => format!("{} KBytes", value / 1024),
            AttrKind::MHz => format!("{} MHz", value / 1000),
            AttrKind::Bits => format!("{} bits", value),
            AttrKind::ComputeMode => match value {
                0 => "Default",
                1 => "Exclusive",
                2 => "Prohibited",
                3 => "Exclusive Process",
                _ => "Unknown",
            }
            .to_string(),
        }
    }
}

const CATALOG: &[(DeviceAttribute, &str, AttrKind)] = &[
    (DeviceAttribute::MaxThreadsPerBlock, "Max threads per block", AttrKind::Int),
    (DeviceAttribute::MaxBlockDimX, "Maximum block dimension X", AttrKind::Int),
    (DeviceAttribute::MaxBlockDimY, "Maximum block dimension Y", AttrKind::Int),
    (DeviceAttribute::MaxBlockDimZ, "Maximum block dimension Z", AttrKind::Int),
    (DeviceAttribute::MaxGridDimX, "Maximum grid dimension X", AttrKind::Int),
    (DeviceAttribute::MaxGridDimY, "Maximum grid dimension Y", AttrKind::Int),
    (DeviceAttribute::MaxGridDimZ, "Maximum grid dimension Z", AttrKind::Int),
    (DeviceAttribute::MaxSharedMemoryPerBlock, "Maximum shared memory available per block", AttrKind::KBytes),
    (DeviceAttribute::TotalConstantMemory, "Memory available on device for constant data", AttrKind::KBytes),
    (DeviceAttribute::WarpSize, "Warp size in threads", AttrKind::Int),
    (DeviceAttribute::MaxPitch, "Maximum pitch in bytes allowed by memory copies", AttrKind::Int),
    (DeviceAttribute::MaxRegistersPerBlock, "Maximum number of 32bit registers available per block", AttrKind::Int),
    (DeviceAttribute::ClockRate, "Typical clock frequency", AttrKind::MHz),
    (DeviceAttribute::TextureAlignment, "Alignment requirement for textures", AttrKind::Int),
    (DeviceAttribute::MultiprocessorCount, "Number of multiprocessors on device", AttrKind::Int),
    (DeviceAttribute::KernelExecTimeout, "Has kernel execution timeout", AttrKind::Bool),
    (DeviceAttribute::Integrated, "Integrated with host memory", AttrKind::Bool),
    (DeviceAttribute::CanMapHostMemory, "Host memory can be mapped to device address space", AttrKind::Bool),
    (DeviceAttribute::ComputeMode, "Compute mode", AttrKind::ComputeMode),
    (DeviceAttribute::SurfaceAlignment, "Alignment requirement for surfaces", AttrKind::Int),
    (DeviceAttribute::ConcurrentKernels, "Multiple concurrent kernel support", AttrKind::Bool),
    (DeviceAttribute::EccEnabled, "Device has ECC support enabled", AttrKind::Bool),
    (DeviceAttribute::PciBusId, "PCI bus ID of the device", AttrKind::Int),
    (DeviceAttribute::PciDeviceId, "PCI device ID of the device", AttrKind::Int),
    (DeviceAttribute::TccDriver, "Device is using TCC driver model", AttrKind::Bool),
    (DeviceAttribute::MemoryClockRate, "Peak memory clock frequency", AttrKind::MHz),
    (DeviceAttribute::GlobalMemoryBusWidth, "Global memory bus width", AttrKind::Bits),
    (DeviceAttribute::L2CacheSize, "Size of L2 cache", AttrKind::KBytes),
    (DeviceAttribute::MaxThreadsPerMultiprocessor, "Maximum threads per multiprocessor", AttrKind::Int),
    (DeviceAttribute::AsyncEngineCount, "Number of asynchronous engines", AttrKind::Int),
    (DeviceAttribute::UnifiedAddressing, "Device shares unified address space", AttrKind::Bool),
    (DeviceAttribute::PciDomainId, "PCI domain ID of the device", AttrKind::Int),
    (DeviceAttribute::ComputeCapabilityMajor, "Major compute capability version number", AttrKind::Int),
    (DeviceAttribute::ComputeCapabilityMinor, "Minor compute capability version number", AttrKind::Int),
    (DeviceAttribute::StreamPrioritiesSupported, "Device supports stream priorities", AttrKind::Bool),
    (DeviceAttribute::GlobalL1CacheSupported, "Device supports caching globals in L1", AttrKind::Bool),
    (DeviceAttribute::LocalL1CacheSupported, "Device supports caching locals in L1", AttrKind::Bool),
    (DeviceAttribute::MaxSharedMemoryPerMultiprocessor, "Maximum shared memory per multiprocessor", AttrKind::KBytes),
    (DeviceAttribute::MaxRegistersPerMultiprocessor, "Maximum number of 32bit registers per multiprocessor", AttrKind::Int),
    (DeviceAttribute::ManagedMemory, "Device can allocate managed memory on this system", AttrKind::Bool),
    (DeviceAttribute::MultiGpuBoard, "Device is on a multi-GPU board", AttrKind::Bool),
    (DeviceAttribute::MultiGpuBoardGroupId, "Unique id if device is on a multi-GPU board", AttrKind::Int),
];

/// One row of the device report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfoRow {
    pub id: usize,
    pub attribute: String,
    pub value: String,
}

impl DeviceRegistry {
    /// Report every attribute of every registered device
    ///
    /// Read-only: only queries the driver.
    pub fn device_info(&self) -> StromResult<Vec<DeviceInfoRow>> {
        let runtime = self.runtime();
        let mut rows = Vec::with_capacity(self.num_devices() * (CATALOG.len() + 2));
        for (id, dev) in self.devices().iter().enumerate() {
            rows.push(DeviceInfoRow {
                id,
                attribute: "Device name".to_string(),
                value: runtime.device_name(dev.ordinal)?,
            });
            rows.push(DeviceInfoRow {
                id,
                attribute: "Total global memory size".to_string(),
                value: format!("{} MBytes", runtime.device_total_mem(dev.ordinal)? >> 20),
            });
            for &(attr, label, kind) in CATALOG {
                let value = runtime.device_attribute(dev.ordinal, attr)?;
                rows.push(DeviceInfoRow {
                    id,
                    attribute: label.to_string(),
                    value: kind.format(value),
                });
            }
        }
        Ok(rows)
    }

    /// [`device_info`](Self::device_info) as a JSON array
    pub fn device_info_json(&self) -> StromResult<String> {
        Ok(serde_json::to_string_pretty(&self.device_info()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimDevice, SimRuntime};
    use crate::config::StromConfig;
    use std::sync::Arc;

    fn registry() -> DeviceRegistry {
        let sim = SimRuntime::builder()
            .device(
                SimDevice::new("Radeon Sim", 20 << 30)
                    .with_attribute(DeviceAttribute::ComputeMode, 3)
                    .with_attribute(DeviceAttribute::EccEnabled, 1),
            )
            .devices(1)
            .build();
        DeviceRegistry::probe(Arc::new(sim), &StromConfig::default()).unwrap()
    }

    #[test]
    fn test_rows_per_device() {
        let rows = registry().device_info().unwrap();
        assert_eq!(rows.len(), 2 * (CATALOG.len() + 2));
        assert_eq!(rows[0].attribute, "Device name");
        assert_eq!(rows[0].value, "Radeon Sim");
        assert_eq!(rows[1].value, "20480 MBytes");
        assert_eq!(rows[CATALOG.len() + 2].id, 1);
    }

    #[test]
    fn test_value_formatting() {
        let rows = registry().device_info().unwrap();
        let value = |label: &str| {
            rows.iter()
                .find(|r| r.id == 0 && r.attribute == label)
                .map(|r| r.value.clone())
                .unwrap()
        };
        assert_eq!(value("Compute mode"), "Exclusive Process");
        assert_eq!(value("Device has ECC support enabled"), "True");
        assert_eq!(value("Integrated with host memory"), "False");
        assert_eq!(value("Maximum shared memory available per block"), "64 KBytes");
        assert_eq!(value("Typical clock frequency"), "2500 MHz");
        assert_eq!(value("Global memory bus width"), "384 bits");
        assert_eq!(value("Warp size in threads"), "32");
    }

    #[test]
    fn test_compute_mode_unknown() {
        assert_eq!(AttrKind::ComputeMode.format(9), "Unknown");
    }

    #[test]
    fn test_json_export() {
        let json = registry().device_info_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2 * (CATALOG.len() + 2));
    }
}
