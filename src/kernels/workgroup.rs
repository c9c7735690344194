//! Launch geometry for GPU kernels
//!
//! Block sizes are bounded by the kernel's thread limit and by the shared
//! memory a block would need: a fixed static part plus a dynamic part that
//! grows with the block dimensions.

use serde::Serialize;

use crate::backend::hip_backend::{
    DeviceProperties, DeviceRuntime, HipKernel, KernelResources, LaunchGeometry,
};
use crate::error::{StromError, StromResult};

/// Device limits that bound a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceLimits {
    pub warp_size: usize,
    pub max_shared_memory_per_block: usize,
}

impl DeviceLimits {
    pub fn new(warp_size: usize, max_shared_memory_per_block: usize) -> Self {
        Self {
            warp_size: warp_size.max(1),
            max_shared_memory_per_block,
        }
    }

    fn warp_floor(&self, n: usize) -> usize {
        n / self.warp_size * self.warp_size
    }

    fn warp_ceil(&self, n: usize) -> usize {
        n.div_ceil(self.warp_size) * self.warp_size
    }
}

impl From<&DeviceProperties> for DeviceLimits {
    fn from(props: &DeviceProperties) -> Self {
        Self::new(
            props.warp_size.max(1) as usize,
            props.max_shared_memory_per_block.max(0) as usize,
        )
    }
}

/// How the 1-D block size is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSizing {
    /// Ask the driver for the occupancy-optimal block size
    MaxOccupancy,
    /// Use the kernel's thread limit, trimmed to fit shared memory
    MaxBlockSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Workgroup1D {
    pub grid_size: usize,
    pub block_size: usize,
}

impl Workgroup1D {
    pub fn geometry(&self, dynamic_shmem: usize) -> LaunchGeometry {
        LaunchGeometry {
            grid: (self.grid_size as u32, 1, 1),
            block: (self.block_size as u32, 1, 1),
            dynamic_shmem: dynamic_shmem as u32,
        }
    }

    /// Threads launched in total
    pub fn threads(&self) -> usize {
        self.grid_size * self.block_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Workgroup2D {
    pub grid_x: usize,
    pub grid_y: usize,
    pub block_x: usize,
    pub block_y: usize,
}

impl Workgroup2D {
    pub fn geometry(&self, dynamic_shmem: usize) -> LaunchGeometry {
        LaunchGeometry {
            grid: (self.grid_x as u32, self.grid_y as u32, 1),
            block: (self.block_x as u32, self.block_y as u32, 1),
            dynamic_shmem: dynamic_shmem as u32,
        }
    }
}

/// Shared memory demand of a 2-D launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedMemoryCost {
    pub per_x_item: usize,
    pub per_y_item: usize,
    pub per_thread: usize,
}

fn too_much_shmem(static_shmem: usize, limits: &DeviceLimits) -> StromError {
    StromError::WorkgroupSize(format!(
        "too much GPU shared memory required: static {} bytes, block limit {} bytes",
        static_shmem, limits.max_shared_memory_per_block
    ))
}

/// Largest warp-aligned block up to `max_block` whose shared memory fits
fn fit_block_to_shmem(
    max_block: usize,
    static_shmem: usize,
    per_thread: usize,
    limits: &DeviceLimits,
) -> StromResult<usize> {
    let budget = limits.max_shared_memory_per_block;
    if static_shmem > budget {
        return Err(too_much_shmem(static_shmem, limits));
    }
    if static_shmem + per_thread * max_block <= budget {
        return Ok(max_block);
    }
    let block = limits.warp_floor((budget - static_shmem) / per_thread);
    if block < limits.warp_size {
        return Err(too_much_shmem(static_shmem, limits));
    }
    Ok(block)
}

/// Shrink `block_size` for small inputs and derive the grid
fn finish_1d(block_size: usize, nitems: usize, limits: &DeviceLimits) -> Workgroup1D {
    if nitems == 0 {
        return Workgroup1D {
            grid_size: 0,
            block_size: limits.warp_size,
        };
    }
    let block_size = if block_size > nitems {
        limits.warp_ceil(nitems)
    } else {
        block_size.max(1)
    };
    Workgroup1D {
        grid_size: nitems.div_ceil(block_size),
        block_size,
    }
}

/// 1-D geometry using the kernel's maximum block size
pub fn workgroup_1d_max_blocksize(
    resources: &KernelResources,
    limits: &DeviceLimits,
    nitems: usize,
    shmem_per_thread: usize,
) -> StromResult<Workgroup1D> {
    let block = fit_block_to_shmem(
        resources.max_threads_per_block,
        resources.static_shmem,
        shmem_per_thread,
        limits,
    )?;
    Ok(finish_1d(block, nitems, limits))
}

/// 1-D geometry for `kernel` on `device`
///
/// `block_size_limit` caps the occupancy search; pass the registry's
/// [`max_threads_per_block`](crate::backend::hip_backend::DeviceRegistry::max_threads_per_block).
pub fn workgroup_1d(
    runtime: &dyn DeviceRuntime,
    kernel: &HipKernel,
    device: &DeviceProperties,
    sizing: BlockSizing,
    nitems: usize,
    shmem_per_thread: usize,
    block_size_limit: usize,
) -> StromResult<Workgroup1D> {
    let limits = DeviceLimits::from(device);
    let resources = kernel.resources(runtime)?;
    let workgroup = match sizing {
        BlockSizing::MaxBlockSize => {
            workgroup_1d_max_blocksize(&resources, &limits, nitems, shmem_per_thread)?
        }
        BlockSizing::MaxOccupancy => {
            let hint = runtime.occupancy_max_potential_block_size(
                kernel.handle(),
                shmem_per_thread,
                block_size_limit,
            )?;
            finish_1d(hint.block_size, nitems, &limits)
        }
    };
    tracing::trace!(
        kernel = kernel.name(),
        nitems,
        grid = workgroup.grid_size,
        block = workgroup.block_size,
        "1-D workgroup"
    );
    Ok(workgroup)
}

/// 2-D geometry, as many concurrent threads as shared memory allows
///
/// Starts from a near-square block and gives up whichever dimension costs
/// more shared memory, a warp at a time for X and one row at a time for Y.
pub fn workgroup_2d_for(
    resources: &KernelResources,
    limits: &DeviceLimits,
    x_nitems: usize,
    y_nitems: usize,
    cost: SharedMemoryCost,
) -> StromResult<Workgroup2D> {
    let warp = limits.warp_size;
    let budget = limits.max_shared_memory_per_block;
    let max_block = fit_block_to_shmem(
        resources.max_threads_per_block,
        resources.static_shmem,
        cost.per_thread,
        limits,
    )?;
    if max_block < warp {
        return Err(StromError::WorkgroupSize(format!(
            "kernel allows {} threads per block, less than one warp of {}",
            max_block, warp
        )));
    }

    let root = (max_block as f64).sqrt() as usize;
    // Keep at least one warp along X.
    let mut block_y = root.min(y_nitems.max(1)).min(max_block / warp).max(1);
    let mut block_x = limits.warp_floor(max_block / block_y);

    let demand = |bx: usize, by: usize| {
        resources.static_shmem + bx * cost.per_x_item + by * cost.per_y_item
    };
    while demand(block_x, block_y) > budget {
        if block_x * cost.per_x_item >= block_y * cost.per_y_item {
            if block_x <= warp {
                return Err(StromError::WorkgroupSize(format!(
                    "cannot reduce block x size below one warp ({})",
                    warp
                )));
            }
            block_x -= warp;
            block_y = max_block / block_x;
        } else {
            if block_y <= 1 {
                return Err(StromError::WorkgroupSize(
                    "cannot reduce block y size below 1".to_string(),
                ));
            }
            block_y -= 1;
            block_x = limits.warp_floor(max_block / block_y);
        }
    }

    Ok(Workgroup2D {
        grid_x: x_nitems.div_ceil(block_x),
        grid_y: y_nitems.div_ceil(block_y),
        block_x,
        block_y,
    })
}

/// 2-D geometry for `kernel` on `device`
pub fn workgroup_2d(
    runtime: &dyn DeviceRuntime,
    kernel: &HipKernel,
    device: &DeviceProperties,
    x_nitems: usize,
    y_nitems: usize,
    cost: SharedMemoryCost,
) -> StromResult<Workgroup2D> {
    let resources = kernel.resources(runtime)?;
    workgroup_2d_for(&resources, &DeviceLimits::from(device), x_nitems, y_nitems, cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIMITS: DeviceLimits = DeviceLimits {
        warp_size: 32,
        max_shared_memory_per_block: 65536,
    };

    fn kernel(static_shmem: usize, max_threads: usize) -> KernelResources {
        KernelResources {
            static_shmem,
            max_threads_per_block: max_threads,
        }
    }

    #[test]
    fn test_max_blocksize_uses_kernel_limit() {
        let wg = workgroup_1d_max_blocksize(&kernel(0, 1024), &LIMITS, 100_000, 8).unwrap();
        assert_eq!(wg.block_size, 1024);
        assert_eq!(wg.grid_size, 98);
    }

    #[test]
    fn test_max_blocksize_shrinks_for_shared_memory() {
        // (65536 - 1024) / 100 = 645 -> 640
        let wg = workgroup_1d_max_blocksize(&kernel(1024, 1024), &LIMITS, 10_000, 100).unwrap();
        assert_eq!(wg.block_size, 640);
        assert_eq!(wg.grid_size, 16);
    }

    #[test]
    fn test_small_input_rounds_to_warp() {
        let wg = workgroup_1d_max_blocksize(&kernel(0, 1024), &LIMITS, 37, 0).unwrap();
        assert_eq!(wg.block_size, 64);
        assert_eq!(wg.grid_size, 1);
    }

    #[test]
    fn test_zero_items() {
        let wg = workgroup_1d_max_blocksize(&kernel(0, 1024), &LIMITS, 0, 0).unwrap();
        assert_eq!(wg, Workgroup1D { grid_size: 0, block_size: 32 });
    }

    #[test]
    fn test_static_shmem_over_limit_fails() {
        let err = workgroup_1d_max_blocksize(&kernel(70_000, 1024), &LIMITS, 10, 0).unwrap_err();
        assert!(matches!(err, StromError::WorkgroupSize(_)));
        let err = workgroup_1d_max_blocksize(&kernel(65_000, 1024), &LIMITS, 10, 64).unwrap_err();
        assert!(matches!(err, StromError::WorkgroupSize(_)));
    }

    #[test]
    fn test_2d_near_square_without_pressure() {
        let wg = workgroup_2d_for(&kernel(0, 1024), &LIMITS, 1000, 1000, SharedMemoryCost::default())
            .unwrap();
        assert_eq!((wg.block_x, wg.block_y), (32, 32));
        assert_eq!((wg.grid_x, wg.grid_y), (32, 32));
    }

    #[test]
    fn test_2d_narrow_y() {
        let wg = workgroup_2d_for(&kernel(0, 1024), &LIMITS, 5000, 4, SharedMemoryCost::default())
            .unwrap();
        assert_eq!((wg.block_x, wg.block_y), (256, 4));
        assert_eq!(wg.grid_y, 1);
    }

    #[test]
    fn test_2d_keeps_a_warp_along_x() {
        // sqrt(512) = 22 rows would leave 23 columns, less than a warp.
        let wg = workgroup_2d_for(&kernel(0, 512), &LIMITS, 1000, 1000, SharedMemoryCost::default())
            .unwrap();
        assert_eq!((wg.block_x, wg.block_y), (32, 16));
    }

    #[test]
    fn test_2d_shrinks_y_under_pressure() {
        let cost = SharedMemoryCost {
            per_x_item: 0,
            per_y_item: 4096,
            per_thread: 0,
        };
        let wg = workgroup_2d_for(&kernel(0, 1024), &LIMITS, 4096, 4096, cost).unwrap();
        assert_eq!((wg.block_x, wg.block_y), (64, 16));
        assert_eq!((wg.grid_x, wg.grid_y), (64, 256));
    }

    #[test]
    fn test_2d_gives_up_when_x_cannot_shrink() {
        let cost = SharedMemoryCost {
            per_x_item: 4096,
            per_y_item: 0,
            per_thread: 0,
        };
        let err = workgroup_2d_for(&kernel(0, 1024), &LIMITS, 64, 64, cost).unwrap_err();
        assert!(matches!(err, StromError::WorkgroupSize(_)));
    }

    proptest! {
        #[test]
        fn prop_1d_covers_every_item(
            nitems in 0usize..5_000_000,
            max_threads in prop::sample::select(vec![64usize, 256, 512, 1024]),
            per_thread in 0usize..48,
        ) {
            let wg = workgroup_1d_max_blocksize(&kernel(0, max_threads), &LIMITS, nitems, per_thread)
                .unwrap();
            prop_assert_eq!(wg.block_size % 32, 0);
            prop_assert!(wg.block_size <= max_threads.max(32));
            prop_assert!(wg.threads() >= nitems);
            prop_assert!(per_thread * wg.block_size <= 65536);
            if nitems > 0 {
                prop_assert!(wg.threads() < nitems + wg.block_size);
            }
        }

        #[test]
        fn prop_2d_fits_shared_memory(
            x in 1usize..100_000,
            y in 1usize..100_000,
            per_x in 0usize..256,
            per_y in 0usize..256,
        ) {
            let cost = SharedMemoryCost { per_x_item: per_x, per_y_item: per_y, per_thread: 0 };
            if let Ok(wg) = workgroup_2d_for(&kernel(0, 1024), &LIMITS, x, y, cost) {
                prop_assert!(wg.block_x * per_x + wg.block_y * per_y <= 65536);
                prop_assert!(wg.block_x >= 32 && wg.block_x % 32 == 0);
                prop_assert!(wg.block_y >= 1);
                prop_assert!(wg.grid_x * wg.block_x >= x);
                prop_assert!(wg.grid_y * wg.block_y >= y);
            }
        }
    }
}
