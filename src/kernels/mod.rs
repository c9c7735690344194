//! Kernel launch support

pub mod workgroup;

pub use workgroup::{
    workgroup_1d, workgroup_1d_max_blocksize, workgroup_2d, workgroup_2d_for, BlockSizing,
    DeviceLimits, SharedMemoryCost, Workgroup1D, Workgroup2D,
};
