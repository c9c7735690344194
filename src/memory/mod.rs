//! Device and pinned host memory management
//!
//! # Background
//!
//! Raw device allocation goes through the driver, may switch contexts and
//! can synchronize the device. A scan issues at least one allocation and
//! one free per task, so calling the driver each time would serialize the
//! pipeline.
//!
//! # Pattern
//!
//! 1. Request raw memory in coarse blocks (eleven input chunks, 1 MiB
//!    granularity)
//! 2. Sub-allocate 1 KiB-aligned chunks first-fit from those blocks
//! 3. Coalesce on free and keep one empty block per device warm
//! 4. Report exhaustion as "retry later" so the scheduler can back off

pub mod allocator;
pub mod arena;
pub mod calculator;

pub use allocator::{AllocatorStats, BlockLayout, ChunkLayout, MemoryHead};
pub use arena::{ScratchArena, ScratchRegion};
