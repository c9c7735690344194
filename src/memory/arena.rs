//! Pinned host scratch arena
//!
//! DMA staging buffers for a [`GpuContext`](crate::context::GpuContext).
//! Page-locked host memory is expensive to map, so the arena grabs it in
//! segments (doubling from `4 x chunk_size` up to a fixed ceiling) and
//! hands out best-fit regions from them.
//!
//! Segments are mapped under the context's primary device context and must
//! be released before that context is destroyed.

use crate::backend::hip_backend::runtime::{DeviceRuntime, HostPtr};
use crate::error::{StromError, StromResult};
use crate::memory::calculator::{align_up, scratch_initial_size, scratch_max_size};

/// Free range within one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: usize,
    size: usize,
}

impl FreeRange {
    fn is_adjacent_to(&self, other: &FreeRange) -> bool {
        self.offset + self.size == other.offset
    }
}

#[derive(Debug)]
struct Segment {
    base: HostPtr,
    capacity: usize,
    /// Sorted by offset, adjacent ranges merged
    free: Vec<FreeRange>,
}

/// Region handed out by [`ScratchArena::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    segment: usize,
    offset: usize,
    size: usize,
    ptr: HostPtr,
}

impl ScratchRegion {
    /// Host address of the region
    pub fn ptr(&self) -> HostPtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Segmented best-fit arena over pinned host memory
#[derive(Debug)]
pub struct ScratchArena {
    segments: Vec<Segment>,
    next_segment_size: usize,
    max_size: usize,
    allocated: usize,
}

impl ScratchArena {
    /// Alignment of every region, suitable for async copies
    pub const DEFAULT_ALIGNMENT: usize = 256;

    /// Create an arena sized for `chunk_size` inputs; nothing is mapped yet
    pub fn new(chunk_size: usize) -> Self {
        Self {
            segments: Vec::new(),
            next_segment_size: scratch_initial_size(chunk_size),
            max_size: scratch_max_size(chunk_size),
            allocated: 0,
        }
    }

    /// Reserve `size` bytes; maps a new segment when no existing one fits
    ///
    /// The owning context's primary device context must be current.
    pub fn allocate(
        &mut self,
        runtime: &dyn DeviceRuntime,
        size: usize,
    ) -> StromResult<ScratchRegion> {
        let size = align_up(size.max(1), Self::DEFAULT_ALIGNMENT).ok_or(
            StromError::ScratchExhausted {
                requested: size,
                limit: self.max_size,
            },
        )?;

        let (segment, index) = match self.find_best_fit(size) {
            Some(hit) => hit,
            None => {
                let segment = self.map_segment(runtime, size)?;
                (segment, 0)
            }
        };

        let seg = &mut self.segments[segment];
        let range = seg.free[index];
        if range.size == size {
            seg.free.remove(index);
        } else {
            seg.free[index] = FreeRange {
                offset: range.offset + size,
                size: range.size - size,
            };
        }
        self.allocated += size;

        tracing::trace!(segment, offset = range.offset, size, "scratch region allocated");
        Ok(ScratchRegion {
            segment,
            offset: range.offset,
            size,
            ptr: seg.base.offset(range.offset),
        })
    }

    /// Return a region to its segment
    pub fn free(&mut self, region: ScratchRegion) -> StromResult<()> {
        let seg = self.segments.get_mut(region.segment).ok_or_else(|| {
            StromError::Internal(format!("scratch region refers to segment {}", region.segment))
        })?;
        if region.offset + region.size > seg.capacity {
            return Err(StromError::Internal(format!(
                "scratch region [{}, {}) exceeds segment of {} bytes",
                region.offset,
                region.offset + region.size,
                seg.capacity
            )));
        }

        let pos = seg.free.partition_point(|r| r.offset < region.offset);
        seg.free.insert(
            pos,
            FreeRange {
                offset: region.offset,
                size: region.size,
            },
        );
        Self::coalesce(&mut seg.free);
        self.allocated -= region.size;
        Ok(())
    }

    /// Unmap every segment
    ///
    /// Failures are logged; this runs during context teardown.
    pub fn release(&mut self, runtime: &dyn DeviceRuntime) {
        for seg in self.segments.drain(..) {
            if let Err(e) = runtime.host_free(seg.base) {
                tracing::warn!(
                    base = seg.base.raw(),
                    capacity = seg.capacity,
                    "failed to release pinned scratch segment: {}",
                    e
                );
            }
        }
        self.allocated = 0;
    }

    /// Bytes currently mapped
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(|s| s.capacity).sum()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of free ranges across all segments
    pub fn fragment_count(&self) -> usize {
        self.segments.iter().map(|s| s.free.len()).sum()
    }

    /// Smallest free range that fits, across all segments
    fn find_best_fit(&self, size: usize) -> Option<(usize, usize)> {
        self.segments
            .iter()
            .enumerate()
            .flat_map(|(s, seg)| seg.free.iter().enumerate().map(move |(i, r)| (s, i, r.size)))
            .filter(|&(_, _, free)| free >= size)
            .min_by_key(|&(_, _, free)| free)
            .map(|(s, i, _)| (s, i))
    }

    fn map_segment(&mut self, runtime: &dyn DeviceRuntime, size: usize) -> StromResult<usize> {
        let limit = self.max_size;
        let exhausted = || StromError::ScratchExhausted {
            requested: size,
            limit,
        };
        if size > limit {
            return Err(exhausted());
        }
        let mut length = self.next_segment_size;
        while length < size {
            length = length.checked_mul(2).ok_or_else(exhausted)?;
        }
        let mapped = self.capacity();
        if mapped.checked_add(length).map_or(true, |total| total > limit) {
            return Err(exhausted());
        }

        let base = runtime.host_alloc(length)?;
        tracing::debug!(base = base.raw(), length, total = mapped + length, "mapped pinned scratch segment");
        self.segments.push(Segment {
            base,
            capacity: length,
            free: vec![FreeRange {
                offset: 0,
                size: length,
            }],
        });
        self.next_segment_size = length.saturating_mul(2);
        Ok(self.segments.len() - 1)
    }

    fn coalesce(free: &mut Vec<FreeRange>) {
        let mut i = 0;
        while i + 1 < free.len() {
            if free[i].is_adjacent_to(&free[i + 1]) {
                free[i].size += free[i + 1].size;
                free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}
