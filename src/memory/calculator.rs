//! Size arithmetic for the device allocator
//!
//! Requests are rounded to [`CHUNK_ALIGNMENT`]; raw blocks are rounded to
//! [`BLOCK_ALIGNMENT`] and sized as a multiple of the configured chunk size
//! so that one raw allocation serves many tasks.

/// Granularity of every chunk handed out by the allocator
pub const CHUNK_ALIGNMENT: usize = 1 << 10;

/// Granularity of raw device blocks
pub const BLOCK_ALIGNMENT: usize = 1 << 20;

/// A new block holds this many chunks of the configured chunk size
pub const CHUNKS_PER_BLOCK: usize = 11;

/// Round `value` up to a power-of-two `alignment`; `None` on overflow
pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

/// Round `value` down to a power-of-two `alignment`
pub fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Chunk size actually reserved for a request of `bytes`
///
/// Zero-byte requests still occupy one unit so that every active chunk has
/// a distinct address. `None` when the rounded size does not fit a `usize`.
pub fn chunk_request_size(bytes: usize) -> Option<usize> {
    align_up(bytes.max(1), CHUNK_ALIGNMENT)
}

/// Size of the raw block to request when no existing block can serve
/// `request` bytes
pub fn block_size_for(request: usize, chunk_size: usize) -> Option<usize> {
    let target = chunk_size.saturating_mul(CHUNKS_PER_BLOCK).max(request);
    align_up(target, BLOCK_ALIGNMENT)
}

/// Largest allocation permitted on a device with `total_mem` bytes
///
/// One third of the device, rounded down to a whole block.
pub fn device_max_alloc_size(total_mem: usize) -> usize {
    align_down(total_mem / 3, BLOCK_ALIGNMENT)
}

/// Installation-wide allocation limit: the smallest per-device limit
pub fn max_alloc_size<I: IntoIterator<Item = usize>>(device_total_mems: I) -> usize {
    device_total_mems
        .into_iter()
        .map(device_max_alloc_size)
        .min()
        .unwrap_or(0)
}

/// First segment length of the host scratch arena
pub fn scratch_initial_size(chunk_size: usize) -> usize {
    4 * chunk_size.next_power_of_two()
}

/// Ceiling of the host scratch arena
pub fn scratch_max_size(chunk_size: usize) -> usize {
    1024 * scratch_initial_size(chunk_size)
}
