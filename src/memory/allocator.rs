//! Segmented device-memory allocator
//!
//! One [`MemoryHead`] per device per context. Raw device memory is obtained
//! in large blocks and carved into chunks:
//!
//! ```text
//! block  [base ........................................ base+size)
//! chunks [ active | free | active | active | free (remainder)   ]
//! ```
//!
//! Blocks and chunks live in slot arrays owned by the head and refer to each
//! other by index. Vacated slots go to free-index pools and are reused before
//! the arrays grow. Each chunk is either on its block's free list or in the
//! device-wide active hash index, never both.
//!
//! Block selection is first-fit over the active blocks, then the single
//! cached empty block, then a fresh raw allocation. Chunk selection is
//! first-fit over the block's free list; `max_free_size` is rescanned only
//! when the consumed chunk was the block's largest.

use std::collections::VecDeque;

use crate::backend::hip_backend::device_context::ContextGuard;
use crate::backend::hip_backend::runtime::{ContextHandle, DevicePtr, DeviceRuntime};
use crate::config::StromConfig;
use crate::error::{StromError, StromResult};
use crate::memory::calculator::{block_size_for, chunk_request_size};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ChunkId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Slot is in the reuse pool
    Unused,
    /// On the owning block's free list
    Free,
    /// In the active hash index
    Active,
}

#[derive(Debug)]
struct MemoryBlock {
    in_use: bool,
    base: DevicePtr,
    size: usize,
    max_free_size: usize,
    /// Lowest-addressed chunk
    head: Option<ChunkId>,
    free_chunks: VecDeque<ChunkId>,
}

#[derive(Debug)]
struct MemoryChunk {
    block: BlockId,
    addr: DevicePtr,
    size: usize,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
    state: ChunkState,
}

/// One chunk in a [`BlockLayout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub addr: DevicePtr,
    pub size: usize,
    pub free: bool,
}

/// Snapshot of one block, chunks in address order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub base: DevicePtr,
    pub size: usize,
    pub max_free_size: usize,
    pub cached_empty: bool,
    pub chunks: Vec<ChunkLayout>,
}

/// Allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Raw device allocations requested from the runtime
    pub raw_allocs: usize,
    /// Raw device allocations returned to the runtime
    pub raw_frees: usize,
    pub active_blocks: usize,
    pub empty_blocks: usize,
    pub active_chunks: usize,
    pub active_bytes: usize,
    /// Requests answered with "no memory, retry later"
    pub backoffs: usize,
}

/// Per-device block/chunk allocator
#[derive(Debug)]
pub struct MemoryHead {
    device_index: usize,
    chunk_size: usize,
    max_alloc_size: usize,
    blocks: Vec<MemoryBlock>,
    chunks: Vec<MemoryChunk>,
    unused_blocks: Vec<BlockId>,
    unused_chunks: Vec<ChunkId>,
    active_blocks: VecDeque<BlockId>,
    empty_block: Option<BlockId>,
    hash_slots: Vec<Vec<ChunkId>>,
    stats: AllocatorStats,
}

impl MemoryHead {
    /// Create an empty head for `device_index`
    ///
    /// `max_alloc_size` is the installation-wide request limit computed by
    /// the device registry.
    pub fn new(device_index: usize, config: &StromConfig, max_alloc_size: usize) -> Self {
        Self {
            device_index,
            chunk_size: config.chunk_size,
            max_alloc_size,
            blocks: Vec::new(),
            chunks: Vec::new(),
            unused_blocks: Vec::new(),
            unused_chunks: Vec::new(),
            active_blocks: VecDeque::new(),
            empty_block: None,
            hash_slots: vec![Vec::new(); config.hash_slots.max(1)],
            stats: AllocatorStats::default(),
        }
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn max_alloc_size(&self) -> usize {
        self.max_alloc_size
    }

    /// Allocate `bytes` of device memory
    ///
    /// The device's context must be current on the calling thread.
    ///
    /// Returns `Ok(None)` when the device is out of memory: the caller is
    /// expected to back off and retry once other tasks have released their
    /// buffers. Any other driver failure, or a request above the allocation
    /// limit, is an error.
    pub fn alloc(
        &mut self,
        runtime: &dyn DeviceRuntime,
        bytes: usize,
    ) -> StromResult<Option<DevicePtr>> {
        let size = match chunk_request_size(bytes) {
            Some(size) if size <= self.max_alloc_size => size,
            _ => {
                return Err(StromError::AllocationTooLarge {
                    requested: bytes,
                    limit: self.max_alloc_size,
                })
            }
        };

        let block = match self.find_active_block(size) {
            Some(b) => b,
            None => match self.promote_empty_block(size) {
                Some(b) => b,
                None => match self.grow(runtime, size)? {
                    Some(b) => b,
                    None => {
                        self.stats.backoffs += 1;
                        return Ok(None);
                    }
                },
            },
        };

        let addr = self.carve(block, size)?;
        tracing::trace!(
            device = self.device_index,
            addr = %addr,
            size,
            "allocated device chunk"
        );
        Ok(Some(addr))
    }

    /// Release a chunk returned by [`alloc`](Self::alloc)
    ///
    /// Unknown addresses are logged and ignored. When the chunk's block
    /// becomes empty it is cached for reuse, or, if a block is already
    /// cached, returned to the runtime with `context` pushed.
    pub fn free(
        &mut self,
        runtime: &dyn DeviceRuntime,
        context: ContextHandle,
        addr: DevicePtr,
    ) -> StromResult<()> {
        let Some(cid) = self.hash_remove(addr) else {
            tracing::warn!(
                device = self.device_index,
                addr = %addr,
                "freeing device memory that is not tracked by this allocator"
            );
            return Ok(());
        };

        let b = self.chunks[cid.0].block;
        let size = self.chunks[cid.0].size;
        self.chunks[cid.0].state = ChunkState::Free;
        self.stats.active_chunks -= 1;
        self.stats.active_bytes -= size;
        {
            let block = &mut self.blocks[b.0];
            block.free_chunks.push_front(cid);
            block.max_free_size = block.max_free_size.max(size);
        }

        let mut merged = cid;
        if let Some(prev) = self.chunks[merged.0].prev {
            if self.chunks[prev.0].state == ChunkState::Free {
                self.absorb_next(prev);
                merged = prev;
            }
        }
        if let Some(next) = self.chunks[merged.0].next {
            if self.chunks[next.0].state == ChunkState::Free {
                self.absorb_next(merged);
            }
        }

        tracing::trace!(device = self.device_index, addr = %addr, size, "released device chunk");

        let chunk = &self.chunks[merged.0];
        if chunk.prev.is_none() && chunk.next.is_none() {
            self.active_blocks.retain(|&x| x != b);
            if self.empty_block.is_none() {
                tracing::debug!(
                    device = self.device_index,
                    base = %self.blocks[b.0].base,
                    "caching empty device block"
                );
                self.empty_block = Some(b);
            } else {
                self.release_block(runtime, context, b)?;
            }
        }
        Ok(())
    }

    /// Return every raw block to the runtime
    ///
    /// Used on context teardown. Failures are logged; chunks still active
    /// are reported as leaks.
    pub fn release_all(&mut self, runtime: &dyn DeviceRuntime, context: ContextHandle) {
        if self.stats.active_chunks > 0 {
            tracing::warn!(
                device = self.device_index,
                chunks = self.stats.active_chunks,
                bytes = self.stats.active_bytes,
                "device memory still in use at teardown"
            );
        }
        let in_use: Vec<BlockId> = (0..self.blocks.len())
            .map(BlockId)
            .filter(|b| self.blocks[b.0].in_use)
            .collect();
        if !in_use.is_empty() {
            match ContextGuard::push(runtime, context) {
                Ok(_guard) => {
                    for b in &in_use {
                        let base = self.blocks[b.0].base;
                        match runtime.mem_free(base) {
                            Ok(()) => self.stats.raw_frees += 1,
                            Err(e) => tracing::warn!(
                                device = self.device_index,
                                base = %base,
                                "failed to free device block: {}",
                                e
                            ),
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    device = self.device_index,
                    "cannot push context to release device blocks: {}",
                    e
                ),
            }
        }

        self.blocks.clear();
        self.chunks.clear();
        self.unused_blocks.clear();
        self.unused_chunks.clear();
        self.active_blocks.clear();
        self.empty_block = None;
        for slot in &mut self.hash_slots {
            slot.clear();
        }
        self.stats.active_chunks = 0;
        self.stats.active_bytes = 0;
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            active_blocks: self.active_blocks.len(),
            empty_blocks: usize::from(self.empty_block.is_some()),
            ..self.stats
        }
    }

    /// Blocks in selection order (active list, then the cached empty block)
    pub fn layout(&self) -> Vec<BlockLayout> {
        self.active_blocks
            .iter()
            .map(|&b| (b, false))
            .chain(self.empty_block.map(|b| (b, true)))
            .map(|(b, cached_empty)| {
                let block = &self.blocks[b.0];
                BlockLayout {
                    base: block.base,
                    size: block.size,
                    max_free_size: block.max_free_size,
                    cached_empty,
                    chunks: self
                        .walk(b)
                        .map(|c| {
                            let chunk = &self.chunks[c.0];
                            ChunkLayout {
                                addr: chunk.addr,
                                size: chunk.size,
                                free: chunk.state == ChunkState::Free,
                            }
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Log every block and chunk
    pub fn dump(&self) {
        tracing::info!(
            device = self.device_index,
            active_blocks = self.active_blocks.len(),
            cached_empty = self.empty_block.is_some(),
            "device memory map"
        );
        for block in self.layout() {
            tracing::info!(
                base = %block.base,
                size = block.size,
                max_free = block.max_free_size,
                cached_empty = block.cached_empty,
                "  block"
            );
            for chunk in block.chunks {
                tracing::info!(
                    addr = %chunk.addr,
                    size = chunk.size,
                    "    {}",
                    if chunk.free { "free" } else { "active" }
                );
            }
        }
    }

    /// Verify the structural invariants of every block and the hash index
    pub fn check_invariants(&self) -> StromResult<()> {
        let violation = |msg: String| Err(StromError::Internal(format!("device {}: {}", self.device_index, msg)));

        let mut active_seen = 0usize;
        let listed: Vec<BlockId> = self
            .active_blocks
            .iter()
            .copied()
            .chain(self.empty_block)
            .collect();
        let in_use = self.blocks.iter().filter(|b| b.in_use).count();
        if listed.len() != in_use {
            return violation(format!("{} blocks listed but {} in use", listed.len(), in_use));
        }

        for &b in &listed {
            let block = &self.blocks[b.0];
            if !block.in_use {
                return violation(format!("listed block {} is not in use", b.0));
            }
            let mut expected = block.base;
            let mut total = 0usize;
            let mut largest_free = 0usize;
            let mut free_count = 0usize;
            let mut active_count = 0usize;
            let mut prev = None;
            for c in self.walk(b) {
                let chunk = &self.chunks[c.0];
                if chunk.block != b || chunk.prev != prev {
                    return violation(format!("chunk {} has broken links", c.0));
                }
                if chunk.addr != expected {
                    return violation(format!(
                        "chunk at {} leaves a gap or overlap (expected {})",
                        chunk.addr, expected
                    ));
                }
                let on_free_list = block.free_chunks.iter().filter(|&&f| f == c).count();
                let in_hash = self.hash_slots[self.bucket(chunk.addr)]
                    .iter()
                    .filter(|&&h| h == c)
                    .count();
                match chunk.state {
                    ChunkState::Free if on_free_list == 1 && in_hash == 0 => {
                        free_count += 1;
                        largest_free = largest_free.max(chunk.size);
                    }
                    ChunkState::Active if on_free_list == 0 && in_hash == 1 => active_count += 1,
                    state => {
                        return violation(format!(
                            "chunk at {} is {:?}, on free list {}x, hashed {}x",
                            chunk.addr, state, on_free_list, in_hash
                        ))
                    }
                }
                expected = chunk.addr.offset(chunk.size);
                total += chunk.size;
                prev = Some(c);
            }
            if total != block.size {
                return violation(format!(
                    "block at {} covers {} of {} bytes",
                    block.base, total, block.size
                ));
            }
            if free_count != block.free_chunks.len() {
                return violation(format!("block at {} has stray free-list entries", block.base));
            }
            if block.max_free_size != largest_free {
                return violation(format!(
                    "block at {} max_free_size {} but largest free chunk is {}",
                    block.base, block.max_free_size, largest_free
                ));
            }
            let cached = self.empty_block == Some(b);
            if cached != (active_count == 0) {
                return violation(format!(
                    "block at {} has {} active chunks but cached_empty={}",
                    block.base, active_count, cached
                ));
            }
            active_seen += active_count;
        }

        let hashed: usize = self.hash_slots.iter().map(Vec::len).sum();
        if hashed != active_seen || hashed != self.stats.active_chunks {
            return violation(format!(
                "hash index holds {} chunks, blocks hold {}, counter says {}",
                hashed, active_seen, self.stats.active_chunks
            ));
        }
        Ok(())
    }

    fn find_active_block(&self, size: usize) -> Option<BlockId> {
        self.active_blocks
            .iter()
            .copied()
            .find(|b| self.blocks[b.0].max_free_size > size)
    }

    fn promote_empty_block(&mut self, size: usize) -> Option<BlockId> {
        let b = self.empty_block?;
        if self.blocks[b.0].max_free_size <= size {
            return None;
        }
        self.empty_block = None;
        self.active_blocks.push_front(b);
        Some(b)
    }

    /// Obtain a new raw block; `None` when the device is out of memory
    fn grow(&mut self, runtime: &dyn DeviceRuntime, size: usize) -> StromResult<Option<BlockId>> {
        let required = block_size_for(size, self.chunk_size).ok_or(
            StromError::AllocationTooLarge {
                requested: size,
                limit: self.max_alloc_size,
            },
        )?;
        let base = match runtime.mem_alloc(required) {
            Ok(ptr) => ptr,
            Err(e) if e.is_out_of_memory() => {
                tracing::debug!(
                    device = self.device_index,
                    required,
                    "device out of memory, caller will retry: {}",
                    e
                );
                return Ok(None);
            }
            Err(e) => {
                tracing::error!(device = self.device_index, required, "raw device allocation failed: {}", e);
                return Err(e.into());
            }
        };
        self.stats.raw_allocs += 1;

        let b = self.new_block(base, required);
        let c = self.new_chunk(MemoryChunk {
            block: b,
            addr: base,
            size: required,
            prev: None,
            next: None,
            state: ChunkState::Free,
        });
        let block = &mut self.blocks[b.0];
        block.head = Some(c);
        block.free_chunks.push_back(c);
        block.max_free_size = required;
        self.active_blocks.push_front(b);

        tracing::debug!(
            device = self.device_index,
            base = %base,
            size = required,
            "acquired raw device block"
        );
        Ok(Some(b))
    }

    /// First-fit within `b`, splitting off any remainder
    fn carve(&mut self, b: BlockId, size: usize) -> StromResult<DevicePtr> {
        let position = self.blocks[b.0]
            .free_chunks
            .iter()
            .position(|c| self.chunks[c.0].size >= size);
        let Some(cid) = position.and_then(|p| self.blocks[b.0].free_chunks.remove(p)) else {
            self.dump();
            tracing::error!(
                device = self.device_index,
                size,
                max_free = self.blocks[b.0].max_free_size,
                "no free chunk found in a block that advertised enough space"
            );
            return Err(StromError::Internal(format!(
                "block at {} has max_free_size {} but no chunk of {} bytes",
                self.blocks[b.0].base, self.blocks[b.0].max_free_size, size
            )));
        };

        let consumed = self.chunks[cid.0].size;
        if consumed > size {
            let addr = self.chunks[cid.0].addr.offset(size);
            let next = self.chunks[cid.0].next;
            let rem = self.new_chunk(MemoryChunk {
                block: b,
                addr,
                size: consumed - size,
                prev: Some(cid),
                next,
                state: ChunkState::Free,
            });
            if let Some(n) = next {
                self.chunks[n.0].prev = Some(rem);
            }
            self.chunks[cid.0].next = Some(rem);
            self.chunks[cid.0].size = size;
            self.blocks[b.0].free_chunks.push_back(rem);
        }

        self.chunks[cid.0].state = ChunkState::Active;
        self.hash_insert(cid);
        self.stats.active_chunks += 1;
        self.stats.active_bytes += size;

        if self.blocks[b.0].max_free_size == consumed {
            self.recompute_max_free(b);
        }
        Ok(self.chunks[cid.0].addr)
    }

    /// Merge the free chunk after `left` into `left`
    fn absorb_next(&mut self, left: ChunkId) {
        let Some(right) = self.chunks[left.0].next else {
            return;
        };
        let b = self.chunks[left.0].block;
        let right_size = self.chunks[right.0].size;
        let right_next = self.chunks[right.0].next;

        self.chunks[left.0].size += right_size;
        self.chunks[left.0].next = right_next;
        if let Some(n) = right_next {
            self.chunks[n.0].prev = Some(left);
        }

        let block = &mut self.blocks[b.0];
        if let Some(pos) = block.free_chunks.iter().position(|&c| c == right) {
            block.free_chunks.remove(pos);
        }
        block.max_free_size = block.max_free_size.max(self.chunks[left.0].size);
        self.recycle_chunk(right);
    }

    fn recompute_max_free(&mut self, b: BlockId) {
        let largest = self.blocks[b.0]
            .free_chunks
            .iter()
            .map(|c| self.chunks[c.0].size)
            .max()
            .unwrap_or(0);
        self.blocks[b.0].max_free_size = largest;
    }

    fn release_block(
        &mut self,
        runtime: &dyn DeviceRuntime,
        context: ContextHandle,
        b: BlockId,
    ) -> StromResult<()> {
        let base = self.blocks[b.0].base;
        let size = self.blocks[b.0].size;
        let chunks: Vec<ChunkId> = self.walk(b).collect();
        for c in chunks {
            self.recycle_chunk(c);
        }
        let block = &mut self.blocks[b.0];
        block.in_use = false;
        block.head = None;
        block.free_chunks.clear();
        block.max_free_size = 0;
        self.unused_blocks.push(b);

        let guard = ContextGuard::push(runtime, context)?;
        runtime.mem_free(base)?;
        guard.pop()?;
        self.stats.raw_frees += 1;
        tracing::debug!(device = self.device_index, base = %base, size, "released raw device block");
        Ok(())
    }

    fn new_block(&mut self, base: DevicePtr, size: usize) -> BlockId {
        let block = MemoryBlock {
            in_use: true,
            base,
            size,
            max_free_size: 0,
            head: None,
            free_chunks: VecDeque::new(),
        };
        match self.unused_blocks.pop() {
            Some(b) => {
                self.blocks[b.0] = block;
                b
            }
            None => {
                self.blocks.push(block);
                BlockId(self.blocks.len() - 1)
            }
        }
    }

    fn new_chunk(&mut self, chunk: MemoryChunk) -> ChunkId {
        match self.unused_chunks.pop() {
            Some(c) => {
                self.chunks[c.0] = chunk;
                c
            }
            None => {
                self.chunks.push(chunk);
                ChunkId(self.chunks.len() - 1)
            }
        }
    }

    fn recycle_chunk(&mut self, c: ChunkId) {
        let chunk = &mut self.chunks[c.0];
        chunk.state = ChunkState::Unused;
        chunk.prev = None;
        chunk.next = None;
        self.unused_chunks.push(c);
    }

    /// Chunks of `b` in address order
    fn walk(&self, b: BlockId) -> impl Iterator<Item = ChunkId> + '_ {
        std::iter::successors(self.blocks[b.0].head, move |c| self.chunks[c.0].next)
    }

    fn bucket(&self, addr: DevicePtr) -> usize {
        crc32fast::hash(&addr.raw().to_le_bytes()) as usize % self.hash_slots.len()
    }

    fn hash_insert(&mut self, c: ChunkId) {
        let slot = self.bucket(self.chunks[c.0].addr);
        self.hash_slots[slot].push(c);
    }

    fn hash_remove(&mut self, addr: DevicePtr) -> Option<ChunkId> {
        let slot = self.bucket(addr);
        let pos = self.hash_slots[slot]
            .iter()
            .position(|c| self.chunks[c.0].addr == addr)?;
        Some(self.hash_slots[slot].swap_remove(pos))
    }
}
