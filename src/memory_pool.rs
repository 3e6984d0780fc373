//! Variable sized payload allocator.
//!
//! A [MemoryPool] bump allocates string and buffer payloads out of a list of anonymous
//! memory blocks. Freed spans are not reused individually; their size is only accounted as
//! reclaimable. Once enough of the pool is reclaimable the collector compacts it: every live
//! payload is copied into one fresh block and the old blocks are unmapped. Compaction is the
//! only operation that changes the location of a payload.
use std::collections::HashMap;

use memmap2::MmapMut;

use crate::{align_usize, error::GcError, Config};

const fn buffer_alignment() -> usize {
    let align = std::mem::align_of::<libc::max_align_t>();
    if align < 8 {
        8
    } else {
        align
    }
}

/// Alignment of every payload span. Matches what malloc(3) guarantees on the platform.
pub const BUFFER_ALIGNMENT: usize = buffer_alignment();

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryPoolId {
    General,
    Constant,
}

/// Location of a payload span: `capacity` bytes starting at `offset` in block `block` of
/// pool `pool`, of which the first `len` are in use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Storage {
    pub(crate) pool: MemoryPoolId,
    pub(crate) block: u32,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) capacity: usize,
}

impl Storage {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    #[inline]
    pub fn pool(&self) -> MemoryPoolId {
        self.pool
    }

    pub(crate) fn span_key(&self) -> (u32, usize) {
        (self.block, self.offset)
    }
}

/// A contiguous region of raw memory. `top` is the bump cursor; everything below it has
/// been handed out, `free()` bytes above it are still available.
pub struct MemoryBlock {
    map: MmapMut,
    top: usize,
}

impl MemoryBlock {
    fn new(size: usize) -> Result<Self, GcError> {
        let map = MmapMut::map_anon(size).map_err(|_| GcError::OutOfMemory(size))?;
        Ok(Self { map, top: 0 })
    }
    #[inline]
    pub fn size(&self) -> usize {
        self.map.len()
    }
    #[inline]
    pub fn free(&self) -> usize {
        self.size() - self.top
    }
    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    fn bump(&mut self, size: usize) -> Option<usize> {
        if self.free() < size {
            return None;
        }
        let offset = self.top;
        self.top += size;
        debug_assert!(self.top <= self.size());
        Some(offset)
    }
}

/// Holders of a span shared through [MemoryPool::share]. Spans that were never shared have
/// no entry and exactly one holder.
#[derive(Clone, Copy, Debug)]
struct SpanShare {
    holders: usize,
    released: bool,
}

pub struct MemoryPool {
    id: MemoryPoolId,
    blocks: Vec<Option<MemoryBlock>>,
    free_block_ids: Vec<u32>,
    top_block: Option<u32>,
    minimum_block_size: usize,
    next_block_size: usize,
    max_block_size: usize,
    growth_factor: f64,
    reclaim_factor: f64,
    total_allocated: usize,
    guaranteed_reclaimable: usize,
    possibly_reclaimable: usize,
    total_copied: usize,
    shares: HashMap<(u32, usize), SpanShare>,
}

/// Bookkeeping for one compaction run, see [MemoryPool::begin_compaction].
pub struct Compaction {
    target: Option<u32>,
    moved: HashMap<(u32, usize), Storage>,
    shares: HashMap<(u32, usize), SpanShare>,
    copied: usize,
}

impl MemoryPool {
    pub fn new(id: MemoryPoolId, config: &Config, reclaim_factor: f64) -> Self {
        Self {
            id,
            blocks: Vec::new(),
            free_block_ids: Vec::new(),
            top_block: None,
            minimum_block_size: config.min_memory_block_size,
            next_block_size: config.min_memory_block_size,
            max_block_size: config.max_memory_block_size,
            growth_factor: config.memory_block_growth_factor,
            reclaim_factor,
            total_allocated: 0,
            guaranteed_reclaimable: 0,
            possibly_reclaimable: 0,
            total_copied: 0,
            shares: HashMap::new(),
        }
    }

    pub fn id(&self) -> MemoryPoolId {
        self.id
    }
    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }
    pub fn guaranteed_reclaimable(&self) -> usize {
        self.guaranteed_reclaimable
    }
    pub fn possibly_reclaimable(&self) -> usize {
        self.possibly_reclaimable
    }
    pub fn total_copied(&self) -> usize {
        self.total_copied
    }
    pub fn reclaim_factor(&self) -> f64 {
        self.reclaim_factor
    }
    pub fn block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }
    pub fn top_block(&self) -> Option<&MemoryBlock> {
        self.top_block.and_then(|id| self.blocks[id as usize].as_ref())
    }

    fn block(&self, id: u32) -> &MemoryBlock {
        match self.blocks.get(id as usize).and_then(|b| b.as_ref()) {
            Some(block) => block,
            None => panic!("memory block {} does not exist in {:?} pool", id, self.id),
        }
    }

    fn block_mut(&mut self, id: u32) -> &mut MemoryBlock {
        let pool = self.id;
        match self.blocks.get_mut(id as usize).and_then(|b| b.as_mut()) {
            Some(block) => block,
            None => panic!("memory block {} does not exist in {:?} pool", id, pool),
        }
    }

    fn install_block(&mut self, block: MemoryBlock) -> u32 {
        self.total_allocated += block.size();
        match self.free_block_ids.pop() {
            Some(id) => {
                self.blocks[id as usize] = Some(block);
                id
            }
            None => {
                self.blocks.push(Some(block));
                (self.blocks.len() - 1) as u32
            }
        }
    }

    /// Appends a new top block large enough for `min_size` bytes.
    fn add_block(&mut self, min_size: usize) -> Result<u32, GcError> {
        let size = align_usize(self.next_block_size.max(min_size), BUFFER_ALIGNMENT);
        let block = MemoryBlock::new(size)?;
        let id = self.install_block(block);
        self.top_block = Some(id);
        self.next_block_size = ((self.next_block_size as f64 * self.growth_factor) as usize)
            .min(self.max_block_size)
            .max(self.minimum_block_size);
        log::trace!(
            "{:?} memory pool: new block #{} of {} bytes (total {})",
            self.id,
            id,
            size,
            self.total_allocated
        );
        Ok(id)
    }

    /// Bump allocates `size` bytes aligned to [BUFFER_ALIGNMENT] from the top block.
    pub fn allocate(&mut self, size: usize) -> Result<Storage, GcError> {
        let capacity = align_usize(size.max(1), BUFFER_ALIGNMENT);
        let offset = match self.top_block {
            Some(id) => self.block_mut(id).bump(capacity).map(|offset| (id, offset)),
            None => None,
        };
        let (block, offset) = match offset {
            Some(found) => found,
            None => {
                let id = self.add_block(capacity)?;
                let offset = self
                    .block_mut(id)
                    .bump(capacity)
                    .ok_or(GcError::OutOfMemory(capacity))?;
                (id, offset)
            }
        };
        Ok(Storage {
            pool: self.id,
            block,
            offset,
            len: size,
            capacity,
        })
    }

    /// Registers one more holder of `storage` for copy-on-write sharing.
    pub(crate) fn share(&mut self, storage: &Storage) {
        debug_assert_eq!(storage.pool, self.id);
        self.shares
            .entry(storage.span_key())
            .or_insert(SpanShare {
                holders: 1,
                released: false,
            })
            .holders += 1;
    }

    /// Is `storage` held by more than one header?
    pub fn is_shared(&self, storage: &Storage) -> bool {
        self.shares
            .get(&storage.span_key())
            .map_or(false, |share| share.holders > 1)
    }

    /// Number of headers holding the span of `storage`.
    pub fn holders(&self, storage: &Storage) -> usize {
        self.shares
            .get(&storage.span_key())
            .map_or(1, |share| share.holders)
    }

    /// Accounts a released span. A shared span becomes possibly reclaimable on its first
    /// release and guaranteed reclaimable once its last holder lets go of it.
    pub fn free(&mut self, storage: Storage) {
        debug_assert_eq!(storage.pool, self.id);
        let key = storage.span_key();
        match self.shares.get_mut(&key) {
            Some(share) => {
                if !share.released {
                    share.released = true;
                    self.possibly_reclaimable += storage.capacity;
                }
                share.holders -= 1;
                if share.holders == 0 {
                    self.guaranteed_reclaimable += storage.capacity;
                    self.shares.remove(&key);
                }
            }
            None => {
                self.possibly_reclaimable += storage.capacity;
                self.guaranteed_reclaimable += storage.capacity;
            }
        }
        debug_assert!(self.guaranteed_reclaimable <= self.possibly_reclaimable);
    }

    /// Resizes `storage` to `new_size` bytes. Extends in place when the span is the last
    /// allocation of the top block, otherwise allocates a new span, copies the contents and
    /// releases the old span. A span that was ever shared is always copied, which unshares
    /// it for the caller.
    pub fn reallocate(&mut self, storage: Storage, new_size: usize) -> Result<Storage, GcError> {
        debug_assert_eq!(storage.pool, self.id);
        let cow = self.shares.contains_key(&storage.span_key());
        let new_capacity = align_usize(new_size.max(1), BUFFER_ALIGNMENT);
        let at_top = Some(storage.block) == self.top_block
            && storage.offset + storage.capacity == self.block(storage.block).top;

        if new_capacity <= storage.capacity && !cow {
            let mut shrunk = storage;
            shrunk.len = new_size;
            if at_top {
                self.block_mut(storage.block).top = storage.offset + new_capacity;
                shrunk.capacity = new_capacity;
            }
            return Ok(shrunk);
        }

        if at_top && !cow && storage.offset + new_capacity <= self.block(storage.block).size() {
            self.block_mut(storage.block).top = storage.offset + new_capacity;
            let mut grown = storage;
            grown.len = new_size;
            grown.capacity = new_capacity;
            return Ok(grown);
        }

        let fresh = self.allocate(new_size)?;
        self.copy_span(storage, fresh, storage.len.min(new_size));
        self.free(storage);
        Ok(fresh)
    }

    fn copy_span(&mut self, from: Storage, to: Storage, len: usize) {
        if len == 0 {
            return;
        }
        if from.block == to.block {
            let block = self.block_mut(from.block);
            block
                .map
                .copy_within(from.offset..from.offset + len, to.offset);
            return;
        }
        let (src, dst) = two_blocks(&mut self.blocks, from.block, to.block);
        dst.map[to.offset..to.offset + len].copy_from_slice(&src.map[from.offset..from.offset + len]);
    }

    pub fn bytes(&self, storage: &Storage) -> &[u8] {
        debug_assert_eq!(storage.pool, self.id);
        &self.block(storage.block).map[storage.offset..storage.offset + storage.len]
    }

    pub fn bytes_mut(&mut self, storage: &Storage) -> &mut [u8] {
        debug_assert_eq!(storage.pool, self.id);
        let range = storage.offset..storage.offset + storage.len;
        &mut self.block_mut(storage.block).map[range]
    }

    /// Does `storage` describe a span that was handed out by this pool?
    pub fn contains(&self, storage: &Storage) -> bool {
        storage.pool == self.id
            && self
                .blocks
                .get(storage.block as usize)
                .and_then(|b| b.as_ref())
                .map(|block| storage.offset + storage.capacity <= block.top)
                .unwrap_or(false)
    }

    /// `true` once enough of the pool is reclaimable for compaction to pay off.
    pub fn should_compact(&self) -> bool {
        self.total_allocated > 0
            && self.possibly_reclaimable as f64 / self.total_allocated as f64 >= self.reclaim_factor
    }

    /// Starts a compaction that will move `live_bytes` worth of payloads.
    pub(crate) fn begin_compaction(&mut self, live_bytes: usize) -> Result<Compaction, GcError> {
        let target = if live_bytes == 0 {
            None
        } else {
            let size = align_usize(live_bytes.max(self.minimum_block_size), BUFFER_ALIGNMENT);
            Some(self.install_block(MemoryBlock::new(size)?))
        };
        Ok(Compaction {
            target,
            moved: HashMap::new(),
            shares: HashMap::new(),
            copied: 0,
        })
    }

    /// Copies one live span into the compaction block. Spans shared by several headers are
    /// copied once and every header gets the same new location.
    pub(crate) fn relocate(&mut self, compaction: &mut Compaction, storage: Storage) -> Storage {
        if let Some(moved) = compaction.moved.get(&storage.span_key()) {
            let mut moved = *moved;
            moved.len = storage.len;
            return moved;
        }
        let target = match compaction.target {
            Some(target) => target,
            None => panic!("relocating {:?} without a compaction block", storage),
        };
        let offset = match self.block_mut(target).bump(storage.capacity) {
            Some(offset) => offset,
            None => panic!("compaction block overflow while relocating {:?}", storage),
        };
        let moved = Storage {
            pool: self.id,
            block: target,
            offset,
            len: storage.len,
            capacity: storage.capacity,
        };
        self.copy_span(storage, moved, storage.capacity);
        compaction.copied += storage.capacity;
        compaction.moved.insert(storage.span_key(), moved);
        if let Some(share) = self.shares.get(&storage.span_key()) {
            if share.holders > 1 {
                compaction.shares.insert(
                    moved.span_key(),
                    SpanShare {
                        holders: share.holders,
                        released: false,
                    },
                );
            }
        }
        moved
    }

    /// Releases every block except the compaction target and resets the reclaim counters.
    pub(crate) fn finish_compaction(&mut self, compaction: Compaction) -> usize {
        for (id, block) in self.blocks.iter_mut().enumerate() {
            if Some(id as u32) != compaction.target && block.take().is_some() {
                self.free_block_ids.push(id as u32);
            }
        }
        self.total_allocated = compaction
            .target
            .map(|id| self.block(id).size())
            .unwrap_or(0);
        self.top_block = compaction.target;
        self.guaranteed_reclaimable = 0;
        self.possibly_reclaimable = 0;
        self.shares = compaction.shares;
        self.total_copied += compaction.copied;
        compaction.copied
    }

    /// Adopts spans allocated elsewhere by copying their bytes into this pool.
    pub(crate) fn adopt(&mut self, source: &MemoryPool, storage: Storage) -> Result<Storage, GcError> {
        let fresh = self.allocate(storage.len)?;
        let bytes = source.bytes(&storage);
        self.bytes_mut(&fresh).copy_from_slice(bytes);
        Ok(fresh)
    }
}

fn two_blocks(
    blocks: &mut [Option<MemoryBlock>],
    a: u32,
    b: u32,
) -> (&mut MemoryBlock, &mut MemoryBlock) {
    debug_assert_ne!(a, b);
    let (a, b) = (a as usize, b as usize);
    let (first, second) = if a < b {
        let (lo, hi) = blocks.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = blocks.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    };
    match (first.as_mut(), second.as_mut()) {
        (Some(first), Some(second)) => (first, second),
        _ => panic!("copy between released memory blocks"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MemoryPool {
        let config = Config {
            min_memory_block_size: 256,
            max_memory_block_size: 1024,
            ..Config::default()
        };
        MemoryPool::new(MemoryPoolId::General, &config, 0.5)
    }

    #[test]
    fn allocations_are_aligned() {
        let mut pool = pool();
        for size in [1, 3, 8, 13, 40] {
            let storage = pool.allocate(size).unwrap();
            assert_eq!(storage.offset % BUFFER_ALIGNMENT, 0);
            assert!(storage.capacity >= size);
            assert_eq!(storage.len(), size);
        }
    }

    #[test]
    fn large_request_gets_its_own_block() {
        let mut pool = pool();
        pool.allocate(16).unwrap();
        let big = pool.allocate(4096).unwrap();
        assert_eq!(pool.block_count(), 2);
        assert!(pool.top_block().unwrap().size() >= 4096);
        assert!(pool.contains(&big));
    }

    #[test]
    fn grow_in_place_at_top() {
        let mut pool = pool();
        let mut storage = pool.allocate(8).unwrap();
        pool.bytes_mut(&storage).copy_from_slice(b"abcdefgh");
        let before = storage;
        storage = pool.reallocate(storage, 32).unwrap();
        assert_eq!(storage.offset, before.offset);
        assert_eq!(&pool.bytes(&storage)[..8], b"abcdefgh");
        assert_eq!(pool.possibly_reclaimable(), 0);
    }

    #[test]
    fn grow_not_at_top_copies_and_releases() {
        let mut pool = pool();
        let first = pool.allocate(8).unwrap();
        pool.bytes_mut(&first).copy_from_slice(b"12345678");
        let _second = pool.allocate(8).unwrap();
        let moved = pool.reallocate(first, 24).unwrap();
        assert_ne!(moved.offset, first.offset);
        assert_eq!(&pool.bytes(&moved)[..8], b"12345678");
        assert_eq!(pool.guaranteed_reclaimable(), first.capacity);
    }

    #[test]
    fn shared_span_is_counted_once() {
        let mut pool = pool();
        let storage = pool.allocate(200).unwrap();
        pool.share(&storage);
        pool.share(&storage);
        assert_eq!(pool.holders(&storage), 3);

        pool.free(storage);
        assert_eq!(pool.guaranteed_reclaimable(), 0);
        assert_eq!(pool.possibly_reclaimable(), storage.capacity);
        pool.free(storage);
        assert_eq!(pool.possibly_reclaimable(), storage.capacity);
        assert!(!pool.is_shared(&storage));

        pool.free(storage);
        assert_eq!(pool.guaranteed_reclaimable(), storage.capacity);
        assert_eq!(pool.possibly_reclaimable(), storage.capacity);
        assert!(pool.possibly_reclaimable() <= pool.total_allocated());
    }

    #[test]
    fn last_holder_resizes_by_copy() {
        let mut pool = pool();
        let storage = pool.allocate(16).unwrap();
        pool.share(&storage);
        pool.free(storage);
        // Sole holder now, but the span was already counted as possibly reclaimable.
        let moved = pool.reallocate(storage, 32).unwrap();
        assert_ne!(moved.offset, storage.offset);
        assert_eq!(pool.guaranteed_reclaimable(), storage.capacity);
        assert_eq!(pool.possibly_reclaimable(), storage.capacity);
        assert_eq!(pool.holders(&moved), 1);
    }

    #[test]
    fn compaction_carries_shares_over() {
        let mut pool = pool();
        let dead = pool.allocate(64).unwrap();
        let storage = pool.allocate(64).unwrap();
        pool.share(&storage);
        pool.free(dead);

        let mut compaction = pool.begin_compaction(storage.capacity).unwrap();
        let moved = pool.relocate(&mut compaction, storage);
        assert_eq!(pool.relocate(&mut compaction, storage), moved);
        pool.finish_compaction(compaction);

        assert!(pool.is_shared(&moved));
        pool.free(moved);
        pool.free(moved);
        assert_eq!(pool.guaranteed_reclaimable(), moved.capacity);
        assert_eq!(pool.possibly_reclaimable(), moved.capacity);
    }
}
