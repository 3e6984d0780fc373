//! Size classed slab allocator for small out of line records, most notably PMC attribute
//! storage. Every request is rounded up to a word multiple; each rounded size gets its own
//! class with chunks of equally sized slots and a free list.
use std::collections::BTreeMap;

use crate::{align_usize, error::GcError};

const WORD: usize = std::mem::size_of::<usize>();
const SLOTS_PER_CHUNK: usize = 64;

/// Handle to a fixed-size record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FixedStorage {
    class: u16,
    chunk: u32,
    slot: u32,
}

struct SizeClass {
    size: usize,
    chunks: Vec<Box<[u8]>>,
    free: Vec<(u32, u32)>,
    in_use: usize,
}

impl SizeClass {
    fn grow(&mut self) -> Result<(), GcError> {
        let bytes = self.size * SLOTS_PER_CHUNK;
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(bytes)
            .map_err(|_| GcError::OutOfMemory(bytes))?;
        memory.resize(bytes, 0u8);
        let chunk = self.chunks.len() as u32;
        self.chunks.push(memory.into_boxed_slice());
        self.free.extend((0..SLOTS_PER_CHUNK as u32).rev().map(|slot| (chunk, slot)));
        Ok(())
    }

    fn range(&self, slot: u32) -> std::ops::Range<usize> {
        let start = slot as usize * self.size;
        start..start + self.size
    }
}

#[derive(Default)]
pub struct FixedSizeAllocator {
    classes: Vec<SizeClass>,
    by_size: BTreeMap<usize, u16>,
}

impl FixedSizeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn class_for(&mut self, size: usize) -> u16 {
        let size = align_usize(size.max(1), WORD);
        if let Some(class) = self.by_size.get(&size) {
            return *class;
        }
        let class = self.classes.len() as u16;
        self.classes.push(SizeClass {
            size,
            chunks: Vec::new(),
            free: Vec::new(),
            in_use: 0,
        });
        self.by_size.insert(size, class);
        log::trace!("fixed size storage: new class #{} for {} byte records", class, size);
        class
    }

    /// Hands out a zeroed record of at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<FixedStorage, GcError> {
        let class = self.class_for(size);
        let sc = &mut self.classes[class as usize];
        if sc.free.is_empty() {
            sc.grow()?;
        }
        let (chunk, slot) = match sc.free.pop() {
            Some(entry) => entry,
            None => return Err(GcError::OutOfMemory(sc.size)),
        };
        let range = sc.range(slot);
        sc.chunks[chunk as usize][range].fill(0);
        sc.in_use += 1;
        Ok(FixedStorage { class, chunk, slot })
    }

    pub fn free(&mut self, storage: FixedStorage) {
        let sc = &mut self.classes[storage.class as usize];
        debug_assert!(
            !sc.free.contains(&(storage.chunk, storage.slot)),
            "double free of {:?}",
            storage
        );
        sc.free.push((storage.chunk, storage.slot));
        sc.in_use -= 1;
    }

    pub fn size_of(&self, storage: FixedStorage) -> usize {
        self.classes[storage.class as usize].size
    }

    pub fn bytes(&self, storage: FixedStorage) -> &[u8] {
        let sc = &self.classes[storage.class as usize];
        &sc.chunks[storage.chunk as usize][sc.range(storage.slot)]
    }

    pub fn bytes_mut(&mut self, storage: FixedStorage) -> &mut [u8] {
        let sc = &mut self.classes[storage.class as usize];
        let range = sc.range(storage.slot);
        &mut sc.chunks[storage.chunk as usize][range]
    }

    /// Bytes currently handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.classes.iter().map(|sc| sc.in_use * sc.size).sum()
    }

    /// Bytes reserved from the system.
    pub fn reserved_bytes(&self) -> usize {
        self.classes
            .iter()
            .map(|sc| sc.chunks.len() * SLOTS_PER_CHUNK * sc.size)
            .sum()
    }

    /// Copies a record owned by `source` into a fresh record of this allocator.
    pub(crate) fn adopt(
        &mut self,
        source: &FixedSizeAllocator,
        storage: FixedStorage,
    ) -> Result<FixedStorage, GcError> {
        let fresh = self.allocate(source.size_of(storage))?;
        self.bytes_mut(fresh).copy_from_slice(source.bytes(storage));
        Ok(fresh)
    }
}
