use crate::{error::GcError, header::Header};

/// Result of sweeping one arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepResult {
    /// Every slot is on the free list.
    Empty,
    /// No slot is free.
    Full,
    /// Some slots are free.
    Reusable,
}

/// A contiguous chunk of header slots. Arenas never grow or shrink; a pool only ever adds
/// whole arenas or releases whole empty ones.
pub struct SmallObjectArena {
    slots: Box<[Header]>,
}

impl SmallObjectArena {
    /// Allocates `capacity` slots, all of them marked free but not linked into any list.
    pub fn new(capacity: usize) -> Result<Self, GcError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| GcError::OutOfMemory(capacity * std::mem::size_of::<Header>()))?;
        slots.extend((0..capacity).map(|_| Header::free(None)));
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot(&self, index: u32) -> &Header {
        &self.slots[index as usize]
    }

    #[inline]
    pub fn slot_mut(&mut self, index: u32) -> &mut Header {
        &mut self.slots[index as usize]
    }

    pub fn slots(&self) -> &[Header] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Header] {
        &mut self.slots
    }

    pub fn used(&self) -> usize {
        self.slots.iter().filter(|h| !h.is_free()).count()
    }

    /// Classifies the arena after a sweep.
    pub fn state(&self) -> SweepResult {
        match self.used() {
            0 => SweepResult::Empty,
            n if n == self.capacity() => SweepResult::Full,
            _ => SweepResult::Reusable,
        }
    }
}
