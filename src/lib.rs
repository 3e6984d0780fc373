//! # arena-gc
//!
//! Memory management core for a register based virtual machine. Every runtime object
//! (PMCs, strings, bufferlike headers) lives in a fixed-size header slot owned by a
//! [`SmallObjectPool`](pool::SmallObjectPool); variable sized payloads live in a
//! [`MemoryPool`](memory_pool::MemoryPool) that can be compacted.
//!
//! The collector is a single-mutator, stop-the-world, non-moving mark & sweep collector:
//! - [Arenas](arenas::Arenas) is the per-interpreter context object that owns all pools.
//! - Marking starts from the [root set](roots::RootSet) and is idempotent, so cycles need no special care.
//! - Sweeping rebuilds free lists and may hand whole empty arenas back.
//! - A lazy pass only destroys headers flagged as impatient.
//! - Collections can be blocked with nesting counters, see [safepoint].
//! - A write barrier keeps an incremental mark consistent while the mutator runs between steps.
//!
//! Headers are addressed by [HeaderRef](gcref::HeaderRef) handles `(pool, arena, slot)` instead of raw
//! pointers, which keeps compaction and sub-interpreter merges free of pointer fixups outside the allocator.

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`
pub const fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

pub mod allocation_config;
pub mod arena;
pub mod arenas;
pub mod barrier;
pub mod constants;
pub mod error;
pub mod fixed_size;
pub mod gc_info_table;
pub mod gcref;
pub mod header;
pub mod marking;
pub mod memory_pool;
pub mod merge;
pub mod pool;
pub mod roots;
pub mod safepoint;
pub mod statistics;
pub mod sweeper;
pub mod visitor;

#[cfg(test)]
mod tests;

pub use arenas::{Arenas, GcPhase};
pub use error::GcError;
pub use gcref::{BufferRef, HeaderRef, PmcRef, StringRef};
pub use header::{AllocFlags, GcFlags};

/// Configuration for [Arenas](arenas::Arenas) constructor.
///
/// Every growth policy is a tunable here; nothing in the collector hardcodes them.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of header slots in the first arena of every pool.
    pub initial_arena_objects: usize,
    /// How fast arenas grow. Each new arena holds `previous * arena_growth_factor` slots.
    pub arena_growth_factor: f64,
    /// Upper bound for the size of one arena in bytes.
    pub max_arena_bytes: usize,
    /// Give arenas that became completely empty during a sweep back to the system.
    pub release_empty_arenas: bool,
    /// When a sweep leaves fewer than `total * replenish_ratio` free headers in a pool,
    /// the next exhaustion of that pool grows it instead of collecting.
    pub replenish_ratio: f64,
    /// Headers allocated since the last collection before allocation requests a collection.
    pub header_collect_threshold: usize,
    /// Payload bytes allocated since the last collection before allocation requests a collection.
    pub memory_collect_threshold: usize,
    /// After a full sweep the header threshold becomes `live * collect_threshold_growth`,
    /// but never less than `header_collect_threshold`.
    pub collect_threshold_growth: f64,
    /// Smallest memory block handed out by the memory pool.
    pub min_memory_block_size: usize,
    /// Geometric growth of consecutive memory blocks.
    pub memory_block_growth_factor: f64,
    /// Largest block size growth may reach. Single requests larger than this still get their own block.
    pub max_memory_block_size: usize,
    /// Compact the memory pool once `possibly_reclaimable / total_allocated` reaches this value.
    pub reclaim_factor: f64,
    /// Same as `reclaim_factor` for the constant string memory pool.
    pub constant_reclaim_factor: f64,
    /// How many levels of references below a newly stored value the write barrier marks eagerly.
    pub barrier_depth: usize,
    /// Enables a summary log line per collection.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_arena_objects: 256,
            arena_growth_factor: 2.0,
            max_arena_bytes: 512 * 1024,
            release_empty_arenas: true,
            replenish_ratio: 0.3,
            header_collect_threshold: 16 * 1024,
            memory_collect_threshold: 4 * 1024 * 1024,
            collect_threshold_growth: 2.0,
            min_memory_block_size: 64 * 1024,
            memory_block_growth_factor: 1.5,
            max_memory_block_size: 8 * 1024 * 1024,
            reclaim_factor: 0.2,
            constant_reclaim_factor: 0.5,
            barrier_depth: 1,
            verbose: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), GcError> {
        let invalid = |msg: &str| Err(GcError::InvalidConfig(msg.to_owned()));
        if self.initial_arena_objects == 0 {
            return invalid("initial_arena_objects must be non-zero");
        }
        if !(self.arena_growth_factor >= 1.0) {
            return invalid("arena_growth_factor must be at least 1.0");
        }
        if !(self.collect_threshold_growth > 1.0) {
            return invalid("collect_threshold_growth must be greater than 1.0");
        }
        if !(self.memory_block_growth_factor >= 1.0) {
            return invalid("memory_block_growth_factor must be at least 1.0");
        }
        if self.min_memory_block_size == 0 || self.max_memory_block_size < self.min_memory_block_size
        {
            return invalid("memory block sizes must satisfy 0 < min <= max");
        }
        for factor in [self.reclaim_factor, self.constant_reclaim_factor] {
            if !(factor > 0.0 && factor <= 1.0) {
                return invalid("reclaim factors must be in (0, 1]");
            }
        }
        if !(0.0..=1.0).contains(&self.replenish_ratio) {
            return invalid("replenish_ratio must be in [0, 1]");
        }
        Ok(())
    }
}
