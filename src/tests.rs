use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    constants::{Constant, ConstantTable},
    error::GcError,
    gc_info_table::GcInfo,
    header::PmcBody,
    pool::PoolIter,
    roots::{MarkingConstraint, MarkingConstraintRuns, TraceMode},
    statistics::InfoKind,
    visitor::Visitor,
    AllocFlags, Arenas, Config, GcFlags, GcPhase, HeaderRef, PmcRef,
};

fn quiet_config() -> Config {
    Config {
        header_collect_threshold: usize::MAX,
        memory_collect_threshold: usize::MAX,
        ..Config::default()
    }
}

fn arenas() -> Arenas {
    Arenas::new(quiet_config()).unwrap()
}

#[test]
pub fn test_pool_grows_in_fixed_arenas() {
    let mut arenas = Arenas::new(Config {
        initial_arena_objects: 100,
        arena_growth_factor: 1.0,
        ..quiet_config()
    })
    .unwrap();
    let mut strings = Vec::new();
    let mut seen = HashSet::new();
    for _ in 0..10_000 {
        let string = arenas.new_string_header(AllocFlags::empty());
        assert!(seen.insert(string.header()));
        strings.push(string);
    }
    let pool = arenas.pool(arenas.string_pool);
    assert_eq!(pool.arena_count(), 100);
    assert_eq!(pool.total_objects(), 10_000);
    assert_eq!(pool.num_free_objects(), 0);

    for string in strings {
        arenas.free_string_header(string);
        assert!(!arenas.is_allocated(string));
    }
    let pool = arenas.pool(arenas.string_pool);
    assert_eq!(pool.active_objects(), 0);
    assert_eq!(pool.num_free_objects(), 10_000);
}

#[test]
pub fn test_slots_are_never_handed_out_twice() {
    let mut arenas = arenas();
    let mut live: Vec<PmcRef> = Vec::new();
    let mut seen = HashSet::new();
    for round in 0..2_000usize {
        if round % 3 == 2 {
            let victim = live.swap_remove(round % live.len());
            seen.remove(&victim.header());
            arenas.free_pmc_header(victim);
        } else {
            let pmc = arenas.new_pmc_header(AllocFlags::empty());
            assert!(seen.insert(pmc.header()), "{:?} handed out twice", pmc);
            live.push(pmc);
        }
    }
    assert_eq!(arenas.pool(arenas.pmc_pool).active_objects(), live.len());
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalization(_: PmcRef, _: &mut PmcBody) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
pub fn test_unreachable_header_is_finalized_once() {
    let mut arenas = arenas();
    let ty = arenas
        .register_type(GcInfo::new("Finalized").with_finalizer(count_finalization))
        .unwrap();
    let pmc = arenas.new_pmc_header_typed(AllocFlags::CUSTOM_DESTROY, ty);
    arenas.mark_pobj_alive(pmc);

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(!arenas.is_allocated(pmc));
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert_eq!(arenas.phase(), GcPhase::Idle);
}

#[test]
pub fn test_reachable_headers_survive() {
    let mut arenas = arenas();
    let root = arenas.new_pmc_header(AllocFlags::empty());
    let child = arenas.new_pmc_header(AllocFlags::empty());
    let name = arenas.new_string(b"name");
    let garbage = arenas.new_pmc_header(AllocFlags::empty());
    arenas.push_element(root, child);
    arenas.set_metadata(child, Some(name.header()));
    arenas.anchor(root);

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(arenas.is_allocated(root));
    assert!(arenas.is_allocated(child));
    assert!(arenas.is_allocated(name));
    assert!(!arenas.is_allocated(garbage));
    assert_eq!(arenas.string_bytes(name), b"name");
    assert!(!arenas.header(root).is_live());

    assert!(arenas.unanchor(root));
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(!arenas.is_allocated(root));
    assert!(!arenas.is_allocated(name));
}

#[test]
pub fn test_cycles_are_collected() {
    let mut arenas = arenas();
    let a = arenas.new_pmc_header(AllocFlags::empty());
    let b = arenas.new_pmc_header(AllocFlags::empty());
    arenas.push_element(a, b);
    arenas.push_element(b, a);
    arenas.set_register(0, Some(a.header()));

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(arenas.is_allocated(a) && arenas.is_allocated(b));

    arenas.set_register(0, None);
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(!arenas.is_allocated(a) && !arenas.is_allocated(b));
}

#[test]
pub fn test_blocked_sweep_defers_collection() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    arenas.block_sweep();
    arenas.block_sweep();
    arenas.unblock_sweep();
    assert_eq!(arenas.sweep_block_level(), 1);

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(arenas.is_allocated(pmc));
    assert!(arenas.has_pending_collection());
    assert!(!arenas.header(pmc).is_live());

    arenas.unblock_sweep();
    assert!(!arenas.has_pending_collection());
    assert!(!arenas.is_allocated(pmc));
}

#[test]
pub fn test_unblocking_mark_runs_queued_collection() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    arenas.block_mark();
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert_eq!(arenas.info(InfoKind::GcMarkRuns), 0);
    assert!(arenas.is_allocated(pmc));

    arenas.unblock_mark();
    assert_eq!(arenas.info(InfoKind::GcMarkRuns), 1);
    assert!(!arenas.is_allocated(pmc));
}

#[test]
pub fn test_gc_blocked_section() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    let still_there = arenas.with_gc_blocked(|arenas| {
        arenas.mark_and_sweep(GcFlags::NORMAL);
        arenas.is_allocated(pmc)
    });
    assert!(still_there);
    assert!(!arenas.is_allocated(pmc));
    assert_eq!(arenas.mark_block_level(), 0);
    assert_eq!(arenas.sweep_block_level(), 0);
}

#[test]
pub fn test_lazy_collection_only_destroys_impatient_headers() {
    let mut arenas = arenas();
    let plain = arenas.new_pmc_header(AllocFlags::empty());
    let impatient = arenas.new_pmc_header(AllocFlags::IMPATIENT);
    let kept = arenas.new_pmc_header(AllocFlags::empty());
    arenas.pmc_needs_early_collection(kept);
    arenas.anchor(kept);
    assert_eq!(arenas.info(InfoKind::ImpatientPmcs), 2);

    arenas.mark_and_sweep(GcFlags::LAZY);
    assert!(arenas.is_allocated(plain));
    assert!(!arenas.is_allocated(impatient));
    assert!(arenas.is_allocated(kept));
    assert_eq!(arenas.info(InfoKind::ImpatientPmcs), 1);
    assert_eq!(arenas.info(InfoKind::GcLazyMarkRuns), 1);

    // Every impatient PMC is reachable, the lazy mark stops early and destroys nothing.
    arenas.mark_and_sweep(GcFlags::LAZY);
    assert!(arenas.is_allocated(plain));
    assert!(arenas.is_allocated(kept));
    assert!(!arenas.header(kept).is_live());
}

#[test]
pub fn test_lazy_collection_without_impatient_headers_is_a_no_op() {
    let mut arenas = arenas();
    arenas.new_pmc_header(AllocFlags::empty());
    arenas.mark_and_sweep(GcFlags::LAZY);
    assert_eq!(arenas.info(InfoKind::GcMarkRuns), 0);
}

static DESTROYED_AT_FINISH: AtomicUsize = AtomicUsize::new(0);

fn count_finish(_: PmcRef, _: &mut PmcBody) {
    DESTROYED_AT_FINISH.fetch_add(1, Ordering::SeqCst);
}

#[test]
pub fn test_finish_destroys_everything() {
    let mut arenas = arenas();
    let ty = arenas
        .register_type(GcInfo::new("FinishCounted").with_finalizer(count_finish))
        .unwrap();
    let anchored = arenas.new_pmc_header_typed(AllocFlags::CUSTOM_DESTROY, ty);
    let constant = arenas.new_pmc_header_typed(
        AllocFlags::CONSTANT | AllocFlags::CUSTOM_DESTROY,
        ty,
    );
    let string = arenas.new_constant_string(b"constant");
    arenas.anchor(anchored);
    arenas.block_mark();

    arenas.finalize();
    assert_eq!(DESTROYED_AT_FINISH.load(Ordering::SeqCst), 2);
    assert!(!arenas.is_allocated(anchored));
    assert!(!arenas.is_allocated(constant));
    assert!(!arenas.is_allocated(string));
    assert!(arenas.header_pools_iterate(PoolIter::all(), |pool| pool.active_objects() == 0));

    // Later requests are ignored, dropping does not finalize twice.
    arenas.mark_and_sweep(GcFlags::NORMAL);
    drop(arenas);
    assert_eq!(DESTROYED_AT_FINISH.load(Ordering::SeqCst), 2);
}

#[test]
pub fn test_constants_survive_regular_collections() {
    let mut arenas = arenas();
    let constant = arenas.new_pmc_header(AllocFlags::CONSTANT);
    let referenced = arenas.new_pmc_header(AllocFlags::empty());
    arenas.push_element(constant, referenced);
    let string = arenas.new_constant_string(b"literal");

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(arenas.is_allocated(constant));
    assert!(arenas.is_allocated(referenced));
    assert_eq!(arenas.string_bytes(string), b"literal");
}

#[test]
pub fn test_constant_tables_are_roots() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    let string = arenas.new_string(b"abc");
    let mut table = ConstantTable::new("main");
    table.push(Constant::Number(1.5));
    table.push(Constant::Pmc(pmc));
    table.push(Constant::String(string));
    let id = arenas.register_constant_table(table);

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(arenas.is_allocated(pmc));
    assert!(arenas.is_allocated(string));
    assert_eq!(arenas.roots().constant_table(id).map(|t| t.len()), Some(3));

    let table = arenas.unregister_constant_table(id).unwrap();
    assert_eq!(table.name(), "main");
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(!arenas.is_allocated(pmc));
    assert!(!arenas.is_allocated(string));
}

#[test]
pub fn test_write_barrier_is_inert_outside_marking() {
    let mut arenas = arenas();
    let aggregate = arenas.new_pmc_header(AllocFlags::empty());
    let value = arenas.new_pmc_header(AllocFlags::empty());
    arenas.anchor(aggregate);
    arenas.set_element(aggregate, 3, Some(value.header()));
    assert_eq!(arenas.element_count(aggregate), 4);
    assert_eq!(arenas.element(aggregate, 3), Some(value.header()));
    assert_eq!(arenas.element(aggregate, 0), None);
    assert!(!arenas.header(value).is_live());
    assert!(!arenas.header(aggregate).is_live());
}

#[test]
pub fn test_write_barrier_ignores_overwritten_values() {
    let mut arenas = arenas();
    let root = arenas.new_pmc_header(AllocFlags::empty());
    let stray = arenas.new_pmc_header(AllocFlags::empty());
    let stray_key = arenas.new_string(b"gone");
    let value = arenas.new_pmc_header(AllocFlags::empty());
    let key = arenas.new_string(b"key");
    arenas.anchor(root);

    assert!(arenas.begin_incremental_mark().unwrap());
    while !arenas.incremental_mark_step(1) {}
    arenas.write_barrier_key(
        root,
        Some(stray.header()),
        Some(stray_key.header()),
        Some(value.header()),
        Some(key.header()),
    );
    arenas.write_barrier(root, Some(stray.header()), None);
    assert!(arenas.header(value).is_live());
    assert!(arenas.header(key).is_live());
    assert!(!arenas.header(stray).is_live());
    assert!(!arenas.header(stray_key).is_live());

    arenas.finish_incremental_collection();
    assert!(!arenas.is_allocated(stray));
    assert!(!arenas.is_allocated(stray_key));
}

#[test]
pub fn test_write_barrier_during_incremental_mark() {
    let mut arenas = arenas();
    let root = arenas.new_pmc_header(AllocFlags::empty());
    let child = arenas.new_pmc_header(AllocFlags::empty());
    let hidden = arenas.new_pmc_header(AllocFlags::empty());
    let key = arenas.new_string(b"key");
    let value = arenas.new_pmc_header(AllocFlags::empty());
    arenas.push_element(root, child);
    arenas.anchor(root);

    assert!(arenas.begin_incremental_mark().unwrap());
    assert_eq!(arenas.phase(), GcPhase::Marking);
    while !arenas.incremental_mark_step(1) {}
    assert!(arenas.header(child).is_live());
    assert!(!arenas.header(hidden).is_live());

    // `root` is already traced. Without the barrier these stores would be missed.
    arenas.set_element(root, 1, Some(hidden.header()));
    arenas.set_keyed(root, key.header(), Some(value.header()));
    assert!(arenas.header(hidden).is_live());
    assert!(arenas.header(key).is_live());
    assert_eq!(arenas.keyed(root, key.header()), Some(value.header()));

    // Allocated black.
    let fresh = arenas.new_pmc_header(AllocFlags::empty());
    assert!(arenas.header(fresh).is_live());

    arenas.finish_incremental_collection();
    assert_eq!(arenas.phase(), GcPhase::Idle);
    for header in [root, child, hidden, value, fresh].iter() {
        assert!(arenas.is_allocated(*header));
    }
    assert!(arenas.is_allocated(key));

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(!arenas.is_allocated(fresh));
    assert!(arenas.is_allocated(hidden));
}

#[test]
pub fn test_collection_request_finishes_incremental_mark() {
    let mut arenas = arenas();
    let garbage = arenas.new_pmc_header(AllocFlags::empty());
    assert!(arenas.begin_incremental_mark().unwrap());
    assert!(matches!(
        arenas.begin_incremental_mark(),
        Err(GcError::CollectionInProgress)
    ));
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert_eq!(arenas.phase(), GcPhase::Idle);
    assert!(!arenas.is_allocated(garbage));
}

struct KeepAlive {
    header: HeaderRef,
    runs: usize,
}

impl MarkingConstraint for KeepAlive {
    fn runs_at(&self) -> MarkingConstraintRuns {
        MarkingConstraintRuns::BeforeMark
    }
    fn name(&self) -> &str {
        "keep-alive"
    }
    fn is_over(&self) -> bool {
        self.runs >= 2
    }
    fn run(&mut self, visitor: &mut dyn Visitor) {
        self.runs += 1;
        visitor.mark_header(self.header);
    }
}

#[test]
pub fn test_marking_constraint_reports_roots_until_over() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    arenas.add_constraint(KeepAlive {
        header: pmc.header(),
        runs: 0,
    });

    // Constraints are system roots, a root-only collection does not run them.
    arenas.mark_and_sweep(GcFlags::empty());
    assert!(!arenas.is_allocated(pmc));

    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    arenas.constraints.clear();
    arenas.add_constraint(KeepAlive {
        header: pmc.header(),
        runs: 0,
    });
    arenas.mark_and_sweep(GcFlags::NORMAL);
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(arenas.is_allocated(pmc));
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(!arenas.is_allocated(pmc));
    assert!(arenas.constraints.is_empty());
}

#[test]
pub fn test_trace_roots_by_mode() {
    let mut arenas = arenas();
    let on_stack = arenas.new_pmc_header(AllocFlags::empty());
    let below = arenas.new_string(b"below");
    let anchored = arenas.new_pmc_header(AllocFlags::empty());
    arenas.push_element(on_stack, below);
    arenas.anchor(anchored);
    let depth = arenas.push_stack_root(on_stack);
    assert_eq!(depth, 0);
    assert_eq!(arenas.roots().stack_depth(), 1);

    assert_eq!(arenas.trace_roots(TraceMode::SystemOnly).unwrap(), 2);
    assert_eq!(arenas.trace_roots(TraceMode::RootOnly).unwrap(), 1);
    assert_eq!(arenas.trace_roots(TraceMode::Full).unwrap(), 3);
    assert!(!arenas.header(on_stack).is_live());

    arenas.pop_stack_roots(depth);
    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(!arenas.is_allocated(on_stack));
    assert!(arenas.is_allocated(anchored));
}

#[test]
pub fn test_compaction_keeps_contents() {
    let mut arenas = arenas();
    let mut kept = Vec::new();
    for i in 0..64u8 {
        let bytes = vec![i; 100 + i as usize];
        let string = arenas.new_string(&bytes);
        if i % 2 == 0 {
            kept.push((string, bytes));
        } else {
            arenas.free_string_header(string);
        }
    }
    let buffer = arenas.new_bufferlike_header(24);
    arenas.allocate_buffer_storage_aligned(buffer, 32);
    arenas.buffer_bytes_mut(buffer).copy_from_slice(&[7u8; 32]);
    let before = arenas.payloads.memory_pool.guaranteed_reclaimable();
    assert!(before > 0);

    assert!(arenas.compact_memory_pool());
    assert_eq!(arenas.payloads.memory_pool.guaranteed_reclaimable(), 0);
    assert_eq!(arenas.payloads.memory_pool.block_count(), 1);
    assert!(arenas.statistics().total_copied > 0);
    assert_eq!(arenas.info(InfoKind::GcCollectRuns), 1);
    for (string, bytes) in kept.iter() {
        assert_eq!(arenas.string_bytes(*string), &bytes[..]);
    }
    assert_eq!(arenas.buffer_bytes(buffer), &[7u8; 32][..]);

    arenas.block_sweep();
    assert!(!arenas.compact_memory_pool());
    arenas.unblock_sweep();
}

#[test]
pub fn test_shared_strings_copy_on_write() {
    let mut arenas = arenas();
    let original = arenas.new_string(b"hello");
    let hash = arenas.string_hash(original);
    let copy = arenas.share_string(original);
    assert_eq!(arenas.string_storage(original), arenas.string_storage(copy));
    assert_eq!(arenas.string_hash(copy), hash);

    arenas.string_bytes_mut(copy)[0] = b'j';
    assert_ne!(arenas.string_storage(original), arenas.string_storage(copy));
    assert_eq!(arenas.string_bytes(original), b"hello");
    assert_eq!(arenas.string_bytes(copy), b"jello");
    assert_ne!(arenas.string_hash(copy), hash);

    let span = arenas.string_storage(original).unwrap();
    let pool = &arenas.payloads.memory_pool;
    assert_eq!(pool.guaranteed_reclaimable(), 0);
    assert_eq!(pool.possibly_reclaimable(), span.capacity());
    assert!(!pool.is_shared(&span));

    // The original is the last holder and writes in place.
    arenas.string_bytes_mut(original)[0] = b'c';
    assert_eq!(arenas.string_storage(original), Some(span));
    assert_eq!(arenas.string_bytes(original), b"cello");
    arenas.free_string_header(original);
    let pool = &arenas.payloads.memory_pool;
    assert_eq!(pool.guaranteed_reclaimable(), span.capacity());
    assert_eq!(pool.possibly_reclaimable(), span.capacity());
}

#[test]
pub fn test_shared_span_reclaim_accounting() {
    let mut arenas = Arenas::new(Config {
        min_memory_block_size: 4096,
        max_memory_block_size: 4096,
        ..quiet_config()
    })
    .unwrap();
    let original = arenas.new_string(&[1u8; 4000]);
    let mut holders = vec![original];
    for _ in 0..3 {
        holders.push(arenas.share_string(original));
    }
    let span = arenas.string_storage(original).unwrap();
    assert_eq!(arenas.payloads.memory_pool.holders(&span), 4);

    let check = |arenas: &Arenas| {
        let pool = &arenas.payloads.memory_pool;
        assert!(pool.guaranteed_reclaimable() <= pool.possibly_reclaimable());
        assert!(pool.possibly_reclaimable() <= pool.total_allocated());
    };
    let last = holders.pop().unwrap();
    for string in holders {
        arenas.free_string_header(string);
        check(&arenas);
        assert_eq!(arenas.payloads.memory_pool.guaranteed_reclaimable(), 0);
        assert_eq!(arenas.payloads.memory_pool.possibly_reclaimable(), span.capacity());
    }
    assert_eq!(arenas.string_bytes(last)[3999], 1);

    arenas.free_string_header(last);
    check(&arenas);
    let pool = &arenas.payloads.memory_pool;
    assert_eq!(pool.guaranteed_reclaimable(), span.capacity());
    assert_eq!(pool.possibly_reclaimable(), span.capacity());
    assert_eq!(pool.total_allocated(), 4096);
}

#[test]
pub fn test_shared_strings_survive_compaction() {
    let mut arenas = arenas();
    let original = arenas.new_string(b"shared bytes");
    let copy = arenas.share_string(original);
    let garbage = arenas.new_string(&[0u8; 512]);
    arenas.free_string_header(garbage);

    assert!(arenas.compact_memory_pool());
    assert_eq!(arenas.string_storage(original), arenas.string_storage(copy));
    assert_eq!(arenas.string_bytes(copy), b"shared bytes");
}

#[test]
pub fn test_string_resizing() {
    let mut arenas = arenas();
    let string = arenas.new_string(b"abc");
    arenas.reallocate_string_storage(string, 6).unwrap();
    assert_eq!(&arenas.string_bytes(string)[..3], b"abc");
    arenas.string_bytes_mut(string)[3..].copy_from_slice(b"def");
    assert_eq!(arenas.string_bytes(string), b"abcdef");
    let storage = arenas.string_storage(string).unwrap();
    assert!(arenas.ptr_in_memory_pool(&storage));

    let constant = arenas.new_constant_string(b"fixed");
    assert!(matches!(
        arenas.reallocate_string_storage(constant, 10),
        Err(GcError::Unsupported { .. })
    ));
    assert_eq!(arenas.string_bytes(constant), b"fixed");
}

#[test]
pub fn test_pmc_attributes() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    arenas.allocate_pmc_attributes(pmc, 24).unwrap();
    assert!(arenas.pmc_attributes(pmc).unwrap().iter().all(|b| *b == 0));
    arenas.pmc_attributes_mut(pmc).unwrap()[0] = 42;
    assert_eq!(arenas.pmc_attributes(pmc).unwrap()[0], 42);
    assert_eq!(arenas.info(InfoKind::ExtendedPmcs), 1);

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert_eq!(arenas.info(InfoKind::ExtendedPmcs), 0);

    let constant = arenas.new_pmc_header(AllocFlags::CONSTANT);
    assert!(matches!(
        arenas.allocate_pmc_attributes(constant, 8),
        Err(GcError::Unsupported { .. })
    ));
    assert!(arenas.pmc_attributes(constant).is_none());
}

#[test]
pub fn test_shared_pmc_sync() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    assert!(arenas.lock_pmc(pmc).is_none());
    arenas.add_pmc_sync(pmc);
    assert!(arenas.header(pmc).flags().shared());
    {
        let _guard = arenas.lock_pmc(pmc).unwrap();
    }
    arenas.free_pmc_sync(pmc);
    assert!(arenas.lock_pmc(pmc).is_none());
}

#[test]
pub fn test_allocation_threshold_triggers_collection() {
    let mut arenas = Arenas::new(Config {
        initial_arena_objects: 16,
        arena_growth_factor: 1.0,
        header_collect_threshold: 50,
        ..quiet_config()
    })
    .unwrap();
    for _ in 0..200 {
        arenas.new_pmc_header(AllocFlags::empty());
    }
    let stats = arenas.statistics();
    assert!(stats.mark_runs >= 1);
    assert!(stats.total_pmcs < 200);
}

#[test]
pub fn test_bufferlike_pools_by_size() {
    let mut arenas = arenas();
    let small = arenas.new_bufferlike_header(16);
    let same = arenas.new_bufferlike_header(13);
    let large = arenas.new_bufferlike_header(64);
    assert_eq!(small.header().pool, same.header().pool);
    assert_ne!(small.header().pool, large.header().pool);
    assert!(!arenas.ptr_is_pmc(small.header()));

    assert_eq!(arenas.bufferlike_bytes(small).len(), 16);
    assert_eq!(arenas.bufferlike_bytes(same).len(), 13);
    assert_eq!(arenas.bufferlike_bytes(large).len(), 64);
    assert!(arenas.bufferlike_bytes(large).iter().all(|b| *b == 0));

    arenas.bufferlike_bytes_mut(large).copy_from_slice(&[7u8; 64]);
    arenas.bufferlike_bytes_mut(small)[15] = 3;
    assert_eq!(arenas.bufferlike_bytes(large), &[7u8; 64][..]);
    assert_eq!(arenas.bufferlike_bytes(small)[15], 3);
    assert!(arenas.bufferlike_bytes(same).iter().all(|b| *b == 0));

    arenas.allocate_buffer_storage_aligned(large, 10);
    arenas.reallocate_buffer_storage(large, 100);
    assert_eq!(arenas.buffer_bytes(large).len(), 100);
    assert_eq!(arenas.bufferlike_bytes(large)[63], 7);

    let fixed_before = arenas.payloads.fixed.allocated_bytes();
    arenas.free_bufferlike_header(large);
    assert!(!arenas.is_allocated(large));
    assert_eq!(arenas.payloads.fixed.allocated_bytes(), fixed_before - 64);

    let empty = arenas.new_bufferlike_header(0);
    assert!(arenas.bufferlike_bytes(empty).is_empty());
}

#[test]
pub fn test_sized_pool_ids_are_bounded() {
    let mut arenas = arenas();
    let word = std::mem::size_of::<usize>();
    let mut size = word;
    while arenas.pools.len() <= u16::MAX as usize {
        arenas.sized_pool(size).unwrap();
        size += word;
    }
    assert!(matches!(arenas.sized_pool(size), Err(GcError::PoolLimit(_))));
    // Sizes that already have a pool keep resolving.
    assert!(arenas.sized_pool(word).is_ok());
    assert_eq!(arenas.pools.len(), u16::MAX as usize + 1);
}

#[test]
pub fn test_header_pool_iteration() {
    let mut arenas = arenas();
    arenas.new_pmc_header(AllocFlags::empty());
    arenas.new_bufferlike_header(32);
    let mut names = Vec::new();
    arenas.header_pools_iterate(PoolIter::PMC, |pool| {
        names.push(pool.name());
        true
    });
    assert_eq!(names, vec!["pmc"]);

    let mut visited = 0;
    let completed = arenas.header_pools_iterate(PoolIter::all(), |_| {
        visited += 1;
        false
    });
    assert!(!completed);
    assert_eq!(visited, 1);
}

#[test]
pub fn test_pmc_index_is_stable() {
    let mut arenas = arenas();
    let first = arenas.new_pmc_header(AllocFlags::empty());
    let second = arenas.new_pmc_header(AllocFlags::empty());
    assert_ne!(arenas.get_pmc_index(first), arenas.get_pmc_index(second));
    assert!(arenas.ptr_is_pmc(first.header()));
    assert_eq!(arenas.as_pmc(second.header()), Some(second));
    let string = arenas.new_string(b"not a pmc");
    assert_eq!(arenas.as_pmc(string.header()), None);
}

#[test]
pub fn test_merge_child_into_parent() {
    let mut parent = arenas();
    let parent_pmc = parent.new_pmc_header(AllocFlags::empty());
    parent.anchor(parent_pmc);

    let mut child = parent.spawn_child().unwrap();
    let holder = child.new_pmc_header(AllocFlags::empty());
    let text = child.new_string(b"from the child");
    let shared = child.share_string(text);
    child.push_element(holder, text);
    child.push_element(holder, shared);
    child.allocate_pmc_attributes(holder, 16).unwrap();
    child.pmc_attributes_mut(holder).unwrap()[3] = 9;
    child.anchor(holder);
    let garbage = child.new_pmc_header(AllocFlags::empty());

    let remap = parent.merge_header_pools(child).unwrap();
    let holder = remap.pmc(holder).unwrap();
    let text = remap.string(text).unwrap();
    let shared = remap.string(shared).unwrap();
    assert!(remap.get(garbage.header()).is_some());
    assert_eq!(parent.element(holder, 0), Some(text.header()));
    assert_eq!(parent.element(holder, 1), Some(shared.header()));
    assert_eq!(parent.string_bytes(text), b"from the child");
    assert_eq!(parent.string_storage(text), parent.string_storage(shared));
    let span = parent.string_storage(text).unwrap();
    assert_eq!(parent.payloads.memory_pool.holders(&span), 2);
    assert_eq!(parent.pmc_attributes(holder).unwrap()[3], 9);
    assert_eq!(parent.info(InfoKind::ExtendedPmcs), 1);

    parent.mark_and_sweep(GcFlags::NORMAL);
    assert!(parent.is_allocated(parent_pmc));
    assert!(parent.is_allocated(holder));
    assert!(parent.is_allocated(text));
    assert!(!parent.is_allocated(remap.get(garbage.header()).unwrap()));
}

#[test]
pub fn test_merge_keeps_bufferlike_fields() {
    let mut parent = arenas();
    let mut child = parent.spawn_child().unwrap();
    let buffer = child.new_bufferlike_header(24);
    child.bufferlike_bytes_mut(buffer)[..5].copy_from_slice(b"stack");

    let remap = parent.merge_header_pools(child).unwrap();
    let buffer = remap.buffer(buffer).unwrap();
    assert_eq!(parent.bufferlike_bytes(buffer).len(), 24);
    assert_eq!(&parent.bufferlike_bytes(buffer)[..5], b"stack");

    parent.free_bufferlike_header(buffer);
    assert_eq!(parent.payloads.fixed.allocated_bytes(), 0);
}

#[test]
pub fn test_merge_requires_shared_types() {
    let mut parent = arenas();
    let stranger = arenas();
    assert!(matches!(
        parent.merge_header_pools(stranger),
        Err(GcError::ForeignTypeTable)
    ));
}

fn trace_first_element_only(body: &PmcBody, visitor: &mut dyn Visitor) {
    visitor.mark_optional(body.elements.first().copied().flatten());
}

#[test]
pub fn test_custom_trace_skips_weak_references() {
    let mut arenas = arenas();
    let ty = arenas
        .register_type(GcInfo::new("WeakTail").with_trace(trace_first_element_only))
        .unwrap();
    let holder = arenas.new_pmc_header_typed(AllocFlags::empty(), ty);
    let strong = arenas.new_pmc_header(AllocFlags::empty());
    let weak = arenas.new_pmc_header(AllocFlags::empty());
    arenas.push_element(holder, strong);
    arenas.push_element(holder, weak);
    arenas.anchor(holder);

    arenas.mark_and_sweep(GcFlags::NORMAL);
    assert!(arenas.is_allocated(strong));
    assert!(!arenas.is_allocated(weak));
}

#[test]
pub fn test_statistics_report() {
    let mut arenas = arenas();
    let pmc = arenas.new_pmc_header(AllocFlags::empty());
    arenas.anchor(pmc);
    arenas.new_string(b"text");
    arenas.mark_and_sweep(GcFlags::NORMAL);

    let stats = arenas.statistics();
    assert_eq!(stats.active_pmcs, 1);
    assert_eq!(stats.active_buffers, 0);
    assert_eq!(stats.mark_runs, 1);
    assert!(stats.total_memory_allocated() > 0);
    let report = stats.to_string();
    assert!(report.starts_with("Heap statistics:"));
    assert!(report.contains("PMCs: 1 active"));
}
