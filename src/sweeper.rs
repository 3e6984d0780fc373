use std::collections::HashSet;

use crate::{
    arenas::{Arenas, GcCounters, Payloads},
    gc_info_table::GcInfoTable,
    gcref::{HeaderRef, PmcRef},
    header::{Header, HeaderBody, ObjectKind},
    memory_pool::MemoryPoolId,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepMode {
    /// Destroys every header that was not marked, then rebuilds the free lists.
    Full,
    /// Destroys unmarked headers only if they are flagged impatient.
    ImpatientOnly,
    /// Destroys everything, constants included.
    Finish,
}

/// Per-kind destruction of a dead header.
pub(crate) struct Reclaimer<'a> {
    pub payloads: &'a mut Payloads,
    pub types: &'a GcInfoTable,
    pub counters: &'a mut GcCounters,
}

impl Reclaimer<'_> {
    pub fn gc_object(&mut self, kind: ObjectKind, header: HeaderRef, slot: &mut Header) {
        match kind {
            ObjectKind::Plain | ObjectKind::AttributeBearing => self.destroy_pmc(header, slot),
            ObjectKind::Bufferlike | ObjectKind::StringLike => self.release_payload(slot),
        }
        slot.body = HeaderBody::Free;
    }

    fn destroy_pmc(&mut self, header: HeaderRef, slot: &mut Header) {
        let flags = slot.flags();
        let body = match slot.pmc_mut() {
            Some(body) => body,
            None => return,
        };
        if flags.custom_destroy() {
            if let Some(finalize) = self.types.get(body.type_index).finalize {
                finalize(PmcRef(header), body);
            }
        }
        if let Some(attributes) = body.attributes.take() {
            self.payloads.fixed.free(attributes);
            self.counters.extended_pmcs -= 1;
        }
        body.sync = None;
        if flags.needs_early_gc() {
            self.counters.num_early_gc_pmcs = self.counters.num_early_gc_pmcs.saturating_sub(1);
        }
    }

    fn release_payload(&mut self, slot: &mut Header) {
        if let Some(storage) = slot.body.storage_mut().and_then(|s| s.take()) {
            self.payloads.release(storage);
        }
        if let HeaderBody::Buffer(buffer) = &mut slot.body {
            if let Some(inline) = buffer.inline.take() {
                self.payloads.fixed.free(inline);
            }
        }
    }
}

impl Arenas {
    /// Walks every pool and destroys the headers `mode` selects. Returns the number of
    /// destroyed headers.
    pub(crate) fn sweep(&mut self, mode: SweepMode) -> usize {
        let release = self.config.release_empty_arenas && mode != SweepMode::ImpatientOnly;
        let replenish_ratio = self.config.replenish_ratio;
        let mut freed = 0;
        let mut live = 0;
        let mut reclaimer = Reclaimer {
            payloads: &mut self.payloads,
            types: &self.types,
            counters: &mut self.counters,
        };
        for pool in self.pools.iter_mut() {
            if pool.is_constant() && mode != SweepMode::Finish {
                pool.for_each_live_mut(|_, header| header.clear_live());
                live += pool.active_objects();
                continue;
            }
            let kind = pool.kind();
            for header in pool.live_refs() {
                let slot = pool.header_mut(header);
                let dead = match mode {
                    SweepMode::Finish => true,
                    SweepMode::Full => !slot.is_live(),
                    SweepMode::ImpatientOnly => !slot.is_live() && slot.flags().needs_early_gc(),
                };
                if !dead {
                    slot.clear_live();
                    if mode == SweepMode::Full {
                        slot.age();
                    }
                    live += 1;
                    continue;
                }
                reclaimer.gc_object(kind, header, slot);
                freed += 1;
                if mode == SweepMode::ImpatientOnly {
                    pool.add_free_object(header);
                } else {
                    *slot = Header::free(None);
                }
            }
            if mode != SweepMode::ImpatientOnly {
                pool.rebuild_free_list(release);
                pool.skip = mode == SweepMode::Full
                    && (pool.num_free_objects() as f64)
                        < replenish_ratio * pool.total_objects() as f64;
            }
        }

        match mode {
            SweepMode::Full => {
                self.alloc.update_after_collection(&self.config, live);
                for pool in [MemoryPoolId::General, MemoryPoolId::Constant] {
                    if self.payloads.pool(pool).should_compact() {
                        self.compact(pool);
                    }
                }
            }
            SweepMode::ImpatientOnly => {}
            SweepMode::Finish => self.counters.num_early_gc_pmcs = 0,
        }
        log::debug!("sweep {:?}: {} destroyed, {} live", mode, freed, live);
        freed
    }

    /// Moves every allocated payload of memory pool `which` into one fresh block and
    /// releases the old blocks. Returns `false` if sweeping is blocked or the new block
    /// could not be mapped.
    pub(crate) fn compact(&mut self, which: MemoryPoolId) -> bool {
        if self.blocking.is_sweep_blocked() {
            log::debug!("compaction of {:?} memory pool deferred: sweep blocked", which);
            return false;
        }
        let mut spans = HashSet::new();
        let mut live_bytes = 0;
        for pool in self.pools.iter().filter(|pool| !pool.kind().is_pmc()) {
            pool.for_each_live(|_, header| {
                if let Some(storage) = header.body().storage() {
                    if storage.pool() == which && spans.insert(storage.span_key()) {
                        live_bytes += storage.capacity();
                    }
                }
            });
        }

        let memory_pool = self.payloads.pool_mut(which);
        let before = memory_pool.total_allocated();
        let mut compaction = match memory_pool.begin_compaction(live_bytes) {
            Ok(compaction) => compaction,
            Err(error) => {
                log::warn!("compaction of {:?} memory pool skipped: {}", which, error);
                return false;
            }
        };
        for pool in self.pools.iter_mut().filter(|pool| !pool.kind().is_pmc()) {
            pool.for_each_live_mut(|_, header| {
                if let Some(slot) = header.body.storage_mut() {
                    if let Some(storage) = *slot {
                        if storage.pool() == which {
                            *slot = Some(memory_pool.relocate(&mut compaction, storage));
                        }
                    }
                }
            });
        }
        let copied = memory_pool.finish_compaction(compaction);
        let after = memory_pool.total_allocated();
        self.counters.collect_runs += 1;
        log::debug!(
            "compacted {:?} memory pool: {} -> {} bytes, {} copied",
            which,
            before,
            after,
            copied
        );
        true
    }
}
