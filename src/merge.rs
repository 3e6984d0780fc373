//! Folding the arenas of a finished sub-interpreter into its parent.
use std::{collections::HashMap, sync::Arc};

use crate::{
    arenas::{Arenas, GcPhase, Payloads},
    error::{oom_abort, GcError},
    gcref::{BufferRef, HeaderRef, PmcRef, PoolId, StringRef},
    header::HeaderBody,
    memory_pool::Storage,
};

/// Copies a payload span of the merged heap. Spans shared copy-on-write are copied once.
fn adopt_span(
    payloads: &mut Payloads,
    source: &Payloads,
    spans: &mut HashMap<Storage, Storage>,
    slot: &mut Option<Storage>,
) {
    let storage = match *slot {
        Some(storage) => storage,
        None => return,
    };
    let moved = match spans.get(&storage) {
        Some(moved) => {
            payloads.pool_mut(moved.pool()).share(moved);
            *moved
        }
        None => {
            let moved = match payloads
                .pool_mut(storage.pool())
                .adopt(source.pool(storage.pool()), storage)
            {
                Ok(moved) => moved,
                Err(_) => oom_abort(storage.len()),
            };
            spans.insert(storage, moved);
            moved
        }
    };
    *slot = Some(moved);
}

/// New addresses of the headers moved by [Arenas::merge_header_pools].
#[derive(Default, Debug)]
pub struct HeaderRemap {
    map: HashMap<HeaderRef, HeaderRef>,
}

impl HeaderRemap {
    pub fn get(&self, header: HeaderRef) -> Option<HeaderRef> {
        self.map.get(&header).copied()
    }
    pub fn pmc(&self, pmc: PmcRef) -> Option<PmcRef> {
        self.get(pmc.0).map(PmcRef)
    }
    pub fn string(&self, string: StringRef) -> Option<StringRef> {
        self.get(string.0).map(StringRef)
    }
    pub fn buffer(&self, buffer: BufferRef) -> Option<BufferRef> {
        self.get(buffer.0).map(BufferRef)
    }
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Arenas {
    fn matching_pool(&mut self, source: &Arenas, pool: PoolId) -> Result<PoolId, GcError> {
        let pool = if pool == source.pmc_pool {
            self.pmc_pool
        } else if pool == source.constant_pmc_pool {
            self.constant_pmc_pool
        } else if pool == source.string_pool {
            self.string_pool
        } else if pool == source.constant_string_pool {
            self.constant_string_pool
        } else {
            self.sized_pool(source.pools[pool.index()].object_size())?
        };
        Ok(pool)
    }

    /// Moves every header of `source` into these arenas.
    ///
    /// Arenas are moved whole, so headers keep their slot but get a new pool and arena
    /// index. References between moved headers, the anchors and constant tables of `source`
    /// are rewritten; payloads and attributes are copied into this heap's allocators. The
    /// returned [HeaderRemap] translates handles the caller still holds.
    ///
    /// Both heaps must share a type table and be idle.
    pub fn merge_header_pools(&mut self, mut source: Arenas) -> Result<HeaderRemap, GcError> {
        if !Arc::ptr_eq(&self.types, &source.types) {
            return Err(GcError::ForeignTypeTable);
        }
        if self.phase != GcPhase::Idle || source.phase != GcPhase::Idle {
            return Err(GcError::CollectionInProgress);
        }

        let mut arena_map = HashMap::new();
        let mut adopted = Vec::new();
        for index in 0..source.pools.len() {
            let from = PoolId(index as u16);
            let to = self.matching_pool(&source, from)?;
            for (old_arena, arena) in source.pools[index].drain_arenas() {
                let new_arena = self.pools[to.index()].adopt_arena(arena);
                arena_map.insert((from, old_arena), (to, new_arena));
                adopted.push((from, old_arena, to, new_arena));
            }
        }
        let relocate = |header: &mut HeaderRef| match arena_map.get(&(header.pool, header.arena)) {
            Some((pool, arena)) => *header = HeaderRef::new(*pool, *arena, header.slot),
            None => log::warn!("merged heap references released arena of {:?}", header),
        };

        let mut remap = HeaderRemap::default();
        let mut spans: HashMap<Storage, Storage> = HashMap::new();
        let owner = self.id;
        for (from, old_arena, to, new_arena) in adopted.iter().copied() {
            let arena = self.pools[to.index()].arena_at_mut(new_arena);
            for (slot, header) in arena.slots_mut().iter_mut().enumerate() {
                if header.is_free() {
                    continue;
                }
                remap.map.insert(
                    HeaderRef::new(from, old_arena, slot as u32),
                    HeaderRef::new(to, new_arena, slot as u32),
                );
                match &mut header.body {
                    HeaderBody::Pmc(body) => {
                        body.for_each_reference_mut(relocate);
                        if let Some(attributes) = body.attributes {
                            let fixed = &source.payloads.fixed;
                            body.attributes = Some(match self.payloads.fixed.adopt(fixed, attributes) {
                                Ok(storage) => storage,
                                Err(_) => oom_abort(fixed.size_of(attributes)),
                            });
                        }
                        if let Some(sync) = body.sync.as_mut() {
                            sync.owner = owner;
                        }
                    }
                    HeaderBody::String(string) => {
                        adopt_span(&mut self.payloads, &source.payloads, &mut spans, &mut string.storage)
                    }
                    HeaderBody::Buffer(buffer) => {
                        adopt_span(&mut self.payloads, &source.payloads, &mut spans, &mut buffer.storage);
                        if let Some(inline) = buffer.inline {
                            let fixed = &source.payloads.fixed;
                            buffer.inline = Some(match self.payloads.fixed.adopt(fixed, inline) {
                                Ok(storage) => storage,
                                Err(_) => oom_abort(fixed.size_of(inline)),
                            });
                        }
                    }
                    HeaderBody::Free => {}
                }
            }
        }
        for (_, _, to, new_arena) in adopted.iter().copied() {
            self.pools[to.index()].relink(new_arena);
        }

        source.roots.for_each_root_mut(relocate);
        let roots = std::mem::take(&mut source.roots);
        self.roots.append(roots);
        self.constraints.append(&mut source.constraints);
        self.counters.num_early_gc_pmcs += source.counters.num_early_gc_pmcs;
        self.counters.extended_pmcs += source.counters.extended_pmcs;
        source.counters.num_early_gc_pmcs = 0;
        source.counters.extended_pmcs = 0;
        source.finished = true;

        log::debug!(
            "merged arenas #{} into #{}: {} headers in {} arenas",
            source.id,
            self.id,
            remap.len(),
            adopted.len()
        );
        Ok(remap)
    }
}
