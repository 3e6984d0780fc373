use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    hash::Hasher,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::MutexGuard;

use crate::{
    align_usize,
    allocation_config::AllocationConfig,
    constants::{ConstantTable, ConstantTableId},
    error::{oom_abort, GcError},
    fixed_size::{FixedSizeAllocator, FixedStorage},
    gc_info_table::{GcInfo, GcInfoIndex, GcInfoTable},
    gcref::{BufferRef, HeaderRef, PmcRef, PoolId, StringRef},
    header::{
        AllocFlags, BufferBody, GcFlags, Header, HeaderBody, ObjectKind, PmcBody, PmcSync,
        StringBody,
    },
    memory_pool::{MemoryPool, MemoryPoolId, Storage},
    pool::{PoolIter, SmallObjectPool},
    roots::{MarkingConstraint, RootSet, TraceMode},
    safepoint::BlockState,
    statistics::{formatted_size, HeapStatistics, InfoKind},
    sweeper::SweepMode,
    Config,
};

static NEXT_ARENAS_ID: AtomicUsize = AtomicUsize::new(1);

/// Collector state machine: `Idle -> Marking -> Sweeping -> Idle`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcPhase {
    Idle,
    Marking,
    Sweeping,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct GcCounters {
    pub mark_runs: usize,
    pub lazy_mark_runs: usize,
    pub collect_runs: usize,
    /// PMCs currently flagged impatient.
    pub num_early_gc_pmcs: usize,
    /// Impatient PMCs marked during the current mark.
    pub impatient_seen: usize,
    /// PMCs that currently own attribute storage.
    pub extended_pmcs: usize,
}

/// Payload allocators. Kept apart from the header pools so the sweeper can release payloads
/// while walking the pools.
pub(crate) struct Payloads {
    pub memory_pool: MemoryPool,
    pub constant_memory_pool: MemoryPool,
    pub fixed: FixedSizeAllocator,
}

impl Payloads {
    pub fn pool(&self, id: MemoryPoolId) -> &MemoryPool {
        match id {
            MemoryPoolId::General => &self.memory_pool,
            MemoryPoolId::Constant => &self.constant_memory_pool,
        }
    }

    pub fn pool_mut(&mut self, id: MemoryPoolId) -> &mut MemoryPool {
        match id {
            MemoryPoolId::General => &mut self.memory_pool,
            MemoryPoolId::Constant => &mut self.constant_memory_pool,
        }
    }

    pub fn release(&mut self, storage: Storage) {
        self.pool_mut(storage.pool()).free(storage);
    }
}

/// Per-interpreter GC state. Owns every header pool, the memory pools, the root set and the
/// collector counters.
///
/// All collector operations are methods on this context object; there is no global state.
/// An `Arenas` runs a FINISH sweep when dropped, so every finalizer runs exactly once.
pub struct Arenas {
    pub(crate) id: usize,
    pub(crate) config: Config,
    pub(crate) pools: Vec<SmallObjectPool>,
    pub(crate) pmc_pool: PoolId,
    pub(crate) constant_pmc_pool: PoolId,
    pub(crate) string_pool: PoolId,
    pub(crate) constant_string_pool: PoolId,
    pub(crate) sized_pools: BTreeMap<usize, PoolId>,
    pub(crate) payloads: Payloads,
    pub(crate) types: Arc<GcInfoTable>,
    pub(crate) roots: RootSet,
    pub(crate) constraints: Vec<Box<dyn MarkingConstraint>>,
    pub(crate) blocking: BlockState,
    pub(crate) phase: GcPhase,
    pub(crate) mark_stack: Vec<HeaderRef>,
    pub(crate) alloc: AllocationConfig,
    pub(crate) counters: GcCounters,
    pub(crate) finished: bool,
}

impl Arenas {
    pub fn new(config: Config) -> Result<Self, GcError> {
        Self::with_types(config, GcInfoTable::new())
    }

    /// Creates arenas that share `types` with other arenas. Only arenas sharing a type table
    /// can be merged.
    pub fn with_types(config: Config, types: Arc<GcInfoTable>) -> Result<Self, GcError> {
        config.validate()?;
        let mut pools = Vec::new();
        let mut add_pool = |name: &'static str, kind: ObjectKind, size: usize, constant: bool| {
            let id = PoolId(pools.len() as u16);
            pools.push(SmallObjectPool::new(id, name, kind, size, constant, &config));
            id
        };
        let pmc_pool = add_pool("pmc", ObjectKind::AttributeBearing, 0, false);
        let constant_pmc_pool = add_pool("constant pmc", ObjectKind::Plain, 0, true);
        let string_pool = add_pool("string", ObjectKind::StringLike, 0, false);
        let constant_string_pool = add_pool("constant string", ObjectKind::StringLike, 0, true);

        let payloads = Payloads {
            memory_pool: MemoryPool::new(MemoryPoolId::General, &config, config.reclaim_factor),
            constant_memory_pool: MemoryPool::new(
                MemoryPoolId::Constant,
                &config,
                config.constant_reclaim_factor,
            ),
            fixed: FixedSizeAllocator::new(),
        };
        let id = NEXT_ARENAS_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("arenas #{} created", id);
        Ok(Self {
            id,
            alloc: AllocationConfig::new(&config),
            config,
            pools,
            pmc_pool,
            constant_pmc_pool,
            string_pool,
            constant_string_pool,
            sized_pools: BTreeMap::new(),
            payloads,
            types,
            roots: RootSet::new(),
            constraints: Vec::new(),
            blocking: BlockState::new(),
            phase: GcPhase::Idle,
            mark_stack: Vec::new(),
            counters: GcCounters::default(),
            finished: false,
        })
    }

    /// Arenas for a sub-interpreter. The child shares the type table and configuration, so
    /// it can later be folded back with [merge_header_pools](Arenas::merge_header_pools).
    pub fn spawn_child(&self) -> Result<Arenas, GcError> {
        Arenas::with_types(self.config.clone(), self.types.clone())
    }

    pub fn id(&self) -> usize {
        self.id
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn phase(&self) -> GcPhase {
        self.phase
    }
    pub fn types(&self) -> &Arc<GcInfoTable> {
        &self.types
    }

    pub fn register_type(&self, info: GcInfo) -> Result<GcInfoIndex, GcError> {
        self.types.register(info)
    }

    // Pools and headers

    pub fn pool(&self, id: PoolId) -> &SmallObjectPool {
        &self.pools[id.index()]
    }

    /// Pool serving bufferlike headers of `size` bytes, created on first use. Fails once
    /// every [PoolId] is taken.
    pub(crate) fn sized_pool(&mut self, size: usize) -> Result<PoolId, GcError> {
        let size = align_usize(size.max(1), std::mem::size_of::<usize>());
        if let Some(id) = self.sized_pools.get(&size) {
            return Ok(*id);
        }
        if self.pools.len() > u16::MAX as usize {
            return Err(GcError::PoolLimit(self.pools.len()));
        }
        let id = PoolId(self.pools.len() as u16);
        self.pools.push(SmallObjectPool::new(
            id,
            "bufferlike",
            ObjectKind::Bufferlike,
            size,
            false,
            &self.config,
        ));
        self.sized_pools.insert(size, id);
        log::debug!("created bufferlike pool #{} for {} byte headers", id.0, size);
        Ok(id)
    }

    pub fn header(&self, header: impl Into<HeaderRef>) -> &Header {
        let header = header.into();
        self.pools[header.pool.index()].header(header)
    }

    pub(crate) fn header_mut(&mut self, header: HeaderRef) -> &mut Header {
        self.pools[header.pool.index()].header_mut(header)
    }

    /// `true` while `header` is allocated, i.e. not on a free list.
    pub fn is_allocated(&self, header: impl Into<HeaderRef>) -> bool {
        let header = header.into();
        self.pools
            .get(header.pool.index())
            .map(|pool| pool.owns(header) && !pool.header(header).is_free())
            .unwrap_or(false)
    }

    pub fn pmc_body(&self, pmc: PmcRef) -> &PmcBody {
        match self.header(pmc).pmc() {
            Some(body) => body,
            None => panic!("{:?} is not a PMC", pmc.0),
        }
    }

    pub(crate) fn pmc_body_mut(&mut self, pmc: PmcRef) -> &mut PmcBody {
        match self.header_mut(pmc.0).pmc_mut() {
            Some(body) => body,
            None => panic!("{:?} is not a PMC", pmc.0),
        }
    }

    /// Takes a slot from `pool`, growing the pool or collecting when it is exhausted.
    fn get_free_header(&mut self, pool: PoolId) -> HeaderRef {
        if let Some(header) = self.pools[pool.index()].get_free_object() {
            return header;
        }
        if self.pools[pool.index()].skip {
            self.pools[pool.index()].skip = false;
        } else if self.alloc.allocation_threshold_exceeded()
            && self.phase == GcPhase::Idle
            && !self.finished
        {
            self.mark_and_sweep(GcFlags::NORMAL);
            if let Some(header) = self.pools[pool.index()].get_free_object() {
                return header;
            }
        }
        if let Err(error) = self.pools[pool.index()].alloc_objects() {
            log::warn!("{} pool growth failed: {}", self.pools[pool.index()].name(), error);
            if self.phase == GcPhase::Idle {
                self.mark_and_sweep(GcFlags::NORMAL);
            }
            if let Some(header) = self.pools[pool.index()].get_free_object() {
                return header;
            }
            match error {
                GcError::OutOfMemory(size) => oom_abort(size),
                _ => oom_abort(0),
            }
        }
        match self.pools[pool.index()].get_free_object() {
            Some(header) => header,
            None => oom_abort(std::mem::size_of::<Header>()),
        }
    }

    fn new_header(&mut self, pool: PoolId, flags: AllocFlags, body: HeaderBody) -> HeaderRef {
        let header = self.get_free_header(pool);
        let marking = self.phase == GcPhase::Marking;
        let slot = self.header_mut(header);
        slot.init(flags, body);
        // Allocated black while an incremental mark is running.
        if marking {
            slot.set_live();
        }
        self.alloc.increment_allocations();
        header
    }

    // Allocation API

    pub fn new_pmc_header(&mut self, flags: AllocFlags) -> PmcRef {
        self.new_pmc_header_typed(flags, GcInfoTable::DEFAULT_INDEX)
    }

    pub fn new_pmc_header_typed(&mut self, flags: AllocFlags, type_index: GcInfoIndex) -> PmcRef {
        let pool = if flags.contains(AllocFlags::CONSTANT) {
            self.constant_pmc_pool
        } else {
            self.pmc_pool
        };
        let body = PmcBody {
            type_index,
            ..PmcBody::default()
        };
        let pmc = PmcRef(self.new_header(pool, flags, HeaderBody::Pmc(body)));
        if flags.contains(AllocFlags::IMPATIENT) {
            self.counters.num_early_gc_pmcs += 1;
        }
        pmc
    }

    pub fn new_string_header(&mut self, flags: AllocFlags) -> StringRef {
        let pool = if flags.contains(AllocFlags::CONSTANT) {
            self.constant_string_pool
        } else {
            self.string_pool
        };
        StringRef(self.new_header(pool, flags, HeaderBody::String(StringBody::default())))
    }

    /// Allocates a string header and copies `bytes` into fresh storage.
    pub fn new_string(&mut self, bytes: &[u8]) -> StringRef {
        let string = self.new_string_header(AllocFlags::empty());
        self.allocate_string_storage(string, bytes.len());
        self.string_bytes_mut(string).copy_from_slice(bytes);
        string
    }

    /// Constant string for the bytecode loader. Lives in the constant string pool and the
    /// constant memory pool, and is never swept before shutdown.
    pub fn new_constant_string(&mut self, bytes: &[u8]) -> StringRef {
        let string = self.new_string_header(AllocFlags::CONSTANT);
        self.allocate_string_storage(string, bytes.len());
        self.string_bytes_mut(string).copy_from_slice(bytes);
        string
    }

    /// Bufferlike header carrying `size` zeroed bytes of caller fields, see
    /// [Arenas::bufferlike_bytes].
    pub fn new_bufferlike_header(&mut self, size: usize) -> BufferRef {
        let pool = match self.sized_pool(size) {
            Ok(pool) => pool,
            Err(error) => {
                log::error!("{}", error);
                oom_abort(size)
            }
        };
        let inline = if size == 0 {
            None
        } else {
            Some(self.allocate_fixed_size_storage(size))
        };
        BufferRef(self.new_header(
            pool,
            AllocFlags::empty(),
            HeaderBody::Buffer(BufferBody {
                storage: None,
                size,
                inline,
            }),
        ))
    }

    // Deallocation API. The caller guarantees the header is unreferenced.

    fn free_header(&mut self, header: HeaderRef) {
        let kind = self.pools[header.pool.index()].kind();
        let slot = self.pools[header.pool.index()].header_mut(header);
        let mut reclaimer = crate::sweeper::Reclaimer {
            payloads: &mut self.payloads,
            types: &self.types,
            counters: &mut self.counters,
        };
        reclaimer.gc_object(kind, header, slot);
        self.pools[header.pool.index()].add_free_object(header);
    }

    pub fn free_pmc_header(&mut self, pmc: PmcRef) {
        self.free_header(pmc.0);
    }

    pub fn free_string_header(&mut self, string: StringRef) {
        self.free_header(string.0);
    }

    pub fn free_bufferlike_header(&mut self, buffer: BufferRef) {
        self.free_header(buffer.0);
    }

    // PMC extras

    /// Allocates zeroed attribute storage for `pmc`, replacing any previous storage.
    pub fn allocate_pmc_attributes(
        &mut self,
        pmc: PmcRef,
        size: usize,
    ) -> Result<FixedStorage, GcError> {
        let kind = self.pools[pmc.0.pool.index()].kind();
        if kind != ObjectKind::AttributeBearing {
            return Err(GcError::Unsupported {
                operation: "allocate_pmc_attributes",
                kind: kind.name(),
            });
        }
        self.free_pmc_attributes(pmc);
        let storage = match self.payloads.fixed.allocate(size) {
            Ok(storage) => storage,
            Err(GcError::OutOfMemory(size)) => oom_abort(size),
            Err(error) => return Err(error),
        };
        self.pmc_body_mut(pmc).attributes = Some(storage);
        self.counters.extended_pmcs += 1;
        Ok(storage)
    }

    pub fn free_pmc_attributes(&mut self, pmc: PmcRef) {
        if let Some(storage) = self.pmc_body_mut(pmc).attributes.take() {
            self.payloads.fixed.free(storage);
            self.counters.extended_pmcs -= 1;
        }
    }

    pub fn pmc_attributes(&self, pmc: PmcRef) -> Option<&[u8]> {
        let storage = self.pmc_body(pmc).attributes?;
        Some(self.payloads.fixed.bytes(storage))
    }

    pub fn pmc_attributes_mut(&mut self, pmc: PmcRef) -> Option<&mut [u8]> {
        let storage = self.pmc_body(pmc).attributes?;
        Some(self.payloads.fixed.bytes_mut(storage))
    }

    pub fn allocate_fixed_size_storage(&mut self, size: usize) -> FixedStorage {
        match self.payloads.fixed.allocate(size) {
            Ok(storage) => storage,
            Err(_) => oom_abort(size),
        }
    }

    pub fn free_fixed_size_storage(&mut self, storage: FixedStorage) {
        self.payloads.fixed.free(storage);
    }

    pub fn fixed_size_bytes(&self, storage: FixedStorage) -> &[u8] {
        self.payloads.fixed.bytes(storage)
    }

    pub fn fixed_size_bytes_mut(&mut self, storage: FixedStorage) -> &mut [u8] {
        self.payloads.fixed.bytes_mut(storage)
    }

    /// Attaches a synchronization record to a shared PMC.
    pub fn add_pmc_sync(&mut self, pmc: PmcRef) {
        let owner = self.id;
        let header = self.header_mut(pmc.0);
        header.flags.set_shared(true);
        if let Some(body) = header.pmc_mut() {
            if body.sync.is_none() {
                body.sync = Some(Box::new(PmcSync {
                    owner,
                    lock: parking_lot::Mutex::new(()),
                }));
            }
        }
    }

    pub fn free_pmc_sync(&mut self, pmc: PmcRef) {
        self.pmc_body_mut(pmc).sync = None;
    }

    pub fn lock_pmc(&self, pmc: PmcRef) -> Option<MutexGuard<'_, ()>> {
        self.pmc_body(pmc).sync.as_ref().map(|sync| sync.lock.lock())
    }

    /// Flags `pmc` impatient: it wants to be destroyed by the next lazy collection that
    /// finds it unreachable.
    pub fn pmc_needs_early_collection(&mut self, pmc: PmcRef) {
        let header = self.header_mut(pmc.0);
        if !header.flags.needs_early_gc() {
            header.flags.set_needs_early_gc(true);
            self.counters.num_early_gc_pmcs += 1;
        }
    }

    /// Marks `header` live from a custom mark routine running during an incremental mark.
    /// Outside of a mark the flag only lasts until the next mark starts.
    pub fn mark_pobj_alive(&mut self, header: impl Into<HeaderRef>) {
        self.mark_object(header.into());
    }

    // String and buffer storage

    fn release_storage(&mut self, header: HeaderRef) {
        let old = {
            let slot = self.header_mut(header);
            slot.flags.set_cow(false);
            slot.body.storage_mut().and_then(|s| s.take())
        };
        if let Some(old) = old {
            self.payloads.release(old);
        }
    }

    pub(crate) fn allocate_memory(&mut self, pool: MemoryPoolId, size: usize) -> Storage {
        self.alloc.increment_memory_allocations(size);
        if let Ok(storage) = self.payloads.pool_mut(pool).allocate(size) {
            return storage;
        }
        // Compaction unmaps the dead blocks, which may be enough to map a new one.
        self.compact(pool);
        match self.payloads.pool_mut(pool).allocate(size) {
            Ok(storage) => storage,
            Err(_) => oom_abort(size),
        }
    }

    fn set_storage(&mut self, header: HeaderRef, storage: Storage) {
        if let Some(slot) = self.header_mut(header).body.storage_mut() {
            *slot = Some(storage);
        }
    }

    fn resize_storage(
        &mut self,
        header: HeaderRef,
        size: usize,
        default_pool: MemoryPoolId,
    ) -> Storage {
        let storage = match self.header(header).body().storage() {
            None => self.allocate_memory(default_pool, size),
            Some(storage) => {
                let grown = size.saturating_sub(storage.len());
                self.alloc.increment_memory_allocations(grown);
                match self.payloads.pool_mut(storage.pool()).reallocate(storage, size) {
                    Ok(storage) => storage,
                    Err(_) => oom_abort(size),
                }
            }
        };
        self.header_mut(header).flags.set_cow(false);
        self.set_storage(header, storage);
        storage
    }

    fn string_pool_for(&self, string: StringRef) -> MemoryPoolId {
        if self.header(string).flags().constant() {
            MemoryPoolId::Constant
        } else {
            MemoryPoolId::General
        }
    }

    /// Gives `string` fresh storage of `size` bytes, releasing its previous storage.
    pub fn allocate_string_storage(&mut self, string: StringRef, size: usize) {
        let pool = self.string_pool_for(string);
        self.release_storage(string.0);
        let storage = self.allocate_memory(pool, size);
        self.set_storage(string.0, storage);
        self.invalidate_hash(string);
    }

    /// Resizes the storage of `string`, keeping its contents. Constant strings cannot be
    /// resized.
    pub fn reallocate_string_storage(
        &mut self,
        string: StringRef,
        size: usize,
    ) -> Result<(), GcError> {
        if self.header(string).flags().constant() {
            return Err(GcError::Unsupported {
                operation: "reallocate_string_storage",
                kind: "constant string",
            });
        }
        let pool = self.string_pool_for(string);
        self.resize_storage(string.0, size, pool);
        self.invalidate_hash(string);
        Ok(())
    }

    pub fn allocate_buffer_storage_aligned(&mut self, buffer: BufferRef, size: usize) {
        self.release_storage(buffer.0);
        let storage = self.allocate_memory(MemoryPoolId::General, size);
        self.set_storage(buffer.0, storage);
    }

    pub fn reallocate_buffer_storage(&mut self, buffer: BufferRef, size: usize) {
        self.resize_storage(buffer.0, size, MemoryPoolId::General);
    }

    fn bytes_of(&self, header: HeaderRef) -> &[u8] {
        match self.header(header).body().storage() {
            Some(storage) => self.payloads.pool(storage.pool()).bytes(&storage),
            None => &[],
        }
    }

    fn bytes_of_mut(&mut self, header: HeaderRef) -> &mut [u8] {
        let (storage, cow) = {
            let slot = self.header(header);
            (slot.body().storage(), slot.flags().cow())
        };
        let storage = match storage {
            // Writing through a shared span unshares it first.
            Some(storage) if self.payloads.pool(storage.pool()).is_shared(&storage) => {
                self.resize_storage(header, storage.len(), storage.pool())
            }
            Some(storage) => {
                if cow {
                    self.header_mut(header).flags.set_cow(false);
                }
                storage
            }
            None => return &mut [],
        };
        self.payloads.pool_mut(storage.pool()).bytes_mut(&storage)
    }

    pub fn string_bytes(&self, string: StringRef) -> &[u8] {
        self.bytes_of(string.0)
    }

    pub fn string_bytes_mut(&mut self, string: StringRef) -> &mut [u8] {
        self.invalidate_hash(string);
        self.bytes_of_mut(string.0)
    }

    pub fn buffer_bytes(&self, buffer: BufferRef) -> &[u8] {
        self.bytes_of(buffer.0)
    }

    pub fn buffer_bytes_mut(&mut self, buffer: BufferRef) -> &mut [u8] {
        self.bytes_of_mut(buffer.0)
    }

    /// The caller fields of a bufferlike header: exactly the `size` bytes it was created with.
    pub fn bufferlike_bytes(&self, buffer: BufferRef) -> &[u8] {
        match &self.header(buffer).body {
            HeaderBody::Buffer(BufferBody {
                inline: Some(inline),
                size,
                ..
            }) => &self.payloads.fixed.bytes(*inline)[..*size],
            _ => &[],
        }
    }

    pub fn bufferlike_bytes_mut(&mut self, buffer: BufferRef) -> &mut [u8] {
        let (inline, size) = match &self.header(buffer).body {
            HeaderBody::Buffer(BufferBody {
                inline: Some(inline),
                size,
                ..
            }) => (*inline, *size),
            _ => return &mut [],
        };
        &mut self.payloads.fixed.bytes_mut(inline)[..size]
    }

    pub fn string_storage(&self, string: StringRef) -> Option<Storage> {
        self.header(string).body().storage()
    }

    pub fn buffer_storage(&self, buffer: BufferRef) -> Option<Storage> {
        self.header(buffer).body().storage()
    }

    /// Copy-on-write copy of `string`. Both headers point at the same span until one of
    /// them is written to or resized.
    pub fn share_string(&mut self, string: StringRef) -> StringRef {
        let copy = self.new_string_header(AllocFlags::empty());
        let (storage, hashval) = match &self.header(string).body {
            HeaderBody::String(body) => (body.storage, body.hashval),
            _ => panic!("{:?} is not a string", string.0),
        };
        if let Some(storage) = storage {
            self.payloads.pool_mut(storage.pool()).share(&storage);
            self.header_mut(string.0).flags.set_cow(true);
            let slot = self.header_mut(copy.0);
            slot.flags.set_cow(true);
            slot.body = HeaderBody::String(StringBody {
                storage: Some(storage),
                hashval,
            });
        }
        copy
    }

    pub fn string_hash(&mut self, string: StringRef) -> u64 {
        if let HeaderBody::String(body) = &self.header(string).body {
            if let Some(hash) = body.hashval {
                return hash;
            }
        }
        let mut hasher = DefaultHasher::new();
        hasher.write(self.string_bytes(string));
        let hash = hasher.finish();
        if let HeaderBody::String(body) = &mut self.header_mut(string.0).body {
            body.hashval = Some(hash);
        }
        hash
    }

    fn invalidate_hash(&mut self, string: StringRef) {
        if let HeaderBody::String(body) = &mut self.header_mut(string.0).body {
            body.hashval = None;
        }
    }

    /// Was `storage` handed out by one of the memory pools of these arenas?
    pub fn ptr_in_memory_pool(&self, storage: &Storage) -> bool {
        self.payloads.pool(storage.pool()).contains(storage)
    }

    /// Does `header` address an allocated PMC?
    pub fn ptr_is_pmc(&self, header: HeaderRef) -> bool {
        self.is_allocated(header) && self.pools[header.pool.index()].kind().is_pmc()
    }

    /// Typed handle for `header` if it addresses an allocated PMC.
    pub fn as_pmc(&self, header: HeaderRef) -> Option<PmcRef> {
        if self.ptr_is_pmc(header) {
            Some(PmcRef(header))
        } else {
            None
        }
    }

    /// Position of `pmc` in its pool, counting the slots of all arenas before it.
    pub fn get_pmc_index(&self, pmc: PmcRef) -> usize {
        self.pools[pmc.0.pool.index()].slot_index(pmc.0)
    }

    // Collection control

    /// Requests a collection. `flags` select the kind of run:
    /// - no flag: full mark and sweep from anchored roots only.
    /// - [GcFlags::TRACE_STACK]: also traces the shadow stack and marking constraints.
    /// - [GcFlags::LAZY]: only impatient PMCs may be destroyed; marking stops as soon as all
    ///   of them were found.
    /// - [GcFlags::FINISH]: destroys every header, including constants.
    ///
    /// While marking is blocked the request is queued. A request arriving during an
    /// incremental mark completes that mark instead.
    pub fn mark_and_sweep(&mut self, flags: GcFlags) {
        if self.finished {
            return;
        }
        if flags.contains(GcFlags::FINISH) {
            self.finish_sweep();
            return;
        }
        match self.phase {
            GcPhase::Idle => {}
            GcPhase::Marking => {
                self.finish_incremental_collection();
                return;
            }
            GcPhase::Sweeping => return,
        }
        if self.blocking.is_mark_blocked() {
            self.blocking.defer(flags);
            return;
        }
        let lazy = flags.contains(GcFlags::LAZY);
        if lazy && self.counters.num_early_gc_pmcs == 0 {
            return;
        }
        let mode = if flags.contains(GcFlags::TRACE_STACK) {
            TraceMode::Full
        } else {
            TraceMode::RootOnly
        };

        let start = Instant::now();
        let before = self.heap_usage();
        self.counters.mark_runs += 1;
        if lazy {
            self.counters.lazy_mark_runs += 1;
        }
        let complete = self.mark(mode, lazy);
        let freed = self.complete_collection(flags, lazy, complete);
        logln_if!(
            self.config.verbose,
            "[gc] GC({}) Pause {} {}->{}({}) freed {} {:.4}ms",
            self.counters.mark_runs,
            if lazy { "LazyMarkSweep" } else { "MarkSweep" },
            formatted_size(before),
            formatted_size(self.heap_usage()),
            formatted_size(self.statistics().total_memory_allocated()),
            freed,
            start.elapsed().as_micros() as f64 / 1000.0
        );
    }

    /// Sweeps after a finished mark. Returns the number of destroyed headers.
    pub(crate) fn complete_collection(&mut self, flags: GcFlags, lazy: bool, complete: bool) -> usize {
        if self.blocking.is_sweep_blocked() {
            self.clear_live_flags();
            self.mark_stack.clear();
            self.blocking.defer(flags);
            self.phase = GcPhase::Idle;
            return 0;
        }
        self.phase = GcPhase::Sweeping;
        let freed = match (lazy, complete) {
            (false, _) => self.sweep(SweepMode::Full),
            (true, true) => self.sweep(SweepMode::ImpatientOnly),
            (true, false) => {
                self.clear_live_flags();
                0
            }
        };
        self.mark_stack.clear();
        self.phase = GcPhase::Idle;
        freed
    }

    fn finish_sweep(&mut self) {
        self.phase = GcPhase::Sweeping;
        self.mark_stack.clear();
        let freed = self.sweep(SweepMode::Finish);
        self.phase = GcPhase::Idle;
        log::debug!("arenas #{}: finish sweep destroyed {} headers", self.id, freed);
    }

    /// Compacts the general memory pool. Returns `false` if sweeping is blocked.
    pub fn compact_memory_pool(&mut self) -> bool {
        self.compact(MemoryPoolId::General)
    }

    /// Clears the state a collection that did not complete may have left behind: live
    /// flags and the mark stack.
    pub fn cleanup_next_for_gc(&mut self) {
        self.clear_live_flags();
        self.mark_stack.clear();
        self.counters.impatient_seen = 0;
        self.phase = GcPhase::Idle;
    }

    pub(crate) fn clear_live_flags(&mut self) {
        for pool in self.pools.iter_mut() {
            pool.for_each_live_mut(|_, header| header.clear_live());
        }
    }

    /// Runs the FINISH sweep and retires the arenas. Later collection requests are ignored.
    pub fn finalize(&mut self) {
        if self.finished {
            return;
        }
        self.blocking = BlockState::new();
        if self.phase != GcPhase::Idle {
            self.cleanup_next_for_gc();
        }
        self.mark_and_sweep(GcFlags::FINISH);
        self.finished = true;
    }

    // Blocking

    pub fn block_mark(&mut self) {
        self.blocking.block_mark();
    }

    pub fn unblock_mark(&mut self) {
        self.blocking.unblock_mark();
        self.run_pending();
    }

    pub fn block_sweep(&mut self) {
        self.blocking.block_sweep();
    }

    pub fn unblock_sweep(&mut self) {
        self.blocking.unblock_sweep();
        self.run_pending();
    }

    pub fn is_blocked_mark(&self) -> bool {
        self.blocking.is_mark_blocked()
    }

    pub fn is_blocked_sweep(&self) -> bool {
        self.blocking.is_sweep_blocked()
    }

    pub fn mark_block_level(&self) -> usize {
        self.blocking.mark_level()
    }

    pub fn sweep_block_level(&self) -> usize {
        self.blocking.sweep_level()
    }

    /// A collection request is waiting for the blocks to be lifted.
    pub fn has_pending_collection(&self) -> bool {
        self.blocking.pending().is_some()
    }

    /// Zeroes both block levels and drops queued requests. Only meant for fatal error
    /// unwinding.
    pub fn completely_unblock(&mut self) {
        self.blocking.clear();
    }

    /// Runs `f` with marking and sweeping blocked. A collection requested meanwhile runs
    /// afterwards.
    pub fn with_gc_blocked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.block_mark();
        self.block_sweep();
        let result = f(self);
        self.blocking.unblock_sweep();
        self.unblock_mark();
        result
    }

    fn run_pending(&mut self) {
        if self.phase != GcPhase::Idle {
            return;
        }
        if let Some(flags) = self.blocking.take_runnable() {
            log::debug!("running deferred collection {:?}", flags);
            self.mark_and_sweep(flags);
        }
    }

    // Roots

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn roots_mut(&mut self) -> &mut RootSet {
        &mut self.roots
    }

    pub fn set_register(&mut self, index: usize, value: Option<HeaderRef>) {
        self.roots.set_register(index, value);
    }

    pub fn anchor(&mut self, header: impl Into<HeaderRef>) {
        self.roots.anchor(header.into());
    }

    pub fn unanchor(&mut self, header: impl Into<HeaderRef>) -> bool {
        self.roots.unanchor(header.into())
    }

    pub fn push_stack_root(&mut self, header: impl Into<HeaderRef>) -> usize {
        self.roots.push_stack_root(header.into())
    }

    pub fn pop_stack_roots(&mut self, depth: usize) {
        self.roots.pop_stack_roots(depth);
    }

    pub fn register_constant_table(&mut self, table: ConstantTable) -> ConstantTableId {
        self.roots.register_constant_table(table)
    }

    pub fn unregister_constant_table(&mut self, id: ConstantTableId) -> Option<ConstantTable> {
        self.roots.unregister_constant_table(id)
    }

    pub fn add_constraint<T: MarkingConstraint + 'static>(&mut self, constraint: T) {
        self.constraints.push(Box::new(constraint));
    }

    // Introspection

    fn heap_usage(&self) -> usize {
        let headers: usize = self
            .pools
            .iter()
            .map(|pool| pool.active_objects() * std::mem::size_of::<Header>())
            .sum();
        let memory = |pool: &MemoryPool| pool.total_allocated() - pool.guaranteed_reclaimable();
        headers
            + memory(&self.payloads.memory_pool)
            + memory(&self.payloads.constant_memory_pool)
            + self.payloads.fixed.allocated_bytes()
    }

    pub fn statistics(&self) -> HeapStatistics {
        let mut stats = HeapStatistics {
            memory_pool_size: self.payloads.memory_pool.total_allocated(),
            constant_memory_pool_size: self.payloads.constant_memory_pool.total_allocated(),
            fixed_size_memory: self.payloads.fixed.reserved_bytes(),
            mark_runs: self.counters.mark_runs,
            lazy_mark_runs: self.counters.lazy_mark_runs,
            collect_runs: self.counters.collect_runs,
            header_allocs_since_collect: self.alloc.header_allocations,
            mem_allocs_since_collect: self.alloc.memory_allocations,
            total_copied: self.payloads.memory_pool.total_copied()
                + self.payloads.constant_memory_pool.total_copied(),
            impatient_pmcs: self.counters.num_early_gc_pmcs,
            extended_pmcs: self.counters.extended_pmcs,
            header_threshold: self.alloc.header_threshold,
            ..HeapStatistics::default()
        };
        for pool in self.pools.iter() {
            stats.header_memory += pool.reserved_bytes();
            if pool.kind().is_pmc() {
                stats.active_pmcs += pool.active_objects();
                stats.total_pmcs += pool.total_objects();
            } else {
                stats.active_buffers += pool.active_objects();
                stats.total_buffers += pool.total_objects();
            }
        }
        stats
    }

    pub fn info(&self, kind: InfoKind) -> usize {
        self.statistics().get(kind)
    }

    /// Calls `f` for every pool in the categories selected by `which` until `f` returns
    /// `false`. Returns `false` if the iteration was stopped early.
    pub fn header_pools_iterate(
        &self,
        which: PoolIter,
        mut f: impl FnMut(&SmallObjectPool) -> bool,
    ) -> bool {
        for pool in self.pools.iter() {
            let selected = if pool.is_constant() {
                which.contains(PoolIter::CONST)
            } else if pool.kind().is_pmc() {
                which.contains(PoolIter::PMC)
            } else {
                which.contains(PoolIter::BUFFER)
            };
            if selected && !f(pool) {
                return false;
            }
        }
        true
    }
}

impl Drop for Arenas {
    fn drop(&mut self) {
        self.finalize();
    }
}
