use crate::{
    arena::{SmallObjectArena, SweepResult},
    error::GcError,
    gcref::{HeaderRef, PoolId},
    header::{Header, ObjectKind},
    Config,
};

bitflags::bitflags! {
    /// Pool categories visited by [Arenas::header_pools_iterate](crate::arenas::Arenas::header_pools_iterate).
    pub struct PoolIter: u32 {
        const PMC = 1 << 0;
        const BUFFER = 1 << 1;
        const CONST = 1 << 2;
    }
}

/// Allocator for one header size class.
///
/// Free slots form an intrusive singly linked list threaded through the slots themselves.
/// The list is LIFO so a freed header is the next one handed out.
pub struct SmallObjectPool {
    id: PoolId,
    name: &'static str,
    kind: ObjectKind,
    object_size: usize,
    constant: bool,
    arenas: Vec<Option<SmallObjectArena>>,
    free_arena_ids: Vec<u32>,
    free_list: Option<HeaderRef>,
    total_objects: usize,
    num_free_objects: usize,
    objects_per_alloc: usize,
    max_objects_per_alloc: usize,
    growth_factor: f64,
    /// Set by a sweep that left the pool short of free headers: the next exhaustion grows
    /// the pool without collecting first.
    pub(crate) skip: bool,
}

impl SmallObjectPool {
    pub fn new(
        id: PoolId,
        name: &'static str,
        kind: ObjectKind,
        object_size: usize,
        constant: bool,
        config: &Config,
    ) -> Self {
        let slot_bytes = std::mem::size_of::<Header>().max(object_size);
        Self {
            id,
            name,
            kind,
            object_size,
            constant,
            arenas: Vec::new(),
            free_arena_ids: Vec::new(),
            free_list: None,
            total_objects: 0,
            num_free_objects: 0,
            objects_per_alloc: config.initial_arena_objects,
            max_objects_per_alloc: (config.max_arena_bytes / slot_bytes)
                .max(config.initial_arena_objects),
            growth_factor: config.arena_growth_factor,
            skip: false,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
    pub fn object_size(&self) -> usize {
        self.object_size
    }
    pub fn is_constant(&self) -> bool {
        self.constant
    }
    pub fn total_objects(&self) -> usize {
        self.total_objects
    }
    pub fn num_free_objects(&self) -> usize {
        self.num_free_objects
    }
    pub fn active_objects(&self) -> usize {
        self.total_objects - self.num_free_objects
    }
    pub fn arena_count(&self) -> usize {
        self.arenas.iter().filter(|a| a.is_some()).count()
    }
    pub fn objects_per_alloc(&self) -> usize {
        self.objects_per_alloc
    }

    /// Pops the head of the free list. The returned slot still has to be initialized.
    pub fn get_free_object(&mut self) -> Option<HeaderRef> {
        let head = self.free_list?;
        let header = self.header_mut(head);
        debug_assert!(header.is_free(), "free list entry {:?} is in use", head);
        let next = header.next_free.take();
        header.flags.set_on_free_list(false);
        self.free_list = next;
        self.num_free_objects -= 1;
        Some(head)
    }

    /// Pushes a slot back on the free list. The header must already be finalized.
    pub fn add_free_object(&mut self, header: HeaderRef) {
        debug_assert_eq!(header.pool, self.id);
        let next = self.free_list;
        let slot = self.header_mut(header);
        debug_assert!(!slot.is_free(), "double free of {:?}", header);
        *slot = Header::free(next);
        self.free_list = Some(header);
        self.num_free_objects += 1;
    }

    /// Adds one arena of `objects_per_alloc` slots and links all of them into the free
    /// list. Consecutive arenas grow geometrically up to the configured maximum.
    pub fn alloc_objects(&mut self) -> Result<(), GcError> {
        let capacity = self.objects_per_alloc;
        let arena = SmallObjectArena::new(capacity)?;
        let index = self.install_arena(arena);
        self.link_arena(index);
        self.total_objects += capacity;
        self.objects_per_alloc = ((capacity as f64 * self.growth_factor).ceil() as usize)
            .min(self.max_objects_per_alloc)
            .max(1);
        log::debug!(
            "{} pool: added arena #{} with {} slots (total {})",
            self.name,
            index,
            capacity,
            self.total_objects
        );
        Ok(())
    }

    fn install_arena(&mut self, arena: SmallObjectArena) -> u32 {
        match self.free_arena_ids.pop() {
            Some(index) => {
                self.arenas[index as usize] = Some(arena);
                index
            }
            None => {
                self.arenas.push(Some(arena));
                (self.arenas.len() - 1) as u32
            }
        }
    }

    /// Threads every free slot of arena `index` onto the free list, lowest slot first.
    fn link_arena(&mut self, index: u32) {
        let id = self.id;
        let mut head = self.free_list;
        let mut linked = 0;
        let arena = self.arena_mut(index);
        for (slot, header) in arena.slots_mut().iter_mut().enumerate().rev() {
            if header.is_free() {
                header.next_free = head;
                head = Some(HeaderRef::new(id, index, slot as u32));
                linked += 1;
            }
        }
        self.free_list = head;
        self.num_free_objects += linked;
    }

    fn arena(&self, index: u32) -> &SmallObjectArena {
        match self.arenas.get(index as usize).and_then(|a| a.as_ref()) {
            Some(arena) => arena,
            None => panic!("{} pool has no arena #{}", self.name, index),
        }
    }

    fn arena_mut(&mut self, index: u32) -> &mut SmallObjectArena {
        let name = self.name;
        match self.arenas.get_mut(index as usize).and_then(|a| a.as_mut()) {
            Some(arena) => arena,
            None => panic!("{} pool has no arena #{}", name, index),
        }
    }

    pub fn header(&self, header: HeaderRef) -> &Header {
        debug_assert_eq!(header.pool, self.id);
        self.arena(header.arena).slot(header.slot)
    }

    pub fn header_mut(&mut self, header: HeaderRef) -> &mut Header {
        debug_assert_eq!(header.pool, self.id);
        self.arena_mut(header.arena).slot_mut(header.slot)
    }

    /// Does `header` address an existing slot of this pool?
    pub fn owns(&self, header: HeaderRef) -> bool {
        header.pool == self.id
            && self
                .arenas
                .get(header.arena as usize)
                .and_then(|a| a.as_ref())
                .map(|a| (header.slot as usize) < a.capacity())
                .unwrap_or(false)
    }

    /// Linear index of `header` across all arenas of the pool.
    pub fn slot_index(&self, header: HeaderRef) -> usize {
        let before: usize = self.arenas[..header.arena as usize]
            .iter()
            .flatten()
            .map(|arena| arena.capacity())
            .sum();
        before + header.slot as usize
    }

    /// Calls `f` for every allocated header.
    pub fn for_each_live(&self, mut f: impl FnMut(HeaderRef, &Header)) {
        for (index, arena) in self.arenas.iter().enumerate() {
            if let Some(arena) = arena {
                for (slot, header) in arena.slots().iter().enumerate() {
                    if !header.is_free() {
                        f(HeaderRef::new(self.id, index as u32, slot as u32), header);
                    }
                }
            }
        }
    }

    pub fn for_each_live_mut(&mut self, mut f: impl FnMut(HeaderRef, &mut Header)) {
        let id = self.id;
        for (index, arena) in self.arenas.iter_mut().enumerate() {
            if let Some(arena) = arena {
                for (slot, header) in arena.slots_mut().iter_mut().enumerate() {
                    if !header.is_free() {
                        f(HeaderRef::new(id, index as u32, slot as u32), header);
                    }
                }
            }
        }
    }

    /// Addresses of every allocated header. Used by the sweeper, which needs to mutate
    /// other collector state while visiting a slot.
    pub(crate) fn live_refs(&self) -> Vec<HeaderRef> {
        let mut refs = Vec::with_capacity(self.active_objects());
        self.for_each_live(|r, _| refs.push(r));
        refs
    }

    /// Rebuilds the free list from the slot flags after a sweep. Optionally hands empty
    /// arenas back, always keeping at least one arena.
    pub(crate) fn rebuild_free_list(&mut self, release_empty: bool) -> usize {
        self.free_list = None;
        self.num_free_objects = 0;
        let mut released = 0;
        let mut remaining = self.arena_count();
        for index in (0..self.arenas.len() as u32).rev() {
            let state = match &self.arenas[index as usize] {
                Some(arena) => arena.state(),
                None => continue,
            };
            if release_empty && state == SweepResult::Empty && remaining > 1 {
                if let Some(arena) = self.arenas[index as usize].take() {
                    self.total_objects -= arena.capacity();
                    self.free_arena_ids.push(index);
                    remaining -= 1;
                    released += 1;
                }
                continue;
            }
            if state != SweepResult::Full {
                self.link_arena(index);
            }
        }
        if released > 0 {
            log::debug!("{} pool: released {} empty arenas", self.name, released);
        }
        released
    }

    /// Takes every arena out of the pool, leaving it empty.
    pub(crate) fn drain_arenas(&mut self) -> Vec<(u32, SmallObjectArena)> {
        self.free_list = None;
        self.total_objects = 0;
        self.num_free_objects = 0;
        self.free_arena_ids.clear();
        self.arenas
            .drain(..)
            .enumerate()
            .filter_map(|(index, arena)| arena.map(|arena| (index as u32, arena)))
            .collect()
    }

    /// Installs an arena taken from another pool of the same size class. Returns its new
    /// index. Slots keep their contents; the free list is rebuilt by the caller.
    pub(crate) fn adopt_arena(&mut self, arena: SmallObjectArena) -> u32 {
        self.total_objects += arena.capacity();
        self.install_arena(arena)
    }

    /// Relinks the free slots of an adopted arena.
    pub(crate) fn relink(&mut self, index: u32) {
        self.link_arena(index)
    }

    pub(crate) fn arena_at_mut(&mut self, index: u32) -> &mut SmallObjectArena {
        self.arena_mut(index)
    }

    /// Bytes reserved for header slots of this pool.
    pub fn reserved_bytes(&self) -> usize {
        self.total_objects * std::mem::size_of::<Header>()
    }
}
