use crate::{
    fixed_size::FixedStorage, gc_info_table::GcInfoIndex, gcref::HeaderRef,
    memory_pool::Storage,
};
use modular_bitfield::prelude::*;
use parking_lot::Mutex;

// Every header carries one 16-bit flags word.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | live            |    1 | Set by mark, cleared by sweep.           |
// | on free list    |    1 | Slot is owned by the pool free list.     |
// | constant        |    1 | Lives in a constant pool.                |
// | needs early gc  |    1 | Impatient: wants timely destruction.     |
// | generation      |    2 | Saturating count of survived sweeps.     |
// | custom destroy  |    1 | Finalizer of the PMC type must run.      |
// | cow             |    1 | Payload span may be shared copy-on-write.|
// | shared          |    1 | PMC is shared between interpreters.      |
// | unused          |    7 |                                          |
// +-----------------+------+------------------------------------------+
#[bitfield(bits = 16)]
#[derive(Clone, Copy, Debug)]
pub struct HeaderFlags {
    pub live: bool,
    pub on_free_list: bool,
    pub constant: bool,
    pub needs_early_gc: bool,
    pub generation: B2,
    pub custom_destroy: bool,
    pub cow: bool,
    pub shared: bool,
    #[skip]
    __: B7,
}

pub const MAX_GENERATION: u8 = 3;

bitflags::bitflags! {
    /// Flags accepted by the header allocation functions.
    pub struct AllocFlags: u32 {
        /// Allocate from the constant pool. Constant headers are never swept before shutdown.
        const CONSTANT = 1 << 0;
        /// Request timely destruction, see [Arenas::pmc_needs_early_collection](crate::arenas::Arenas::pmc_needs_early_collection).
        const IMPATIENT = 1 << 1;
        /// Run the type finalizer when the header dies.
        const CUSTOM_DESTROY = 1 << 2;
        /// Header is shared with other interpreters.
        const SHARED = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Flags accepted by [Arenas::mark_and_sweep](crate::arenas::Arenas::mark_and_sweep).
    pub struct GcFlags: u32 {
        /// Trace system areas (the shadow stack and marking constraints) in addition to anchors.
        const TRACE_STACK = 1 << 0;
        /// Timely destruction run: only impatient headers may be destroyed.
        const LAZY = 1 << 1;
        /// Interpreter exit: nothing is live, every header is destroyed.
        const FINISH = 1 << 2;
    }
}

impl GcFlags {
    /// Alias for the default full collection request.
    pub const NORMAL: GcFlags = GcFlags::TRACE_STACK;
}

/// The four object kinds a pool can serve. Each pool dispatches its allocation and
/// destruction on this tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectKind {
    /// PMCs without out of line attribute storage.
    Plain,
    /// PMCs that may own fixed-size attribute storage.
    AttributeBearing,
    /// Bufferlike headers with a memory pool payload.
    Bufferlike,
    /// String headers with a memory pool payload.
    StringLike,
}

impl ObjectKind {
    pub fn is_pmc(self) -> bool {
        matches!(self, ObjectKind::Plain | ObjectKind::AttributeBearing)
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Plain => "plain PMC",
            ObjectKind::AttributeBearing => "PMC",
            ObjectKind::Bufferlike => "bufferlike",
            ObjectKind::StringLike => "string",
        }
    }
}

/// Synchronization record attached to shared PMCs.
pub struct PmcSync {
    /// Id of the [Arenas](crate::arenas::Arenas) that owns the PMC.
    pub owner: usize,
    pub lock: Mutex<()>,
}

#[derive(Default)]
pub struct PmcBody {
    pub type_index: GcInfoIndex,
    pub attributes: Option<FixedStorage>,
    pub metadata: Option<HeaderRef>,
    pub elements: Vec<Option<HeaderRef>>,
    pub keyed: Vec<(HeaderRef, Option<HeaderRef>)>,
    pub sync: Option<Box<PmcSync>>,
}

impl PmcBody {
    /// Call `f` for every header this PMC references.
    pub fn for_each_reference(&self, mut f: impl FnMut(HeaderRef)) {
        if let Some(meta) = self.metadata {
            f(meta);
        }
        self.elements.iter().flatten().for_each(|r| f(*r));
        for (key, value) in self.keyed.iter() {
            f(*key);
            if let Some(value) = value {
                f(*value);
            }
        }
    }

    pub(crate) fn for_each_reference_mut(&mut self, mut f: impl FnMut(&mut HeaderRef)) {
        if let Some(meta) = self.metadata.as_mut() {
            f(meta);
        }
        self.elements.iter_mut().flatten().for_each(|r| f(r));
        for (key, value) in self.keyed.iter_mut() {
            f(key);
            if let Some(value) = value.as_mut() {
                f(value);
            }
        }
    }
}

#[derive(Default)]
pub struct StringBody {
    pub storage: Option<Storage>,
    pub hashval: Option<u64>,
}

pub struct BufferBody {
    pub storage: Option<Storage>,
    /// Requested header size; selects the sized pool.
    pub size: usize,
    /// The `size` bytes of caller fields carried by the header. `None` for zero sized
    /// headers.
    pub inline: Option<FixedStorage>,
}

pub enum HeaderBody {
    Free,
    Pmc(PmcBody),
    String(StringBody),
    Buffer(BufferBody),
}

impl HeaderBody {
    pub fn storage(&self) -> Option<Storage> {
        match self {
            HeaderBody::String(s) => s.storage,
            HeaderBody::Buffer(b) => b.storage,
            _ => None,
        }
    }

    pub(crate) fn storage_mut(&mut self) -> Option<&mut Option<Storage>> {
        match self {
            HeaderBody::String(s) => Some(&mut s.storage),
            HeaderBody::Buffer(b) => Some(&mut b.storage),
            _ => None,
        }
    }
}

/// A header slot. Free slots keep the link to the next free slot, like a free-list entry
/// written over a dead object.
pub struct Header {
    pub(crate) flags: HeaderFlags,
    pub(crate) next_free: Option<HeaderRef>,
    pub(crate) body: HeaderBody,
}

impl Header {
    pub(crate) fn free(next: Option<HeaderRef>) -> Self {
        Self {
            flags: HeaderFlags::new().with_on_free_list(true),
            next_free: next,
            body: HeaderBody::Free,
        }
    }
    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        self.flags
    }
    #[inline(always)]
    pub fn body(&self) -> &HeaderBody {
        &self.body
    }
    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.flags.on_free_list()
    }
    #[inline(always)]
    pub fn is_live(&self) -> bool {
        self.flags.live()
    }
    /// Sets the live flag. Returns `false` if it was already set.
    #[inline(always)]
    pub fn set_live(&mut self) -> bool {
        if self.flags.live() {
            return false;
        }
        self.flags.set_live(true);
        true
    }
    #[inline(always)]
    pub fn clear_live(&mut self) {
        self.flags.set_live(false);
    }
    pub(crate) fn age(&mut self) {
        let generation = self.flags.generation();
        if generation < MAX_GENERATION {
            self.flags.set_generation(generation + 1);
        }
    }

    pub(crate) fn init(&mut self, flags: AllocFlags, body: HeaderBody) {
        self.flags = HeaderFlags::new()
            .with_constant(flags.contains(AllocFlags::CONSTANT))
            .with_needs_early_gc(flags.contains(AllocFlags::IMPATIENT))
            .with_custom_destroy(flags.contains(AllocFlags::CUSTOM_DESTROY))
            .with_shared(flags.contains(AllocFlags::SHARED));
        self.next_free = None;
        self.body = body;
    }

    pub(crate) fn pmc(&self) -> Option<&PmcBody> {
        match &self.body {
            HeaderBody::Pmc(body) => Some(body),
            _ => None,
        }
    }

    pub(crate) fn pmc_mut(&mut self) -> Option<&mut PmcBody> {
        match &mut self.body {
            HeaderBody::Pmc(body) => Some(body),
            _ => None,
        }
    }

    /// Call `f` for every header directly referenced by this one.
    pub fn for_each_reference(&self, f: impl FnMut(HeaderRef)) {
        if let HeaderBody::Pmc(body) = &self.body {
            body.for_each_reference(f);
        }
    }
}
