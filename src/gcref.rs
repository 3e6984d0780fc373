use std::fmt;

/// Index of a [SmallObjectPool](crate::pool::SmallObjectPool) inside its [Arenas](crate::arenas::Arenas).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PoolId(pub(crate) u16);

impl PoolId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Untyped handle to a header slot.
///
/// A handle is the `(pool, arena, slot)` address of the slot that owns the header. Handles
/// stay valid for as long as the header is allocated; once the header is freed the slot may
/// be reused and the handle silently refers to the new occupant, exactly like a dangling
/// pointer would. The collector only guarantees that reachable headers are never freed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderRef {
    pub(crate) pool: PoolId,
    pub(crate) arena: u32,
    pub(crate) slot: u32,
}

impl HeaderRef {
    #[inline(always)]
    pub(crate) const fn new(pool: PoolId, arena: u32, slot: u32) -> Self {
        Self { pool, arena, slot }
    }
    #[inline(always)]
    pub fn pool(self) -> PoolId {
        self.pool
    }
    #[inline(always)]
    pub fn arena(self) -> u32 {
        self.arena
    }
    #[inline(always)]
    pub fn slot(self) -> u32 {
        self.slot
    }
}

impl fmt::Debug for HeaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}:{}", self.pool.0, self.arena, self.slot)
    }
}

macro_rules! typed_ref {
    ($(#[$meta: meta])* $name: ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        #[repr(transparent)]
        pub struct $name(pub(crate) HeaderRef);

        impl $name {
            #[inline(always)]
            pub fn header(self) -> HeaderRef {
                self.0
            }
        }

        impl From<$name> for HeaderRef {
            #[inline(always)]
            fn from(value: $name) -> HeaderRef {
                value.0
            }
        }
    };
}

typed_ref!(
    /// Handle to a PMC header.
    PmcRef
);
typed_ref!(
    /// Handle to a string header.
    StringRef
);
typed_ref!(
    /// Handle to a bufferlike header.
    BufferRef
);
