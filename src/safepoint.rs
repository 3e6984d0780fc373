//! Blocking protocol.
//!
//! Code that holds unanchored handles across a call that may allocate brackets the call with
//! `block_*`/`unblock_*` pairs. The counters nest. A collection requested while marking is
//! blocked is queued, not dropped; a collection requested while only sweeping is blocked still
//! marks, but finalization is queued. The queued request runs when the last block is lifted.
use crate::header::GcFlags;

#[derive(Default, Debug)]
pub struct BlockState {
    mark_level: usize,
    sweep_level: usize,
    pending: Option<GcFlags>,
}

impl BlockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_mark(&mut self) {
        self.mark_level += 1;
    }

    pub fn block_sweep(&mut self) {
        self.sweep_level += 1;
    }

    pub fn unblock_mark(&mut self) {
        debug_assert!(self.mark_level > 0, "unbalanced unblock_mark");
        self.mark_level = self.mark_level.saturating_sub(1);
    }

    pub fn unblock_sweep(&mut self) {
        debug_assert!(self.sweep_level > 0, "unbalanced unblock_sweep");
        self.sweep_level = self.sweep_level.saturating_sub(1);
    }

    pub fn mark_level(&self) -> usize {
        self.mark_level
    }

    pub fn sweep_level(&self) -> usize {
        self.sweep_level
    }

    pub fn is_mark_blocked(&self) -> bool {
        self.mark_level > 0
    }

    pub fn is_sweep_blocked(&self) -> bool {
        self.sweep_level > 0
    }

    pub fn pending(&self) -> Option<GcFlags> {
        self.pending
    }

    /// Queues a collection request, merging it with an already queued one. The merged
    /// request is lazy only when both requests are lazy.
    pub fn defer(&mut self, flags: GcFlags) {
        self.pending = Some(match self.pending {
            None => flags,
            Some(queued) => {
                let mut merged = queued | flags;
                if !(queued.contains(GcFlags::LAZY) && flags.contains(GcFlags::LAZY)) {
                    merged.remove(GcFlags::LAZY);
                }
                merged
            }
        });
        log::debug!(
            "collection deferred (mark level {}, sweep level {}): {:?}",
            self.mark_level,
            self.sweep_level,
            self.pending
        );
    }

    /// Hands out the queued request once nothing is blocked anymore.
    pub fn take_runnable(&mut self) -> Option<GcFlags> {
        if self.mark_level == 0 && self.sweep_level == 0 {
            self.pending.take()
        } else {
            None
        }
    }

    /// Drops every block and every queued request.
    pub fn clear(&mut self) {
        if self.mark_level > 0 || self.sweep_level > 0 {
            log::warn!(
                "forcibly unblocking GC (mark level {}, sweep level {})",
                self.mark_level,
                self.sweep_level
            );
        }
        self.mark_level = 0;
        self.sweep_level = 0;
        self.pending = None;
    }
}
