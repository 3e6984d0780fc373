use crate::{
    arenas::{Arenas, GcPhase},
    error::GcError,
    gcref::HeaderRef,
    header::HeaderBody,
    pool::SmallObjectPool,
    roots::{MarkingConstraintRuns, TraceMode},
    visitor::Visitor,
};

/// Sets the live flag of every header it is handed and queues PMCs for tracing. A header
/// that is already live is not queued again, which is what terminates cycles.
pub(crate) struct MarkingVisitor<'a> {
    pools: &'a mut [SmallObjectPool],
    mark_stack: &'a mut Vec<HeaderRef>,
    impatient_seen: &'a mut usize,
}

impl Visitor for MarkingVisitor<'_> {
    fn mark_header(&mut self, header: HeaderRef) {
        let slot = self.pools[header.pool.index()].header_mut(header);
        debug_assert!(!slot.is_free(), "marking freed header {:?}", header);
        if slot.is_free() || !slot.set_live() {
            return;
        }
        if slot.flags().needs_early_gc() {
            *self.impatient_seen += 1;
        }
        if let HeaderBody::Pmc(_) = slot.body() {
            self.mark_stack.push(header);
        }
    }
}

macro_rules! marking_visitor {
    ($arenas: expr) => {
        MarkingVisitor {
            pools: &mut $arenas.pools,
            mark_stack: &mut $arenas.mark_stack,
            impatient_seen: &mut $arenas.counters.impatient_seen,
        }
    };
}

impl Arenas {
    pub(crate) fn mark_object(&mut self, header: HeaderRef) {
        marking_visitor!(self).mark_header(header);
    }

    /// Headers `header` keeps alive, as reported by the trace routine of its type.
    pub(crate) fn references_of(&self, header: HeaderRef, out: &mut Vec<HeaderRef>) {
        if let Some(body) = self.header(header).pmc() {
            let info = self.types.get(body.type_index);
            info.trace(body, &mut |child: HeaderRef| out.push(child));
        }
    }

    fn run_constraints(&mut self, when: MarkingConstraintRuns) {
        let mut visitor = marking_visitor!(self);
        self.constraints.retain_mut(|constraint| {
            if constraint.is_over() {
                false
            } else {
                if constraint.runs_at() == when {
                    constraint.run(&mut visitor);
                }
                true
            }
        });
    }

    /// Marks the roots selected by `mode`. Constant PMCs are always live, so their
    /// references are roots whenever anchors are traced.
    pub(crate) fn mark_roots(&mut self, mode: TraceMode) {
        let constants = if mode.traces_anchors() {
            self.pools[self.constant_pmc_pool.index()].live_refs()
        } else {
            Vec::new()
        };
        let mut visitor = marking_visitor!(self);
        self.roots.trace(mode, &mut visitor);
        for constant in constants {
            visitor.mark_header(constant);
        }
    }

    /// Traces queued PMCs until the mark stack is empty, `budget` PMCs were traced, or, for
    /// a lazy mark, every impatient PMC was found. Returns `true` when the stack was emptied.
    pub(crate) fn process_mark_stack(&mut self, budget: Option<usize>, lazy: bool) -> bool {
        let mut children = Vec::new();
        let mut traced = 0;
        loop {
            if lazy && self.counters.impatient_seen >= self.counters.num_early_gc_pmcs {
                return false;
            }
            if let Some(budget) = budget {
                if traced >= budget {
                    return self.mark_stack.is_empty();
                }
            }
            let header = match self.mark_stack.pop() {
                Some(header) => header,
                None => return true,
            };
            children.clear();
            self.references_of(header, &mut children);
            let mut visitor = marking_visitor!(self);
            for child in children.iter() {
                visitor.mark_header(*child);
            }
            traced += 1;
        }
    }

    /// A complete stop-the-world mark starting from clear live flags. Returns `false` if a
    /// lazy mark stopped early because every impatient PMC is reachable.
    pub(crate) fn mark(&mut self, mode: TraceMode, lazy: bool) -> bool {
        self.cleanup_next_for_gc();
        self.phase = GcPhase::Marking;
        if mode.traces_system_areas() {
            self.run_constraints(MarkingConstraintRuns::BeforeMark);
        }
        self.mark_roots(mode);
        if !self.process_mark_stack(None, lazy) {
            self.mark_stack.clear();
            return false;
        }
        if mode.traces_system_areas() {
            self.run_constraints(MarkingConstraintRuns::AfterMark);
            if !self.process_mark_stack(None, lazy) {
                self.mark_stack.clear();
                return false;
            }
        }
        true
    }

    /// Diagnostic trace: marks everything reachable from the roots selected by `mode`,
    /// counts it and clears the live flags again. Nothing is swept.
    pub fn trace_roots(&mut self, mode: TraceMode) -> Result<usize, GcError> {
        if self.phase != GcPhase::Idle || self.blocking.is_mark_blocked() {
            return Err(GcError::CollectionInProgress);
        }
        self.mark(mode, false);
        let mut reachable = 0;
        for pool in self.pools.iter() {
            pool.for_each_live(|_, header| {
                if header.is_live() {
                    reachable += 1;
                }
            });
        }
        self.cleanup_next_for_gc();
        Ok(reachable)
    }

    // Incremental marking

    /// Starts an incremental mark: marks the roots and returns. The mutator may run between
    /// [incremental_mark_step](Arenas::incremental_mark_step) calls; stores into live PMCs go
    /// through the write barrier and new headers are allocated live.
    ///
    /// Returns `Ok(false)` if marking is blocked, in which case a collection is queued.
    pub fn begin_incremental_mark(&mut self) -> Result<bool, GcError> {
        if self.phase != GcPhase::Idle {
            return Err(GcError::CollectionInProgress);
        }
        if self.blocking.is_mark_blocked() {
            self.blocking.defer(crate::header::GcFlags::NORMAL);
            return Ok(false);
        }
        self.cleanup_next_for_gc();
        self.counters.mark_runs += 1;
        self.phase = GcPhase::Marking;
        self.run_constraints(MarkingConstraintRuns::BeforeMark);
        self.mark_roots(TraceMode::Full);
        log::debug!(
            "incremental mark started with {} grey headers",
            self.mark_stack.len()
        );
        Ok(true)
    }

    /// Traces up to `budget` queued PMCs. Returns `true` once nothing is left to trace.
    pub fn incremental_mark_step(&mut self, budget: usize) -> bool {
        if self.phase != GcPhase::Marking {
            return true;
        }
        self.process_mark_stack(Some(budget.max(1)), false)
    }

    /// Finishes an incremental mark and sweeps. Roots are rescanned since register and stack
    /// stores do not go through the barrier.
    pub fn finish_incremental_collection(&mut self) -> usize {
        if self.phase != GcPhase::Marking {
            return 0;
        }
        self.mark_roots(TraceMode::Full);
        self.process_mark_stack(None, false);
        self.run_constraints(MarkingConstraintRuns::AfterMark);
        self.process_mark_stack(None, false);
        self.complete_collection(crate::header::GcFlags::NORMAL, false, true)
    }
}
