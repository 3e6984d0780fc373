//! Write barrier and the PMC store helpers that invoke it.
//!
//! During an incremental mark the mutator runs between mark steps. Storing a reference to an
//! unmarked header into a PMC the collector already marked would hide the header from the
//! rest of the mark, so the barrier marks the stored header (and, up to `barrier_depth`
//! levels, what it references) right away. Outside of an incremental mark the barrier only
//! reads the phase.
use crate::{
    arenas::{Arenas, GcPhase},
    gcref::{HeaderRef, PmcRef},
};

impl Arenas {
    #[inline]
    pub fn write_barrier(
        &mut self,
        aggregate: PmcRef,
        _old: Option<HeaderRef>,
        new: Option<HeaderRef>,
    ) {
        if self.phase != GcPhase::Marking {
            return;
        }
        if let Some(new) = new {
            self.barrier_mark(aggregate, new);
        }
    }

    /// Barrier for keyed stores: the key is barriered along with the value.
    #[inline]
    pub fn write_barrier_key(
        &mut self,
        aggregate: PmcRef,
        _old: Option<HeaderRef>,
        _old_key: Option<HeaderRef>,
        new: Option<HeaderRef>,
        new_key: Option<HeaderRef>,
    ) {
        if self.phase != GcPhase::Marking {
            return;
        }
        for value in [new_key, new].iter().flatten() {
            self.barrier_mark(aggregate, *value);
        }
    }

    fn barrier_mark(&mut self, aggregate: PmcRef, new: HeaderRef) {
        if !self.header(aggregate).is_live() || self.header(new).is_live() {
            return;
        }
        self.mark_object(new);
        let mut frontier = vec![new];
        let mut next = Vec::new();
        for _ in 0..self.config.barrier_depth {
            next.clear();
            for header in frontier.iter() {
                self.references_of(*header, &mut next);
            }
            if next.is_empty() {
                break;
            }
            for header in next.iter() {
                self.mark_object(*header);
            }
            std::mem::swap(&mut frontier, &mut next);
        }
    }

    // Store helpers

    pub fn set_element(&mut self, aggregate: PmcRef, index: usize, value: Option<HeaderRef>) {
        let body = self.pmc_body_mut(aggregate);
        if body.elements.len() <= index {
            body.elements.resize(index + 1, None);
        }
        let old = std::mem::replace(&mut body.elements[index], value);
        self.write_barrier(aggregate, old, value);
    }

    pub fn push_element(&mut self, aggregate: PmcRef, value: impl Into<HeaderRef>) -> usize {
        let value = value.into();
        let body = self.pmc_body_mut(aggregate);
        body.elements.push(Some(value));
        let index = body.elements.len() - 1;
        self.write_barrier(aggregate, None, Some(value));
        index
    }

    pub fn element(&self, aggregate: PmcRef, index: usize) -> Option<HeaderRef> {
        self.pmc_body(aggregate)
            .elements
            .get(index)
            .copied()
            .flatten()
    }

    pub fn element_count(&self, aggregate: PmcRef) -> usize {
        self.pmc_body(aggregate).elements.len()
    }

    /// Stores `value` under `key`. Keys compare by handle identity.
    pub fn set_keyed(&mut self, aggregate: PmcRef, key: HeaderRef, value: Option<HeaderRef>) {
        let body = self.pmc_body_mut(aggregate);
        let position = body.keyed.iter().position(|(k, _)| *k == key);
        let (old, old_key) = match position {
            Some(index) => (std::mem::replace(&mut body.keyed[index].1, value), Some(key)),
            None => {
                body.keyed.push((key, value));
                (None, None)
            }
        };
        self.write_barrier_key(aggregate, old, old_key, value, Some(key));
    }

    pub fn keyed(&self, aggregate: PmcRef, key: HeaderRef) -> Option<HeaderRef> {
        self.pmc_body(aggregate)
            .keyed
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, value)| *value)
    }

    pub fn set_metadata(&mut self, aggregate: PmcRef, metadata: Option<HeaderRef>) {
        let old = std::mem::replace(&mut self.pmc_body_mut(aggregate).metadata, metadata);
        self.write_barrier(aggregate, old, metadata);
    }

    pub fn metadata(&self, aggregate: PmcRef) -> Option<HeaderRef> {
        self.pmc_body(aggregate).metadata
    }
}
