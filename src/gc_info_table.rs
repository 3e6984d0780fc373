use std::sync::Arc;

use parking_lot::RwLock;

use crate::{error::GcError, gcref::PmcRef, header::PmcBody, visitor::Visitor};

pub type GcInfoIndex = u16;

/// Replaces the default reference walk of a PMC type. Types that hold weak references
/// visit only the strong ones.
pub type TraceCallback = fn(&PmcBody, &mut dyn Visitor);
/// Runs when a header flagged `CUSTOM_DESTROY` is destroyed.
pub type FinalizationCallback = fn(PmcRef, &mut PmcBody);

/// GcInfo contains metadata for PMC types.
#[derive(Clone, Copy)]
pub struct GcInfo {
    pub name: &'static str,
    pub trace: Option<TraceCallback>,
    pub finalize: Option<FinalizationCallback>,
}

impl GcInfo {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            trace: None,
            finalize: None,
        }
    }
    pub fn with_trace(mut self, trace: TraceCallback) -> Self {
        self.trace = Some(trace);
        self
    }
    pub fn with_finalizer(mut self, finalize: FinalizationCallback) -> Self {
        self.finalize = Some(finalize);
        self
    }

    /// Visits every header `body` keeps alive.
    pub fn trace(&self, body: &PmcBody, visitor: &mut dyn Visitor) {
        match self.trace {
            Some(trace) => trace(body, visitor),
            None => body.for_each_reference(|r| visitor.mark_header(r)),
        }
    }
}

/// Table of PMC types. A parent interpreter and all of its children share one table, which is
/// what allows merging their pools: type indices stored in headers mean the same thing on
/// both sides.
pub struct GcInfoTable {
    infos: RwLock<Vec<GcInfo>>,
}

impl GcInfoTable {
    /// At maximum [`MAX_INDEX - 1`](GcInfoTable::MAX_INDEX) indices are supported.
    pub const MAX_INDEX: u16 = 1 << 14;
    /// Index of the type every PMC gets unless told otherwise.
    pub const DEFAULT_INDEX: GcInfoIndex = 0;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            infos: RwLock::new(vec![GcInfo::new("default")]),
        })
    }

    /// Registers `info`, or returns the index it was registered under before.
    pub fn register(&self, info: GcInfo) -> Result<GcInfoIndex, GcError> {
        let mut infos = self.infos.write();
        if let Some(index) = infos.iter().position(|known| known.name == info.name) {
            return Ok(index as GcInfoIndex);
        }
        if infos.len() >= Self::MAX_INDEX as usize {
            return Err(GcError::TypeTableExhausted(infos.len()));
        }
        infos.push(info);
        Ok((infos.len() - 1) as GcInfoIndex)
    }

    pub fn get(&self, index: GcInfoIndex) -> GcInfo {
        let infos = self.infos.read();
        match infos.get(index as usize) {
            Some(info) => *info,
            None => panic!("unknown GC info index {}", index),
        }
    }

    pub fn len(&self) -> usize {
        self.infos.read().len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}
