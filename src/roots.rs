//! The root set. Nothing in here is owned by the collector; it only reads the roots while
//! marking.
use crate::{
    constants::{ConstantTable, ConstantTableId},
    gcref::HeaderRef,
    visitor::Visitor,
};

/// Which roots a trace starts from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceMode {
    /// Registers, anchors, constants, the shadow stack and marking constraints.
    Full,
    /// Only direct anchors: registers, anchored globals and constants.
    RootOnly,
    /// Only system areas: the shadow stack and marking constraints.
    SystemOnly,
}

impl TraceMode {
    pub fn traces_anchors(self) -> bool {
        matches!(self, TraceMode::Full | TraceMode::RootOnly)
    }

    pub fn traces_system_areas(self) -> bool {
        matches!(self, TraceMode::Full | TraceMode::SystemOnly)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkingConstraintRuns {
    AfterMark,
    BeforeMark,
}

/// Marking constraint that is executed at every full mark.
///
/// Constraints report extra roots the collector cannot find on its own, e.g. references held
/// by native code. A constraint must not allocate or request a collection.
pub trait MarkingConstraint {
    /// Returns when marking constraint should run: after mark or before marking cycle.
    fn runs_at(&self) -> MarkingConstraintRuns;
    fn name(&self) -> &str;
    /// Returns `true` if this constraint is over and should be removed from the constraint list.
    fn is_over(&self) -> bool;
    /// Executes this constraint.
    fn run(&mut self, visitor: &mut dyn Visitor);
}

#[derive(Default)]
pub struct RootSet {
    registers: Vec<Option<HeaderRef>>,
    anchors: Vec<HeaderRef>,
    stack: Vec<HeaderRef>,
    constant_tables: Vec<Option<ConstantTable>>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes the register window. New registers are empty.
    pub fn resize_registers(&mut self, count: usize) {
        self.registers.resize(count, None);
    }

    pub fn set_register(&mut self, index: usize, value: Option<HeaderRef>) {
        if index >= self.registers.len() {
            self.resize_registers(index + 1);
        }
        self.registers[index] = value;
    }

    pub fn register(&self, index: usize) -> Option<HeaderRef> {
        self.registers.get(index).copied().flatten()
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    /// Anchors `header` as a global root. Anchors nest: a header anchored twice needs two
    /// [unanchor](RootSet::unanchor) calls.
    pub fn anchor(&mut self, header: HeaderRef) {
        self.anchors.push(header);
    }

    pub fn unanchor(&mut self, header: HeaderRef) -> bool {
        match self.anchors.iter().rposition(|h| *h == header) {
            Some(index) => {
                self.anchors.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Pushes a root on the shadow stack and returns the depth before the push, to be
    /// passed to [pop_stack_roots](RootSet::pop_stack_roots).
    pub fn push_stack_root(&mut self, header: HeaderRef) -> usize {
        self.stack.push(header);
        self.stack.len() - 1
    }

    pub fn pop_stack_roots(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn register_constant_table(&mut self, table: ConstantTable) -> ConstantTableId {
        if let Some(index) = self.constant_tables.iter().position(|t| t.is_none()) {
            self.constant_tables[index] = Some(table);
            return ConstantTableId(index);
        }
        self.constant_tables.push(Some(table));
        ConstantTableId(self.constant_tables.len() - 1)
    }

    pub fn unregister_constant_table(&mut self, id: ConstantTableId) -> Option<ConstantTable> {
        self.constant_tables.get_mut(id.0).and_then(|t| t.take())
    }

    pub fn constant_table(&self, id: ConstantTableId) -> Option<&ConstantTable> {
        self.constant_tables.get(id.0).and_then(|t| t.as_ref())
    }

    /// Visits the roots selected by `mode`. Marking constraints are owned by the
    /// [Arenas](crate::arenas::Arenas) and run separately.
    pub fn trace(&self, mode: TraceMode, visitor: &mut dyn Visitor) {
        if mode.traces_anchors() {
            for register in self.registers.iter() {
                visitor.mark_optional(*register);
            }
            for anchor in self.anchors.iter() {
                visitor.mark_header(*anchor);
            }
            for table in self.constant_tables.iter().flatten() {
                table.trace(visitor);
            }
        }
        if mode.traces_system_areas() {
            for root in self.stack.iter() {
                visitor.mark_header(*root);
            }
        }
    }

    /// Rewrites every root through `f`. Used when headers change address during a merge.
    pub(crate) fn for_each_root_mut(&mut self, mut f: impl FnMut(&mut HeaderRef)) {
        self.registers.iter_mut().flatten().for_each(&mut f);
        self.anchors.iter_mut().for_each(&mut f);
        self.stack.iter_mut().for_each(&mut f);
        for table in self.constant_tables.iter_mut().flatten() {
            table.for_each_reference_mut(&mut f);
        }
    }

    pub(crate) fn append(&mut self, other: RootSet) {
        self.anchors.extend(other.anchors);
        for table in other.constant_tables.into_iter().flatten() {
            self.register_constant_table(table);
        }
    }
}
