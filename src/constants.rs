use crate::{
    gcref::{HeaderRef, PmcRef, StringRef},
    visitor::Visitor,
};

/// One entry of a bytecode constant table.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Constant {
    Number(f64),
    String(StringRef),
    Pmc(PmcRef),
}

impl Constant {
    pub fn header(&self) -> Option<HeaderRef> {
        match self {
            Constant::Number(_) => None,
            Constant::String(s) => Some(s.header()),
            Constant::Pmc(p) => Some(p.header()),
        }
    }
}

/// Constants unpacked by the loader. Once registered with
/// [Arenas::register_constant_table](crate::arenas::Arenas::register_constant_table) every
/// entry is a permanent root.
#[derive(Clone, Debug, Default)]
pub struct ConstantTable {
    name: String,
    constants: Vec<Constant>,
}

/// Handle returned when a table is registered.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConstantTableId(pub(crate) usize);

impl ConstantTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constants: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, constant: Constant) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Constant> {
        self.constants.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }

    pub fn trace(&self, visitor: &mut dyn Visitor) {
        for constant in self.constants.iter() {
            visitor.mark_optional(constant.header());
        }
    }

    pub(crate) fn for_each_reference_mut(&mut self, mut f: impl FnMut(&mut HeaderRef)) {
        for constant in self.constants.iter_mut() {
            match constant {
                Constant::Number(_) => {}
                Constant::String(s) => f(&mut s.0),
                Constant::Pmc(p) => f(&mut p.0),
            }
        }
    }
}
