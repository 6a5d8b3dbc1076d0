//! Inline property caches.
//!
//! A lookup remembers the hidden class it last resolved a name against and the
//! slot the name lived in. A later access on an object of the same class reads
//! the slot directly.

use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::internal_class::ClassId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LookupKind {
    Getter,
    Setter,
    GlobalGetter,
}

#[derive(Clone, Copy, Debug)]
pub struct Lookup {
    pub kind: LookupKind,
    pub name: Identifier,
    pub class: Option<ClassId>,
    pub index: u32,
    pub hits: u32,
    pub misses: u32,
}

impl Lookup {
    pub fn new(kind: LookupKind, name: Identifier) -> Self {
        Lookup {
            kind,
            name,
            class: None,
            index: u32::MAX,
            hits: 0,
            misses: 0,
        }
    }

    /// Slot for objects of `class`, if this lookup has seen that class.
    pub fn probe(&mut self, class: ClassId) -> Option<u32> {
        if self.class == Some(class) {
            self.hits += 1;
            Some(self.index)
        } else {
            self.misses += 1;
            None
        }
    }

    pub fn remember(&mut self, class: ClassId, index: u32) {
        self.class = Some(class);
        self.index = index;
    }

    pub fn reset(&mut self) {
        self.class = None;
        self.index = u32::MAX;
    }
}
