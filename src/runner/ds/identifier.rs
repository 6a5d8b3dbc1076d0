//! Interned property names.

use std::fmt;
use std::rc::Rc;

use ahash::HashMap;

/// An interned property name. Two identifiers are equal iff their text is.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(u32);

impl Identifier {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier(#{})", self.0)
    }
}

#[derive(Default)]
pub struct IdentifierTable {
    names: Vec<Rc<str>>,
    by_name: HashMap<Rc<str>, Identifier>,
}

impl IdentifierTable {
    pub fn new() -> Self {
        IdentifierTable::default()
    }

    pub fn intern(&mut self, name: &str) -> Identifier {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = Identifier(self.names.len() as u32);
        let text: Rc<str> = Rc::from(name);
        self.names.push(text.clone());
        self.by_name.insert(text, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<Identifier> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: Identifier) -> &str {
        self.names
            .get(id.0 as usize)
            .map(|s| &**s)
            .unwrap_or("")
    }

    pub fn name_rc(&self, id: Identifier) -> Rc<str> {
        self.names
            .get(id.0 as usize)
            .cloned()
            .unwrap_or_else(|| Rc::from(""))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut table = IdentifierTable::new();
        let a = table.intern("length");
        let b = table.intern("prototype");
        assert_ne!(a, b);
        assert_eq!(table.intern("length"), a);
        assert_eq!(table.name(b), "prototype");
        assert_eq!(table.lookup("missing"), None);
    }
}
