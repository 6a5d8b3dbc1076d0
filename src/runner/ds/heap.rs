//! Cell storage for the JavaScript runtime.
//!
//! Every string and object lives in one arena and is addressed by a
//! [`ManagedRef`]. Cells are never moved. Reclaiming unreachable cells belongs
//! to an external tracer that walks from the engine's roots using the mark bit
//! in each header; this module only hands out and limits cells.

use std::rc::Rc;

use crate::runner::ds::error::HeapError;
use crate::runner::ds::internal_class::ClassId;
use crate::runner::ds::managed::{ManagedFlags, ManagedRef};
use crate::runner::ds::object::ObjectData;

/// Configuration for the heap manager.
#[derive(Debug, Clone, Default)]
pub struct HeapConfig {
    /// Maximum number of live cells. None means unlimited.
    pub max_objects: Option<usize>,
}

impl HeapConfig {
    pub fn unlimited() -> Self {
        HeapConfig { max_objects: None }
    }

    pub fn with_limit(max_objects: usize) -> Self {
        HeapConfig {
            max_objects: Some(max_objects),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManagedHeader {
    pub internal_class: ClassId,
    pub flags: ManagedFlags,
}

#[derive(Debug, Clone)]
pub struct JsString {
    text: Rc<str>,
}

impl JsString {
    pub fn new(text: Rc<str>) -> Self {
        JsString { text }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn text(&self) -> Rc<str> {
        self.text.clone()
    }

    /// Length in UTF-16 code units, as `length` reports it.
    pub fn length(&self) -> u32 {
        self.text.encode_utf16().count() as u32
    }
}

pub enum HeapKind {
    String(JsString),
    Object(Box<ObjectData>),
}

pub struct HeapObject {
    pub header: ManagedHeader,
    pub kind: HeapKind,
}

impl HeapObject {
    pub fn string(internal_class: ClassId, text: Rc<str>) -> Self {
        HeapObject {
            header: ManagedHeader {
                internal_class,
                flags: ManagedFlags::fresh(),
            },
            kind: HeapKind::String(JsString::new(text)),
        }
    }

    pub fn object(internal_class: ClassId, data: ObjectData) -> Self {
        HeapObject {
            header: ManagedHeader {
                internal_class,
                flags: ManagedFlags::fresh(),
            },
            kind: HeapKind::Object(Box::new(data)),
        }
    }
}

#[derive(Default)]
pub struct MemoryManager {
    config: HeapConfig,
    cells: Vec<HeapObject>,
}

impl MemoryManager {
    pub fn new(config: HeapConfig) -> Self {
        MemoryManager {
            config,
            cells: Vec::with_capacity(256),
        }
    }

    /// Stores `cell`. Fails once the configured cell limit is reached.
    pub fn allocate(&mut self, cell: HeapObject) -> Result<ManagedRef, HeapError> {
        if let Some(limit) = self.config.max_objects {
            if self.cells.len() >= limit {
                tracing::debug!(target: "jsv4::alloc", limit, "heap limit reached");
                return Err(HeapError::OutOfMemory { limit });
            }
        }
        Ok(self.allocate_reserved(cell))
    }

    /// Stores `cell` regardless of the limit. Used for the error raised when
    /// the limit is hit.
    pub fn allocate_reserved(&mut self, cell: HeapObject) -> ManagedRef {
        let m = ManagedRef::new(self.cells.len() as u32);
        self.cells.push(cell);
        m
    }

    pub fn get(&self, m: ManagedRef) -> &HeapObject {
        &self.cells[m.index() as usize]
    }

    pub fn get_mut(&mut self, m: ManagedRef) -> &mut HeapObject {
        &mut self.cells[m.index() as usize]
    }

    pub fn header(&self, m: ManagedRef) -> &ManagedHeader {
        &self.get(m).header
    }

    pub fn header_mut(&mut self, m: ManagedRef) -> &mut ManagedHeader {
        &mut self.get_mut(m).header
    }

    pub fn string(&self, m: ManagedRef) -> Option<&JsString> {
        match self.cells.get(m.index() as usize).map(|c| &c.kind) {
            Some(HeapKind::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn object(&self, m: ManagedRef) -> Option<&ObjectData> {
        match self.cells.get(m.index() as usize).map(|c| &c.kind) {
            Some(HeapKind::Object(o)) => Some(o),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, m: ManagedRef) -> Option<&mut ObjectData> {
        match self.cells.get_mut(m.index() as usize).map(|c| &mut c.kind) {
            Some(HeapKind::Object(o)) => Some(o),
            _ => None,
        }
    }

    pub fn is_string(&self, m: ManagedRef) -> bool {
        self.string(m).is_some()
    }

    pub fn is_object(&self, m: ManagedRef) -> bool {
        self.object(m).is_some()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn max_objects(&self) -> Option<usize> {
        self.config.max_objects
    }

    pub fn available(&self) -> Option<usize> {
        self.config
            .max_objects
            .map(|max| max.saturating_sub(self.cells.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ds::internal_class::InternalClassPool;
    use crate::runner::ds::managed::{VTable, STRING_VTABLE};

    #[test]
    fn test_heap_limited() {
        let pool = InternalClassPool::new(VTable::Managed(&STRING_VTABLE));
        let class = pool.empty_class();
        let mut heap = MemoryManager::new(HeapConfig::with_limit(2));
        assert!(heap.allocate(HeapObject::string(class, Rc::from("a"))).is_ok());
        assert!(heap.allocate(HeapObject::string(class, Rc::from("b"))).is_ok());
        assert_eq!(heap.available(), Some(0));
        let result = heap.allocate(HeapObject::string(class, Rc::from("c")));
        assert_eq!(result.err(), Some(HeapError::OutOfMemory { limit: 2 }));
        let m = heap.allocate_reserved(HeapObject::string(class, Rc::from("d")));
        assert_eq!(heap.string(m).map(|s| s.as_str()), Some("d"));
    }

    #[test]
    fn test_heap_unlimited() {
        let pool = InternalClassPool::new(VTable::Managed(&STRING_VTABLE));
        let mut heap = MemoryManager::new(HeapConfig::unlimited());
        for i in 0..1000 {
            let text: Rc<str> = Rc::from(i.to_string());
            assert!(heap
                .allocate(HeapObject::string(pool.empty_class(), text))
                .is_ok());
        }
        assert_eq!(heap.len(), 1000);
        assert_eq!(heap.available(), None);
        assert!(heap.is_string(ManagedRef::new(999)));
        assert!(!heap.is_object(ManagedRef::new(999)));
        assert!(heap.string(ManagedRef::new(5000)).is_none());
    }
}
