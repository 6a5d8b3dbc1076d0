//! Hidden classes.
//!
//! An [`InternalClass`] describes the layout of every object that reached it
//! through the same sequence of member additions: which identifier lives in
//! which slot, with which attributes, plus the prototype and vtable shared by
//! those objects. Classes are interned in an [`InternalClassPool`] owned by
//! one engine; every derived class is reached through a cached transition so
//! that repeating a sequence of operations always lands on the same class.
//!
//! Adding a member to a class appends to storage shared with its parent
//! ([`SharedInternalClassData`], [`PropertyHash`]). The parent only ever reads
//! the prefix it knows about, so the append happens in place; a second child
//! appending at the same position detaches first.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use ahash::HashMap;

use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::managed::{ManagedRef, VTable};
use crate::runner::ds::property::PropertyAttributes;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Copy-on-divergent-write array shared between a class and its descendants.
pub struct SharedInternalClassData<T: Copy> {
    d: Rc<RefCell<Vec<T>>>,
}

impl<T: Copy> Clone for SharedInternalClassData<T> {
    fn clone(&self) -> Self {
        SharedInternalClassData { d: self.d.clone() }
    }
}

impl<T: Copy> Default for SharedInternalClassData<T> {
    fn default() -> Self {
        SharedInternalClassData {
            d: Rc::new(RefCell::new(Vec::with_capacity(8))),
        }
    }
}

impl<T: Copy> SharedInternalClassData<T> {
    /// Stores `value` at `pos`, which must be the adding class's size.
    pub fn add(&mut self, pos: usize, value: T) {
        let len = self.d.borrow().len();
        if pos < len {
            // a sibling already appended here
            let mut fresh = Vec::with_capacity(pos + 8);
            fresh.extend_from_slice(&self.d.borrow()[..pos]);
            fresh.push(value);
            self.d = Rc::new(RefCell::new(fresh));
            return;
        }
        debug_assert_eq!(pos, len);
        self.d.borrow_mut().push(value);
    }

    pub fn set(&mut self, pos: usize, value: T) {
        if Rc::strong_count(&self.d) > 1 {
            let copy = self.d.borrow().clone();
            self.d = Rc::new(RefCell::new(copy));
        }
        self.d.borrow_mut()[pos] = value;
    }

    pub fn at(&self, i: usize) -> T {
        self.d.borrow()[i]
    }

    pub fn const_data(&self) -> Ref<'_, Vec<T>> {
        self.d.borrow()
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.d)
    }

    pub fn shares_storage_with(&self, other: &SharedInternalClassData<T>) -> bool {
        Rc::ptr_eq(&self.d, &other.d)
    }
}

#[derive(Default)]
struct PropertyHashData {
    entries: HashMap<Identifier, u32>,
}

/// Identifier to slot index map, shared the same way as the name map.
#[derive(Clone, Default)]
pub struct PropertyHash {
    d: Rc<RefCell<PropertyHashData>>,
}

impl PropertyHash {
    pub fn add_entry(&mut self, id: Identifier, index: u32, class_size: u32) {
        let shared_len = self.d.borrow().entries.len() as u32;
        if class_size < shared_len {
            let entries = self
                .d
                .borrow()
                .entries
                .iter()
                .filter(|(_, idx)| **idx < class_size)
                .map(|(k, v)| (*k, *v))
                .collect();
            self.d = Rc::new(RefCell::new(PropertyHashData { entries }));
        }
        self.d.borrow_mut().entries.insert(id, index);
    }

    /// Slot index recorded for `id`, `u32::MAX` if none. Callers compare the
    /// result against their own class size.
    pub fn lookup(&self, id: Identifier) -> u32 {
        self.d.borrow().entries.get(&id).copied().unwrap_or(u32::MAX)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TransitionTarget {
    Member(Identifier),
    Prototype(Option<ManagedRef>),
    VTable(usize),
}

/// Key of a cached edge in the class graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Transition {
    pub target: TransitionTarget,
    pub flags: i32,
}

impl Transition {
    // 0..=0xff are attribute nibbles of added or changed members
    pub const PROTO_CHANGE: i32 = 0x100;
    pub const VTABLE_CHANGE: i32 = 0x200;
    pub const REMOVE_MEMBER: i32 = -1;
}

pub struct InternalClass {
    pub prototype: Option<ManagedRef>,
    pub vtable: VTable,
    property_table: PropertyHash,
    name_map: SharedInternalClassData<Identifier>,
    property_data: SharedInternalClassData<PropertyAttributes>,
    transitions: HashMap<Transition, ClassId>,
    sealed: Option<ClassId>,
    frozen: Option<ClassId>,
    size: u32,
}

impl InternalClass {
    fn root(vtable: VTable) -> Self {
        InternalClass {
            prototype: None,
            vtable,
            property_table: PropertyHash::default(),
            name_map: SharedInternalClassData::default(),
            property_data: SharedInternalClassData::default(),
            transitions: HashMap::default(),
            sealed: None,
            frozen: None,
            size: 0,
        }
    }

    /// Copy sharing member storage, with no transitions of its own.
    fn derive(&self) -> Self {
        InternalClass {
            prototype: self.prototype,
            vtable: self.vtable,
            property_table: self.property_table.clone(),
            name_map: self.name_map.clone(),
            property_data: self.property_data.clone(),
            transitions: HashMap::default(),
            sealed: None,
            frozen: None,
            size: self.size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn find(&self, id: Identifier) -> Option<u32> {
        let idx = self.property_table.lookup(id);
        if idx < self.size {
            Some(idx)
        } else {
            None
        }
    }

    pub fn name_at(&self, slot: u32) -> Identifier {
        self.name_map.at(slot as usize)
    }

    pub fn attributes_at(&self, slot: u32) -> PropertyAttributes {
        self.property_data.at(slot as usize)
    }

    pub fn name_map(&self) -> &SharedInternalClassData<Identifier> {
        &self.name_map
    }

    pub fn property_data(&self) -> &SharedInternalClassData<PropertyAttributes> {
        &self.property_data
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }
}

/// Owner of every class of one engine. Not thread-safe.
pub struct InternalClassPool {
    classes: Vec<InternalClass>,
    empty: ClassId,
}

impl InternalClassPool {
    pub fn new(base_vtable: VTable) -> Self {
        InternalClassPool {
            classes: vec![InternalClass::root(base_vtable)],
            empty: ClassId(0),
        }
    }

    pub fn empty_class(&self) -> ClassId {
        self.empty
    }

    pub fn get(&self, id: ClassId) -> &InternalClass {
        &self.classes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn new_class_from(&mut self, from: ClassId) -> ClassId {
        let class = self.classes[from.index()].derive();
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(class);
        tracing::trace!(target: "jsv4::class", from = from.0, to = id.0, "new internal class");
        id
    }

    fn cached(&self, from: ClassId, t: &Transition) -> Option<ClassId> {
        self.classes[from.index()].transitions.get(t).copied()
    }

    fn remember(&mut self, from: ClassId, t: Transition, to: ClassId) {
        self.classes[from.index()].transitions.insert(t, to);
    }

    /// Class for objects with the given vtable and prototype and no members.
    pub fn create(&mut self, vtable: VTable, prototype: Option<ManagedRef>) -> ClassId {
        let c = self.change_vtable(self.empty, vtable);
        self.change_prototype(c, prototype)
    }

    pub fn find(&self, class: ClassId, id: Identifier) -> Option<u32> {
        self.get(class).find(id)
    }

    /// Class reached by adding `id` with `attrs`, and the slot it occupies.
    /// Adding an existing member changes it instead.
    pub fn add_member(
        &mut self,
        class: ClassId,
        id: Identifier,
        attrs: PropertyAttributes,
    ) -> (ClassId, u32) {
        let mut data = attrs;
        data.resolve();
        if self.get(class).find(id).is_some() {
            return self.change_member(class, id, data);
        }
        self.add_member_impl(class, id, data)
    }

    fn add_member_impl(
        &mut self,
        class: ClassId,
        id: Identifier,
        data: PropertyAttributes,
    ) -> (ClassId, u32) {
        let t = Transition {
            target: TransitionTarget::Member(id),
            flags: data.flags() as i32,
        };
        let index = self.get(class).size;
        if let Some(next) = self.cached(class, &t) {
            return (next, index);
        }
        let new = self.new_class_from(class);
        {
            let nc = &mut self.classes[new.index()];
            let size = nc.size;
            nc.property_table.add_entry(id, size, size);
            nc.name_map.add(size as usize, id);
            nc.property_data.add(size as usize, data);
            nc.size += 1;
        }
        self.remember(class, t, new);
        (new, index)
    }

    /// Class in which `id` carries `attrs`. Adds the member when missing.
    pub fn change_member(
        &mut self,
        class: ClassId,
        id: Identifier,
        attrs: PropertyAttributes,
    ) -> (ClassId, u32) {
        let mut data = attrs;
        data.resolve();
        let idx = match self.get(class).find(id) {
            Some(idx) => idx,
            None => return self.add_member_impl(class, id, data),
        };
        if self.get(class).attributes_at(idx) == data {
            return (class, idx);
        }
        let t = Transition {
            target: TransitionTarget::Member(id),
            flags: data.flags() as i32,
        };
        if let Some(next) = self.cached(class, &t) {
            return (next, idx);
        }
        let new = self.new_class_from(class);
        self.classes[new.index()]
            .property_data
            .set(idx as usize, data);
        self.remember(class, t, new);
        (new, idx)
    }

    /// Rebuilds `members` of `source` on top of a fresh class with the given vtable and prototype.
    fn rebuild(
        &mut self,
        source: ClassId,
        vtable: VTable,
        prototype: Option<ManagedRef>,
        skip: Option<u32>,
        adjust: fn(PropertyAttributes) -> PropertyAttributes,
    ) -> ClassId {
        let mut c = self.change_vtable(self.empty, vtable);
        c = self.change_prototype(c, prototype);
        let size = self.get(source).size;
        for i in 0..size {
            if Some(i) == skip {
                continue;
            }
            let name = self.get(source).name_at(i);
            let attrs = adjust(self.get(source).attributes_at(i));
            c = self.add_member(c, name, attrs).0;
        }
        c
    }

    pub fn change_prototype(&mut self, class: ClassId, proto: Option<ManagedRef>) -> ClassId {
        if self.get(class).prototype == proto {
            return class;
        }
        let t = Transition {
            target: TransitionTarget::Prototype(proto),
            flags: Transition::PROTO_CHANGE,
        };
        if let Some(next) = self.cached(class, &t) {
            return next;
        }
        let new = {
            let c = self.get(class);
            if c.size == 0 && c.prototype.is_none() {
                let n = self.new_class_from(class);
                self.classes[n.index()].prototype = proto;
                n
            } else {
                let vtable = c.vtable;
                self.rebuild(class, vtable, proto, None, |a| a)
            }
        };
        self.remember(class, t, new);
        new
    }

    pub fn change_vtable(&mut self, class: ClassId, vtable: VTable) -> ClassId {
        if self.get(class).vtable == vtable {
            return class;
        }
        let t = Transition {
            target: TransitionTarget::VTable(vtable.id()),
            flags: Transition::VTABLE_CHANGE,
        };
        if let Some(next) = self.cached(class, &t) {
            return next;
        }
        let new = if class == self.empty {
            let n = self.new_class_from(class);
            self.classes[n.index()].vtable = vtable;
            n
        } else {
            let proto = self.get(class).prototype;
            self.rebuild(class, vtable, proto, None, |a| a)
        };
        self.remember(class, t, new);
        new
    }

    /// Class without `id`. The caller shifts its member slots above the removed one down by one.
    pub fn remove_member(&mut self, class: ClassId, id: Identifier) -> ClassId {
        let prop_idx = match self.get(class).find(id) {
            Some(idx) => idx,
            None => return class,
        };
        let t = Transition {
            target: TransitionTarget::Member(id),
            flags: Transition::REMOVE_MEMBER,
        };
        if let Some(next) = self.cached(class, &t) {
            return next;
        }
        let (vtable, proto) = {
            let c = self.get(class);
            (c.vtable, c.prototype)
        };
        let new = self.rebuild(class, vtable, proto, Some(prop_idx), |a| a);
        self.remember(class, t, new);
        new
    }

    /// Same members, all non-configurable. Computed once per class.
    pub fn sealed(&mut self, class: ClassId) -> ClassId {
        if let Some(s) = self.get(class).sealed {
            return s;
        }
        let (vtable, proto) = {
            let c = self.get(class);
            (c.vtable, c.prototype)
        };
        let s = self.rebuild(class, vtable, proto, None, |mut a| {
            a.set_configurable(false);
            a
        });
        self.classes[s.index()].sealed = Some(s);
        self.classes[class.index()].sealed = Some(s);
        s
    }

    /// Same members, all non-configurable and data members read-only.
    pub fn frozen(&mut self, class: ClassId) -> ClassId {
        if let Some(f) = self.get(class).frozen {
            return f;
        }
        let (vtable, proto) = {
            let c = self.get(class);
            (c.vtable, c.prototype)
        };
        let f = self.rebuild(class, vtable, proto, None, |mut a| {
            if !a.is_accessor() {
                a.set_writable(false);
            }
            a.set_configurable(false);
            a
        });
        self.classes[f.index()].frozen = Some(f);
        self.classes[class.index()].frozen = Some(f);
        f
    }

    pub fn is_sealed(&self, class: ClassId) -> bool {
        let c = self.get(class);
        (0..c.size).all(|i| !c.attributes_at(i).is_configurable())
    }

    pub fn is_frozen(&self, class: ClassId) -> bool {
        let c = self.get(class);
        (0..c.size).all(|i| {
            let a = c.attributes_at(i);
            !a.is_configurable() && (a.is_accessor() || !a.is_writable())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ds::identifier::IdentifierTable;
    use crate::runner::ds::managed::MANAGED_VTABLE;
    use crate::runner::ds::object::{ARRAY_OBJECT_VTABLE, OBJECT_VTABLE};
    use crate::runner::ds::property::{ATTR_DATA, ATTR_NOT_ENUMERABLE};

    fn setup() -> (InternalClassPool, IdentifierTable, ClassId) {
        let mut pool = InternalClassPool::new(VTable::Managed(&MANAGED_VTABLE));
        let object = pool.create(VTable::Object(&OBJECT_VTABLE), None);
        (pool, IdentifierTable::new(), object)
    }

    #[test]
    fn test_same_sequence_reaches_same_class() {
        let (mut pool, mut ids, object) = setup();
        let x = ids.intern("x");
        let y = ids.intern("y");
        let attrs = PropertyAttributes::from_flags(ATTR_DATA);
        let (a1, sx) = pool.add_member(object, x, attrs);
        let (a2, sy) = pool.add_member(a1, y, attrs);
        let classes = pool.len();
        let (b1, _) = pool.add_member(object, x, attrs);
        let (b2, _) = pool.add_member(b1, y, attrs);
        assert_eq!(a2, b2);
        assert_eq!((sx, sy), (0, 1));
        assert_eq!(pool.len(), classes);
    }

    #[test]
    fn test_order_matters() {
        let (mut pool, mut ids, object) = setup();
        let x = ids.intern("x");
        let y = ids.intern("y");
        let attrs = PropertyAttributes::data();
        let xy = pool.add_member(object, x, attrs).0;
        let xy = pool.add_member(xy, y, attrs).0;
        let yx = pool.add_member(object, y, attrs).0;
        let yx = pool.add_member(yx, x, attrs).0;
        assert_ne!(xy, yx);
        assert_eq!(pool.find(xy, y), Some(1));
        assert_eq!(pool.find(yx, y), Some(0));
    }

    #[test]
    fn test_siblings_detach_shared_storage() {
        let (mut pool, mut ids, object) = setup();
        let x = ids.intern("x");
        let y = ids.intern("y");
        let z = ids.intern("z");
        let attrs = PropertyAttributes::data();
        let parent = pool.add_member(object, x, attrs).0;
        let first = pool.add_member(parent, y, attrs).0;
        assert!(pool
            .get(first)
            .name_map()
            .shares_storage_with(pool.get(parent).name_map()));
        let second = pool.add_member(parent, z, attrs).0;
        assert!(!pool
            .get(second)
            .name_map()
            .shares_storage_with(pool.get(parent).name_map()));
        assert_eq!(pool.find(parent, y), None);
        assert_eq!(pool.find(parent, z), None);
        assert_eq!(pool.find(first, z), None);
        assert_eq!(pool.find(second, y), None);
        assert_eq!(pool.find(second, z), Some(1));
        assert_eq!(pool.get(first).name_at(1), y);
    }

    #[test]
    fn test_change_member_is_upsert() {
        let (mut pool, mut ids, object) = setup();
        let x = ids.intern("x");
        let hidden = PropertyAttributes::from_flags(ATTR_NOT_ENUMERABLE);
        let via_change = pool.change_member(object, x, hidden);
        let via_add = pool.add_member(object, x, hidden);
        assert_eq!(via_change, via_add);
        let visible = pool.add_member(object, x, PropertyAttributes::data()).0;
        let changed = pool.change_member(visible, x, hidden);
        assert_eq!(changed.1, 0);
        assert!(!pool.get(changed.0).attributes_at(0).is_enumerable());
        assert!(pool.get(visible).attributes_at(0).is_enumerable());
        assert_eq!(pool.change_member(visible, x, hidden), changed);
        assert_eq!(
            pool.change_member(visible, x, PropertyAttributes::data()),
            (visible, 0)
        );
    }

    #[test]
    fn test_prototype_and_vtable_changes_keep_members() {
        let (mut pool, mut ids, object) = setup();
        let x = ids.intern("x");
        let c = pool.add_member(object, x, PropertyAttributes::data()).0;
        let proto = Some(ManagedRef::new(3));
        let p = pool.change_prototype(c, proto);
        assert_eq!(pool.get(p).prototype, proto);
        assert_eq!(pool.find(p, x), Some(0));
        assert_eq!(pool.change_prototype(c, proto), p);
        let v = pool.change_vtable(p, VTable::Object(&ARRAY_OBJECT_VTABLE));
        assert_eq!(pool.get(v).prototype, proto);
        assert_eq!(pool.find(v, x), Some(0));
        assert_eq!(pool.change_vtable(v, VTable::Object(&ARRAY_OBJECT_VTABLE)), v);
    }

    #[test]
    fn test_remove_member() {
        let (mut pool, mut ids, object) = setup();
        let x = ids.intern("x");
        let y = ids.intern("y");
        let c = pool.add_member(object, x, PropertyAttributes::data()).0;
        let c = pool.add_member(c, y, PropertyAttributes::data()).0;
        let r = pool.remove_member(c, x);
        assert_eq!(pool.find(r, x), None);
        assert_eq!(pool.find(r, y), Some(0));
        assert_eq!(pool.remove_member(c, x), r);
        assert_eq!(pool.remove_member(r, x), r);
    }

    #[test]
    fn test_sealed_and_frozen_are_memoized() {
        let (mut pool, mut ids, object) = setup();
        let x = ids.intern("x");
        let c = pool.add_member(object, x, PropertyAttributes::data()).0;
        let s = pool.sealed(c);
        assert_eq!(pool.sealed(c), s);
        assert_eq!(pool.sealed(s), s);
        assert!(pool.is_sealed(s));
        assert!(!pool.is_frozen(s));
        assert!(pool.get(s).attributes_at(0).is_writable());
        let f = pool.frozen(c);
        assert_eq!(pool.frozen(c), f);
        assert_eq!(pool.frozen(f), f);
        assert!(pool.is_frozen(f));
        assert!(!pool.get(f).attributes_at(0).is_writable());
    }

    #[test]
    fn test_shared_data_reads_do_not_copy() {
        let mut data: SharedInternalClassData<u32> = SharedInternalClassData::default();
        data.add(0, 1);
        let other = data.clone();
        assert_eq!(data.refcount(), 2);
        assert_eq!(other.at(0), 1);
        assert!(data.shares_storage_with(&other));
        data.set(0, 5);
        assert!(!data.shares_storage_with(&other));
        assert_eq!(other.at(0), 1);
        assert_eq!(data.at(0), 5);
    }
}
