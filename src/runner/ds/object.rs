//! Objects: named members, indexed elements and the dispatch tables.
//!
//! Named members live in `members`, one slot per entry of the object's
//! internal class; the class owns names and attributes, the object owns only
//! the values. Indexed properties live in [`ArrayData`], which starts as a
//! dense vector and switches to a [`SparseArray`] index once writes leave
//! large gaps.

use std::mem;
use std::rc::Rc;

use crate::runner::ds::error::{ErrorType, ExceptionSignal, ReturnedValue};
use crate::runner::ds::heap::MemoryManager;
use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::lookup::Lookup;
use crate::runner::ds::managed::{
    managed_kind, managed_vtable, ManagedRef, ManagedType, ObjectVTable,
};
use crate::runner::ds::property::{Property, PropertyAttributes, PropertyType, ATTR_READ_ONLY};
use crate::runner::ds::sparse_array::SparseArray;
use crate::runner::ds::value::{string_to_array_index, Value};
use crate::runner::engine::ExecutionEngine;
use crate::runner::function::FunctionKind;

/// Writes past `len` further than this switch a dense array to sparse storage.
const SPARSE_GAP: u32 = 64;

/// Receiver and arguments of a call.
#[derive(Debug, Clone)]
pub struct CallData {
    pub this: Value,
    pub args: Vec<Value>,
}

impl CallData {
    pub fn new(this: Value, args: Vec<Value>) -> Self {
        CallData { this, args }
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// Argument `i`, or undefined when fewer were passed.
    pub fn arg(&self, i: usize) -> Value {
        self.args.get(i).copied().unwrap_or_else(Value::undefined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKey {
    Name(Identifier),
    Index(u32),
}

/// State of a `for-in` walk. `current` moves up the prototype chain once an
/// object is exhausted; keys of objects already walked shadow later ones.
#[derive(Debug, Clone, Default)]
pub struct ObjectIterator {
    pub current: Option<ManagedRef>,
    pub array_index: u32,
    pub member_index: u32,
    pub visited: Vec<ManagedRef>,
}

impl ObjectIterator {
    pub fn new(object: Option<ManagedRef>) -> Self {
        ObjectIterator {
            current: object,
            ..ObjectIterator::default()
        }
    }
}

enum ArrayStorage {
    Simple(Vec<Property>),
    Sparse {
        map: SparseArray,
        slots: Vec<Property>,
        free: Vec<u32>,
    },
}

/// Indexed properties of an object. A dense vector uses `Value::empty()` in
/// a slot for a hole; the sparse form only stores present entries.
pub struct ArrayData {
    storage: ArrayStorage,
    attrs: Option<Vec<PropertyAttributes>>,
}

impl Default for ArrayData {
    fn default() -> Self {
        ArrayData::new()
    }
}

impl ArrayData {
    pub fn new() -> Self {
        ArrayData {
            storage: ArrayStorage::Simple(Vec::new()),
            attrs: None,
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        ArrayData {
            storage: ArrayStorage::Simple(values.into_iter().map(Property::new).collect()),
            attrs: None,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.storage, ArrayStorage::Sparse { .. })
    }

    /// Whether some element was ever given non-default attributes.
    pub fn has_attributes(&self) -> bool {
        self.attrs.is_some()
    }

    fn slot_of(&self, index: u32) -> Option<usize> {
        match &self.storage {
            ArrayStorage::Simple(values) => match values.get(index as usize) {
                Some(p) if !p.value.is_empty() => Some(index as usize),
                _ => None,
            },
            ArrayStorage::Sparse { map, .. } => map.find_node(index).map(|n| map.value(n) as usize),
        }
    }

    fn slot_attrs(&self, slot: usize) -> PropertyAttributes {
        self.attrs
            .as_ref()
            .and_then(|a| a.get(slot).copied())
            .unwrap_or_else(PropertyAttributes::data)
    }

    fn slot(&self, slot: usize) -> Property {
        match &self.storage {
            ArrayStorage::Simple(values) => values[slot],
            ArrayStorage::Sparse { slots, .. } => slots[slot],
        }
    }

    fn slot_mut(&mut self, slot: usize) -> &mut Property {
        match &mut self.storage {
            ArrayStorage::Simple(values) => &mut values[slot],
            ArrayStorage::Sparse { slots, .. } => &mut slots[slot],
        }
    }

    fn set_slot_attrs(&mut self, slot: usize, attrs: PropertyAttributes) {
        if self.attrs.is_none() && attrs == PropertyAttributes::data() {
            return;
        }
        let len = match &self.storage {
            ArrayStorage::Simple(values) => values.len(),
            ArrayStorage::Sparse { slots, .. } => slots.len(),
        };
        let table = self.attrs.get_or_insert_with(Vec::new);
        if table.len() < len {
            table.resize(len, PropertyAttributes::data());
        }
        table[slot] = attrs;
    }

    pub fn get(&self, index: u32) -> Option<(Property, PropertyAttributes)> {
        let slot = self.slot_of(index)?;
        Some((self.slot(slot), self.slot_attrs(slot)))
    }

    pub fn has(&self, index: u32) -> bool {
        self.slot_of(index).is_some()
    }

    /// Overwrites the value of an existing element.
    pub fn set_value(&mut self, index: u32, value: Value) -> bool {
        match self.slot_of(index) {
            Some(slot) => {
                self.slot_mut(slot).value = value;
                true
            }
            None => false,
        }
    }

    /// Stores `prop` at `index`, creating the element if needed.
    pub fn put(&mut self, index: u32, prop: Property, attrs: PropertyAttributes) {
        if let Some(slot) = self.slot_of(index) {
            *self.slot_mut(slot) = prop;
            self.set_slot_attrs(slot, attrs);
            return;
        }
        if let ArrayStorage::Simple(values) = &self.storage {
            let len = values.len() as u32;
            if index > len.saturating_add(SPARSE_GAP) {
                self.convert_to_sparse();
            }
        }
        let slot = match &mut self.storage {
            ArrayStorage::Simple(values) => {
                let i = index as usize;
                if i >= values.len() {
                    values.resize(i + 1, Property::new(Value::empty()));
                }
                values[i] = prop;
                i
            }
            ArrayStorage::Sparse { map, slots, free } => {
                let slot = match free.pop() {
                    Some(s) => {
                        slots[s as usize] = prop;
                        s
                    }
                    None => {
                        slots.push(prop);
                        (slots.len() - 1) as u32
                    }
                };
                let n = map.insert(index);
                map.set_value(n, slot);
                slot as usize
            }
        };
        self.set_slot_attrs(slot, attrs);
    }

    /// Removes the element at `index`. Attributes are not checked.
    pub fn remove(&mut self, index: u32) {
        let slot = match self.slot_of(index) {
            Some(s) => s,
            None => return,
        };
        match &mut self.storage {
            ArrayStorage::Simple(values) => {
                values[slot] = Property::new(Value::empty());
                while values.last().map_or(false, |p| p.value.is_empty()) {
                    values.pop();
                }
            }
            ArrayStorage::Sparse { map, slots, free } => {
                if let Some(n) = map.find_node(index) {
                    map.erase(n);
                }
                slots[slot] = Property::default();
                free.push(slot as u32);
            }
        }
        if let Some(attrs) = self.attrs.as_mut() {
            if let Some(a) = attrs.get_mut(slot) {
                *a = PropertyAttributes::data();
            }
        }
    }

    pub fn convert_to_sparse(&mut self) {
        let values = match &mut self.storage {
            ArrayStorage::Simple(values) => mem::take(values),
            ArrayStorage::Sparse { .. } => return,
        };
        let old_attrs = self.attrs.take();
        let mut map = SparseArray::new();
        let mut slots = Vec::new();
        let mut attrs = Vec::new();
        for (i, p) in values.into_iter().enumerate() {
            if p.value.is_empty() {
                continue;
            }
            let n = map.insert(i as u32);
            map.set_value(n, slots.len() as u32);
            slots.push(p);
            attrs.push(
                old_attrs
                    .as_ref()
                    .and_then(|a| a.get(i).copied())
                    .unwrap_or_else(PropertyAttributes::data),
            );
        }
        tracing::trace!(target: "jsv4::object", entries = slots.len(), "array storage now sparse");
        self.storage = ArrayStorage::Sparse {
            map,
            slots,
            free: Vec::new(),
        };
        self.attrs = old_attrs.map(|_| attrs);
    }

    /// Smallest present index not below `from`.
    pub fn next_index(&self, from: u32) -> Option<u32> {
        match &self.storage {
            ArrayStorage::Simple(values) => (from as usize..values.len())
                .find(|&i| !values[i].value.is_empty())
                .map(|i| i as u32),
            ArrayStorage::Sparse { map, .. } => {
                let n = map.lower_bound(from);
                if n == map.end() {
                    None
                } else {
                    Some(map.key(n))
                }
            }
        }
    }

    /// Present indices, ascending.
    pub fn indices(&self) -> Vec<u32> {
        match &self.storage {
            ArrayStorage::Simple(values) => values
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.value.is_empty())
                .map(|(i, _)| i as u32)
                .collect(),
            ArrayStorage::Sparse { map, .. } => map.keys(),
        }
    }

    /// One past the highest present index.
    pub fn high_water(&self) -> u32 {
        match &self.storage {
            ArrayStorage::Simple(values) => values.len() as u32,
            ArrayStorage::Sparse { map, .. } => {
                let last = map.previous_node(map.end());
                if last == map.end() {
                    0
                } else {
                    map.key(last) + 1
                }
            }
        }
    }

    /// Removes index 0 and moves every later element down by one.
    pub fn shift(&mut self) -> Option<Property> {
        match &mut self.storage {
            ArrayStorage::Simple(values) => {
                if values.is_empty() {
                    return None;
                }
                let p = values.remove(0);
                if let Some(attrs) = self.attrs.as_mut() {
                    if !attrs.is_empty() {
                        attrs.remove(0);
                    }
                }
                if p.value.is_empty() {
                    None
                } else {
                    Some(p)
                }
            }
            ArrayStorage::Sparse { map, slots, free } => {
                if map.find_node(0).is_none() {
                    let n = map.insert(0);
                    map.set_value(n, u32::MAX);
                }
                let slot = map.pop_front();
                if slot == u32::MAX {
                    return None;
                }
                free.push(slot);
                Some(mem::take(&mut slots[slot as usize]))
            }
        }
    }

    /// Moves every element up by one and stores `value` at index 0.
    pub fn unshift(&mut self, value: Value) {
        match &mut self.storage {
            ArrayStorage::Simple(values) => {
                values.insert(0, Property::new(value));
                if let Some(attrs) = self.attrs.as_mut() {
                    attrs.insert(0, PropertyAttributes::data());
                }
            }
            ArrayStorage::Sparse { map, slots, free } => {
                let slot = match free.pop() {
                    Some(s) => {
                        slots[s as usize] = Property::new(value);
                        s
                    }
                    None => {
                        slots.push(Property::new(value));
                        (slots.len() - 1) as u32
                    }
                };
                map.push_front(slot);
                if let Some(attrs) = self.attrs.as_mut() {
                    if attrs.len() <= slot as usize {
                        attrs.resize(slot as usize + 1, PropertyAttributes::data());
                    }
                    attrs[slot as usize] = PropertyAttributes::data();
                }
            }
        }
    }

    /// Applies `adjust` to the attributes of every present element.
    pub fn adjust_attributes(&mut self, adjust: fn(PropertyAttributes) -> PropertyAttributes) {
        for index in self.indices() {
            if let Some(slot) = self.slot_of(index) {
                let a = adjust(self.slot_attrs(slot));
                self.set_slot_attrs(slot, a);
            }
        }
    }
}

pub enum ObjectKind {
    Ordinary,
    Array { length: u32, length_writable: bool },
    Function(FunctionKind),
    Boolean(bool),
    Number(f64),
    String(Value),
    Error(ErrorType),
    Arguments,
    RegExp { source: Rc<str>, flags: Rc<str> },
    ForeachIterator(ObjectIterator),
}

pub struct ObjectData {
    pub members: Vec<Property>,
    pub array: ArrayData,
    pub kind: ObjectKind,
}

impl ObjectData {
    pub fn new(kind: ObjectKind) -> Self {
        ObjectData {
            members: Vec::new(),
            array: ArrayData::new(),
            kind,
        }
    }

    pub fn ordinary() -> Self {
        ObjectData::new(ObjectKind::Ordinary)
    }

    pub fn array(values: Vec<Value>) -> Self {
        let length = values.len() as u32;
        ObjectData {
            members: Vec::new(),
            array: ArrayData::from_values(values),
            kind: ObjectKind::Array {
                length,
                length_writable: true,
            },
        }
    }
}

pub(crate) const fn object_vtable(ty: ManagedType, class_name: &'static str) -> ObjectVTable {
    ObjectVTable {
        managed: managed_vtable(ty, class_name),
        call: not_callable,
        construct: not_a_constructor,
        get: ordinary_get,
        get_indexed: ordinary_get_indexed,
        put: ordinary_put,
        put_indexed: ordinary_put_indexed,
        query: ordinary_query,
        query_indexed: ordinary_query_indexed,
        delete_property: ordinary_delete_property,
        delete_indexed_property: ordinary_delete_indexed_property,
        get_lookup: ordinary_get_lookup,
        set_lookup: ordinary_set_lookup,
        get_length: ordinary_get_length,
        advance_iterator: ordinary_advance_iterator,
    }
}

pub static OBJECT_VTABLE: ObjectVTable = object_vtable(ManagedType::Object, "Object");

pub static ARRAY_OBJECT_VTABLE: ObjectVTable = ObjectVTable {
    get: array_get,
    put: array_put,
    put_indexed: array_put_indexed,
    query: array_query,
    delete_property: array_delete_property,
    get_length: array_get_length,
    ..object_vtable(ManagedType::ArrayObject, "Array")
};

pub static BOOLEAN_OBJECT_VTABLE: ObjectVTable = object_vtable(ManagedType::BooleanObject, "Boolean");

pub static NUMBER_OBJECT_VTABLE: ObjectVTable = object_vtable(ManagedType::NumberObject, "Number");

pub static STRING_OBJECT_VTABLE: ObjectVTable = ObjectVTable {
    get: string_object_get,
    get_indexed: string_object_get_indexed,
    put_indexed: string_object_put_indexed,
    query: string_object_query,
    query_indexed: string_object_query_indexed,
    delete_property: string_object_delete_property,
    delete_indexed_property: string_object_delete_indexed_property,
    get_length: string_object_get_length,
    advance_iterator: string_object_advance_iterator,
    ..object_vtable(ManagedType::StringObject, "String")
};

pub static ERROR_OBJECT_VTABLE: ObjectVTable = object_vtable(ManagedType::ErrorObject, "Error");

pub static ARGUMENTS_OBJECT_VTABLE: ObjectVTable =
    object_vtable(ManagedType::ArgumentsObject, "Arguments");

pub static REGEXP_OBJECT_VTABLE: ObjectVTable = object_vtable(ManagedType::RegExpObject, "RegExp");

pub static FOREACH_ITERATOR_VTABLE: ObjectVTable =
    object_vtable(ManagedType::ForeachIteratorObject, "__ForeachIterator");

managed_kind!(PlainObject, OBJECT_VTABLE.managed);
managed_kind!(ArrayObject, ARRAY_OBJECT_VTABLE.managed);
managed_kind!(BooleanObject, BOOLEAN_OBJECT_VTABLE.managed);
managed_kind!(NumberObject, NUMBER_OBJECT_VTABLE.managed);
managed_kind!(StringObject, STRING_OBJECT_VTABLE.managed);
managed_kind!(ErrorObject, ERROR_OBJECT_VTABLE.managed);
managed_kind!(ArgumentsObject, ARGUMENTS_OBJECT_VTABLE.managed);
managed_kind!(RegExpObject, REGEXP_OBJECT_VTABLE.managed);
managed_kind!(ForeachIteratorObject, FOREACH_ITERATOR_VTABLE.managed);

// ── Dispatch ──

fn vtable(engine: &ExecutionEngine, m: ManagedRef) -> &'static ObjectVTable {
    engine.vtable_of(m).object().unwrap_or(&OBJECT_VTABLE)
}

/// Name's array index, `u32::MAX` if it is not one.
fn name_index(engine: &ExecutionEngine, id: Identifier) -> u32 {
    string_to_array_index(engine.identifiers.name(id))
}

pub fn get(engine: &mut ExecutionEngine, m: ManagedRef, id: Identifier) -> ReturnedValue {
    let v = (vtable(engine, m).get)(engine, m, id)?;
    Ok(v.unwrap_or_else(Value::undefined))
}

pub fn get_indexed(engine: &mut ExecutionEngine, m: ManagedRef, index: u32) -> ReturnedValue {
    let v = (vtable(engine, m).get_indexed)(engine, m, index)?;
    Ok(v.unwrap_or_else(Value::undefined))
}

pub fn put(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
    value: Value,
) -> Result<(), ExceptionSignal> {
    (vtable(engine, m).put)(engine, m, id, value)
}

pub fn put_indexed(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
    value: Value,
) -> Result<(), ExceptionSignal> {
    (vtable(engine, m).put_indexed)(engine, m, index, value)
}

pub fn query(engine: &ExecutionEngine, m: ManagedRef, id: Identifier) -> PropertyAttributes {
    (vtable(engine, m).query)(engine, m, id)
}

pub fn query_indexed(engine: &ExecutionEngine, m: ManagedRef, index: u32) -> PropertyAttributes {
    (vtable(engine, m).query_indexed)(engine, m, index)
}

pub fn delete_property(engine: &mut ExecutionEngine, m: ManagedRef, id: Identifier) -> bool {
    (vtable(engine, m).delete_property)(engine, m, id)
}

pub fn delete_indexed_property(engine: &mut ExecutionEngine, m: ManagedRef, index: u32) -> bool {
    (vtable(engine, m).delete_indexed_property)(engine, m, index)
}

pub fn get_length(engine: &ExecutionEngine, m: ManagedRef) -> u32 {
    (vtable(engine, m).get_length)(engine, m)
}

pub fn get_lookup(engine: &mut ExecutionEngine, m: ManagedRef, l: &mut Lookup) -> ReturnedValue {
    (vtable(engine, m).get_lookup)(engine, m, l)
}

pub fn set_lookup(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    l: &mut Lookup,
    value: Value,
) -> Result<(), ExceptionSignal> {
    (vtable(engine, m).set_lookup)(engine, m, l, value)
}

pub fn call(engine: &mut ExecutionEngine, m: ManagedRef, data: &CallData) -> ReturnedValue {
    (vtable(engine, m).call)(engine, m, data)
}

pub fn construct(engine: &mut ExecutionEngine, m: ManagedRef, data: &CallData) -> ReturnedValue {
    (vtable(engine, m).construct)(engine, m, data)
}

// ── Member helpers ──

pub fn member_at(engine: &ExecutionEngine, m: ManagedRef, slot: u32) -> Property {
    engine
        .heap
        .object(m)
        .and_then(|o| o.members.get(slot as usize).copied())
        .unwrap_or_default()
}

pub fn set_member_at(engine: &mut ExecutionEngine, m: ManagedRef, slot: u32, p: Property) {
    if let Some(o) = engine.heap.object_mut(m) {
        let slot = slot as usize;
        if slot >= o.members.len() {
            o.members.resize(slot + 1, Property::default());
        }
        o.members[slot] = p;
    }
}

/// Adds (or redefines) member `id` with exactly `attrs`.
pub fn insert_member(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
    p: Property,
    attrs: PropertyAttributes,
) {
    let class = engine.class_of(m);
    let (new_class, slot) = engine.classes.add_member(class, id, attrs);
    let header = engine.heap.header_mut(m);
    header.internal_class = new_class;
    if attrs.is_accessor() {
        header.flags.set_has_accessor_property(true);
    }
    set_member_at(engine, m, slot, p);
}

fn own_member(engine: &ExecutionEngine, m: ManagedRef, id: Identifier) -> Option<(u32, PropertyAttributes)> {
    let class = engine.classes.get(engine.class_of(m));
    class.find(id).map(|slot| (slot, class.attributes_at(slot)))
}

fn own_element(engine: &ExecutionEngine, m: ManagedRef, index: u32) -> Option<(Property, PropertyAttributes)> {
    engine.heap.object(m).and_then(|o| o.array.get(index))
}

pub fn is_extensible(engine: &ExecutionEngine, m: ManagedRef) -> bool {
    engine.heap.header(m).flags.extensible()
}

/// Reads a slot: the value itself, or the getter's result.
pub fn property_value(
    engine: &mut ExecutionEngine,
    this: Value,
    p: Property,
    attrs: PropertyAttributes,
) -> ReturnedValue {
    if !attrs.is_accessor() {
        return Ok(p.value);
    }
    match p.getter() {
        Some(getter) => engine.call_function(getter, this, Vec::new()),
        None => Ok(Value::undefined()),
    }
}

fn call_setter(
    engine: &mut ExecutionEngine,
    this: ManagedRef,
    p: Property,
    value: Value,
) -> Result<bool, ExceptionSignal> {
    match p.setter() {
        Some(setter) => {
            engine.call_function(setter, Value::from_managed(this), vec![value])?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// A failed assignment: TypeError in strict code, silently ignored otherwise.
fn reject(engine: &mut ExecutionEngine, what: &str) -> Result<bool, ExceptionSignal> {
    if engine.current_strict() {
        Err(engine.throw_type_error(format!("Cannot assign to read-only property \"{}\"", what)))
    } else {
        Ok(false)
    }
}

// ── Ordinary objects ──

fn not_callable(engine: &mut ExecutionEngine, _: ManagedRef, _: &CallData) -> ReturnedValue {
    Err(engine.throw_type_error("object is not a function"))
}

fn not_a_constructor(engine: &mut ExecutionEngine, _: ManagedRef, _: &CallData) -> ReturnedValue {
    Err(engine.throw_type_error("object is not a constructor"))
}

fn ordinary_get(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
) -> Result<Option<Value>, ExceptionSignal> {
    let index = name_index(engine, id);
    if index != u32::MAX {
        return (vtable(engine, m).get_indexed)(engine, m, index);
    }
    let mut o = Some(m);
    while let Some(cur) = o {
        if let Some((slot, attrs)) = own_member(engine, cur, id) {
            let p = member_at(engine, cur, slot);
            return property_value(engine, Value::from_managed(m), p, attrs).map(Some);
        }
        o = engine.prototype_of(cur);
    }
    Ok(None)
}

fn ordinary_get_indexed(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
) -> Result<Option<Value>, ExceptionSignal> {
    let mut o = Some(m);
    while let Some(cur) = o {
        if let Some((p, attrs)) = own_element(engine, cur, index) {
            return property_value(engine, Value::from_managed(m), p, attrs).map(Some);
        }
        o = engine.prototype_of(cur);
    }
    Ok(None)
}

/// Assignment of ECMA-262 §8.12.5. Returns whether the value was stored.
fn put_member(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
    value: Value,
) -> Result<bool, ExceptionSignal> {
    if let Some((slot, attrs)) = own_member(engine, m, id) {
        if attrs.is_accessor() {
            let p = member_at(engine, m, slot);
            if call_setter(engine, m, p, value)? {
                return Ok(true);
            }
        } else if attrs.is_writable() {
            let mut p = member_at(engine, m, slot);
            p.value = value;
            set_member_at(engine, m, slot, p);
            return Ok(true);
        }
        let name = engine.identifiers.name_rc(id);
        return reject(engine, &name);
    }
    if !is_extensible(engine, m) {
        let name = engine.identifiers.name_rc(id);
        return reject(engine, &name);
    }
    let mut o = engine.prototype_of(m);
    while let Some(cur) = o {
        if let Some((slot, attrs)) = own_member(engine, cur, id) {
            if attrs.is_accessor() {
                let p = member_at(engine, cur, slot);
                if call_setter(engine, m, p, value)? {
                    return Ok(true);
                }
                let name = engine.identifiers.name_rc(id);
                return reject(engine, &name);
            }
            if !attrs.is_writable() {
                let name = engine.identifiers.name_rc(id);
                return reject(engine, &name);
            }
            break;
        }
        o = engine.prototype_of(cur);
    }
    insert_member(engine, m, id, Property::new(value), PropertyAttributes::data());
    Ok(true)
}

fn put_element(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
    value: Value,
) -> Result<bool, ExceptionSignal> {
    if let Some((p, attrs)) = own_element(engine, m, index) {
        if attrs.is_accessor() {
            if call_setter(engine, m, p, value)? {
                return Ok(true);
            }
        } else if attrs.is_writable() {
            if let Some(o) = engine.heap.object_mut(m) {
                o.array.set_value(index, value);
            }
            return Ok(true);
        }
        return reject(engine, &index.to_string());
    }
    if !is_extensible(engine, m) {
        return reject(engine, &index.to_string());
    }
    let mut o = engine.prototype_of(m);
    while let Some(cur) = o {
        if let Some((p, attrs)) = own_element(engine, cur, index) {
            if attrs.is_accessor() {
                if call_setter(engine, m, p, value)? {
                    return Ok(true);
                }
                return reject(engine, &index.to_string());
            }
            if !attrs.is_writable() {
                return reject(engine, &index.to_string());
            }
            break;
        }
        o = engine.prototype_of(cur);
    }
    if let Some(o) = engine.heap.object_mut(m) {
        o.array.put(index, Property::new(value), PropertyAttributes::data());
    }
    Ok(true)
}

fn ordinary_put(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
    value: Value,
) -> Result<(), ExceptionSignal> {
    let index = name_index(engine, id);
    if index != u32::MAX {
        return (vtable(engine, m).put_indexed)(engine, m, index, value);
    }
    put_member(engine, m, id, value).map(|_| ())
}

fn ordinary_put_indexed(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
    value: Value,
) -> Result<(), ExceptionSignal> {
    put_element(engine, m, index, value).map(|_| ())
}

fn ordinary_query(engine: &ExecutionEngine, m: ManagedRef, id: Identifier) -> PropertyAttributes {
    let index = name_index(engine, id);
    if index != u32::MAX {
        return (vtable(engine, m).query_indexed)(engine, m, index);
    }
    let mut o = Some(m);
    while let Some(cur) = o {
        if let Some((_, attrs)) = own_member(engine, cur, id) {
            return attrs;
        }
        o = engine.prototype_of(cur);
    }
    PropertyAttributes::generic()
}

fn ordinary_query_indexed(engine: &ExecutionEngine, m: ManagedRef, index: u32) -> PropertyAttributes {
    let mut o = Some(m);
    while let Some(cur) = o {
        if let Some((_, attrs)) = own_element(engine, cur, index) {
            return attrs;
        }
        o = engine.prototype_of(cur);
    }
    PropertyAttributes::generic()
}

fn ordinary_delete_property(engine: &mut ExecutionEngine, m: ManagedRef, id: Identifier) -> bool {
    let index = name_index(engine, id);
    if index != u32::MAX {
        return (vtable(engine, m).delete_indexed_property)(engine, m, index);
    }
    let (slot, attrs) = match own_member(engine, m, id) {
        Some(found) => found,
        None => return true,
    };
    if !attrs.is_configurable() {
        return false;
    }
    let class = engine.class_of(m);
    let new_class = engine.classes.remove_member(class, id);
    engine.heap.header_mut(m).internal_class = new_class;
    if let Some(o) = engine.heap.object_mut(m) {
        if (slot as usize) < o.members.len() {
            o.members.remove(slot as usize);
        }
    }
    true
}

fn ordinary_delete_indexed_property(engine: &mut ExecutionEngine, m: ManagedRef, index: u32) -> bool {
    match own_element(engine, m, index) {
        None => true,
        Some((_, attrs)) if !attrs.is_configurable() => false,
        Some(_) => {
            if let Some(o) = engine.heap.object_mut(m) {
                o.array.remove(index);
            }
            true
        }
    }
}

/// Reads through the inline cache. Only own data members are cached.
fn ordinary_get_lookup(engine: &mut ExecutionEngine, m: ManagedRef, l: &mut Lookup) -> ReturnedValue {
    let class = engine.class_of(m);
    if let Some(slot) = l.probe(class) {
        return Ok(member_at(engine, m, slot).value);
    }
    if let Some((slot, attrs)) = own_member(engine, m, l.name) {
        if !attrs.is_accessor() {
            l.remember(class, slot);
            return Ok(member_at(engine, m, slot).value);
        }
    }
    get(engine, m, l.name)
}

/// Writes through the inline cache. Only own writable data members are cached.
fn ordinary_set_lookup(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    l: &mut Lookup,
    value: Value,
) -> Result<(), ExceptionSignal> {
    let class = engine.class_of(m);
    let slot = match l.probe(class) {
        Some(slot) => Some(slot),
        None => match own_member(engine, m, l.name) {
            Some((slot, attrs)) if !attrs.is_accessor() && attrs.is_writable() => {
                l.remember(class, slot);
                Some(slot)
            }
            _ => None,
        },
    };
    match slot {
        Some(slot) => {
            set_member_at(engine, m, slot, Property::new(value));
            Ok(())
        }
        None => put(engine, m, l.name, value),
    }
}

fn ordinary_get_length(engine: &ExecutionEngine, m: ManagedRef) -> u32 {
    match own_member(engine, m, engine.ids.length) {
        Some((slot, attrs)) if !attrs.is_accessor() => {
            member_at(engine, m, slot).value.to_uint32(&engine.heap)
        }
        _ => 0,
    }
}

fn ordinary_advance_iterator(
    engine: &ExecutionEngine,
    m: ManagedRef,
    it: &mut ObjectIterator,
) -> Option<(PropertyKey, PropertyAttributes)> {
    let o = engine.heap.object(m)?;
    if let Some(index) = o.array.next_index(it.array_index) {
        it.array_index = index.saturating_add(1);
        let attrs = o.array.get(index).map_or_else(PropertyAttributes::data, |(_, a)| a);
        return Some((PropertyKey::Index(index), attrs));
    }
    it.array_index = u32::MAX;
    let class = engine.classes.get(engine.class_of(m));
    if it.member_index < class.size() {
        let slot = it.member_index;
        it.member_index += 1;
        return Some((PropertyKey::Name(class.name_at(slot)), class.attributes_at(slot)));
    }
    None
}

// ── Arrays ──

pub fn array_length(engine: &ExecutionEngine, m: ManagedRef) -> u32 {
    match engine.heap.object(m).map(|o| &o.kind) {
        Some(ObjectKind::Array { length, .. }) => *length,
        _ => 0,
    }
}

fn set_length_field(engine: &mut ExecutionEngine, m: ManagedRef, new_length: u32) {
    if let Some(ObjectKind::Array { length, .. }) = engine.heap.object_mut(m).map(|o| &mut o.kind) {
        *length = new_length;
    }
}

fn length_writable(engine: &ExecutionEngine, m: ManagedRef) -> bool {
    matches!(
        engine.heap.object(m).map(|o| &o.kind),
        Some(ObjectKind::Array {
            length_writable: true,
            ..
        })
    )
}

/// `array.length = value` (ECMA-262 §15.4.5.1). Truncation stops at the first
/// element that cannot be deleted.
pub fn set_array_length(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    value: Value,
) -> Result<bool, ExceptionSignal> {
    let new_len = match value.as_array_length(&engine.heap) {
        Some(l) => l,
        None => return Err(engine.throw_range_error("Invalid array length")),
    };
    if !length_writable(engine, m) {
        return reject(engine, "length");
    }
    let old_len = array_length(engine, m);
    if new_len < old_len {
        let doomed: Vec<u32> = match engine.heap.object(m) {
            Some(o) => o.array.indices().into_iter().filter(|&i| i >= new_len).collect(),
            None => Vec::new(),
        };
        for index in doomed.into_iter().rev() {
            let configurable = own_element(engine, m, index).map_or(true, |(_, a)| a.is_configurable());
            if !configurable {
                set_length_field(engine, m, index + 1);
                return reject(engine, "length");
            }
            if let Some(o) = engine.heap.object_mut(m) {
                o.array.remove(index);
            }
        }
    }
    set_length_field(engine, m, new_len);
    Ok(true)
}

fn array_get(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
) -> Result<Option<Value>, ExceptionSignal> {
    if id == engine.ids.length {
        return Ok(Some(Value::from_uint32(array_length(engine, m))));
    }
    ordinary_get(engine, m, id)
}

fn array_put(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
    value: Value,
) -> Result<(), ExceptionSignal> {
    if id == engine.ids.length {
        return set_array_length(engine, m, value).map(|_| ());
    }
    ordinary_put(engine, m, id, value)
}

fn array_put_indexed(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
    value: Value,
) -> Result<(), ExceptionSignal> {
    let len = array_length(engine, m);
    if index >= len && !length_writable(engine, m) {
        return reject(engine, &index.to_string()).map(|_| ());
    }
    if put_element(engine, m, index, value)? && index >= len {
        set_length_field(engine, m, index + 1);
    }
    Ok(())
}

fn array_query(engine: &ExecutionEngine, m: ManagedRef, id: Identifier) -> PropertyAttributes {
    if id == engine.ids.length {
        let mut a = PropertyAttributes::from_flags(ATTR_READ_ONLY);
        a.set_writable(length_writable(engine, m));
        return a;
    }
    ordinary_query(engine, m, id)
}

fn array_delete_property(engine: &mut ExecutionEngine, m: ManagedRef, id: Identifier) -> bool {
    if id == engine.ids.length {
        return false;
    }
    ordinary_delete_property(engine, m, id)
}

fn array_get_length(engine: &ExecutionEngine, m: ManagedRef) -> u32 {
    array_length(engine, m)
}

// ── String wrappers ──

fn wrapped_string(engine: &ExecutionEngine, m: ManagedRef) -> Option<Vec<u16>> {
    match engine.heap.object(m).map(|o| &o.kind) {
        Some(ObjectKind::String(v)) => v
            .as_managed()
            .and_then(|s| engine.heap.string(s))
            .map(|s| s.as_str().encode_utf16().collect()),
        _ => None,
    }
}

fn string_object_get_length(engine: &ExecutionEngine, m: ManagedRef) -> u32 {
    wrapped_string(engine, m).map_or(0, |s| s.len() as u32)
}

fn string_object_get(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
) -> Result<Option<Value>, ExceptionSignal> {
    if id == engine.ids.length {
        return Ok(Some(Value::from_uint32(string_object_get_length(engine, m))));
    }
    ordinary_get(engine, m, id)
}

fn string_object_get_indexed(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
) -> Result<Option<Value>, ExceptionSignal> {
    if let Some(unit) = wrapped_string(engine, m).and_then(|s| s.get(index as usize).copied()) {
        let text = String::from_utf16_lossy(&[unit]);
        return engine.new_string(&text).map(Some);
    }
    ordinary_get_indexed(engine, m, index)
}

fn string_object_put_indexed(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
    value: Value,
) -> Result<(), ExceptionSignal> {
    if index < string_object_get_length(engine, m) {
        return reject(engine, &index.to_string()).map(|_| ());
    }
    ordinary_put_indexed(engine, m, index, value)
}

fn string_object_query(engine: &ExecutionEngine, m: ManagedRef, id: Identifier) -> PropertyAttributes {
    if id == engine.ids.length {
        return PropertyAttributes::from_flags(ATTR_READ_ONLY);
    }
    ordinary_query(engine, m, id)
}

fn string_object_query_indexed(engine: &ExecutionEngine, m: ManagedRef, index: u32) -> PropertyAttributes {
    if index < string_object_get_length(engine, m) {
        let mut a = PropertyAttributes::from_flags(ATTR_READ_ONLY);
        a.set_enumerable(true);
        return a;
    }
    ordinary_query_indexed(engine, m, index)
}

fn string_object_delete_property(engine: &mut ExecutionEngine, m: ManagedRef, id: Identifier) -> bool {
    if id == engine.ids.length {
        return false;
    }
    ordinary_delete_property(engine, m, id)
}

fn string_object_delete_indexed_property(engine: &mut ExecutionEngine, m: ManagedRef, index: u32) -> bool {
    if index < string_object_get_length(engine, m) {
        return false;
    }
    ordinary_delete_indexed_property(engine, m, index)
}

fn string_object_advance_iterator(
    engine: &ExecutionEngine,
    m: ManagedRef,
    it: &mut ObjectIterator,
) -> Option<(PropertyKey, PropertyAttributes)> {
    let len = string_object_get_length(engine, m);
    if it.member_index == 0 && it.array_index < len {
        let index = it.array_index;
        it.array_index += 1;
        return Some((PropertyKey::Index(index), string_object_query_indexed(engine, m, index)));
    }
    ordinary_advance_iterator(engine, m, it)
}

// ── Descriptors ──

/// Validates a redefinition against the current slot (ECMA-262 §8.12.9 steps
/// 5 to 12). Returns the merged slot, or None when it must be rejected.
fn redefine(
    heap: &MemoryManager,
    mut current: Property,
    mut cattrs: PropertyAttributes,
    desc: &Property,
    dattrs: PropertyAttributes,
) -> Option<(Property, PropertyAttributes)> {
    if dattrs.is_empty() || desc.is_subset(dattrs, &current, cattrs, heap) {
        return Some((current, cattrs));
    }
    if !cattrs.is_configurable() {
        if dattrs.has_configurable() && dattrs.is_configurable() {
            return None;
        }
        if dattrs.has_enumerable() && dattrs.is_enumerable() != cattrs.is_enumerable() {
            return None;
        }
    }
    if !dattrs.is_generic() {
        let to_accessor = dattrs.property_type() == PropertyType::Accessor;
        if cattrs.is_accessor() != to_accessor {
            if !cattrs.is_configurable() {
                return None;
            }
            if to_accessor {
                cattrs.set_type(PropertyType::Accessor);
                cattrs.clear_writable();
                current = Property::accessor(None, None);
            } else {
                cattrs.set_type(PropertyType::Data);
                cattrs.set_writable(false);
                current = Property::new(Value::undefined());
            }
        } else if !cattrs.is_accessor() {
            if !cattrs.is_configurable() && !cattrs.is_writable() {
                if dattrs.has_writable() && dattrs.is_writable() {
                    return None;
                }
                if dattrs.has_type()
                    && !desc.value.is_empty()
                    && !crate::runner::ds::property::same_value(desc.value, current.value, heap)
                {
                    return None;
                }
            }
        } else if !cattrs.is_configurable() {
            if !desc.value.is_empty() && desc.getter() != current.getter() {
                return None;
            }
            if !desc.set.is_empty() && desc.setter() != current.setter() {
                return None;
            }
        }
    }
    current.merge(&mut cattrs, desc, dattrs);
    cattrs.resolve();
    Some((current, cattrs))
}

fn define_rejected(engine: &mut ExecutionEngine, what: &str) -> Result<bool, ExceptionSignal> {
    Err(engine.throw_type_error(format!("Cannot redefine property: {}", what)))
}

/// `[[DefineOwnProperty]]` with `throw` set: refusals raise a TypeError.
pub fn define_own_property(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    id: Identifier,
    desc: Property,
    dattrs: PropertyAttributes,
) -> Result<bool, ExceptionSignal> {
    let index = name_index(engine, id);
    if index != u32::MAX {
        return define_own_indexed_property(engine, m, index, desc, dattrs);
    }
    if id == engine.ids.length && engine.vtable_of(m).is::<ArrayObject>() {
        if dattrs.is_accessor() || (dattrs.has_configurable() && dattrs.is_configurable()) {
            return define_rejected(engine, "length");
        }
        if dattrs.has_type() && !desc.value.is_empty() && !set_array_length(engine, m, desc.value)? {
            return define_rejected(engine, "length");
        }
        if dattrs.has_writable() && !dattrs.is_writable() {
            if let Some(ObjectKind::Array { length_writable, .. }) =
                engine.heap.object_mut(m).map(|o| &mut o.kind)
            {
                *length_writable = false;
            }
        }
        return Ok(true);
    }
    match own_member(engine, m, id) {
        None => {
            if !is_extensible(engine, m) {
                let name = engine.identifiers.name_rc(id);
                return define_rejected(engine, &name);
            }
            let mut p = desc;
            let mut a = dattrs;
            p.fully_populated(&mut a);
            insert_member(engine, m, id, p, a);
            Ok(true)
        }
        Some((slot, cattrs)) => {
            let current = member_at(engine, m, slot);
            match redefine(&engine.heap, current, cattrs, &desc, dattrs) {
                Some((p, a)) => {
                    if a != cattrs {
                        let class = engine.class_of(m);
                        let (new_class, _) = engine.classes.change_member(class, id, a);
                        let header = engine.heap.header_mut(m);
                        header.internal_class = new_class;
                        if a.is_accessor() {
                            header.flags.set_has_accessor_property(true);
                        }
                    }
                    set_member_at(engine, m, slot, p);
                    Ok(true)
                }
                None => {
                    let name = engine.identifiers.name_rc(id);
                    define_rejected(engine, &name)
                }
            }
        }
    }
}

pub fn define_own_indexed_property(
    engine: &mut ExecutionEngine,
    m: ManagedRef,
    index: u32,
    desc: Property,
    dattrs: PropertyAttributes,
) -> Result<bool, ExceptionSignal> {
    let is_array = engine.vtable_of(m).is::<ArrayObject>();
    if is_array && index >= array_length(engine, m) && !length_writable(engine, m) {
        return define_rejected(engine, &index.to_string());
    }
    let stored = match own_element(engine, m, index) {
        None => {
            if !is_extensible(engine, m) {
                return define_rejected(engine, &index.to_string());
            }
            let mut p = desc;
            let mut a = dattrs;
            p.fully_populated(&mut a);
            (p, a)
        }
        Some((current, cattrs)) => match redefine(&engine.heap, current, cattrs, &desc, dattrs) {
            Some(merged) => merged,
            None => return define_rejected(engine, &index.to_string()),
        },
    };
    if let Some(o) = engine.heap.object_mut(m) {
        o.array.put(index, stored.0, stored.1);
    }
    if is_array && index >= array_length(engine, m) {
        set_length_field(engine, m, index + 1);
    }
    Ok(true)
}

/// Own property descriptor, without running getters.
pub fn get_own_property(
    engine: &ExecutionEngine,
    m: ManagedRef,
    key: PropertyKey,
) -> Option<(Property, PropertyAttributes)> {
    match key {
        PropertyKey::Index(index) => own_element(engine, m, index),
        PropertyKey::Name(id) => {
            let index = name_index(engine, id);
            if index != u32::MAX {
                return own_element(engine, m, index);
            }
            own_member(engine, m, id).map(|(slot, attrs)| (member_at(engine, m, slot), attrs))
        }
    }
}

pub fn has_own_property(engine: &ExecutionEngine, m: ManagedRef, key: PropertyKey) -> bool {
    if get_own_property(engine, m, key).is_some() {
        return true;
    }
    let vt = engine.vtable_of(m);
    match key {
        PropertyKey::Name(id) if id == engine.ids.length => {
            vt.is::<ArrayObject>() || vt.is::<StringObject>()
        }
        PropertyKey::Index(index) if vt.is::<StringObject>() => {
            index < string_object_get_length(engine, m)
        }
        _ => false,
    }
}

// ── Integrity levels ──

pub fn prevent_extensions(engine: &mut ExecutionEngine, m: ManagedRef) {
    engine.heap.header_mut(m).flags.set_extensible(false);
}

pub fn seal(engine: &mut ExecutionEngine, m: ManagedRef) {
    prevent_extensions(engine, m);
    let class = engine.class_of(m);
    let sealed = engine.classes.sealed(class);
    engine.heap.header_mut(m).internal_class = sealed;
    if let Some(o) = engine.heap.object_mut(m) {
        o.array.adjust_attributes(|mut a| {
            a.set_configurable(false);
            a
        });
    }
}

pub fn freeze(engine: &mut ExecutionEngine, m: ManagedRef) {
    prevent_extensions(engine, m);
    let class = engine.class_of(m);
    let frozen = engine.classes.frozen(class);
    engine.heap.header_mut(m).internal_class = frozen;
    if let Some(o) = engine.heap.object_mut(m) {
        o.array.adjust_attributes(|mut a| {
            if !a.is_accessor() {
                a.set_writable(false);
            }
            a.set_configurable(false);
            a
        });
        if let ObjectKind::Array { length_writable, .. } = &mut o.kind {
            *length_writable = false;
        }
    }
}

fn elements_all(engine: &ExecutionEngine, m: ManagedRef, pred: fn(PropertyAttributes) -> bool) -> bool {
    match engine.heap.object(m) {
        Some(o) => o
            .array
            .indices()
            .into_iter()
            .all(|i| o.array.get(i).map_or(true, |(_, a)| pred(a))),
        None => true,
    }
}

pub fn is_sealed(engine: &ExecutionEngine, m: ManagedRef) -> bool {
    !is_extensible(engine, m)
        && engine.classes.is_sealed(engine.class_of(m))
        && elements_all(engine, m, |a| !a.is_configurable())
}

pub fn is_frozen(engine: &ExecutionEngine, m: ManagedRef) -> bool {
    let length_ok = !engine.vtable_of(m).is::<ArrayObject>() || !length_writable(engine, m);
    !is_extensible(engine, m)
        && length_ok
        && engine.classes.is_frozen(engine.class_of(m))
        && elements_all(engine, m, |a| {
            !a.is_configurable() && (a.is_accessor() || !a.is_writable())
        })
}

// ── Enumeration ──

/// Next enumerable key of a `for-in` walk, skipping shadowed names.
pub fn next_enumerable_key(engine: &ExecutionEngine, it: &mut ObjectIterator) -> Option<PropertyKey> {
    loop {
        let cur = it.current?;
        match (vtable(engine, cur).advance_iterator)(engine, cur, it) {
            Some((key, attrs)) => {
                if !attrs.is_enumerable() {
                    continue;
                }
                if it.visited.iter().any(|&v| has_own_property(engine, v, key)) {
                    continue;
                }
                return Some(key);
            }
            None => {
                it.visited.push(cur);
                it.current = engine.prototype_of(cur);
                it.array_index = 0;
                it.member_index = 0;
            }
        }
    }
}

/// Own enumerable keys in enumeration order.
pub fn own_enumerable_keys(engine: &ExecutionEngine, m: ManagedRef) -> Vec<PropertyKey> {
    let mut it = ObjectIterator::new(Some(m));
    let mut keys = Vec::new();
    while let Some((key, attrs)) = (vtable(engine, m).advance_iterator)(engine, m, &mut it) {
        if attrs.is_enumerable() {
            keys.push(key);
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::config::EngineConfig;
    use crate::runner::ds::property::ATTR_ACCESSOR;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(EngineConfig::default())
    }

    #[test]
    fn test_array_data_dense_to_sparse() {
        let mut a = ArrayData::new();
        a.put(0, Property::new(Value::from_int32(1)), PropertyAttributes::data());
        a.put(1, Property::new(Value::from_int32(2)), PropertyAttributes::data());
        assert!(!a.is_sparse());
        a.put(10_000, Property::new(Value::from_int32(3)), PropertyAttributes::data());
        assert!(a.is_sparse());
        assert_eq!(a.indices(), vec![0, 1, 10_000]);
        assert_eq!(a.high_water(), 10_001);
        assert_eq!(a.get(10_000).map(|(p, _)| p.value.int_32()), Some(3));
        assert!(a.get(5).is_none());
        a.remove(1);
        assert_eq!(a.next_index(1), Some(10_000));
    }

    #[test]
    fn test_array_data_shift_and_unshift_keep_order() {
        let mut dense = ArrayData::from_values(vec![Value::from_int32(7), Value::from_int32(8)]);
        dense.unshift(Value::from_int32(6));
        assert_eq!(dense.shift().map(|p| p.value.int_32()), Some(6));
        assert_eq!(dense.get(0).map(|(p, _)| p.value.int_32()), Some(7));

        let mut sparse = ArrayData::new();
        sparse.put(3, Property::new(Value::from_int32(30)), PropertyAttributes::data());
        sparse.put(500, Property::new(Value::from_int32(50)), PropertyAttributes::data());
        assert!(sparse.is_sparse());
        // index 0 is a hole: shift yields nothing but still moves everything down
        assert!(sparse.shift().is_none());
        assert_eq!(sparse.indices(), vec![2, 499]);
        sparse.unshift(Value::from_int32(1));
        assert_eq!(sparse.indices(), vec![0, 3, 500]);
    }

    #[test]
    fn test_put_then_get_member() {
        let mut e = engine();
        let o = e.new_object().unwrap();
        let x = e.identifiers.intern("x");
        put(&mut e, o, x, Value::from_int32(42)).unwrap();
        assert_eq!(get(&mut e, o, x).unwrap().int_32(), 42);
        let y = e.identifiers.intern("y");
        assert!(get(&mut e, o, y).unwrap().is_undefined());
        assert!(query(&e, o, y).is_empty());
    }

    #[test]
    fn test_same_shape_objects_share_class() {
        let mut e = engine();
        let a = e.new_object().unwrap();
        let b = e.new_object().unwrap();
        let x = e.identifiers.intern("x");
        let y = e.identifiers.intern("y");
        for o in [a, b] {
            put(&mut e, o, x, Value::from_int32(1)).unwrap();
            put(&mut e, o, y, Value::from_int32(2)).unwrap();
        }
        assert_eq!(e.class_of(a), e.class_of(b));
    }

    #[test]
    fn test_delete_shifts_member_slots() {
        let mut e = engine();
        let o = e.new_object().unwrap();
        let ids: Vec<_> = ["a", "b", "c"].iter().map(|n| e.identifiers.intern(n)).collect();
        for (i, id) in ids.iter().enumerate() {
            put(&mut e, o, *id, Value::from_int32(i as i32)).unwrap();
        }
        assert!(delete_property(&mut e, o, ids[1]));
        assert_eq!(get(&mut e, o, ids[0]).unwrap().int_32(), 0);
        assert_eq!(get(&mut e, o, ids[2]).unwrap().int_32(), 2);
        assert!(get(&mut e, o, ids[1]).unwrap().is_undefined());
    }

    #[test]
    fn test_frozen_object_ignores_writes_in_sloppy_mode() {
        let mut e = engine();
        let o = e.new_object().unwrap();
        let x = e.identifiers.intern("x");
        put(&mut e, o, x, Value::from_int32(1)).unwrap();
        freeze(&mut e, o);
        assert!(is_frozen(&e, o));
        assert!(is_sealed(&e, o));
        put(&mut e, o, x, Value::from_int32(2)).unwrap();
        assert_eq!(get(&mut e, o, x).unwrap().int_32(), 1);
        let z = e.identifiers.intern("z");
        put(&mut e, o, z, Value::from_int32(3)).unwrap();
        assert!(get(&mut e, o, z).unwrap().is_undefined());
        assert!(!delete_property(&mut e, o, x));
    }

    #[test]
    fn test_array_length_tracks_writes_and_truncates() {
        let mut e = engine();
        let a = e.new_array(vec![Value::from_int32(1), Value::from_int32(2)]).unwrap();
        put_indexed(&mut e, a, 5, Value::from_int32(6)).unwrap();
        assert_eq!(get_length(&e, a), 6);
        let length = e.ids.length;
        put(&mut e, a, length, Value::from_int32(1)).unwrap();
        assert_eq!(get_length(&e, a), 1);
        assert!(get_indexed(&mut e, a, 5).unwrap().is_undefined());
        assert_eq!(get_indexed(&mut e, a, 0).unwrap().int_32(), 1);
    }

    #[test]
    fn test_invalid_array_length_throws_range_error() {
        let mut e = engine();
        let a = e.new_array(Vec::new()).unwrap();
        let length = e.ids.length;
        assert!(put(&mut e, a, length, Value::from_double(1.5)).is_err());
        assert!(e.has_exception);
        let exc = e.catch_exception();
        assert_eq!(e.error_type_of(exc), Some(ErrorType::RangeError));
    }

    #[test]
    fn test_define_own_property_rejects_incompatible_redefinition() {
        let mut e = engine();
        let o = e.new_object().unwrap();
        let x = e.identifiers.intern("x");
        let ro = PropertyAttributes::from_flags(ATTR_READ_ONLY);
        assert!(define_own_property(&mut e, o, x, Property::new(Value::from_int32(1)), ro).unwrap());
        // same value again is a no-op
        assert!(define_own_property(&mut e, o, x, Property::new(Value::from_int32(1)), ro).unwrap());
        let mut w = PropertyAttributes::generic();
        w.set_writable(true);
        assert!(define_own_property(&mut e, o, x, Property::generic_descriptor(), w).is_err());
        e.catch_exception();
        assert_eq!(get(&mut e, o, x).unwrap().int_32(), 1);
    }

    #[test]
    fn test_accessor_members_run_getter() {
        let mut e = engine();
        let o = e.new_object().unwrap();
        let getter = e
            .new_builtin_function("answer", |_, _| Ok(Value::from_int32(42)))
            .unwrap();
        let x = e.identifiers.intern("x");
        let attrs = PropertyAttributes::from_flags(ATTR_ACCESSOR);
        define_own_property(&mut e, o, x, Property::accessor(Some(getter), None), attrs).unwrap();
        assert!(e.heap.header(o).flags.has_accessor_property());
        assert_eq!(get(&mut e, o, x).unwrap().int_32(), 42);
    }

    #[test]
    fn test_lookup_caches_own_data_slot() {
        let mut e = engine();
        let o = e.new_object().unwrap();
        let x = e.identifiers.intern("x");
        put(&mut e, o, x, Value::from_int32(5)).unwrap();
        let mut l = Lookup::new(crate::runner::ds::lookup::LookupKind::Getter, x);
        assert_eq!(get_lookup(&mut e, o, &mut l).unwrap().int_32(), 5);
        assert_eq!(get_lookup(&mut e, o, &mut l).unwrap().int_32(), 5);
        assert_eq!(l.hits, 1);
        set_lookup(&mut e, o, &mut l, Value::from_int32(9)).unwrap();
        assert_eq!(get(&mut e, o, x).unwrap().int_32(), 9);
    }

    #[test]
    fn test_for_in_order_and_shadowing() {
        let mut e = engine();
        let proto = e.new_object().unwrap();
        let a = e.identifiers.intern("a");
        let b = e.identifiers.intern("b");
        put(&mut e, proto, a, Value::from_int32(1)).unwrap();
        put(&mut e, proto, b, Value::from_int32(2)).unwrap();
        let o = e.new_object_with_proto(Some(proto)).unwrap();
        put_indexed(&mut e, o, 0, Value::from_int32(0)).unwrap();
        put(&mut e, o, b, Value::from_int32(3)).unwrap();
        let mut it = ObjectIterator::new(Some(o));
        let mut keys = Vec::new();
        while let Some(k) = next_enumerable_key(&e, &mut it) {
            keys.push(k);
        }
        assert_eq!(
            keys,
            vec![PropertyKey::Index(0), PropertyKey::Name(b), PropertyKey::Name(a)]
        );
    }
}
