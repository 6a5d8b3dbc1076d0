//! Header and dispatch tables shared by every heap cell.
//!
//! Behaviour is selected through a [`VTable`] stored in the cell's hidden
//! class. Each concrete kind installs one static table; downcasts compare the
//! table's address.

use std::fmt;
use std::ptr;

use crate::runner::ds::error::{ExceptionSignal, ReturnedValue};
use crate::runner::ds::heap::MemoryManager;
use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::lookup::Lookup;
use crate::runner::ds::object::{CallData, ObjectIterator, PropertyKey};
use crate::runner::ds::property::PropertyAttributes;
use crate::runner::ds::value::Value;
use crate::runner::engine::ExecutionEngine;

/// Handle to a cell owned by the [`MemoryManager`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedRef(u32);

impl ManagedRef {
    pub const fn new(index: u32) -> Self {
        ManagedRef(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ManagedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedRef(#{})", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum ManagedType {
    Invalid,
    String,
    Object,
    ArrayObject,
    FunctionObject,
    BooleanObject,
    NumberObject,
    StringObject,
    RegExpObject,
    ErrorObject,
    ArgumentsObject,
    ExecutionContext,
    ForeachIteratorObject,
}

/// Bits kept next to the class pointer of every cell.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagedFlags(u32);

impl ManagedFlags {
    const MARK_BIT: u32 = 0x01;
    const IN_USE: u32 = 0x02;
    const EXTENSIBLE: u32 = 0x04;
    const NEEDS_ACTIVATION: u32 = 0x10;
    const STRICT_MODE: u32 = 0x20;
    const BINDING_KEY_FLAG: u32 = 0x40;
    const HAS_ACCESSOR_PROPERTY: u32 = 0x80;
    const SUBTYPE_SHIFT: u32 = 16;

    /// Flags of a freshly allocated cell: in use and extensible.
    pub fn fresh() -> Self {
        ManagedFlags(Self::IN_USE | Self::EXTENSIBLE)
    }

    fn get(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    fn set(&mut self, bit: u32, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn mark_bit(self) -> bool {
        self.get(Self::MARK_BIT)
    }

    pub fn set_mark_bit(&mut self, on: bool) {
        self.set(Self::MARK_BIT, on)
    }

    pub fn in_use(self) -> bool {
        self.get(Self::IN_USE)
    }

    pub fn set_in_use(&mut self, on: bool) {
        self.set(Self::IN_USE, on)
    }

    pub fn extensible(self) -> bool {
        self.get(Self::EXTENSIBLE)
    }

    pub fn set_extensible(&mut self, on: bool) {
        self.set(Self::EXTENSIBLE, on)
    }

    pub fn needs_activation(self) -> bool {
        self.get(Self::NEEDS_ACTIVATION)
    }

    pub fn set_needs_activation(&mut self, on: bool) {
        self.set(Self::NEEDS_ACTIVATION, on)
    }

    pub fn strict_mode(self) -> bool {
        self.get(Self::STRICT_MODE)
    }

    pub fn set_strict_mode(&mut self, on: bool) {
        self.set(Self::STRICT_MODE, on)
    }

    pub fn binding_key_flag(self) -> bool {
        self.get(Self::BINDING_KEY_FLAG)
    }

    pub fn set_binding_key_flag(&mut self, on: bool) {
        self.set(Self::BINDING_KEY_FLAG, on)
    }

    pub fn has_accessor_property(self) -> bool {
        self.get(Self::HAS_ACCESSOR_PROPERTY)
    }

    pub fn set_has_accessor_property(&mut self, on: bool) {
        self.set(Self::HAS_ACCESSOR_PROPERTY, on)
    }

    pub fn subtype(self) -> u8 {
        (self.0 >> Self::SUBTYPE_SHIFT) as u8
    }

    pub fn set_subtype(&mut self, subtype: u8) {
        self.0 = (self.0 & !(0xff << Self::SUBTYPE_SHIFT)) | ((subtype as u32) << Self::SUBTYPE_SHIFT);
    }
}

impl fmt::Debug for ManagedFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedFlags")
            .field("in_use", &self.in_use())
            .field("extensible", &self.extensible())
            .field("strict_mode", &self.strict_mode())
            .field("subtype", &self.subtype())
            .finish()
    }
}

pub struct ManagedVTable {
    pub is_execution_context: bool,
    pub is_string: bool,
    pub is_object: bool,
    pub is_function_object: bool,
    pub is_error_object: bool,
    pub is_array_data: bool,
    pub ty: ManagedType,
    pub class_name: &'static str,
    pub is_equal_to: fn(&MemoryManager, ManagedRef, ManagedRef) -> bool,
}

/// Behaviour of object cells. `get` family entries yield `None` when the
/// property does not exist anywhere on the prototype chain.
pub struct ObjectVTable {
    pub managed: ManagedVTable,
    pub call: fn(&mut ExecutionEngine, ManagedRef, &CallData) -> ReturnedValue,
    pub construct: fn(&mut ExecutionEngine, ManagedRef, &CallData) -> ReturnedValue,
    pub get: fn(&mut ExecutionEngine, ManagedRef, Identifier) -> Result<Option<Value>, ExceptionSignal>,
    pub get_indexed: fn(&mut ExecutionEngine, ManagedRef, u32) -> Result<Option<Value>, ExceptionSignal>,
    pub put: fn(&mut ExecutionEngine, ManagedRef, Identifier, Value) -> Result<(), ExceptionSignal>,
    pub put_indexed: fn(&mut ExecutionEngine, ManagedRef, u32, Value) -> Result<(), ExceptionSignal>,
    pub query: fn(&ExecutionEngine, ManagedRef, Identifier) -> PropertyAttributes,
    pub query_indexed: fn(&ExecutionEngine, ManagedRef, u32) -> PropertyAttributes,
    pub delete_property: fn(&mut ExecutionEngine, ManagedRef, Identifier) -> bool,
    pub delete_indexed_property: fn(&mut ExecutionEngine, ManagedRef, u32) -> bool,
    pub get_lookup: fn(&mut ExecutionEngine, ManagedRef, &mut Lookup) -> ReturnedValue,
    pub set_lookup: fn(&mut ExecutionEngine, ManagedRef, &mut Lookup, Value) -> Result<(), ExceptionSignal>,
    pub get_length: fn(&ExecutionEngine, ManagedRef) -> u32,
    pub advance_iterator:
        fn(&ExecutionEngine, ManagedRef, &mut ObjectIterator) -> Option<(PropertyKey, PropertyAttributes)>,
}

#[derive(Clone, Copy)]
pub enum VTable {
    Managed(&'static ManagedVTable),
    Object(&'static ObjectVTable),
}

impl VTable {
    pub fn managed(self) -> &'static ManagedVTable {
        match self {
            VTable::Managed(vt) => vt,
            VTable::Object(vt) => &vt.managed,
        }
    }

    pub fn object(self) -> Option<&'static ObjectVTable> {
        match self {
            VTable::Object(vt) => Some(vt),
            VTable::Managed(_) => None,
        }
    }

    /// Address of the table, used as its identity.
    pub fn id(self) -> usize {
        self.managed() as *const ManagedVTable as usize
    }

    pub fn ty(self) -> ManagedType {
        self.managed().ty
    }

    pub fn is<T: ManagedKind>(self) -> bool {
        ptr::eq(self.managed(), T::static_vtable())
    }
}

impl PartialEq for VTable {
    fn eq(&self, other: &VTable) -> bool {
        ptr::eq(self.managed(), other.managed())
    }
}

impl Eq for VTable {}

impl fmt::Debug for VTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VTable({})", self.managed().class_name)
    }
}

/// A concrete cell kind with one static table, for checked downcasts.
pub trait ManagedKind {
    fn static_vtable() -> &'static ManagedVTable;
}

macro_rules! managed_kind {
    ($marker:ident, $table:expr) => {
        pub struct $marker;

        impl $crate::runner::ds::managed::ManagedKind for $marker {
            fn static_vtable() -> &'static $crate::runner::ds::managed::ManagedVTable {
                &$table
            }
        }
    };
}

pub(crate) use managed_kind;

fn identity_equal(_: &MemoryManager, a: ManagedRef, b: ManagedRef) -> bool {
    a == b
}

fn string_equal(heap: &MemoryManager, a: ManagedRef, b: ManagedRef) -> bool {
    match (heap.string(a), heap.string(b)) {
        (Some(x), Some(y)) => x.as_str() == y.as_str(),
        _ => false,
    }
}

pub(crate) const fn managed_vtable(
    ty: ManagedType,
    class_name: &'static str,
) -> ManagedVTable {
    ManagedVTable {
        is_execution_context: matches!(ty, ManagedType::ExecutionContext),
        is_string: matches!(ty, ManagedType::String),
        is_object: !matches!(
            ty,
            ManagedType::Invalid | ManagedType::String | ManagedType::ExecutionContext
        ),
        is_function_object: matches!(ty, ManagedType::FunctionObject),
        is_error_object: matches!(ty, ManagedType::ErrorObject),
        is_array_data: false,
        ty,
        class_name,
        is_equal_to: identity_equal,
    }
}

pub static MANAGED_VTABLE: ManagedVTable = managed_vtable(ManagedType::Invalid, "Managed");

pub static STRING_VTABLE: ManagedVTable = ManagedVTable {
    is_equal_to: string_equal,
    ..managed_vtable(ManagedType::String, "String")
};

managed_kind!(StringCell, STRING_VTABLE);

/// Name reported by `Object.prototype.toString` style queries.
pub fn class_name(vtable: VTable, subtype: u8) -> &'static str {
    use crate::runner::ds::error::ErrorType;
    match vtable.ty() {
        ManagedType::Invalid | ManagedType::String => "",
        ManagedType::Object => "Object",
        ManagedType::ArrayObject => "Array",
        ManagedType::FunctionObject => "Function",
        ManagedType::BooleanObject => "Boolean",
        ManagedType::NumberObject => "Number",
        ManagedType::StringObject => "String",
        ManagedType::RegExpObject => "RegExp",
        ManagedType::ErrorObject => ErrorType::from_u8(subtype).name(),
        ManagedType::ArgumentsObject => "Arguments",
        ManagedType::ExecutionContext => "__ExecutionContext",
        ManagedType::ForeachIteratorObject => "__ForeachIterator",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ds::error::ErrorType;
    use crate::runner::ds::object::{ARRAY_OBJECT_VTABLE, ERROR_OBJECT_VTABLE, OBJECT_VTABLE};

    #[test]
    fn test_flags_pack_independently() {
        let mut f = ManagedFlags::fresh();
        assert!(f.in_use() && f.extensible());
        f.set_subtype(ErrorType::TypeError as u8);
        f.set_strict_mode(true);
        f.set_extensible(false);
        assert_eq!(f.subtype(), ErrorType::TypeError as u8);
        assert!(f.strict_mode());
        assert!(!f.extensible());
        assert!(!f.mark_bit());
    }

    #[test]
    fn test_vtable_identity() {
        let a = VTable::Object(&ARRAY_OBJECT_VTABLE);
        let o = VTable::Object(&OBJECT_VTABLE);
        assert_ne!(a, o);
        assert_eq!(a, VTable::Object(&ARRAY_OBJECT_VTABLE));
        assert!(VTable::Managed(&STRING_VTABLE).is::<StringCell>());
        assert!(!o.is::<StringCell>());
        assert!(o.managed().is_object);
        assert!(!VTable::Managed(&STRING_VTABLE).managed().is_object);
    }

    #[test]
    fn test_class_names() {
        let e = VTable::Object(&ERROR_OBJECT_VTABLE);
        assert_eq!(class_name(e, ErrorType::RangeError as u8), "RangeError");
        assert_eq!(class_name(VTable::Object(&ARRAY_OBJECT_VTABLE), 0), "Array");
        assert_eq!(class_name(VTable::Managed(&STRING_VTABLE), 0), "");
    }
}
