//! Property slots and their attributes.
//!
//! A [`Property`] holds the value(s) of one slot; whether it is a data or an
//! accessor slot, and whether it is writable, enumerable or configurable, is
//! recorded separately in a [`PropertyAttributes`] kept by the object's
//! internal class (or by the array data for indexed slots).

use crate::runner::ds::heap::MemoryManager;
use crate::runner::ds::managed::ManagedRef;
use crate::runner::ds::value::Value;

pub const ATTR_DATA: u8 = 0;
pub const ATTR_ACCESSOR: u8 = 0x1;
pub const ATTR_NOT_WRITABLE: u8 = 0x2;
pub const ATTR_NOT_ENUMERABLE: u8 = 0x4;
pub const ATTR_NOT_CONFIGURABLE: u8 = 0x8;
pub const ATTR_READ_ONLY: u8 = ATTR_NOT_WRITABLE | ATTR_NOT_ENUMERABLE | ATTR_NOT_CONFIGURABLE;
pub const ATTR_INVALID: u8 = 0xff;

const TYPE_BIT: u8 = 1 << 0;
const WRITABLE_BIT: u8 = 1 << 1;
const ENUMERABLE_BIT: u8 = 1 << 2;
const CONFIGURABLE_BIT: u8 = 1 << 3;
const TYPE_SET: u8 = 1 << 4;
const WRITABLE_SET: u8 = 1 << 5;
const ENUMERABLE_SET: u8 = 1 << 6;
const CONFIGURABLE_SET: u8 = 1 << 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Data,
    Accessor,
    Generic,
}

/// Packed attribute byte.
///
/// The low nibble holds the attribute values, the high nibble records which
/// of them were actually specified, so that "unspecified" and "false" stay
/// distinguishable while a descriptor is being assembled (ECMA-262 §8.10).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PropertyAttributes {
    all: u8,
}

impl PropertyAttributes {
    /// Attributes with nothing specified.
    pub const fn generic() -> Self {
        PropertyAttributes { all: 0 }
    }

    /// Builds fully specified attributes from `ATTR_*` flags.
    pub fn from_flags(f: u8) -> Self {
        let mut a = PropertyAttributes::generic();
        if f != ATTR_INVALID {
            a.set_type(if f & ATTR_ACCESSOR != 0 {
                PropertyType::Accessor
            } else {
                PropertyType::Data
            });
            if f & ATTR_ACCESSOR == 0 {
                a.set_writable(f & ATTR_NOT_WRITABLE == 0);
            }
            a.set_enumerable(f & ATTR_NOT_ENUMERABLE == 0);
            a.set_configurable(f & ATTR_NOT_CONFIGURABLE == 0);
        }
        a
    }

    pub fn data() -> Self {
        Self::from_flags(ATTR_DATA)
    }

    pub fn accessor() -> Self {
        Self::from_flags(ATTR_ACCESSOR)
    }

    #[inline]
    fn bit(self, b: u8) -> bool {
        self.all & b != 0
    }

    #[inline]
    fn put(&mut self, b: u8, on: bool) {
        if on {
            self.all |= b;
        } else {
            self.all &= !b;
        }
    }

    pub fn set_type(&mut self, t: PropertyType) {
        self.put(TYPE_BIT, t == PropertyType::Accessor);
        self.put(TYPE_SET, true);
    }

    pub fn property_type(self) -> PropertyType {
        if !self.bit(TYPE_SET) {
            PropertyType::Generic
        } else if self.bit(TYPE_BIT) {
            PropertyType::Accessor
        } else {
            PropertyType::Data
        }
    }

    pub fn is_data(self) -> bool {
        self.property_type() == PropertyType::Data || self.bit(WRITABLE_SET)
    }

    pub fn is_accessor(self) -> bool {
        self.property_type() == PropertyType::Accessor
    }

    pub fn is_generic(self) -> bool {
        self.property_type() == PropertyType::Generic && !self.bit(WRITABLE_SET)
    }

    pub fn has_type(self) -> bool {
        self.bit(TYPE_SET)
    }

    pub fn has_writable(self) -> bool {
        self.bit(WRITABLE_SET)
    }

    pub fn has_enumerable(self) -> bool {
        self.bit(ENUMERABLE_SET)
    }

    pub fn has_configurable(self) -> bool {
        self.bit(CONFIGURABLE_SET)
    }

    pub fn set_writable(&mut self, b: bool) {
        self.put(WRITABLE_BIT, b);
        self.put(WRITABLE_SET, true);
    }

    pub fn set_enumerable(&mut self, b: bool) {
        self.put(ENUMERABLE_BIT, b);
        self.put(ENUMERABLE_SET, true);
    }

    pub fn set_configurable(&mut self, b: bool) {
        self.put(CONFIGURABLE_BIT, b);
        self.put(CONFIGURABLE_SET, true);
    }

    /// Marks every attribute as specified. Accessors never carry a writable bit.
    pub fn resolve(&mut self) {
        self.all |= 0xf0;
        if self.bit(TYPE_BIT) {
            self.put(WRITABLE_BIT, false);
            self.put(WRITABLE_SET, false);
        }
    }

    /// Accessors count as writable: assignment goes through the setter.
    pub fn is_writable(self) -> bool {
        self.bit(TYPE_BIT) || self.bit(WRITABLE_BIT)
    }

    pub fn is_enumerable(self) -> bool {
        self.bit(ENUMERABLE_BIT)
    }

    pub fn is_configurable(self) -> bool {
        self.bit(CONFIGURABLE_BIT)
    }

    pub fn clear_type(&mut self) {
        self.put(TYPE_BIT, false);
        self.put(TYPE_SET, false);
    }

    pub fn clear_writable(&mut self) {
        self.put(WRITABLE_BIT, false);
        self.put(WRITABLE_SET, false);
    }

    pub fn clear_enumerable(&mut self) {
        self.put(ENUMERABLE_BIT, false);
        self.put(ENUMERABLE_SET, false);
    }

    pub fn clear_configurable(&mut self) {
        self.put(CONFIGURABLE_BIT, false);
        self.put(CONFIGURABLE_SET, false);
    }

    pub fn clear(&mut self) {
        self.all = 0;
    }

    pub fn is_empty(self) -> bool {
        self.all == 0
    }

    /// The attribute nibble, used as the transition key of a member change.
    pub fn flags(self) -> u8 {
        self.all & 0x0f
    }

    pub fn all(self) -> u8 {
        self.all
    }
}

impl std::fmt::Debug for PropertyAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PropertyAttributes({:?}{}{}{})",
            self.property_type(),
            if self.is_writable() { " writable" } else { "" },
            if self.is_enumerable() { " enumerable" } else { "" },
            if self.is_configurable() { " configurable" } else { "" }
        )
    }
}

/// One property slot. Accessors keep the getter in `value` and the setter in `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub value: Value,
    pub set: Value,
}

impl Default for Property {
    fn default() -> Self {
        Property {
            value: Value::undefined(),
            set: Value::undefined(),
        }
    }
}

impl Property {
    pub fn new(value: Value) -> Self {
        Property {
            value,
            set: Value::undefined(),
        }
    }

    pub fn accessor(getter: Option<ManagedRef>, setter: Option<ManagedRef>) -> Self {
        Property {
            value: getter.map_or(Value::undefined(), Value::from_managed),
            set: setter.map_or(Value::undefined(), Value::from_managed),
        }
    }

    /// A descriptor with no value specified.
    pub fn generic_descriptor() -> Self {
        Property {
            value: Value::empty(),
            set: Value::undefined(),
        }
    }

    pub fn getter(&self) -> Option<ManagedRef> {
        self.value.as_managed()
    }

    pub fn setter(&self) -> Option<ManagedRef> {
        self.set.as_managed()
    }

    pub fn set_getter(&mut self, g: Option<ManagedRef>) {
        self.value = g.map_or(Value::undefined(), Value::from_managed);
    }

    pub fn set_setter(&mut self, s: Option<ManagedRef>) {
        self.set = s.map_or(Value::undefined(), Value::from_managed);
    }

    pub fn copy_from(&mut self, other: &Property, attrs: PropertyAttributes) {
        self.value = other.value;
        if attrs.is_accessor() {
            self.set = other.set;
        }
    }

    /// Fills in the defaults of ECMA-262 §8.10 and resolves the attributes.
    pub fn fully_populated(&mut self, attrs: &mut PropertyAttributes) {
        if !attrs.has_type() {
            self.value = Value::undefined();
        }
        if attrs.property_type() == PropertyType::Accessor {
            attrs.clear_writable();
            if self.value.is_empty() {
                self.value = Value::undefined();
            }
            if self.set.is_empty() {
                self.set = Value::undefined();
            }
        }
        attrs.resolve();
    }

    /// Whether redefining `other` with `self`/`attrs` would change nothing.
    pub fn is_subset(
        &self,
        attrs: PropertyAttributes,
        other: &Property,
        other_attrs: PropertyAttributes,
        heap: &MemoryManager,
    ) -> bool {
        if attrs.property_type() != PropertyType::Generic
            && attrs.property_type() != other_attrs.property_type()
        {
            return false;
        }
        if attrs.has_enumerable() && attrs.is_enumerable() != other_attrs.is_enumerable() {
            return false;
        }
        if attrs.has_configurable() && attrs.is_configurable() != other_attrs.is_configurable() {
            return false;
        }
        if attrs.has_writable() && attrs.is_writable() != other_attrs.is_writable() {
            return false;
        }
        if attrs.property_type() == PropertyType::Data
            && !same_value(self.value, other.value, heap)
        {
            return false;
        }
        if attrs.property_type() == PropertyType::Accessor {
            if self.value.as_managed() != other.value.as_managed() {
                return false;
            }
            if self.set.as_managed() != other.set.as_managed() {
                return false;
            }
        }
        true
    }

    /// Applies the specified parts of `other` on top of this slot.
    pub fn merge(
        &mut self,
        attrs: &mut PropertyAttributes,
        other: &Property,
        other_attrs: PropertyAttributes,
    ) {
        if other_attrs.has_enumerable() {
            attrs.set_enumerable(other_attrs.is_enumerable());
        }
        if other_attrs.has_configurable() {
            attrs.set_configurable(other_attrs.is_configurable());
        }
        if other_attrs.has_writable() {
            attrs.set_writable(other_attrs.is_writable());
        }
        match other_attrs.property_type() {
            PropertyType::Accessor => {
                attrs.set_type(PropertyType::Accessor);
                if !other.value.is_empty() {
                    self.value = other.value;
                }
                if !other.set.is_empty() {
                    self.set = other.set;
                }
            }
            PropertyType::Data => {
                attrs.set_type(PropertyType::Data);
                self.value = other.value;
            }
            PropertyType::Generic => {}
        }
    }
}

/// ECMA-262 SameValue.
pub fn same_value(a: Value, b: Value, heap: &MemoryManager) -> bool {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        if x.is_nan() && y.is_nan() {
            return true;
        }
        return x == y && x.is_sign_negative() == y.is_sign_negative();
    }
    a.strict_equals(b, heap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_round_trip() {
        let a = PropertyAttributes::from_flags(ATTR_NOT_ENUMERABLE);
        assert!(a.is_data());
        assert!(a.is_writable());
        assert!(!a.is_enumerable());
        assert!(a.is_configurable());
        assert_eq!(a.flags(), WRITABLE_BIT | CONFIGURABLE_BIT);
    }

    #[test]
    fn test_read_only() {
        let a = PropertyAttributes::from_flags(ATTR_READ_ONLY);
        assert!(!a.is_writable());
        assert!(!a.is_enumerable());
        assert!(!a.is_configurable());
    }

    #[test]
    fn test_invalid_flags_are_generic() {
        let a = PropertyAttributes::from_flags(ATTR_INVALID);
        assert!(a.is_empty());
        assert!(a.is_generic());
    }

    #[test]
    fn test_unspecified_differs_from_false() {
        let mut a = PropertyAttributes::generic();
        assert!(!a.has_writable());
        a.set_writable(false);
        assert!(a.has_writable());
        assert!(!a.is_writable());
        assert!(a.is_data());
    }

    #[test]
    fn test_accessor_resolve_drops_writable() {
        let mut a = PropertyAttributes::generic();
        a.set_type(PropertyType::Accessor);
        a.set_writable(true);
        a.resolve();
        assert!(!a.has_writable());
        assert!(a.is_writable());
        assert!(a.has_enumerable());
    }

    #[test]
    fn test_fully_populated_accessor() {
        let mut p = Property {
            value: Value::empty(),
            set: Value::empty(),
        };
        let mut attrs = PropertyAttributes::generic();
        attrs.set_type(PropertyType::Accessor);
        p.fully_populated(&mut attrs);
        assert!(p.value.is_undefined());
        assert!(p.set.is_undefined());
        assert!(attrs.has_configurable());
        assert!(!attrs.is_configurable());
    }

    #[test]
    fn test_merge_and_subset() {
        let heap = MemoryManager::default();
        let mut slot = Property::new(Value::from_int32(1));
        let mut attrs = PropertyAttributes::data();
        let mut change = PropertyAttributes::generic();
        change.set_writable(false);
        let desc = Property::generic_descriptor();
        assert!(!desc.is_subset(change, &slot, attrs, &heap));
        slot.merge(&mut attrs, &desc, change);
        assert!(!attrs.is_writable());
        assert_eq!(slot.value, Value::from_int32(1));
        assert!(desc.is_subset(change, &slot, attrs, &heap));
    }

    #[test]
    fn test_same_value() {
        let heap = MemoryManager::default();
        assert!(same_value(Value::from_double(f64::NAN), Value::from_double(f64::NAN), &heap));
        assert!(!same_value(Value::from_double(0.0), Value::from_double(-0.0), &heap));
        assert!(same_value(Value::from_int32(2), Value::from_double(2.0), &heap));
    }
}
