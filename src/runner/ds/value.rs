//! Tagged value representation.
//!
//! Every JavaScript value fits in one 64-bit word. Doubles are stored with
//! their bit pattern XORed against [`NAN_ENCODE_MASK`]; everything that is
//! not a double lives in the part of the NaN space that the mask maps to
//! words whose top 17 bits are all zero. The upper 32 bits of such a word
//! hold a [`ValueTag`], the lower 32 bits the payload.
//!
//! ```text
//!  63            47 46          32 31                         0
//! +----------------+--------------+----------------------------+
//! | 0000...0000    |     tag      |          payload           |   tagged
//! +----------------+--------------+----------------------------+
//! | anything but 0 |        double bits ^ NAN_ENCODE_MASK      |   double
//! +----------------+-------------------------------------------+
//! ```
//!
//! The all-zero word is `undefined`, so zero-initialised memory reads back
//! as undefined.

use std::fmt;

use crate::runner::ds::heap::MemoryManager;
use crate::runner::ds::managed::ManagedRef;

/// XOR mask applied to the bits of every stored double.
pub const NAN_ENCODE_MASK: u64 = 0xffff_8000_0000_0000;

/// Bit position of the tag inside a non-double word.
pub const TAG_SHIFT: u32 = 32;

/// Raw bits of the canonical quiet NaN. Incoming NaNs whose encoding would
/// collide with a tagged word are replaced by this one.
pub const CANONICAL_NAN_BITS: u64 = 0x7ff8_0000_0000_0000;

/// Tag stored in the upper half of a non-double value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueTag {
    Undefined = 0,
    Managed = 1,
    Empty = 2,
    Null = 3,
    Boolean = 4,
    Integer = 5,
}

impl ValueTag {
    pub fn from_u32(tag: u32) -> Option<ValueTag> {
        Some(match tag {
            0 => ValueTag::Undefined,
            1 => ValueTag::Managed,
            2 => ValueTag::Empty,
            3 => ValueTag::Null,
            4 => ValueTag::Boolean,
            5 => ValueTag::Integer,
            _ => return None,
        })
    }
}

/// A NaN-boxed JavaScript value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value {
    raw: u64,
}

impl Default for Value {
    fn default() -> Self {
        Value::undefined()
    }
}

impl Value {
    #[inline]
    pub const fn from_raw(raw: u64) -> Value {
        Value { raw }
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.raw
    }

    #[inline]
    const fn tagged(tag: ValueTag, payload: u32) -> Value {
        Value {
            raw: ((tag as u64) << TAG_SHIFT) | payload as u64,
        }
    }

    #[inline]
    pub const fn undefined() -> Value {
        Value::tagged(ValueTag::Undefined, 0)
    }

    #[inline]
    pub const fn null() -> Value {
        Value::tagged(ValueTag::Null, 0)
    }

    /// Marker for array holes and "nothing pending" results.
    #[inline]
    pub const fn empty() -> Value {
        Value::tagged(ValueTag::Empty, 0)
    }

    #[inline]
    pub const fn from_bool(b: bool) -> Value {
        Value::tagged(ValueTag::Boolean, b as u32)
    }

    #[inline]
    pub const fn from_int32(i: i32) -> Value {
        Value::tagged(ValueTag::Integer, i as u32)
    }

    #[inline]
    pub fn from_managed(m: ManagedRef) -> Value {
        Value::tagged(ValueTag::Managed, m.index())
    }

    /// Stores `d` as a double, whatever its value.
    ///
    /// NaNs whose bit pattern falls in the range reserved for tagged words
    /// are canonicalised; every other bit pattern survives the round trip.
    #[inline]
    pub fn from_double(d: f64) -> Value {
        let mut bits = d.to_bits();
        if bits >> 47 == 0x1_ffff {
            bits = CANONICAL_NAN_BITS;
        }
        Value {
            raw: bits ^ NAN_ENCODE_MASK,
        }
    }

    /// Integer encoding when the number is representable as one, double otherwise.
    pub fn from_number(d: f64) -> Value {
        let i = d as i32;
        if i as f64 == d && !(i == 0 && d.is_sign_negative()) {
            Value::from_int32(i)
        } else {
            Value::from_double(d)
        }
    }

    pub fn from_uint32(u: u32) -> Value {
        if u < i32::MAX as u32 {
            Value::from_int32(u as i32)
        } else {
            Value::from_double(u as f64)
        }
    }

    // ── Type tests ──────────────────────────────────────────

    #[inline]
    pub fn is_double(self) -> bool {
        self.raw >> 47 != 0
    }

    #[inline]
    pub fn tag(self) -> Option<ValueTag> {
        if self.is_double() {
            None
        } else {
            ValueTag::from_u32((self.raw >> TAG_SHIFT) as u32)
        }
    }

    #[inline]
    fn has_tag(self, tag: ValueTag) -> bool {
        !self.is_double() && (self.raw >> TAG_SHIFT) as u32 == tag as u32
    }

    #[inline]
    pub fn is_undefined(self) -> bool {
        self.raw == 0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.has_tag(ValueTag::Null)
    }

    #[inline]
    pub fn is_null_or_undefined(self) -> bool {
        self.is_undefined() || self.is_null()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.has_tag(ValueTag::Empty)
    }

    #[inline]
    pub fn is_boolean(self) -> bool {
        self.has_tag(ValueTag::Boolean)
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        self.has_tag(ValueTag::Integer)
    }

    #[inline]
    pub fn is_number(self) -> bool {
        self.is_double() || self.is_integer()
    }

    #[inline]
    pub fn is_managed(self) -> bool {
        self.has_tag(ValueTag::Managed)
    }

    /// Strings are managed; answering needs the heap.
    pub fn is_string(self, heap: &MemoryManager) -> bool {
        self.as_managed().map_or(false, |m| heap.is_string(m))
    }

    pub fn is_object(self, heap: &MemoryManager) -> bool {
        self.as_managed().map_or(false, |m| heap.is_object(m))
    }

    // ── Payload access ──────────────────────────────────────

    #[inline]
    pub fn int_32(self) -> i32 {
        self.raw as u32 as i32
    }

    #[inline]
    pub fn double_value(self) -> f64 {
        f64::from_bits(self.raw ^ NAN_ENCODE_MASK)
    }

    #[inline]
    pub fn boolean_value(self) -> bool {
        self.raw as u32 != 0
    }

    #[inline]
    pub fn as_managed(self) -> Option<ManagedRef> {
        if self.is_managed() {
            Some(ManagedRef::new(self.raw as u32))
        } else {
            None
        }
    }

    /// Numeric value of an integer or double, `None` otherwise.
    #[inline]
    pub fn as_number(self) -> Option<f64> {
        if self.is_integer() {
            Some(self.int_32() as f64)
        } else if self.is_double() {
            Some(self.double_value())
        } else {
            None
        }
    }

    // ── Conversions ─────────────────────────────────────────

    /// ToNumber for primitives and strings. Objects must already have been
    /// reduced to a primitive by the engine; here they read as NaN.
    pub fn to_number(self, heap: &MemoryManager) -> f64 {
        if let Some(n) = self.as_number() {
            return n;
        }
        match self.tag() {
            Some(ValueTag::Undefined) | Some(ValueTag::Empty) => f64::NAN,
            Some(ValueTag::Null) => 0.0,
            Some(ValueTag::Boolean) => {
                if self.boolean_value() {
                    1.0
                } else {
                    0.0
                }
            }
            Some(ValueTag::Managed) => match self.as_managed().and_then(|m| heap.string(m)) {
                Some(s) => string_to_number(s.as_str()),
                None => f64::NAN,
            },
            _ => f64::NAN,
        }
    }

    pub fn to_int32(self, heap: &MemoryManager) -> i32 {
        if self.is_integer() {
            return self.int_32();
        }
        let d = if self.is_double() {
            self.double_value()
        } else {
            self.to_number(heap)
        };
        double_to_int32(d)
    }

    pub fn to_uint32(self, heap: &MemoryManager) -> u32 {
        self.to_int32(heap) as u32
    }

    pub fn to_boolean(self, heap: &MemoryManager) -> bool {
        if self.is_double() {
            let d = self.double_value();
            return d != 0.0 && !d.is_nan();
        }
        match self.tag() {
            Some(ValueTag::Undefined) | Some(ValueTag::Null) | Some(ValueTag::Empty) => false,
            Some(ValueTag::Boolean) | Some(ValueTag::Integer) => self.int_32() != 0,
            Some(ValueTag::Managed) => match self.as_managed().and_then(|m| heap.string(m)) {
                Some(s) => !s.as_str().is_empty(),
                None => true,
            },
            None => false,
        }
    }

    /// Array index for a number, or `u32::MAX` when the value is not one.
    pub fn as_array_index(self) -> u32 {
        if self.is_integer() {
            let i = self.int_32();
            return if i >= 0 { i as u32 } else { u32::MAX };
        }
        if !self.is_double() {
            return u32::MAX;
        }
        let d = self.double_value();
        let idx = d as u32;
        if idx as f64 != d {
            return u32::MAX;
        }
        idx
    }

    /// Array length for a value assigned to `length`. `None` when the value
    /// is negative, fractional or out of range; callers decide whether that
    /// turns into a RangeError.
    pub fn as_array_length(self, heap: &MemoryManager) -> Option<u32> {
        if self.is_integer() {
            let i = self.int_32();
            return if i >= 0 { Some(i as u32) } else { None };
        }
        if self.is_double() {
            let d = self.double_value();
            let idx = d as u32;
            return if idx as f64 == d { Some(idx) } else { None };
        }
        if let Some(s) = self.as_managed().and_then(|m| heap.string(m)) {
            return string_to_uint(s.as_str());
        }
        let idx = self.to_uint32(heap);
        let d = self.to_number(heap);
        if d != idx as f64 {
            None
        } else {
            Some(idx)
        }
    }

    /// Strict equality (`===`) for values whose managed part compares by identity.
    pub fn strict_equals(self, other: Value, heap: &MemoryManager) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a == b;
        }
        if self.raw == other.raw {
            return !self.is_empty();
        }
        match (self.as_managed(), other.as_managed()) {
            (Some(a), Some(b)) => match (heap.string(a), heap.string(b)) {
                (Some(x), Some(y)) => x.as_str() == y.as_str(),
                _ => false,
            },
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_double() {
            return write!(f, "Value::Double({})", self.double_value());
        }
        match self.tag() {
            Some(ValueTag::Undefined) => write!(f, "Value::Undefined"),
            Some(ValueTag::Null) => write!(f, "Value::Null"),
            Some(ValueTag::Empty) => write!(f, "Value::Empty"),
            Some(ValueTag::Boolean) => write!(f, "Value::Boolean({})", self.boolean_value()),
            Some(ValueTag::Integer) => write!(f, "Value::Integer({})", self.int_32()),
            Some(ValueTag::Managed) => write!(f, "Value::Managed(#{})", self.raw as u32),
            None => write!(f, "Value::Invalid({:#018x})", self.raw),
        }
    }
}

/// ECMA-262 ToInt32.
pub fn double_to_int32(d: f64) -> i32 {
    if d >= -2147483648.0 && d < 2147483648.0 {
        return d as i32;
    }
    if !d.is_finite() {
        return 0;
    }
    const TWO_32: f64 = 4294967296.0;
    let mut m = d.trunc() % TWO_32;
    if m < 0.0 {
        m += TWO_32;
    }
    (m as u64 as u32) as i32
}

fn is_js_whitespace(c: char) -> bool {
    matches!(
        c,
        '\u{9}' | '\u{a}' | '\u{b}' | '\u{c}' | '\u{d}' | ' ' | '\u{a0}' | '\u{2028}' | '\u{2029}'
            | '\u{feff}'
    ) || c.is_whitespace()
}

/// ToNumber applied to a string.
pub fn string_to_number(s: &str) -> f64 {
    let t = s.trim_matches(is_js_whitespace);
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        if hex.is_empty() {
            return f64::NAN;
        }
        let mut acc = 0.0f64;
        for c in hex.chars() {
            match c.to_digit(16) {
                Some(d) => acc = acc * 16.0 + d as f64,
                None => return f64::NAN,
            }
        }
        return acc;
    }
    // Rust accepts "inf" and "nan" spellings that JavaScript does not.
    if t.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// Parses a canonical unsigned integer string such as an array length.
pub fn string_to_uint(s: &str) -> Option<u32> {
    let d = string_to_number(s);
    let idx = d as u32;
    if idx as f64 == d {
        Some(idx)
    } else {
        None
    }
}

/// Array index named by a property key string, `u32::MAX` if it is not one.
pub fn string_to_array_index(s: &str) -> u32 {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 10 || (bytes.len() > 1 && bytes[0] == b'0') {
        return u32::MAX;
    }
    let mut acc: u64 = 0;
    for b in bytes {
        if !b.is_ascii_digit() {
            return u32::MAX;
        }
        acc = acc * 10 + (b - b'0') as u64;
    }
    if acc >= u32::MAX as u64 {
        u32::MAX
    } else {
        acc as u32
    }
}

/// Number::toString for radix 10.
pub fn number_to_string(d: f64) -> String {
    if d.is_nan() {
        return "NaN".to_string();
    }
    if d == 0.0 {
        return "0".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let abs = d.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let s = format!("{:e}", d);
        return match s.find('e') {
            Some(pos) if !s[pos + 1..].starts_with('-') => {
                format!("{}e+{}", &s[..pos], &s[pos + 1..])
            }
            _ => s,
        };
    }
    format!("{}", d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> MemoryManager {
        MemoryManager::default()
    }

    #[test]
    fn test_undefined_is_zero_word() {
        assert_eq!(Value::undefined().raw(), 0);
        assert!(Value::undefined().is_undefined());
        assert!(!Value::undefined().is_double());
    }

    #[test]
    fn test_tags_are_not_doubles() {
        for v in [
            Value::undefined(),
            Value::null(),
            Value::empty(),
            Value::from_bool(true),
            Value::from_int32(-7),
            Value::from_managed(ManagedRef::new(12)),
        ] {
            assert!(!v.is_double(), "{:?}", v);
        }
    }

    #[test]
    fn test_double_round_trip_keeps_bits() {
        for d in [0.0, -0.0, 1.5, -2.25e300, f64::INFINITY, f64::MIN_POSITIVE] {
            let v = Value::from_double(d);
            assert!(v.is_double());
            assert_eq!(v.double_value().to_bits(), d.to_bits());
        }
        let signalling = f64::from_bits(0x7ff0_0000_0000_0001);
        assert_eq!(
            Value::from_double(signalling).double_value().to_bits(),
            0x7ff0_0000_0000_0001
        );
    }

    #[test]
    fn test_colliding_nan_is_canonicalised() {
        let v = Value::from_double(f64::from_bits(0xffff_8000_0000_0005));
        assert!(v.is_double());
        assert_eq!(v.double_value().to_bits(), CANONICAL_NAN_BITS);
    }

    #[test]
    fn test_to_int32() {
        let h = heap();
        assert_eq!(Value::from_double(4294967297.5).to_int32(&h), 1);
        assert_eq!(Value::from_double(-1.9).to_int32(&h), -1);
        assert_eq!(Value::from_double(2147483648.0).to_int32(&h), -2147483648);
        assert_eq!(Value::from_double(f64::NAN).to_int32(&h), 0);
        assert_eq!(Value::from_double(f64::NEG_INFINITY).to_int32(&h), 0);
        assert_eq!(Value::from_double(-0.0).to_int32(&h), 0);
        assert_eq!(Value::from_double(-4294967297.0).to_int32(&h), -1);
        assert_eq!(Value::from_double(-2147483649.0).to_uint32(&h), 2147483647);
    }

    #[test]
    fn test_to_boolean() {
        let h = heap();
        assert!(!Value::undefined().to_boolean(&h));
        assert!(!Value::null().to_boolean(&h));
        assert!(!Value::from_int32(0).to_boolean(&h));
        assert!(Value::from_int32(3).to_boolean(&h));
        assert!(!Value::from_double(f64::NAN).to_boolean(&h));
        assert!(!Value::from_double(-0.0).to_boolean(&h));
        assert!(Value::from_double(0.5).to_boolean(&h));
    }

    #[test]
    fn test_array_index_and_length() {
        let h = heap();
        assert_eq!(Value::from_int32(5).as_array_index(), 5);
        assert_eq!(Value::from_int32(-1).as_array_index(), u32::MAX);
        assert_eq!(Value::from_double(1.5).as_array_index(), u32::MAX);
        assert_eq!(Value::from_double(4294967296.0).as_array_index(), u32::MAX);
        assert_eq!(Value::from_double(3.0).as_array_length(&h), Some(3));
        assert_eq!(Value::from_double(-3.0).as_array_length(&h), None);
        assert_eq!(Value::from_double(4294967295.0).as_array_length(&h), Some(u32::MAX));
        assert_eq!(Value::from_bool(true).as_array_length(&h), Some(1));
    }

    #[test]
    fn test_from_number_prefers_integers() {
        assert!(Value::from_number(3.0).is_integer());
        assert!(Value::from_number(-0.0).is_double());
        assert!(Value::from_number(0.5).is_double());
        assert!(Value::from_uint32(u32::MAX).is_double());
        assert!(Value::from_uint32(7).is_integer());
    }

    #[test]
    fn test_string_conversions() {
        assert_eq!(string_to_number("  42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1f"), 31.0);
        assert!(string_to_number("inf").is_nan());
        assert!(string_to_number("12px").is_nan());
        assert_eq!(string_to_array_index("12"), 12);
        assert_eq!(string_to_array_index("012"), u32::MAX);
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(0.1), "0.1");
        assert_eq!(number_to_string(-5.0), "-5");
    }
}
