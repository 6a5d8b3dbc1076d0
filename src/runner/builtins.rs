//! The global environment: just enough library to observe the engine from
//! scripts.

use std::rc::Rc;

use crate::runner::ds::error::{ErrorType, ExceptionSignal, ReturnedValue};
use crate::runner::ds::heap::HeapObject;
use crate::runner::ds::managed::{class_name, ManagedRef};
use crate::runner::ds::object::{self, CallData, ObjectData, ObjectKind, PropertyKey};
use crate::runner::ds::property::{
    Property, PropertyAttributes, PropertyType, ATTR_NOT_ENUMERABLE, ATTR_READ_ONLY,
};
use crate::runner::ds::value::Value;
use crate::runner::engine::ExecutionEngine;
use crate::runner::function::{BuiltinCode, FunctionKind};
use crate::runner::runtime;

// Installation runs before scripts and ignores the heap limit, so a tiny
// heap still gets a usable global object.

fn reserved_function(engine: &mut ExecutionEngine, name: &str, code: BuiltinCode, construct: Option<BuiltinCode>) -> ManagedRef {
    let name = engine.identifiers.intern(name);
    let kind = ObjectKind::Function(FunctionKind::Builtin { name, code, construct });
    let class = engine.object_classes.builtin_function;
    engine
        .heap
        .allocate_reserved(HeapObject::object(class, ObjectData::new(kind)))
}

fn reserved_string(engine: &mut ExecutionEngine, text: &str) -> Value {
    let class = engine.object_classes.string;
    Value::from_managed(engine.heap.allocate_reserved(HeapObject::string(class, Rc::from(text))))
}

fn define_value(engine: &mut ExecutionEngine, target: ManagedRef, name: &str, value: Value, attrs: u8) {
    let id = engine.identifiers.intern(name);
    object::insert_member(engine, target, id, Property::new(value), PropertyAttributes::from_flags(attrs));
}

fn define_method(engine: &mut ExecutionEngine, target: ManagedRef, name: &str, code: BuiltinCode, argc: i32) -> ManagedRef {
    let f = reserved_function(engine, name, code, None);
    define_value(engine, f, "length", Value::from_int32(argc), ATTR_READ_ONLY);
    define_value(engine, target, name, Value::from_managed(f), ATTR_NOT_ENUMERABLE);
    f
}

fn define_constructor(
    engine: &mut ExecutionEngine,
    name: &str,
    code: BuiltinCode,
    construct: BuiltinCode,
    prototype: ManagedRef,
) -> ManagedRef {
    let ctor = reserved_function(engine, name, code, Some(construct));
    define_value(engine, ctor, "length", Value::from_int32(1), ATTR_READ_ONLY);
    define_value(engine, ctor, "prototype", Value::from_managed(prototype), ATTR_READ_ONLY);
    define_value(engine, prototype, "constructor", Value::from_managed(ctor), ATTR_NOT_ENUMERABLE);
    let global = engine.global_object;
    define_value(engine, global, name, Value::from_managed(ctor), ATTR_NOT_ENUMERABLE);
    ctor
}

pub fn install(engine: &mut ExecutionEngine) {
    let global = engine.global_object;
    define_value(engine, global, "undefined", Value::undefined(), ATTR_READ_ONLY);
    define_value(engine, global, "NaN", Value::from_double(f64::NAN), ATTR_READ_ONLY);
    define_value(engine, global, "Infinity", Value::from_double(f64::INFINITY), ATTR_READ_ONLY);
    define_method(engine, global, "print", print, 1);

    let object_proto = engine.protos.object;
    let object_ctor = define_constructor(engine, "Object", object_call, object_call, object_proto);
    define_method(engine, object_ctor, "freeze", object_freeze, 1);
    define_method(engine, object_ctor, "seal", object_seal, 1);
    define_method(engine, object_ctor, "preventExtensions", object_prevent_extensions, 1);
    define_method(engine, object_ctor, "isFrozen", object_is_frozen, 1);
    define_method(engine, object_ctor, "isSealed", object_is_sealed, 1);
    define_method(engine, object_ctor, "isExtensible", object_is_extensible, 1);
    define_method(engine, object_ctor, "keys", object_keys, 1);
    define_method(engine, object_ctor, "getPrototypeOf", object_get_prototype_of, 1);
    define_method(engine, object_ctor, "defineProperty", object_define_property, 3);
    define_method(engine, object_proto, "toString", object_to_string, 0);
    define_method(engine, object_proto, "valueOf", object_value_of, 0);
    define_method(engine, object_proto, "hasOwnProperty", object_has_own_property, 1);

    let function_proto = engine.protos.function;
    define_method(engine, function_proto, "toString", function_to_string, 0);
    define_method(engine, function_proto, "call", function_call, 1);
    define_method(engine, function_proto, "apply", function_apply, 2);

    let array_proto = engine.protos.array;
    define_constructor(engine, "Array", array_call, array_call, array_proto);
    define_method(engine, array_proto, "push", array_push, 1);
    define_method(engine, array_proto, "pop", array_pop, 0);
    define_method(engine, array_proto, "shift", array_shift, 0);
    define_method(engine, array_proto, "unshift", array_unshift, 1);
    define_method(engine, array_proto, "join", array_join, 1);
    define_method(engine, array_proto, "toString", array_to_string, 0);

    let number_proto = engine.protos.number;
    define_method(engine, number_proto, "toString", primitive_to_string, 0);
    define_method(engine, number_proto, "valueOf", primitive_value_of, 0);
    let boolean_proto = engine.protos.boolean;
    define_method(engine, boolean_proto, "toString", primitive_to_string, 0);
    define_method(engine, boolean_proto, "valueOf", primitive_value_of, 0);
    let string_proto = engine.protos.string;
    define_method(engine, string_proto, "toString", primitive_to_string, 0);
    define_method(engine, string_proto, "valueOf", primitive_value_of, 0);

    let error_ctors: [BuiltinCode; 7] = [
        error_ctor,
        eval_error_ctor,
        range_error_ctor,
        reference_error_ctor,
        syntax_error_ctor,
        type_error_ctor,
        uri_error_ctor,
    ];
    for (ty, code) in ErrorType::ALL.into_iter().zip(error_ctors) {
        let proto = engine.protos.errors[ty as usize];
        define_constructor(engine, ty.name(), code, code, proto);
        let name = reserved_string(engine, ty.name());
        define_value(engine, proto, "name", name, ATTR_NOT_ENUMERABLE);
        let message = reserved_string(engine, "");
        define_value(engine, proto, "message", message, ATTR_NOT_ENUMERABLE);
    }
    let error_proto = engine.protos.errors[ErrorType::Error as usize];
    define_method(engine, error_proto, "toString", error_to_string, 0);
}

// ── Helpers ──

fn object_arg(engine: &mut ExecutionEngine, data: &CallData, what: &str) -> Result<ManagedRef, ExceptionSignal> {
    match data.arg(0).as_managed() {
        Some(m) if engine.heap.is_object(m) => Ok(m),
        _ => Err(engine.throw_type_error(format!("Object.{} called on non-object", what))),
    }
}

fn this_object(engine: &mut ExecutionEngine, data: &CallData) -> Result<ManagedRef, ExceptionSignal> {
    runtime::to_object(engine, data.this)
}

fn length_of(engine: &mut ExecutionEngine, o: ManagedRef) -> Result<u32, ExceptionSignal> {
    let length = engine.ids.length;
    let v = object::get(engine, o, length)?;
    runtime::to_uint32(engine, v)
}

fn set_length(engine: &mut ExecutionEngine, o: ManagedRef, len: u32) -> Result<(), ExceptionSignal> {
    let length = engine.ids.length;
    object::put(engine, o, length, Value::from_uint32(len))
}

/// Arrays whose elements all have default attributes can move elements in
/// place.
fn is_simple_array(engine: &ExecutionEngine, o: ManagedRef) -> bool {
    engine.vtable_of(o).is::<object::ArrayObject>()
        && object::is_extensible(engine, o)
        && engine.heap.object(o).map_or(false, |d| !d.array.has_attributes())
}

// ── Global ──

fn print(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let mut parts = Vec::with_capacity(data.argc());
    for v in &data.args {
        parts.push(runtime::display_value(engine, *v));
    }
    let line = parts.join(" ");
    tracing::debug!(target: "jsv4::builtins", %line, "print");
    engine.print(line);
    Ok(Value::undefined())
}

// ── Object ──

fn object_call(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let v = data.arg(0);
    if v.is_null_or_undefined() {
        return engine.new_object().map(Value::from_managed);
    }
    runtime::to_object(engine, v).map(Value::from_managed)
}

fn object_freeze(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "freeze")?;
    object::freeze(engine, o);
    Ok(data.arg(0))
}

fn object_seal(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "seal")?;
    object::seal(engine, o);
    Ok(data.arg(0))
}

fn object_prevent_extensions(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "preventExtensions")?;
    object::prevent_extensions(engine, o);
    Ok(data.arg(0))
}

fn object_is_frozen(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "isFrozen")?;
    Ok(Value::from_bool(object::is_frozen(engine, o)))
}

fn object_is_sealed(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "isSealed")?;
    Ok(Value::from_bool(object::is_sealed(engine, o)))
}

fn object_is_extensible(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "isExtensible")?;
    Ok(Value::from_bool(object::is_extensible(engine, o)))
}

fn object_keys(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "keys")?;
    let mut names = Vec::new();
    for key in object::own_enumerable_keys(engine, o) {
        names.push(match key {
            PropertyKey::Name(id) => engine.identifier_string(id)?,
            PropertyKey::Index(i) => engine.new_string(&i.to_string())?,
        });
    }
    engine.new_array(names).map(Value::from_managed)
}

fn object_get_prototype_of(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "getPrototypeOf")?;
    Ok(engine.prototype_of(o).map_or(Value::null(), Value::from_managed))
}

/// ToPropertyDescriptor (ECMA-262 §8.10.5).
fn to_property_descriptor(
    engine: &mut ExecutionEngine,
    desc: Value,
) -> Result<(Property, PropertyAttributes), ExceptionSignal> {
    let d = match desc.as_managed() {
        Some(d) if engine.heap.is_object(d) => d,
        _ => return Err(engine.throw_type_error("Property description must be an object")),
    };
    let mut p = Property::generic_descriptor();
    let mut attrs = PropertyAttributes::generic();
    let has = |engine: &mut ExecutionEngine, name: &str| {
        let id = engine.identifiers.intern(name);
        (id, !object::query(engine, d, id).is_empty())
    };
    let (id, present) = has(engine, "enumerable");
    if present {
        let v = object::get(engine, d, id)?;
        attrs.set_enumerable(runtime::to_boolean(engine, v));
    }
    let (id, present) = has(engine, "configurable");
    if present {
        let v = object::get(engine, d, id)?;
        attrs.set_configurable(runtime::to_boolean(engine, v));
    }
    for (name, is_getter) in [("get", true), ("set", false)] {
        let (id, present) = has(engine, name);
        if !present {
            continue;
        }
        let f = object::get(engine, d, id)?;
        if !f.is_undefined() && !engine.is_function(f) {
            return Err(engine.throw_type_error(format!("Invalid {}ter", name)));
        }
        attrs.set_type(PropertyType::Accessor);
        if is_getter {
            p.set_getter(f.as_managed());
        } else {
            p.set_setter(f.as_managed());
        }
    }
    let (id, present) = has(engine, "writable");
    if present {
        if attrs.is_accessor() {
            return Err(engine.throw_type_error("Invalid property descriptor. Cannot both specify accessors and a writable attribute"));
        }
        let v = object::get(engine, d, id)?;
        attrs.set_writable(runtime::to_boolean(engine, v));
    }
    let (id, present) = has(engine, "value");
    if present {
        if attrs.is_accessor() {
            return Err(engine.throw_type_error("Invalid property descriptor. Cannot both specify accessors and a value"));
        }
        p.value = object::get(engine, d, id)?;
        attrs.set_type(PropertyType::Data);
    }
    Ok((p, attrs))
}

fn object_define_property(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = object_arg(engine, data, "defineProperty")?;
    let key = runtime::to_property_key(engine, data.arg(1))?;
    let (p, attrs) = to_property_descriptor(engine, data.arg(2))?;
    match key {
        PropertyKey::Name(id) => object::define_own_property(engine, o, id, p, attrs)?,
        PropertyKey::Index(i) => object::define_own_indexed_property(engine, o, i, p, attrs)?,
    };
    Ok(data.arg(0))
}

fn object_to_string(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let text = if data.this.is_undefined() {
        "[object Undefined]".to_string()
    } else if data.this.is_null() {
        "[object Null]".to_string()
    } else {
        let o = this_object(engine, data)?;
        let vtable = engine.vtable_of(o);
        let subtype = engine.heap.header(o).flags.subtype();
        format!("[object {}]", class_name(vtable, subtype))
    };
    engine.new_string(&text)
}

fn object_value_of(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    this_object(engine, data).map(Value::from_managed)
}

fn object_has_own_property(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let key = runtime::to_property_key(engine, data.arg(0))?;
    let o = this_object(engine, data)?;
    Ok(Value::from_bool(object::has_own_property(engine, o, key)))
}

// ── Function ──

fn function_to_string(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    if !engine.is_function(data.this) {
        return Err(engine.throw_type_error("Function.prototype.toString called on incompatible object"));
    }
    engine.new_string("function() { [code] }")
}

fn function_call(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let args = data.args.iter().skip(1).copied().collect();
    runtime::call_value(engine, data.this, data.arg(0), args)
}

fn function_apply(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let list = data.arg(1);
    let mut args = Vec::new();
    if !list.is_null_or_undefined() {
        let o = match list.as_managed() {
            Some(o) if engine.heap.is_object(o) => o,
            _ => return Err(engine.throw_type_error("CreateListFromArrayLike called on non-object")),
        };
        let len = length_of(engine, o)?;
        for i in 0..len {
            args.push(object::get_indexed(engine, o, i)?);
        }
    }
    runtime::call_value(engine, data.this, data.arg(0), args)
}

// ── Array ──

fn array_call(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    if data.argc() == 1 && data.arg(0).is_number() {
        let len = data.arg(0);
        let a = engine.new_array(Vec::new())?;
        object::set_array_length(engine, a, len)?;
        return Ok(Value::from_managed(a));
    }
    engine.new_array(data.args.clone()).map(Value::from_managed)
}

fn array_push(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = this_object(engine, data)?;
    let mut len = length_of(engine, o)?;
    for v in &data.args {
        object::put_indexed(engine, o, len, *v)?;
        len += 1;
    }
    set_length(engine, o, len)?;
    Ok(Value::from_uint32(len))
}

fn array_pop(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = this_object(engine, data)?;
    let len = length_of(engine, o)?;
    if len == 0 {
        set_length(engine, o, 0)?;
        return Ok(Value::undefined());
    }
    let v = object::get_indexed(engine, o, len - 1)?;
    object::delete_indexed_property(engine, o, len - 1);
    set_length(engine, o, len - 1)?;
    Ok(v)
}

fn array_shift(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = this_object(engine, data)?;
    let len = length_of(engine, o)?;
    if len == 0 {
        set_length(engine, o, 0)?;
        return Ok(Value::undefined());
    }
    if is_simple_array(engine, o) {
        let first = object::get_indexed(engine, o, 0)?;
        if let Some(d) = engine.heap.object_mut(o) {
            d.array.shift();
        }
        object::set_array_length(engine, o, Value::from_uint32(len - 1))?;
        return Ok(first);
    }
    let first = object::get_indexed(engine, o, 0)?;
    for k in 1..len {
        if object::has_own_property(engine, o, PropertyKey::Index(k)) {
            let v = object::get_indexed(engine, o, k)?;
            object::put_indexed(engine, o, k - 1, v)?;
        } else {
            object::delete_indexed_property(engine, o, k - 1);
        }
    }
    object::delete_indexed_property(engine, o, len - 1);
    set_length(engine, o, len - 1)?;
    Ok(first)
}

fn array_unshift(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = this_object(engine, data)?;
    let len = length_of(engine, o)?;
    let count = data.argc() as u32;
    if is_simple_array(engine, o) {
        for v in data.args.iter().rev() {
            if let Some(d) = engine.heap.object_mut(o) {
                d.array.unshift(*v);
            }
        }
        object::set_array_length(engine, o, Value::from_uint32(len + count))?;
        return Ok(Value::from_uint32(len + count));
    }
    for k in (0..len).rev() {
        if object::has_own_property(engine, o, PropertyKey::Index(k)) {
            let v = object::get_indexed(engine, o, k)?;
            object::put_indexed(engine, o, k + count, v)?;
        } else {
            object::delete_indexed_property(engine, o, k + count);
        }
    }
    for (j, v) in data.args.iter().enumerate() {
        object::put_indexed(engine, o, j as u32, *v)?;
    }
    set_length(engine, o, len + count)?;
    Ok(Value::from_uint32(len + count))
}

fn array_join(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = this_object(engine, data)?;
    let separator = if data.arg(0).is_undefined() {
        Rc::from(",")
    } else {
        runtime::to_string(engine, data.arg(0))?
    };
    let len = length_of(engine, o)?;
    let mut out = String::new();
    for i in 0..len {
        if i > 0 {
            out.push_str(&separator);
        }
        let v = object::get_indexed(engine, o, i)?;
        if !v.is_null_or_undefined() {
            out.push_str(&runtime::to_string(engine, v)?);
        }
    }
    engine.new_string(&out)
}

fn array_to_string(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    array_join(engine, &CallData::new(data.this, Vec::new()))
}

// ── Boolean, Number, String ──

fn primitive_of(engine: &mut ExecutionEngine, v: Value) -> ReturnedValue {
    let m = match v.as_managed() {
        Some(m) if engine.heap.is_object(m) => m,
        _ => return Ok(v),
    };
    let inner = match engine.heap.object(m).map(|o| &o.kind) {
        Some(ObjectKind::Boolean(b)) => Some(Value::from_bool(*b)),
        Some(ObjectKind::Number(d)) => Some(Value::from_number(*d)),
        Some(ObjectKind::String(s)) => Some(*s),
        _ => None,
    };
    inner.ok_or_else(|| engine.throw_type_error("valueOf called on incompatible object"))
}

fn primitive_value_of(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    primitive_of(engine, data.this)
}

fn primitive_to_string(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let v = primitive_of(engine, data.this)?;
    runtime::to_string_value(engine, v)
}

// ── Error ──

fn construct_error(engine: &mut ExecutionEngine, ty: ErrorType, data: &CallData) -> ReturnedValue {
    let message = if data.arg(0).is_undefined() {
        Rc::from("")
    } else {
        runtime::to_string(engine, data.arg(0))?
    };
    Ok(Value::from_managed(engine.new_error(ty, &message)))
}

macro_rules! error_constructor {
    ($name:ident, $ty:expr) => {
        fn $name(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
            construct_error(engine, $ty, data)
        }
    };
}

error_constructor!(error_ctor, ErrorType::Error);
error_constructor!(eval_error_ctor, ErrorType::EvalError);
error_constructor!(range_error_ctor, ErrorType::RangeError);
error_constructor!(reference_error_ctor, ErrorType::ReferenceError);
error_constructor!(syntax_error_ctor, ErrorType::SyntaxError);
error_constructor!(type_error_ctor, ErrorType::TypeError);
error_constructor!(uri_error_ctor, ErrorType::URIError);

fn error_to_string(engine: &mut ExecutionEngine, data: &CallData) -> ReturnedValue {
    let o = match data.this.as_managed() {
        Some(o) if engine.heap.is_object(o) => o,
        _ => return Err(engine.throw_type_error("Error.prototype.toString called on non-object")),
    };
    let name_id = engine.ids.name;
    let message_id = engine.ids.message;
    let name = object::get(engine, o, name_id)?;
    let name = if name.is_undefined() { Rc::from("Error") } else { runtime::to_string(engine, name)? };
    let message = object::get(engine, o, message_id)?;
    let message = if message.is_undefined() { Rc::from("") } else { runtime::to_string(engine, message)? };
    let text = match (name.is_empty(), message.is_empty()) {
        (_, true) => name.to_string(),
        (true, false) => message.to_string(),
        (false, false) => format!("{}: {}", name, message),
    };
    engine.new_string(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(engine: &mut ExecutionEngine, name: &str) -> Value {
        let id = engine.identifiers.intern(name);
        let g = engine.global_object;
        object::get(engine, g, id).unwrap()
    }

    #[test]
    fn test_error_constructors_are_installed() {
        let mut e = ExecutionEngine::default();
        for ty in ErrorType::ALL {
            let ctor = global(&mut e, ty.name());
            assert!(e.is_function(ctor));
            let msg = e.new_string("boom").unwrap();
            let err = runtime::construct_value(&mut e, ctor, vec![msg]).unwrap();
            assert_eq!(e.error_type_of(err), Some(ty));
            assert_eq!(runtime::describe_exception(&mut e, err), format!("{}: boom", ty.name()));
        }
    }

    #[test]
    fn test_push_pop_shift_unshift() {
        let mut e = ExecutionEngine::default();
        let a = Value::from_managed(e.new_array(vec![Value::from_int32(1)]).unwrap());
        let push = e.identifiers.intern("push");
        let n = runtime::call_property(&mut e, a, push, vec![Value::from_int32(2), Value::from_int32(3)]).unwrap();
        assert_eq!(n.int_32(), 3);
        let unshift = e.identifiers.intern("unshift");
        runtime::call_property(&mut e, a, unshift, vec![Value::from_int32(0)]).unwrap();
        let shift = e.identifiers.intern("shift");
        assert_eq!(runtime::call_property(&mut e, a, shift, vec![]).unwrap().int_32(), 0);
        let pop = e.identifiers.intern("pop");
        assert_eq!(runtime::call_property(&mut e, a, pop, vec![]).unwrap().int_32(), 3);
        assert_eq!(runtime::display_value(&mut e, a), "1,2");
    }

    #[test]
    fn test_object_to_string_tags() {
        let mut e = ExecutionEngine::default();
        let a = Value::from_managed(e.new_array(vec![]).unwrap());
        let to_string = e.identifiers.intern("toString");
        let proto = e.protos.object;
        let f = object::get(&mut e, proto, to_string).unwrap();
        let r = runtime::call_value(&mut e, f, a, vec![]).unwrap();
        assert_eq!(e.string_text(r).as_deref(), Some("[object Array]"));
    }

    #[test]
    fn test_define_property_read_only() {
        let mut e = ExecutionEngine::default();
        let o = e.new_object().unwrap();
        let desc = e.new_object().unwrap();
        let value = e.identifiers.intern("value");
        object::put(&mut e, desc, value, Value::from_int32(1)).unwrap();
        let define = global(&mut e, "Object");
        let define_id = e.identifiers.intern("defineProperty");
        let key = e.new_string("x").unwrap();
        runtime::call_property(&mut e, define, define_id, vec![Value::from_managed(o), key, Value::from_managed(desc)]).unwrap();
        let x = e.identifiers.intern("x");
        object::put(&mut e, o, x, Value::from_int32(2)).unwrap();
        assert_eq!(object::get(&mut e, o, x).unwrap().int_32(), 1);
        assert!(!object::query(&e, o, x).is_writable());
    }
}
