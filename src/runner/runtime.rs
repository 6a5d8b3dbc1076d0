//! Runtime helpers shared by the interpreter and the generated code.
//!
//! Every operation the backends do not inline lands here: name resolution
//! through the context chain, property access on arbitrary values, the
//! operators, and the builtins the code generator calls by name.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::runner::context::{ContextId, ContextKind, VarSlot};
use crate::runner::ds::error::{ErrorType, ExceptionSignal, ReturnedValue};
use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::internal_class::ClassId;
use crate::runner::ds::managed::ManagedRef;
use crate::runner::ds::object::{self, ObjectKind, PropertyKey};
use crate::runner::ds::property::{Property, PropertyAttributes, ATTR_NOT_CONFIGURABLE};
use crate::runner::ds::value::{number_to_string, string_to_array_index, Value, ValueTag};
use crate::runner::engine::ExecutionEngine;
use crate::runner::ir::{AluOp, Type};

/// Preferred result type of ToPrimitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Number,
    String,
}

// ── Conversions ──

pub fn to_primitive(engine: &mut ExecutionEngine, v: Value, hint: Hint) -> ReturnedValue {
    let m = match v.as_managed() {
        Some(m) if engine.heap.is_object(m) => m,
        _ => return Ok(v),
    };
    let order = match hint {
        Hint::String => [engine.ids.to_string, engine.ids.value_of],
        Hint::Number => [engine.ids.value_of, engine.ids.to_string],
    };
    for id in order {
        let f = object::get(engine, m, id)?;
        if engine.is_function(f) {
            let r = engine.call_value(f, v, Vec::new())?;
            if !r.is_object(&engine.heap) {
                return Ok(r);
            }
        }
    }
    Err(engine.throw_type_error("Cannot convert object to primitive value"))
}

pub fn to_number(engine: &mut ExecutionEngine, v: Value) -> Result<f64, ExceptionSignal> {
    if let Some(n) = v.as_number() {
        return Ok(n);
    }
    let p = to_primitive(engine, v, Hint::Number)?;
    Ok(p.to_number(&engine.heap))
}

pub fn to_int32(engine: &mut ExecutionEngine, v: Value) -> Result<i32, ExceptionSignal> {
    if v.is_integer() {
        return Ok(v.int_32());
    }
    let p = to_primitive(engine, v, Hint::Number)?;
    Ok(p.to_int32(&engine.heap))
}

pub fn to_uint32(engine: &mut ExecutionEngine, v: Value) -> Result<u32, ExceptionSignal> {
    to_int32(engine, v).map(|i| i as u32)
}

pub fn to_boolean(engine: &ExecutionEngine, v: Value) -> bool {
    v.to_boolean(&engine.heap)
}

/// Value of `v` as the static type `ty`. `Var` and the non-value types
/// leave it unchanged.
pub fn convert_type(engine: &mut ExecutionEngine, v: Value, ty: Type) -> ReturnedValue {
    Ok(match ty {
        Type::Bool => Value::from_bool(to_boolean(engine, v)),
        Type::SInt32 => Value::from_int32(to_int32(engine, v)?),
        Type::UInt32 => Value::from_uint32(to_uint32(engine, v)?),
        Type::Double => Value::from_double(to_number(engine, v)?),
        Type::String => return to_string_value(engine, v),
        Type::Undefined => Value::undefined(),
        Type::Null => Value::null(),
        Type::Var | Type::Missing => v,
    })
}

/// Boxed form of an IR constant. Strings are not constants.
pub fn constant_value(ty: Type, value: f64) -> Value {
    match ty {
        Type::Undefined | Type::String | Type::Var => Value::undefined(),
        Type::Null => Value::null(),
        Type::Bool => Value::from_bool(value != 0.0),
        Type::SInt32 => Value::from_int32(value as i32),
        Type::UInt32 => Value::from_uint32(value as u32),
        Type::Double => Value::from_double(value),
        Type::Missing => Value::empty(),
    }
}

/// Text of a primitive. Objects must be reduced first.
fn primitive_to_string(engine: &ExecutionEngine, v: Value) -> Rc<str> {
    if v.is_double() {
        return Rc::from(number_to_string(v.double_value()));
    }
    match v.tag() {
        Some(ValueTag::Undefined) | Some(ValueTag::Empty) => Rc::from("undefined"),
        Some(ValueTag::Null) => Rc::from("null"),
        Some(ValueTag::Boolean) => Rc::from(if v.boolean_value() { "true" } else { "false" }),
        Some(ValueTag::Integer) => Rc::from(v.int_32().to_string()),
        Some(ValueTag::Managed) => engine.string_text(v).unwrap_or_else(|| Rc::from("")),
        None => Rc::from(""),
    }
}

pub fn to_string(engine: &mut ExecutionEngine, v: Value) -> Result<Rc<str>, ExceptionSignal> {
    let p = to_primitive(engine, v, Hint::String)?;
    Ok(primitive_to_string(engine, p))
}

/// ToString that hands back a string value, reusing `v` when it is one.
pub fn to_string_value(engine: &mut ExecutionEngine, v: Value) -> ReturnedValue {
    if v.is_string(&engine.heap) {
        return Ok(v);
    }
    let s = to_string(engine, v)?;
    engine.new_string_rc(s)
}

pub fn to_object(engine: &mut ExecutionEngine, v: Value) -> Result<ManagedRef, ExceptionSignal> {
    if let Some(m) = v.as_managed() {
        if engine.heap.is_object(m) {
            return Ok(m);
        }
        return engine.new_string_object(v);
    }
    if let Some(d) = v.as_number() {
        return engine.new_number_object(d);
    }
    if v.is_boolean() {
        return engine.new_boolean_object(v.boolean_value());
    }
    Err(engine.throw_type_error("Cannot convert undefined or null to object"))
}

pub fn to_property_key(engine: &mut ExecutionEngine, v: Value) -> Result<PropertyKey, ExceptionSignal> {
    let index = v.as_array_index();
    if index != u32::MAX {
        return Ok(PropertyKey::Index(index));
    }
    let s = to_string(engine, v)?;
    let index = string_to_array_index(&s);
    if index != u32::MAX {
        return Ok(PropertyKey::Index(index));
    }
    Ok(PropertyKey::Name(engine.identifiers.intern(&s)))
}

/// Never-throwing rendering for diagnostics and the command line.
pub fn display_value(engine: &mut ExecutionEngine, v: Value) -> String {
    if engine.is_function(v) {
        return "function() { [code] }".to_string();
    }
    if let Some(m) = v.as_managed() {
        if engine.vtable_of(m).is::<object::ArrayObject>() {
            let len = object::array_length(engine, m);
            let mut parts = Vec::with_capacity(len as usize);
            for i in 0..len.min(100) {
                let e = object::get_indexed(engine, m, i).unwrap_or_else(|_| {
                    engine.catch_exception();
                    Value::undefined()
                });
                parts.push(if e.is_null_or_undefined() { String::new() } else { display_value(engine, e) });
            }
            return parts.join(",");
        }
    }
    match to_string(engine, v) {
        Ok(s) => s.to_string(),
        Err(_) => {
            engine.catch_exception();
            "[object]".to_string()
        }
    }
}

/// `Name: message` for error objects, the plain text of anything else.
pub fn describe_exception(engine: &mut ExecutionEngine, v: Value) -> String {
    let m = match v.as_managed() {
        Some(m) if engine.error_type_of(v).is_some() => m,
        _ => return display_value(engine, v),
    };
    let fallback = engine.error_type_of(v).map_or("Error", ErrorType::name);
    let name_id = engine.ids.name;
    let message_id = engine.ids.message;
    let name = object::get(engine, m, name_id)
        .ok()
        .filter(|n| !n.is_undefined())
        .map(|n| display_value(engine, n))
        .unwrap_or_else(|| fallback.to_string());
    let message = object::get(engine, m, message_id)
        .ok()
        .filter(|n| !n.is_undefined())
        .map(|n| display_value(engine, n))
        .unwrap_or_default();
    if engine.has_exception {
        engine.catch_exception();
    }
    if message.is_empty() {
        name
    } else {
        format!("{}: {}", name, message)
    }
}

// ── Scope chain ──

enum Binding {
    Slot(ContextId, VarSlot),
    CatchVar(ContextId),
    Callee(ManagedRef),
    Object(ManagedRef),
    Unresolved,
}

fn has_property(engine: &ExecutionEngine, m: ManagedRef, id: Identifier) -> bool {
    !object::query(engine, m, id).is_empty() || {
        let mut cur = Some(m);
        let mut found = false;
        while let Some(c) = cur {
            if object::has_own_property(engine, c, PropertyKey::Name(id)) {
                found = true;
                break;
            }
            cur = engine.prototype_of(c);
        }
        found
    }
}

fn resolve(engine: &ExecutionEngine, id: Identifier) -> Binding {
    let mut cur = Some(engine.current_context);
    while let Some(c) = cur {
        let ctx = engine.contexts.get(c);
        match &ctx.kind {
            ContextKind::Call(call) => {
                if let Some(slot) = call.slot(id, &engine.classes) {
                    return Binding::Slot(c, slot);
                }
                if call.function.flags.is_named_expression && call.function.name == id {
                    return Binding::Callee(call.function_object);
                }
            }
            ContextKind::Catch { exception_var, .. } => {
                if *exception_var == id {
                    return Binding::CatchVar(c);
                }
            }
            ContextKind::With { object } => {
                if has_property(engine, *object, id) {
                    return Binding::Object(*object);
                }
            }
            ContextKind::Global => {
                if has_property(engine, engine.global_object, id) {
                    return Binding::Object(engine.global_object);
                }
            }
        }
        cur = ctx.outer;
    }
    Binding::Unresolved
}

fn not_defined(engine: &mut ExecutionEngine, id: Identifier) -> ExceptionSignal {
    let name = engine.identifiers.name_rc(id);
    engine.throw_reference_error(format!("{} is not defined", name))
}

pub fn get_activation_property(engine: &mut ExecutionEngine, id: Identifier) -> ReturnedValue {
    match resolve(engine, id) {
        Binding::Slot(c, slot) => Ok(engine.contexts.get(c).as_call().map_or(Value::undefined(), |call| call.read(slot))),
        Binding::CatchVar(c) => match &engine.contexts.get(c).kind {
            ContextKind::Catch { exception_value, .. } => Ok(*exception_value),
            _ => Ok(Value::undefined()),
        },
        Binding::Callee(f) => Ok(Value::from_managed(f)),
        Binding::Object(o) => object::get(engine, o, id),
        Binding::Unresolved => Err(not_defined(engine, id)),
    }
}

pub fn set_activation_property(engine: &mut ExecutionEngine, id: Identifier, value: Value) -> Result<(), ExceptionSignal> {
    match resolve(engine, id) {
        Binding::Slot(c, slot) => {
            if let Some(call) = engine.contexts.get_mut(c).as_call_mut() {
                call.write(slot, value);
            }
            Ok(())
        }
        Binding::CatchVar(c) => {
            if let ContextKind::Catch { exception_value, .. } = &mut engine.contexts.get_mut(c).kind {
                *exception_value = value;
            }
            Ok(())
        }
        Binding::Callee(_) => {
            if engine.current_strict() {
                return Err(engine.throw_type_error("Assignment to constant variable."));
            }
            Ok(())
        }
        Binding::Object(o) => object::put(engine, o, id, value),
        Binding::Unresolved => {
            if engine.current_strict() {
                return Err(not_defined(engine, id));
            }
            let global = engine.global_object;
            object::put(engine, global, id, value)
        }
    }
}

pub fn delete_name(engine: &mut ExecutionEngine, id: Identifier) -> ReturnedValue {
    match resolve(engine, id) {
        Binding::Object(o) => Ok(Value::from_bool(object::delete_property(engine, o, id))),
        Binding::Unresolved => Ok(Value::from_bool(true)),
        _ => Ok(Value::from_bool(false)),
    }
}

pub fn typeof_name(engine: &mut ExecutionEngine, id: Identifier) -> ReturnedValue {
    let v = match resolve(engine, id) {
        Binding::Unresolved => Value::undefined(),
        _ => get_activation_property(engine, id)?,
    };
    typeof_value(engine, v)
}

/// Global variable declaration. Existing properties are left alone.
pub fn declare_var(engine: &mut ExecutionEngine, deletable: bool, id: Identifier) -> Result<(), ExceptionSignal> {
    let global = engine.global_object;
    if object::has_own_property(engine, global, PropertyKey::Name(id)) {
        return Ok(());
    }
    let attrs = if deletable {
        PropertyAttributes::data()
    } else {
        PropertyAttributes::from_flags(ATTR_NOT_CONFIGURABLE)
    };
    object::insert_member(engine, global, id, Property::new(Value::undefined()), attrs);
    Ok(())
}

/// `this` of the innermost function, the global object at top level.
pub fn this_object(engine: &ExecutionEngine) -> Value {
    let mut cur = Some(engine.current_context);
    while let Some(c) = cur {
        let ctx = engine.contexts.get(c);
        if let Some(call) = ctx.as_call() {
            return call.this;
        }
        cur = ctx.outer;
    }
    Value::from_managed(engine.global_object)
}

fn innermost_call(engine: &ExecutionEngine) -> Option<ContextId> {
    let mut cur = Some(engine.current_context);
    while let Some(c) = cur {
        let ctx = engine.contexts.get(c);
        if ctx.as_call().is_some() {
            return Some(c);
        }
        cur = ctx.outer;
    }
    None
}

/// Sloppy-mode `this`: undefined and null become the global object,
/// primitives get wrapped.
pub fn convert_this_to_object(engine: &mut ExecutionEngine) -> Result<(), ExceptionSignal> {
    let c = match innermost_call(engine) {
        Some(c) => c,
        None => return Ok(()),
    };
    let this = this_object(engine);
    let converted = if this.is_null_or_undefined() {
        Value::from_managed(engine.global_object)
    } else {
        Value::from_managed(to_object(engine, this)?)
    };
    if let Some(call) = engine.contexts.get_mut(c).as_call_mut() {
        call.this = converted;
    }
    Ok(())
}

pub fn setup_arguments_object(engine: &mut ExecutionEngine) -> ReturnedValue {
    match innermost_call(engine) {
        Some(c) => engine.new_arguments_object(c).map(Value::from_managed),
        None => Ok(Value::undefined()),
    }
}

pub fn push_with_scope(engine: &mut ExecutionEngine, v: Value) -> Result<(), ExceptionSignal> {
    let object = to_object(engine, v)?;
    engine.push_context(ContextKind::With { object });
    Ok(())
}

pub fn push_catch_scope(engine: &mut ExecutionEngine, exception_var: Identifier, exception_value: Value) {
    engine.push_context(ContextKind::Catch {
        exception_var,
        exception_value,
    });
}

pub fn pop_scope(engine: &mut ExecutionEngine) {
    engine.pop_context();
}

pub fn throw_exception(engine: &mut ExecutionEngine, v: Value) -> ExceptionSignal {
    engine.throw(v)
}

/// Takes the pending exception at the start of a handler.
pub fn unwind_exception(engine: &mut ExecutionEngine) -> Value {
    engine.catch_exception()
}

// ── Properties ──

fn base_error(engine: &mut ExecutionEngine, verb: &str, key: &str, base: Value) -> ExceptionSignal {
    let what = if base.is_null() { "null" } else { "undefined" };
    engine.throw_type_error(format!("Cannot {} property '{}' of {}", verb, key, what))
}

fn primitive_prototype(engine: &ExecutionEngine, v: Value) -> ManagedRef {
    if v.is_number() {
        engine.protos.number
    } else if v.is_boolean() {
        engine.protos.boolean
    } else if v.is_string(&engine.heap) {
        engine.protos.string
    } else {
        engine.protos.object
    }
}

pub fn get_property(engine: &mut ExecutionEngine, base: Value, id: Identifier) -> ReturnedValue {
    if let Some(m) = base.as_managed() {
        if engine.heap.is_object(m) {
            return object::get(engine, m, id);
        }
    }
    if base.is_null_or_undefined() {
        let name = engine.identifiers.name_rc(id);
        return Err(base_error(engine, "read", &name, base));
    }
    if let Some(text) = engine.string_text(base) {
        if id == engine.ids.length {
            return Ok(Value::from_int32(text.encode_utf16().count() as i32));
        }
    }
    let proto = primitive_prototype(engine, base);
    object::get(engine, proto, id)
}

pub fn set_property(engine: &mut ExecutionEngine, base: Value, id: Identifier, value: Value) -> Result<(), ExceptionSignal> {
    if base.is_null_or_undefined() {
        let name = engine.identifiers.name_rc(id);
        return Err(base_error(engine, "set", &name, base));
    }
    match base.as_managed() {
        Some(m) if engine.heap.is_object(m) => object::put(engine, m, id, value),
        _ => Ok(()),
    }
}

fn string_char_at(engine: &mut ExecutionEngine, base: Value, index: u32) -> Option<ReturnedValue> {
    let text = engine.string_text(base)?;
    let unit = text.encode_utf16().nth(index as usize)?;
    let s = String::from_utf16_lossy(&[unit]);
    Some(engine.new_string(&s))
}

pub fn get_element(engine: &mut ExecutionEngine, base: Value, index: Value) -> ReturnedValue {
    if base.is_null_or_undefined() {
        let key = to_string(engine, index)?;
        return Err(base_error(engine, "read", &key, base));
    }
    let key = to_property_key(engine, index)?;
    if let Some(m) = base.as_managed().filter(|m| engine.heap.is_object(*m)) {
        return match key {
            PropertyKey::Index(i) => object::get_indexed(engine, m, i),
            PropertyKey::Name(id) => object::get(engine, m, id),
        };
    }
    match key {
        PropertyKey::Index(i) => match string_char_at(engine, base, i) {
            Some(r) => r,
            None => {
                let proto = primitive_prototype(engine, base);
                object::get_indexed(engine, proto, i)
            }
        },
        PropertyKey::Name(id) => get_property(engine, base, id),
    }
}

pub fn set_element(engine: &mut ExecutionEngine, base: Value, index: Value, value: Value) -> Result<(), ExceptionSignal> {
    if base.is_null_or_undefined() {
        let key = to_string(engine, index)?;
        return Err(base_error(engine, "set", &key, base));
    }
    let key = to_property_key(engine, index)?;
    match base.as_managed() {
        Some(m) if engine.heap.is_object(m) => match key {
            PropertyKey::Index(i) => object::put_indexed(engine, m, i, value),
            PropertyKey::Name(id) => object::put(engine, m, id, value),
        },
        _ => Ok(()),
    }
}

fn delete_result(engine: &mut ExecutionEngine, deleted: bool, key: &str) -> ReturnedValue {
    if !deleted && engine.current_strict() {
        return Err(engine.throw_type_error(format!("Cannot delete property '{}'", key)));
    }
    Ok(Value::from_bool(deleted))
}

pub fn delete_member(engine: &mut ExecutionEngine, base: Value, id: Identifier) -> ReturnedValue {
    let m = to_object(engine, base)?;
    let deleted = object::delete_property(engine, m, id);
    let name = engine.identifiers.name_rc(id);
    delete_result(engine, deleted, &name)
}

pub fn delete_element(engine: &mut ExecutionEngine, base: Value, index: Value) -> ReturnedValue {
    let m = to_object(engine, base)?;
    match to_property_key(engine, index)? {
        PropertyKey::Index(i) => {
            let deleted = object::delete_indexed_property(engine, m, i);
            delete_result(engine, deleted, &i.to_string())
        }
        PropertyKey::Name(id) => {
            let deleted = object::delete_property(engine, m, id);
            let name = engine.identifiers.name_rc(id);
            delete_result(engine, deleted, &name)
        }
    }
}

// ── Inline caches ──

pub fn get_property_lookup(engine: &mut ExecutionEngine, unit: usize, index: usize, base: Value) -> ReturnedValue {
    let m = match base.as_managed() {
        Some(m) if engine.heap.is_object(m) => m,
        _ => {
            let id = engine.units[unit].lookups[index].name;
            return get_property(engine, base, id);
        }
    };
    let mut l = engine.units[unit].lookups[index];
    let r = object::get_lookup(engine, m, &mut l);
    engine.units[unit].lookups[index] = l;
    r
}

pub fn set_property_lookup(
    engine: &mut ExecutionEngine,
    unit: usize,
    index: usize,
    base: Value,
    value: Value,
) -> Result<(), ExceptionSignal> {
    let m = match base.as_managed() {
        Some(m) if engine.heap.is_object(m) => m,
        _ => {
            let id = engine.units[unit].lookups[index].name;
            return set_property(engine, base, id, value);
        }
    };
    let mut l = engine.units[unit].lookups[index];
    let r = object::set_lookup(engine, m, &mut l, value);
    engine.units[unit].lookups[index] = l;
    r
}

/// Read of a name known to live on the global object.
pub fn get_global_lookup(engine: &mut ExecutionEngine, unit: usize, index: usize) -> ReturnedValue {
    let global = engine.global_object;
    let mut l = engine.units[unit].lookups[index];
    if l.class != Some(engine.class_of(global)) && !has_property(engine, global, l.name) {
        return Err(not_defined(engine, l.name));
    }
    let r = object::get_lookup(engine, global, &mut l);
    engine.units[unit].lookups[index] = l;
    r
}

// ── Calls ──

fn not_a_function(engine: &mut ExecutionEngine, what: &str) -> ExceptionSignal {
    engine.throw_type_error(format!("{} is not a function", what))
}

pub fn call_value(engine: &mut ExecutionEngine, f: Value, this: Value, args: Vec<Value>) -> ReturnedValue {
    if !engine.is_function(f) {
        let what = display_value(engine, f);
        return Err(not_a_function(engine, &what));
    }
    engine.call_value(f, this, args)
}

pub fn call_activation_property(engine: &mut ExecutionEngine, id: Identifier, args: Vec<Value>) -> ReturnedValue {
    let (f, this) = match resolve(engine, id) {
        Binding::Object(o) if o != engine.global_object => (object::get(engine, o, id)?, Value::from_managed(o)),
        Binding::Unresolved => return Err(not_defined(engine, id)),
        _ => (get_activation_property(engine, id)?, Value::undefined()),
    };
    if !engine.is_function(f) {
        let name = engine.identifiers.name_rc(id);
        return Err(not_a_function(engine, &name));
    }
    engine.call_value(f, this, args)
}

pub fn call_property(engine: &mut ExecutionEngine, base: Value, id: Identifier, args: Vec<Value>) -> ReturnedValue {
    let f = get_property(engine, base, id)?;
    if !engine.is_function(f) {
        let name = engine.identifiers.name_rc(id);
        let obj = display_value(engine, base);
        return Err(engine.throw_type_error(format!("Property '{}' of object {} is not a function", name, obj)));
    }
    engine.call_value(f, base, args)
}

pub fn call_element(engine: &mut ExecutionEngine, base: Value, index: Value, args: Vec<Value>) -> ReturnedValue {
    let f = get_element(engine, base, index)?;
    if !engine.is_function(f) {
        let key = display_value(engine, index);
        let obj = display_value(engine, base);
        return Err(engine.throw_type_error(format!("Property '{}' of object {} is not a function", key, obj)));
    }
    engine.call_value(f, base, args)
}

pub fn construct_value(engine: &mut ExecutionEngine, f: Value, args: Vec<Value>) -> ReturnedValue {
    match f.as_managed() {
        Some(m) if engine.is_function(f) => {
            object::construct(engine, m, &object::CallData::new(Value::undefined(), args))
        }
        _ => {
            let what = display_value(engine, f);
            Err(engine.throw_type_error(format!("{} is not a constructor", what)))
        }
    }
}

pub fn construct_activation_property(engine: &mut ExecutionEngine, id: Identifier, args: Vec<Value>) -> ReturnedValue {
    let f = get_activation_property(engine, id)?;
    construct_value(engine, f, args)
}

pub fn construct_property(engine: &mut ExecutionEngine, base: Value, id: Identifier, args: Vec<Value>) -> ReturnedValue {
    let f = get_property(engine, base, id)?;
    construct_value(engine, f, args)
}

// ── Literals ──

pub fn closure(engine: &mut ExecutionEngine, unit: usize, function: usize) -> ReturnedValue {
    let f = engine.units[unit].runtime_functions[function].clone();
    let scope = engine.current_context;
    engine.new_script_function(f, scope).map(Value::from_managed)
}

pub fn regexp_literal(engine: &mut ExecutionEngine, unit: usize, index: usize) -> ReturnedValue {
    let (source, flags) = engine.units[unit].unit.data.regexps[index].clone();
    engine.new_regexp_object(source, flags).map(Value::from_managed)
}

/// Array literal. `Value::empty()` entries are holes.
pub fn define_array(engine: &mut ExecutionEngine, values: Vec<Value>) -> ReturnedValue {
    engine.new_array(values).map(Value::from_managed)
}

/// One property of an object literal.
#[derive(Debug, Clone, Copy)]
pub enum LiteralProperty {
    Data(Value),
    Getter(Value),
    Setter(Value),
}

/// Object literal of shape `class`, the class linked for this literal.
/// Definitions are applied in source order, so a later one replaces an
/// earlier one of the same key and a getter joins an earlier setter.
pub fn define_object_literal(
    engine: &mut ExecutionEngine,
    class: ClassId,
    properties: Vec<(Value, LiteralProperty)>,
) -> ReturnedValue {
    let o = engine.new_literal_object(class)?;
    // Slots whose current content is an accessor.
    let mut accessor_slots = vec![false; engine.classes.get(class).size() as usize];
    for (key, prop) in properties {
        let key = to_property_key(engine, key)?;
        let slot = match key {
            PropertyKey::Name(id) => engine.classes.find(class, id),
            PropertyKey::Index(_) => None,
        };
        let joined = match slot {
            Some(s) if accessor_slots[s as usize] => Some(object::member_at(engine, o, s)),
            Some(_) => None,
            None => object::get_own_property(engine, o, key)
                .filter(|(_, a)| a.is_accessor())
                .map(|(p, _)| p),
        };
        let (p, attrs) = literal_property(prop, joined);
        match (key, slot) {
            (_, Some(s)) => {
                accessor_slots[s as usize] = attrs.is_accessor();
                object::set_member_at(engine, o, s, p);
            }
            (PropertyKey::Name(id), None) => object::insert_member(engine, o, id, p, attrs),
            (PropertyKey::Index(i), None) => {
                if let Some(data) = engine.heap.object_mut(o) {
                    data.array.put(i, p, attrs);
                }
            }
        }
    }
    Ok(Value::from_managed(o))
}

fn literal_property(prop: LiteralProperty, joined: Option<Property>) -> (Property, PropertyAttributes) {
    match prop {
        LiteralProperty::Data(v) => (Property::new(v), PropertyAttributes::data()),
        LiteralProperty::Getter(f) | LiteralProperty::Setter(f) => {
            let mut p = joined.unwrap_or_else(|| Property::accessor(None, None));
            if matches!(prop, LiteralProperty::Getter(_)) {
                p.set_getter(f.as_managed());
            } else {
                p.set_setter(f.as_managed());
            }
            (p, PropertyAttributes::accessor())
        }
    }
}

// ── for-in ──

pub fn foreach_iterator_object(engine: &mut ExecutionEngine, v: Value) -> ReturnedValue {
    let o = if v.is_null_or_undefined() {
        None
    } else {
        Some(to_object(engine, v)?)
    };
    engine.new_foreach_iterator(o).map(Value::from_managed)
}

/// Next key of the walk as a string, null once exhausted.
pub fn foreach_next_property_name(engine: &mut ExecutionEngine, it: Value) -> ReturnedValue {
    let m = match it.as_managed() {
        Some(m) => m,
        None => return Ok(Value::null()),
    };
    let mut state = match engine.heap.object_mut(m).map(|o| &mut o.kind) {
        Some(ObjectKind::ForeachIterator(state)) => std::mem::take(state),
        _ => return Ok(Value::null()),
    };
    let key = object::next_enumerable_key(engine, &mut state);
    if let Some(ObjectKind::ForeachIterator(slot)) = engine.heap.object_mut(m).map(|o| &mut o.kind) {
        *slot = state;
    }
    match key {
        Some(PropertyKey::Name(id)) => engine.identifier_string(id),
        Some(PropertyKey::Index(i)) => engine.new_string(&i.to_string()),
        None => Ok(Value::null()),
    }
}

// ── Operators ──

pub fn typeof_value(engine: &mut ExecutionEngine, v: Value) -> ReturnedValue {
    let name = if v.is_undefined() {
        "undefined"
    } else if v.is_null() {
        "object"
    } else if v.is_boolean() {
        "boolean"
    } else if v.is_number() {
        "number"
    } else if v.is_string(&engine.heap) {
        "string"
    } else if engine.is_function(v) {
        "function"
    } else {
        "object"
    };
    engine.new_string(name)
}

pub fn typeof_member(engine: &mut ExecutionEngine, base: Value, id: Identifier) -> ReturnedValue {
    let v = get_property(engine, base, id)?;
    typeof_value(engine, v)
}

pub fn typeof_element(engine: &mut ExecutionEngine, base: Value, index: Value) -> ReturnedValue {
    let v = get_element(engine, base, index)?;
    typeof_value(engine, v)
}

pub fn unop(engine: &mut ExecutionEngine, op: AluOp, v: Value) -> ReturnedValue {
    Ok(match op {
        AluOp::Not => Value::from_bool(!to_boolean(engine, v)),
        AluOp::UMinus => {
            if v.is_integer() && v.int_32() != 0 && v.int_32() != i32::MIN {
                Value::from_int32(-v.int_32())
            } else {
                Value::from_double(-to_number(engine, v)?)
            }
        }
        AluOp::UPlus => Value::from_number(to_number(engine, v)?),
        AluOp::Compl => Value::from_int32(!to_int32(engine, v)?),
        AluOp::Increment => number_add(Value::from_number(to_number(engine, v)?), Value::from_int32(1)),
        AluOp::Decrement => number_sub(Value::from_number(to_number(engine, v)?), Value::from_int32(1)),
        _ => return Err(engine.throw_type_error(format!("invalid unary operator {}", op.symbol()))),
    })
}

fn number_add(l: Value, r: Value) -> Value {
    if l.is_integer() && r.is_integer() {
        if let Some(s) = l.int_32().checked_add(r.int_32()) {
            return Value::from_int32(s);
        }
    }
    Value::from_number(l.as_number().unwrap_or(f64::NAN) + r.as_number().unwrap_or(f64::NAN))
}

fn number_sub(l: Value, r: Value) -> Value {
    if l.is_integer() && r.is_integer() {
        if let Some(s) = l.int_32().checked_sub(r.int_32()) {
            return Value::from_int32(s);
        }
    }
    Value::from_number(l.as_number().unwrap_or(f64::NAN) - r.as_number().unwrap_or(f64::NAN))
}

pub fn add(engine: &mut ExecutionEngine, l: Value, r: Value) -> ReturnedValue {
    if l.is_number() && r.is_number() {
        return Ok(number_add(l, r));
    }
    let pl = to_primitive(engine, l, Hint::Number)?;
    let pr = to_primitive(engine, r, Hint::Number)?;
    if pl.is_string(&engine.heap) || pr.is_string(&engine.heap) {
        let a = primitive_to_string(engine, pl);
        let b = primitive_to_string(engine, pr);
        let mut s = String::with_capacity(a.len() + b.len());
        s.push_str(&a);
        s.push_str(&b);
        return engine.new_string(&s);
    }
    Ok(Value::from_number(pl.to_number(&engine.heap) + pr.to_number(&engine.heap)))
}

fn numbers(engine: &mut ExecutionEngine, l: Value, r: Value) -> Result<(f64, f64), ExceptionSignal> {
    let a = to_number(engine, l)?;
    let b = to_number(engine, r)?;
    Ok((a, b))
}

fn int32s(engine: &mut ExecutionEngine, l: Value, r: Value) -> Result<(i32, i32), ExceptionSignal> {
    let a = to_int32(engine, l)?;
    let b = to_int32(engine, r)?;
    Ok((a, b))
}

/// `l < r` of ECMA-262 §11.8.5; `None` stands for undefined (a NaN operand).
fn less_than(engine: &mut ExecutionEngine, l: Value, r: Value) -> Result<Option<bool>, ExceptionSignal> {
    if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
        return Ok(a.partial_cmp(&b).map(|o| o == Ordering::Less));
    }
    let pl = to_primitive(engine, l, Hint::Number)?;
    let pr = to_primitive(engine, r, Hint::Number)?;
    if pl.is_string(&engine.heap) && pr.is_string(&engine.heap) {
        let a = primitive_to_string(engine, pl);
        let b = primitive_to_string(engine, pr);
        return Ok(Some(a.encode_utf16().lt(b.encode_utf16())));
    }
    let a = pl.to_number(&engine.heap);
    let b = pr.to_number(&engine.heap);
    Ok(a.partial_cmp(&b).map(|o| o == Ordering::Less))
}

/// Abstract equality (`==`).
pub fn equal(engine: &mut ExecutionEngine, l: Value, r: Value) -> Result<bool, ExceptionSignal> {
    if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
        return Ok(a == b);
    }
    if l.raw() == r.raw() {
        return Ok(true);
    }
    let heap = &engine.heap;
    if l.is_string(heap) && r.is_string(heap) {
        return Ok(l.strict_equals(r, heap));
    }
    if l.is_null_or_undefined() || r.is_null_or_undefined() {
        return Ok(l.is_null_or_undefined() && r.is_null_or_undefined());
    }
    if l.is_boolean() {
        return equal(engine, Value::from_int32(l.boolean_value() as i32), r);
    }
    if r.is_boolean() {
        return equal(engine, l, Value::from_int32(r.boolean_value() as i32));
    }
    let l_obj = l.is_object(heap);
    let r_obj = r.is_object(heap);
    if l_obj && r_obj {
        return Ok(false);
    }
    if l_obj {
        let p = to_primitive(engine, l, Hint::Number)?;
        return equal(engine, p, r);
    }
    if r_obj {
        let p = to_primitive(engine, r, Hint::Number)?;
        return equal(engine, l, p);
    }
    // number against string
    Ok(l.to_number(heap) == r.to_number(heap))
}

pub fn instance_of(engine: &mut ExecutionEngine, l: Value, r: Value) -> Result<bool, ExceptionSignal> {
    let f = match r.as_managed() {
        Some(f) if engine.is_function(r) => f,
        _ => return Err(engine.throw_type_error("Right-hand side of 'instanceof' is not callable")),
    };
    let mut o = match l.as_managed() {
        Some(o) if engine.heap.is_object(o) => o,
        _ => return Ok(false),
    };
    let prototype = engine.ids.prototype;
    let proto = object::get(engine, f, prototype)?;
    let proto = match proto.as_managed() {
        Some(p) if engine.heap.is_object(p) => p,
        _ => return Err(engine.throw_type_error("Function has non-object prototype in instanceof check")),
    };
    while let Some(next) = engine.prototype_of(o) {
        if next == proto {
            return Ok(true);
        }
        o = next;
    }
    Ok(false)
}

pub fn in_op(engine: &mut ExecutionEngine, l: Value, r: Value) -> Result<bool, ExceptionSignal> {
    let o = match r.as_managed() {
        Some(o) if engine.heap.is_object(o) => o,
        _ => return Err(engine.throw_type_error("Cannot use 'in' operator to search for a key in a non-object")),
    };
    Ok(match to_property_key(engine, l)? {
        PropertyKey::Name(id) => has_property(engine, o, id),
        PropertyKey::Index(i) => {
            !object::query_indexed(engine, o, i).is_empty()
                || object::has_own_property(engine, o, PropertyKey::Index(i))
        }
    })
}

pub fn binop(engine: &mut ExecutionEngine, op: AluOp, l: Value, r: Value) -> ReturnedValue {
    Ok(match op {
        AluOp::Add => return add(engine, l, r),
        AluOp::Sub => {
            if l.is_number() && r.is_number() {
                number_sub(l, r)
            } else {
                let (a, b) = numbers(engine, l, r)?;
                Value::from_number(a - b)
            }
        }
        AluOp::Mul => {
            if l.is_integer() && r.is_integer() {
                match l.int_32().checked_mul(r.int_32()) {
                    Some(p) if p != 0 => Value::from_int32(p),
                    _ => Value::from_number(l.int_32() as f64 * r.int_32() as f64),
                }
            } else {
                let (a, b) = numbers(engine, l, r)?;
                Value::from_number(a * b)
            }
        }
        AluOp::Div => {
            let (a, b) = numbers(engine, l, r)?;
            Value::from_number(a / b)
        }
        AluOp::Mod => {
            if l.is_integer() && r.is_integer() && l.int_32() >= 0 && r.int_32() > 0 {
                Value::from_int32(l.int_32() % r.int_32())
            } else {
                let (a, b) = numbers(engine, l, r)?;
                Value::from_number(a % b)
            }
        }
        AluOp::BitAnd => {
            let (a, b) = int32s(engine, l, r)?;
            Value::from_int32(a & b)
        }
        AluOp::BitOr => {
            let (a, b) = int32s(engine, l, r)?;
            Value::from_int32(a | b)
        }
        AluOp::BitXor => {
            let (a, b) = int32s(engine, l, r)?;
            Value::from_int32(a ^ b)
        }
        AluOp::LShift => {
            let (a, b) = int32s(engine, l, r)?;
            Value::from_int32(a.wrapping_shl(b as u32 & 0x1f))
        }
        AluOp::RShift => {
            let (a, b) = int32s(engine, l, r)?;
            Value::from_int32(a >> (b as u32 & 0x1f))
        }
        AluOp::URShift => {
            let (a, b) = int32s(engine, l, r)?;
            Value::from_uint32((a as u32) >> (b as u32 & 0x1f))
        }
        AluOp::Lt => Value::from_bool(less_than(engine, l, r)? == Some(true)),
        AluOp::Gt => {
            let pl = to_primitive(engine, l, Hint::Number)?;
            Value::from_bool(less_than(engine, r, pl)? == Some(true))
        }
        AluOp::Le => {
            let pl = to_primitive(engine, l, Hint::Number)?;
            Value::from_bool(less_than(engine, r, pl)? == Some(false))
        }
        AluOp::Ge => Value::from_bool(less_than(engine, l, r)? == Some(false)),
        AluOp::Equal => Value::from_bool(equal(engine, l, r)?),
        AluOp::NotEqual => Value::from_bool(!equal(engine, l, r)?),
        AluOp::StrictEqual => Value::from_bool(l.strict_equals(r, &engine.heap)),
        AluOp::StrictNotEqual => Value::from_bool(!l.strict_equals(r, &engine.heap)),
        AluOp::InstanceOf => Value::from_bool(instance_of(engine, l, r)?),
        AluOp::In => Value::from_bool(in_op(engine, l, r)?),
        _ => return Err(engine.throw_type_error(format!("invalid binary operator {}", op.symbol()))),
    })
}

/// Result of a comparison as a plain bool, for conditional jumps.
pub fn compare(engine: &mut ExecutionEngine, op: AluOp, l: Value, r: Value) -> Result<bool, ExceptionSignal> {
    binop(engine, op, l, r).map(|v| v.boolean_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::default()
    }

    #[test]
    fn test_add_concatenates_strings() {
        let mut e = engine();
        let a = e.new_string("a").unwrap();
        let r = add(&mut e, a, Value::from_int32(1)).unwrap();
        assert_eq!(e.string_text(r).as_deref(), Some("a1"));
        let r = add(&mut e, Value::from_int32(i32::MAX), Value::from_int32(1)).unwrap();
        assert_eq!(r.as_number(), Some(2147483648.0));
    }

    #[test]
    fn test_abstract_equality() {
        let mut e = engine();
        let one = e.new_string("1").unwrap();
        assert!(equal(&mut e, one, Value::from_int32(1)).unwrap());
        assert!(equal(&mut e, Value::null(), Value::undefined()).unwrap());
        assert!(!equal(&mut e, Value::null(), Value::from_int32(0)).unwrap());
        assert!(equal(&mut e, Value::from_bool(true), Value::from_int32(1)).unwrap());
        let nan = Value::from_double(f64::NAN);
        assert!(!equal(&mut e, nan, nan).unwrap());
    }

    #[test]
    fn test_relational_with_nan_is_false_both_ways() {
        let mut e = engine();
        let nan = Value::from_double(f64::NAN);
        let one = Value::from_int32(1);
        for op in [AluOp::Lt, AluOp::Gt, AluOp::Le, AluOp::Ge] {
            assert!(!compare(&mut e, op, nan, one).unwrap());
            assert!(!compare(&mut e, op, one, nan).unwrap());
        }
        assert!(compare(&mut e, AluOp::Le, one, one).unwrap());
    }

    #[test]
    fn test_shifts_mask_count() {
        let mut e = engine();
        let r = binop(&mut e, AluOp::LShift, Value::from_int32(1), Value::from_int32(33)).unwrap();
        assert_eq!(r.int_32(), 2);
        let r = binop(&mut e, AluOp::URShift, Value::from_int32(-1), Value::from_int32(0)).unwrap();
        assert_eq!(r.as_number(), Some(4294967295.0));
        assert!(r.is_double());
    }

    #[test]
    fn test_property_of_null_is_type_error() {
        let mut e = engine();
        let x = e.identifiers.intern("x");
        assert!(get_property(&mut e, Value::null(), x).is_err());
        let exc = e.catch_exception();
        assert_eq!(e.error_type_of(exc), Some(ErrorType::TypeError));
        assert_eq!(describe_exception(&mut e, exc), "TypeError: Cannot read property 'x' of null");
    }

    #[test]
    fn test_missing_global_is_reference_error_but_typeof_is_undefined() {
        let mut e = engine();
        let x = e.identifiers.intern("nowhere");
        assert!(get_activation_property(&mut e, x).is_err());
        let exc = e.catch_exception();
        assert_eq!(e.error_type_of(exc), Some(ErrorType::ReferenceError));
        let t = typeof_name(&mut e, x).unwrap();
        assert_eq!(e.string_text(t).as_deref(), Some("undefined"));
    }

    #[test]
    fn test_sloppy_assignment_creates_global() {
        let mut e = engine();
        let x = e.identifiers.intern("fresh");
        set_activation_property(&mut e, x, Value::from_int32(3)).unwrap();
        assert_eq!(get_activation_property(&mut e, x).unwrap().int_32(), 3);
    }

    #[test]
    fn test_declared_global_is_not_deletable() {
        let mut e = engine();
        let x = e.identifiers.intern("kept");
        declare_var(&mut e, false, x).unwrap();
        assert!(!delete_name(&mut e, x).unwrap().boolean_value());
        let y = e.identifiers.intern("loose");
        declare_var(&mut e, true, y).unwrap();
        assert!(delete_name(&mut e, y).unwrap().boolean_value());
    }

    #[test]
    fn test_with_scope_resolves_on_object() {
        let mut e = engine();
        let o = e.new_object().unwrap();
        let a = e.identifiers.intern("a");
        object::put(&mut e, o, a, Value::from_int32(5)).unwrap();
        push_with_scope(&mut e, Value::from_managed(o)).unwrap();
        assert_eq!(get_activation_property(&mut e, a).unwrap().int_32(), 5);
        set_activation_property(&mut e, a, Value::from_int32(6)).unwrap();
        pop_scope(&mut e);
        assert_eq!(object::get(&mut e, o, a).unwrap().int_32(), 6);
        assert!(get_activation_property(&mut e, a).is_err());
        e.catch_exception();
    }

    #[test]
    fn test_foreach_walks_keys_then_null() {
        let mut e = engine();
        let arr = define_array(&mut e, vec![Value::from_int32(1), Value::empty(), Value::from_int32(3)]).unwrap();
        let it = foreach_iterator_object(&mut e, arr).unwrap();
        let mut keys = Vec::new();
        loop {
            let k = foreach_next_property_name(&mut e, it).unwrap();
            if k.is_null() {
                break;
            }
            keys.push(e.string_text(k).unwrap().to_string());
        }
        assert_eq!(keys, vec!["0", "2"]);
        let empty = foreach_iterator_object(&mut e, Value::null()).unwrap();
        assert!(foreach_next_property_name(&mut e, empty).unwrap().is_null());
    }

    #[test]
    fn test_object_literal_joins_getter_and_setter() {
        fn getter(_: &mut ExecutionEngine, _: &object::CallData) -> ReturnedValue {
            Ok(Value::from_int32(7))
        }
        let mut e = engine();
        let g = Value::from_managed(e.new_builtin_function("g", getter).unwrap());
        let s = Value::from_managed(e.new_builtin_function("s", getter).unwrap());
        let key = e.new_string("p").unwrap();
        let p = e.identifiers.intern("p");
        let class = e.classes.add_member(e.object_classes.object, p, PropertyAttributes::accessor()).0;
        let o = define_object_literal(
            &mut e,
            class,
            vec![(key, LiteralProperty::Getter(g)), (key, LiteralProperty::Setter(s))],
        )
        .unwrap();
        assert_eq!(e.class_of(o.as_managed().unwrap()), class);
        let (prop, attrs) = object::get_own_property(&e, o.as_managed().unwrap(), PropertyKey::Name(p)).unwrap();
        assert!(attrs.is_accessor());
        assert_eq!(prop.getter(), g.as_managed());
        assert_eq!(prop.setter(), s.as_managed());
        assert_eq!(get_property(&mut e, o, p).unwrap().int_32(), 7);
    }

    #[test]
    fn test_object_literal_keys() {
        let mut e = engine();
        let a = e.identifiers.intern("a");
        let class = e.classes.add_member(e.object_classes.object, a, PropertyAttributes::data()).0;
        let key_a = e.new_string("a").unwrap();
        let key_3 = e.new_string("3").unwrap();
        let o = define_object_literal(
            &mut e,
            class,
            vec![
                (key_a, LiteralProperty::Data(Value::from_int32(1))),
                (key_3, LiteralProperty::Data(Value::from_int32(4))),
                (key_a, LiteralProperty::Data(Value::from_int32(2))),
            ],
        )
        .unwrap();
        let m = o.as_managed().unwrap();
        assert_eq!(e.class_of(m), class);
        assert_eq!(get_property(&mut e, o, a).unwrap().int_32(), 2);
        assert_eq!(get_element(&mut e, o, Value::from_int32(3)).unwrap().int_32(), 4);
        assert_eq!(get_element(&mut e, o, key_3).unwrap().int_32(), 4);
        assert!(matches!(to_property_key(&mut e, key_3).unwrap(), PropertyKey::Index(3)));
        let key_03 = e.new_string("03").unwrap();
        assert!(matches!(to_property_key(&mut e, key_03).unwrap(), PropertyKey::Name(_)));
    }
}
