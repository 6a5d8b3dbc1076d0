//! Runtime functions and function objects.
//!
//! A [`Function`] is the linked, runnable form of one compiled function: its
//! names, its scope class and a reference to its code. Function objects wrap
//! either a `Function` plus the scope it closes over, or a native builtin.

use std::rc::Rc;

use crate::runner::config::TargetKind;
use crate::runner::context::ContextId;
use crate::runner::ds::error::ReturnedValue;
use crate::runner::ds::identifier::{Identifier, IdentifierTable};
use crate::runner::ds::internal_class::{ClassId, InternalClassPool};
use crate::runner::ds::managed::{managed_kind, ManagedRef, ManagedType, ObjectVTable};
use crate::runner::ds::object::{self, object_vtable, CallData, ObjectKind};
use crate::runner::ds::property::{PropertyAttributes, ATTR_NOT_CONFIGURABLE};
use crate::runner::ds::value::Value;
use crate::runner::engine::ExecutionEngine;
use crate::runner::moth::instr::BytecodeFunction;

/// Appended to a duplicated formal name so that each formal keeps a slot.
const DUPLICATE_FORMAL_SUFFIX: char = '\u{fffe}';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    pub strict: bool,
    pub has_nested_functions: bool,
    pub uses_arguments: bool,
    pub uses_this: bool,
    pub is_named_expression: bool,
}

/// Where the code of a function lives.
#[derive(Clone)]
pub enum CodeRef {
    Bytecode(Rc<BytecodeFunction>),
    Native {
        target: TargetKind,
        address: u64,
        size: u32,
    },
}

pub struct Function {
    pub name: Identifier,
    pub formals: Vec<Identifier>,
    pub locals: Vec<Identifier>,
    /// Class whose members are the formals (last to first) then the locals.
    pub internal_class: ClassId,
    pub flags: FunctionFlags,
    /// Index of the owning compilation unit in the engine.
    pub unit: usize,
    /// Index of this function inside its unit.
    pub index: usize,
    pub code: CodeRef,
    pub line: u32,
    pub column: u32,
}

impl Function {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classes: &mut InternalClassPool,
        identifiers: &mut IdentifierTable,
        name: Identifier,
        formals: Vec<Identifier>,
        locals: Vec<Identifier>,
        flags: FunctionFlags,
        unit: usize,
        index: usize,
        code: CodeRef,
    ) -> Function {
        let attrs = PropertyAttributes::from_flags(ATTR_NOT_CONFIGURABLE);
        let mut class = classes.empty_class();
        // Walking backwards lets the last of several same-named formals win.
        for formal in formals.iter().rev() {
            let mut arg = *formal;
            while classes.find(class, arg).is_some() {
                let renamed = format!("{}{}", identifiers.name(arg), DUPLICATE_FORMAL_SUFFIX);
                arg = identifiers.intern(&renamed);
            }
            class = classes.add_member(class, arg, attrs).0;
        }
        for local in &locals {
            if classes.find(class, *local).is_none() {
                class = classes.add_member(class, *local, attrs).0;
            }
        }
        Function {
            name,
            formals,
            locals,
            internal_class: class,
            flags,
            unit,
            index,
            code,
            line: 0,
            column: 0,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.flags.strict
    }

    /// Whether the call context can be dropped as soon as the call returns.
    pub fn needs_activation(&self) -> bool {
        self.flags.has_nested_functions
    }
}

pub type BuiltinCode = fn(&mut ExecutionEngine, &CallData) -> ReturnedValue;

pub enum FunctionKind {
    Script { function: Rc<Function>, scope: ContextId },
    Builtin {
        name: Identifier,
        code: BuiltinCode,
        construct: Option<BuiltinCode>,
    },
}

pub static SCRIPT_FUNCTION_VTABLE: ObjectVTable = ObjectVTable {
    call: script_function_call,
    construct: script_function_construct,
    ..object_vtable(ManagedType::FunctionObject, "Function")
};

pub static BUILTIN_FUNCTION_VTABLE: ObjectVTable = ObjectVTable {
    call: builtin_function_call,
    construct: builtin_function_construct,
    ..object_vtable(ManagedType::FunctionObject, "Function")
};

managed_kind!(ScriptFunction, SCRIPT_FUNCTION_VTABLE.managed);
managed_kind!(BuiltinFunction, BUILTIN_FUNCTION_VTABLE.managed);

fn script_parts(engine: &ExecutionEngine, m: ManagedRef) -> Option<(Rc<Function>, ContextId)> {
    match engine.heap.object(m).map(|o| &o.kind) {
        Some(ObjectKind::Function(FunctionKind::Script { function, scope })) => {
            Some((function.clone(), *scope))
        }
        _ => None,
    }
}

fn script_function_call(engine: &mut ExecutionEngine, m: ManagedRef, data: &CallData) -> ReturnedValue {
    match script_parts(engine, m) {
        Some((function, scope)) => engine.call_script(function, m, scope, data.this, data.args.clone()),
        None => Err(engine.throw_type_error("object is not a function")),
    }
}

fn script_function_construct(engine: &mut ExecutionEngine, m: ManagedRef, data: &CallData) -> ReturnedValue {
    let (function, scope) = match script_parts(engine, m) {
        Some(parts) => parts,
        None => return Err(engine.throw_type_error("object is not a constructor")),
    };
    let prototype_id = engine.ids.prototype;
    let proto = object::get(engine, m, prototype_id)?;
    let proto = if proto.is_object(&engine.heap) {
        proto.as_managed()
    } else {
        Some(engine.protos.object)
    };
    let obj = engine.new_object_with_proto(proto)?;
    let result = engine.call_script(function, m, scope, Value::from_managed(obj), data.args.clone())?;
    if result.is_object(&engine.heap) {
        Ok(result)
    } else {
        Ok(Value::from_managed(obj))
    }
}

fn builtin_code(engine: &ExecutionEngine, m: ManagedRef) -> Option<(BuiltinCode, Option<BuiltinCode>)> {
    match engine.heap.object(m).map(|o| &o.kind) {
        Some(ObjectKind::Function(FunctionKind::Builtin { code, construct, .. })) => Some((*code, *construct)),
        _ => None,
    }
}

fn builtin_function_call(engine: &mut ExecutionEngine, m: ManagedRef, data: &CallData) -> ReturnedValue {
    match builtin_code(engine, m) {
        Some((code, _)) => engine.call_builtin(code, data),
        None => Err(engine.throw_type_error("object is not a function")),
    }
}

fn builtin_function_construct(engine: &mut ExecutionEngine, m: ManagedRef, data: &CallData) -> ReturnedValue {
    match builtin_code(engine, m) {
        Some((_, Some(construct))) => engine.call_builtin(construct, data),
        _ => Err(engine.throw_type_error("object is not a constructor")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ds::managed::VTable;
    use crate::runner::ds::object::OBJECT_VTABLE;

    fn function(formals: &[&str], locals: &[&str]) -> (Function, InternalClassPool, IdentifierTable) {
        let mut classes = InternalClassPool::new(VTable::Object(&OBJECT_VTABLE));
        let mut ids = IdentifierTable::new();
        let formals = formals.iter().map(|n| ids.intern(n)).collect();
        let locals = locals.iter().map(|n| ids.intern(n)).collect();
        let name = ids.intern("f");
        let f = Function::new(
            &mut classes,
            &mut ids,
            name,
            formals,
            locals,
            FunctionFlags::default(),
            0,
            0,
            CodeRef::Native {
                target: TargetKind::X86,
                address: 0,
                size: 0,
            },
        );
        (f, classes, ids)
    }

    #[test]
    fn test_formals_in_reverse_then_locals() {
        let (f, classes, ids) = function(&["a", "b"], &["x"]);
        let class = classes.get(f.internal_class);
        assert_eq!(class.size(), 3);
        assert_eq!(class.find(ids.lookup("b").unwrap()), Some(0));
        assert_eq!(class.find(ids.lookup("a").unwrap()), Some(1));
        assert_eq!(class.find(ids.lookup("x").unwrap()), Some(2));
        assert!(!class.attributes_at(0).is_configurable());
    }

    #[test]
    fn test_duplicate_formal_last_wins() {
        let (f, classes, ids) = function(&["a", "a"], &[]);
        let class = classes.get(f.internal_class);
        assert_eq!(class.size(), 2);
        // slot 0 is the second formal, which is what plain `a` resolves to
        assert_eq!(class.find(ids.lookup("a").unwrap()), Some(0));
        assert!(ids.lookup("a\u{fffe}").is_some());
        assert_eq!(f.formals.len(), 2);
    }

    #[test]
    fn test_duplicate_formal_around_another() {
        let (f, classes, ids) = function(&["a", "b", "a"], &["a"]);
        let class = classes.get(f.internal_class);
        assert_eq!(class.size(), 3);
        assert_eq!(class.find(ids.lookup("a").unwrap()), Some(0));
        assert_eq!(class.find(ids.lookup("b").unwrap()), Some(1));
        assert_eq!(class.find(ids.lookup("a\u{fffe}").unwrap()), Some(2));
    }
}
