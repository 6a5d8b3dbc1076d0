//! Runtime functions callable from generated code.
//!
//! Each entry has a fixed address in the `RUNTIME_BASE` window. Generated
//! code calls that address like any native function; the machine traps the
//! call, collects the arguments the target's calling convention put in
//! registers and on the stack, and runs the Rust implementation. Value
//! arguments are passed as pointers into the caller's frame, names as
//! string table indices. The result comes back in the return register.

use ahash::AHashMap;
use lazy_static::lazy_static;

use crate::runner::ds::error::{ExceptionSignal, ReturnedValue};
use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::internal_class::ClassId;
use crate::runner::ds::value::Value;
use crate::runner::engine::ExecutionEngine;
use crate::runner::ir::{AluOp, Type};
use crate::runner::isel::LiteralKind;
use crate::runner::jit::machine::{MachineError, Memory};
use crate::runner::runtime::{self, LiteralProperty};

pub const RUNTIME_BASE: u64 = 0x4000_0000;
const RUNTIME_STRIDE: u64 = 16;

/// Whether generated code must test the exception flag after a call,
/// decided by the Rust return type of the runtime function.
pub trait ExceptionCheck {
    const NEEDS_CHECK: bool;

    /// What ends up in the return register.
    fn into_return_value(self) -> Value;
}

impl ExceptionCheck for ReturnedValue {
    const NEEDS_CHECK: bool = true;

    fn into_return_value(self) -> Value {
        self.unwrap_or_else(|_| Value::undefined())
    }
}

impl ExceptionCheck for Result<(), ExceptionSignal> {
    const NEEDS_CHECK: bool = true;

    fn into_return_value(self) -> Value {
        Value::undefined()
    }
}

impl ExceptionCheck for Value {
    const NEEDS_CHECK: bool = false;

    fn into_return_value(self) -> Value {
        self
    }
}

impl ExceptionCheck for () {
    const NEEDS_CHECK: bool = false;

    fn into_return_value(self) -> Value {
        Value::undefined()
    }
}

macro_rules! runtime_calls {
    ($($name:ident($argc:expr) -> $ret:ty;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RuntimeCall {
            $($name,)*
        }

        impl RuntimeCall {
            pub const ALL: &'static [RuntimeCall] = &[$(RuntimeCall::$name,)*];

            /// Native argument count, the context pointer included.
            pub fn arg_count(self) -> usize {
                match self {
                    $(RuntimeCall::$name => $argc,)*
                }
            }

            pub fn needs_exception_check(self) -> bool {
                match self {
                    $(RuntimeCall::$name => <$ret as ExceptionCheck>::NEEDS_CHECK,)*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(RuntimeCall::$name => stringify!($name),)*
                }
            }
        }
    };
}

runtime_calls! {
    GetActivationProperty(2) -> ReturnedValue;
    SetActivationProperty(3) -> Result<(), ExceptionSignal>;
    GetGlobalLookup(2) -> ReturnedValue;
    GetProperty(3) -> ReturnedValue;
    SetProperty(4) -> Result<(), ExceptionSignal>;
    GetPropertyLookup(3) -> ReturnedValue;
    SetPropertyLookup(4) -> Result<(), ExceptionSignal>;
    GetElement(3) -> ReturnedValue;
    SetElement(4) -> Result<(), ExceptionSignal>;
    CallValue(4) -> ReturnedValue;
    CallProperty(5) -> ReturnedValue;
    CallElement(5) -> ReturnedValue;
    CallActivationProperty(4) -> ReturnedValue;
    ConstructValue(4) -> ReturnedValue;
    ConstructProperty(5) -> ReturnedValue;
    ConstructActivationProperty(4) -> ReturnedValue;
    LoadThis(1) -> Value;
    LoadString(2) -> Value;
    LoadRegExp(2) -> ReturnedValue;
    Closure(2) -> ReturnedValue;
    TypeofValue(2) -> ReturnedValue;
    TypeofName(2) -> ReturnedValue;
    TypeofMember(3) -> ReturnedValue;
    TypeofElement(3) -> ReturnedValue;
    DeleteName(2) -> ReturnedValue;
    DeleteMember(3) -> ReturnedValue;
    DeleteElement(3) -> ReturnedValue;
    Throw(2) -> Result<(), ExceptionSignal>;
    UnwindException(1) -> Value;
    PushCatchScope(3) -> ();
    PushWithScope(2) -> Result<(), ExceptionSignal>;
    PopScope(1) -> ();
    ForeachIteratorObject(2) -> ReturnedValue;
    ForeachNextPropertyName(2) -> ReturnedValue;
    DeclareVar(3) -> Result<(), ExceptionSignal>;
    DefineArray(3) -> ReturnedValue;
    DefineObjectLiteral(4) -> ReturnedValue;
    SetupArgumentsObject(1) -> ReturnedValue;
    ConvertThisToObject(1) -> Result<(), ExceptionSignal>;
    Unop(3) -> ReturnedValue;
    Binop(4) -> ReturnedValue;
    ToBoolean(2) -> Value;
    ConvertType(3) -> ReturnedValue;
}

lazy_static! {
    static ref CALLS_BY_ADDRESS: AHashMap<u64, RuntimeCall> =
        RuntimeCall::ALL.iter().map(|c| (c.address(), *c)).collect();
}

impl RuntimeCall {
    pub fn address(self) -> u64 {
        let index = RuntimeCall::ALL.iter().position(|c| *c == self).unwrap_or(0) as u64;
        RUNTIME_BASE + index * RUNTIME_STRIDE
    }

    pub fn from_address(address: u64) -> Option<RuntimeCall> {
        CALLS_BY_ADDRESS.get(&address).copied()
    }
}

/// Reads native arguments of a trapped call.
struct Args<'a> {
    call: RuntimeCall,
    words: &'a [u64],
    memory: &'a Memory,
    unit: usize,
}

impl<'a> Args<'a> {
    fn word(&self, i: usize) -> Result<u64, MachineError> {
        self.words.get(i).copied().ok_or(MachineError::BadRuntimeArgument {
            call: self.call.name(),
            index: i,
        })
    }

    fn value(&self, i: usize) -> Result<Value, MachineError> {
        self.memory.read_value(self.word(i)?)
    }

    fn index(&self, i: usize) -> Result<usize, MachineError> {
        self.word(i).map(|w| w as u32 as usize)
    }

    fn identifier(&self, engine: &ExecutionEngine, i: usize) -> Result<Identifier, MachineError> {
        let index = self.index(i)?;
        engine.units[self.unit]
            .runtime_identifiers
            .get(index)
            .copied()
            .ok_or(MachineError::BadRuntimeArgument {
                call: self.call.name(),
                index: i,
            })
    }

    fn literal_class(&self, engine: &ExecutionEngine, i: usize) -> Result<ClassId, MachineError> {
        let index = self.index(i)?;
        engine.units[self.unit]
            .runtime_classes
            .get(index)
            .copied()
            .ok_or(MachineError::BadRuntimeArgument {
                call: self.call.name(),
                index: i,
            })
    }

    fn string(&self, engine: &ExecutionEngine, index: usize) -> Result<Value, MachineError> {
        engine.units[self.unit]
            .runtime_strings
            .get(index)
            .copied()
            .ok_or(MachineError::BadRuntimeArgument {
                call: self.call.name(),
                index,
            })
    }

    /// `count` consecutive Values starting at the pointer in argument `i`.
    fn values(&self, i: usize, count: usize) -> Result<Vec<Value>, MachineError> {
        let base = self.word(i)?;
        (0..count as u64).map(|k| self.memory.read_value(base + 8 * k)).collect()
    }

    fn call_args(&self, ptr: usize) -> Result<Vec<Value>, MachineError> {
        let argc = self.index(ptr + 1)?;
        self.values(ptr, argc)
    }
}

/// Runs `call` with the raw native arguments `words`.
pub fn invoke(
    engine: &mut ExecutionEngine,
    memory: &Memory,
    unit: usize,
    call: RuntimeCall,
    words: &[u64],
) -> Result<Value, MachineError> {
    let a = Args {
        call,
        words,
        memory,
        unit,
    };
    tracing::trace!(target: "jsv4::jit", call = call.name(), "runtime call");
    Ok(match call {
        RuntimeCall::GetActivationProperty => {
            let id = a.identifier(engine, 1)?;
            runtime::get_activation_property(engine, id).into_return_value()
        }
        RuntimeCall::SetActivationProperty => {
            let id = a.identifier(engine, 1)?;
            runtime::set_activation_property(engine, id, a.value(2)?).into_return_value()
        }
        RuntimeCall::GetGlobalLookup => runtime::get_global_lookup(engine, unit, a.index(1)?).into_return_value(),
        RuntimeCall::GetProperty => {
            let id = a.identifier(engine, 2)?;
            runtime::get_property(engine, a.value(1)?, id).into_return_value()
        }
        RuntimeCall::SetProperty => {
            let id = a.identifier(engine, 2)?;
            runtime::set_property(engine, a.value(1)?, id, a.value(3)?).into_return_value()
        }
        RuntimeCall::GetPropertyLookup => {
            runtime::get_property_lookup(engine, unit, a.index(1)?, a.value(2)?).into_return_value()
        }
        RuntimeCall::SetPropertyLookup => {
            runtime::set_property_lookup(engine, unit, a.index(1)?, a.value(2)?, a.value(3)?).into_return_value()
        }
        RuntimeCall::GetElement => runtime::get_element(engine, a.value(1)?, a.value(2)?).into_return_value(),
        RuntimeCall::SetElement => {
            runtime::set_element(engine, a.value(1)?, a.value(2)?, a.value(3)?).into_return_value()
        }
        RuntimeCall::CallValue => {
            let args = a.call_args(2)?;
            runtime::call_value(engine, a.value(1)?, Value::undefined(), args).into_return_value()
        }
        RuntimeCall::CallProperty => {
            let id = a.identifier(engine, 2)?;
            let args = a.call_args(3)?;
            runtime::call_property(engine, a.value(1)?, id, args).into_return_value()
        }
        RuntimeCall::CallElement => {
            let args = a.call_args(3)?;
            runtime::call_element(engine, a.value(1)?, a.value(2)?, args).into_return_value()
        }
        RuntimeCall::CallActivationProperty => {
            let id = a.identifier(engine, 1)?;
            let args = a.call_args(2)?;
            runtime::call_activation_property(engine, id, args).into_return_value()
        }
        RuntimeCall::ConstructValue => {
            let args = a.call_args(2)?;
            runtime::construct_value(engine, a.value(1)?, args).into_return_value()
        }
        RuntimeCall::ConstructProperty => {
            let id = a.identifier(engine, 2)?;
            let args = a.call_args(3)?;
            runtime::construct_property(engine, a.value(1)?, id, args).into_return_value()
        }
        RuntimeCall::ConstructActivationProperty => {
            let id = a.identifier(engine, 1)?;
            let args = a.call_args(2)?;
            runtime::construct_activation_property(engine, id, args).into_return_value()
        }
        RuntimeCall::LoadThis => runtime::this_object(engine).into_return_value(),
        RuntimeCall::LoadString => a.string(engine, a.index(1)?)?,
        RuntimeCall::LoadRegExp => runtime::regexp_literal(engine, unit, a.index(1)?).into_return_value(),
        RuntimeCall::Closure => runtime::closure(engine, unit, a.index(1)?).into_return_value(),
        RuntimeCall::TypeofValue => runtime::typeof_value(engine, a.value(1)?).into_return_value(),
        RuntimeCall::TypeofName => {
            let id = a.identifier(engine, 1)?;
            runtime::typeof_name(engine, id).into_return_value()
        }
        RuntimeCall::TypeofMember => {
            let id = a.identifier(engine, 2)?;
            runtime::typeof_member(engine, a.value(1)?, id).into_return_value()
        }
        RuntimeCall::TypeofElement => runtime::typeof_element(engine, a.value(1)?, a.value(2)?).into_return_value(),
        RuntimeCall::DeleteName => {
            let id = a.identifier(engine, 1)?;
            runtime::delete_name(engine, id).into_return_value()
        }
        RuntimeCall::DeleteMember => {
            let id = a.identifier(engine, 2)?;
            runtime::delete_member(engine, a.value(1)?, id).into_return_value()
        }
        RuntimeCall::DeleteElement => runtime::delete_element(engine, a.value(1)?, a.value(2)?).into_return_value(),
        RuntimeCall::Throw => {
            let v = a.value(1)?;
            Err::<(), _>(runtime::throw_exception(engine, v)).into_return_value()
        }
        RuntimeCall::UnwindException => runtime::unwind_exception(engine).into_return_value(),
        RuntimeCall::PushCatchScope => {
            let id = a.identifier(engine, 1)?;
            runtime::push_catch_scope(engine, id, a.value(2)?).into_return_value()
        }
        RuntimeCall::PushWithScope => runtime::push_with_scope(engine, a.value(1)?).into_return_value(),
        RuntimeCall::PopScope => runtime::pop_scope(engine).into_return_value(),
        RuntimeCall::ForeachIteratorObject => runtime::foreach_iterator_object(engine, a.value(1)?).into_return_value(),
        RuntimeCall::ForeachNextPropertyName => {
            runtime::foreach_next_property_name(engine, a.value(1)?).into_return_value()
        }
        RuntimeCall::DeclareVar => {
            let id = a.identifier(engine, 2)?;
            runtime::declare_var(engine, a.word(1)? != 0, id).into_return_value()
        }
        RuntimeCall::DefineArray => {
            let values = a.values(1, a.index(2)?)?;
            runtime::define_array(engine, values).into_return_value()
        }
        RuntimeCall::DefineObjectLiteral => {
            let slots = a.values(1, 3 * a.index(2)?)?;
            let mut properties = Vec::with_capacity(slots.len() / 3);
            for triple in slots.chunks(3) {
                let key = a.string(engine, triple[0].int_32() as u32 as usize)?;
                let value = triple[2];
                let p = match LiteralKind::from_code(triple[1].int_32() as u32) {
                    LiteralKind::Data => LiteralProperty::Data(value),
                    LiteralKind::Getter => LiteralProperty::Getter(value),
                    LiteralKind::Setter => LiteralProperty::Setter(value),
                };
                properties.push((key, p));
            }
            let class = a.literal_class(engine, 3)?;
            runtime::define_object_literal(engine, class, properties).into_return_value()
        }
        RuntimeCall::SetupArgumentsObject => runtime::setup_arguments_object(engine).into_return_value(),
        RuntimeCall::ConvertThisToObject => runtime::convert_this_to_object(engine).into_return_value(),
        RuntimeCall::Unop => {
            let op = AluOp::from_code(a.index(1)? as u32).ok_or(MachineError::BadRuntimeArgument {
                call: call.name(),
                index: 1,
            })?;
            runtime::unop(engine, op, a.value(2)?).into_return_value()
        }
        RuntimeCall::Binop => {
            let op = AluOp::from_code(a.index(1)? as u32).ok_or(MachineError::BadRuntimeArgument {
                call: call.name(),
                index: 1,
            })?;
            runtime::binop(engine, op, a.value(2)?, a.value(3)?).into_return_value()
        }
        RuntimeCall::ToBoolean => {
            let v = a.value(1)?;
            Value::from_bool(runtime::to_boolean(engine, v))
        }
        RuntimeCall::ConvertType => {
            let ty = Type::from_code(a.index(1)? as u32).unwrap_or(Type::Var);
            runtime::convert_type(engine, a.value(2)?, ty).into_return_value()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_follows_return_type() {
        assert!(RuntimeCall::GetProperty.needs_exception_check());
        assert!(RuntimeCall::Throw.needs_exception_check());
        assert!(RuntimeCall::SetElement.needs_exception_check());
        assert!(!RuntimeCall::LoadThis.needs_exception_check());
        assert!(!RuntimeCall::PopScope.needs_exception_check());
        assert!(!RuntimeCall::UnwindException.needs_exception_check());
        assert!(!RuntimeCall::ToBoolean.needs_exception_check());
    }

    #[test]
    fn test_addresses_are_distinct_and_resolvable() {
        for call in RuntimeCall::ALL {
            assert_eq!(RuntimeCall::from_address(call.address()), Some(*call));
            assert!(call.arg_count() >= 1 && call.arg_count() <= 6, "{}", call.name());
        }
        assert_eq!(RuntimeCall::from_address(RUNTIME_BASE + 1), None);
        assert_eq!(RuntimeCall::ALL[0].address(), RUNTIME_BASE);
    }

    #[test]
    fn test_return_values() {
        assert!(Err::<Value, _>(ExceptionSignal).into_return_value().is_undefined());
        assert_eq!(Ok::<_, ExceptionSignal>(Value::from_int32(3)).into_return_value(), Value::from_int32(3));
        assert!(().into_return_value().is_undefined());
    }
}
