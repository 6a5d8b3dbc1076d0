//! The moth interpreter.

use std::rc::Rc;

use crate::runner::context::ContextId;
use crate::runner::ds::error::{ExceptionSignal, ReturnedValue};
use crate::runner::ds::identifier::Identifier;
use crate::runner::ds::internal_class::ClassId;
use crate::runner::ds::value::Value;
use crate::runner::engine::ExecutionEngine;
use crate::runner::function::Function;
use crate::runner::ir::{AluOp, Type};
use crate::runner::isel::LiteralKind;
use crate::runner::moth::instr::{BytecodeFunction, Instruction, OpCode, NO_HANDLER, NO_REGISTER};
use crate::runner::runtime::{self, LiteralProperty};

/// Interpreter state for one activation.
struct Frame<'a> {
    code: &'a BytecodeFunction,
    unit: usize,
    registers: Vec<Value>,
}

impl<'a> Frame<'a> {
    fn get(&self, r: u32) -> Value {
        self.registers.get(r as usize).copied().unwrap_or_else(Value::undefined)
    }

    fn set(&mut self, r: u32, v: Value) {
        if r == NO_REGISTER {
            return;
        }
        if let Some(slot) = self.registers.get_mut(r as usize) {
            *slot = v;
        }
    }

    fn args(&self, index: u32) -> Vec<Value> {
        self.code.args(index).iter().map(|r| self.get(*r)).collect()
    }

    fn identifier(&self, engine: &ExecutionEngine, index: u32) -> Identifier {
        engine.units[self.unit].runtime_identifiers[index as usize]
    }

    fn string(&self, engine: &ExecutionEngine, index: u32) -> Value {
        engine.units[self.unit].runtime_strings[index as usize]
    }

    fn literal_class(&self, engine: &ExecutionEngine, index: u32) -> ClassId {
        engine.units[self.unit]
            .runtime_classes
            .get(index as usize)
            .copied()
            .unwrap_or(engine.object_classes.object)
    }
}

/// Runs `code`, the bytecode of `function`, in context `ctx`.
pub fn run(
    engine: &mut ExecutionEngine,
    ctx: ContextId,
    function: &Rc<Function>,
    code: &Rc<BytecodeFunction>,
) -> ReturnedValue {
    let span = tracing::trace_span!(target: "jsv4::engine", "moth", function = function.index, context = ctx.index());
    let _guard = span.enter();
    let mut frame = Frame {
        code,
        unit: function.unit,
        registers: vec![Value::undefined(); code.register_count as usize],
    };
    let mut handler: Option<usize> = None;
    let mut ip = 0usize;
    loop {
        let instr = match code.code.get(ip) {
            Some(i) => *i,
            None => return Ok(Value::undefined()),
        };
        ip += 1;
        match step(engine, &mut frame, &instr) {
            Ok(Flow::Next) => {}
            Ok(Flow::Jump(target)) => ip = target,
            Ok(Flow::SetHandler(h)) => handler = h,
            Ok(Flow::Return(v)) => return Ok(v),
            Err(signal) => match handler {
                Some(h) => {
                    tracing::trace!(target: "jsv4::engine", from = ip - 1, to = h, "exception caught");
                    ip = h;
                }
                None => return Err(signal),
            },
        }
    }
}

enum Flow {
    Next,
    Jump(usize),
    SetHandler(Option<usize>),
    Return(Value),
}

fn step(engine: &mut ExecutionEngine, frame: &mut Frame<'_>, instr: &Instruction) -> Result<Flow, ExceptionSignal> {
    let unit = frame.unit;
    let value = match instr.op {
        // ── Loads ──
        OpCode::LoadConst => frame.code.constants.get(instr.imm as usize).copied().unwrap_or_else(Value::undefined),
        OpCode::LoadString => frame.string(engine, instr.imm),
        OpCode::LoadRegExp => runtime::regexp_literal(engine, unit, instr.imm as usize)?,
        OpCode::LoadClosure => runtime::closure(engine, unit, instr.imm as usize)?,
        OpCode::LoadThis => runtime::this_object(engine),
        OpCode::Move => frame.get(instr.src1),
        OpCode::Swap => {
            let a = frame.get(instr.src1);
            let b = frame.get(instr.src2);
            frame.set(instr.src1, b);
            frame.set(instr.src2, a);
            return Ok(Flow::Next);
        }
        OpCode::Convert => {
            let ty = Type::from_code(instr.imm).unwrap_or(Type::Var);
            runtime::convert_type(engine, frame.get(instr.src1), ty)?
        }

        // ── Names ──
        OpCode::LoadName => {
            let id = frame.identifier(engine, instr.imm);
            runtime::get_activation_property(engine, id)?
        }
        OpCode::StoreName => {
            let id = frame.identifier(engine, instr.imm);
            runtime::set_activation_property(engine, id, frame.get(instr.src1))?;
            return Ok(Flow::Next);
        }
        OpCode::LoadGlobalLookup => runtime::get_global_lookup(engine, unit, instr.imm as usize)?,

        // ── Properties ──
        OpCode::LoadProperty => {
            let id = frame.identifier(engine, instr.imm);
            runtime::get_property(engine, frame.get(instr.src1), id)?
        }
        OpCode::StoreProperty => {
            let id = frame.identifier(engine, instr.imm);
            runtime::set_property(engine, frame.get(instr.src2), id, frame.get(instr.src1))?;
            return Ok(Flow::Next);
        }
        OpCode::GetLookup => runtime::get_property_lookup(engine, unit, instr.imm as usize, frame.get(instr.src1))?,
        OpCode::SetLookup => {
            let (value, base) = (frame.get(instr.src1), frame.get(instr.src2));
            runtime::set_property_lookup(engine, unit, instr.imm as usize, base, value)?;
            return Ok(Flow::Next);
        }
        OpCode::LoadElement => runtime::get_element(engine, frame.get(instr.src1), frame.get(instr.src2))?,
        OpCode::StoreElement => {
            let (base, index, value) = (frame.get(instr.src1), frame.get(instr.src2), frame.get(instr.dst));
            runtime::set_element(engine, base, index, value)?;
            return Ok(Flow::Next);
        }

        // ── Calls ──
        OpCode::CallValue => {
            let args = frame.args(instr.imm);
            runtime::call_value(engine, frame.get(instr.src1), Value::undefined(), args)?
        }
        OpCode::CallProperty => {
            let id = frame.identifier(engine, instr.src2);
            let args = frame.args(instr.imm);
            runtime::call_property(engine, frame.get(instr.src1), id, args)?
        }
        OpCode::CallElement => {
            let args = frame.args(instr.imm);
            runtime::call_element(engine, frame.get(instr.src1), frame.get(instr.src2), args)?
        }
        OpCode::CallName => {
            let id = frame.identifier(engine, instr.src1);
            let args = frame.args(instr.imm);
            runtime::call_activation_property(engine, id, args)?
        }
        OpCode::ConstructValue => {
            let args = frame.args(instr.imm);
            runtime::construct_value(engine, frame.get(instr.src1), args)?
        }
        OpCode::ConstructProperty => {
            let id = frame.identifier(engine, instr.src2);
            let args = frame.args(instr.imm);
            runtime::construct_property(engine, frame.get(instr.src1), id, args)?
        }
        OpCode::ConstructName => {
            let id = frame.identifier(engine, instr.src1);
            let args = frame.args(instr.imm);
            runtime::construct_activation_property(engine, id, args)?
        }

        // ── Builtins ──
        OpCode::TypeofValue => runtime::typeof_value(engine, frame.get(instr.src1))?,
        OpCode::TypeofName => {
            let id = frame.identifier(engine, instr.imm);
            runtime::typeof_name(engine, id)?
        }
        OpCode::TypeofMember => {
            let id = frame.identifier(engine, instr.imm);
            runtime::typeof_member(engine, frame.get(instr.src1), id)?
        }
        OpCode::TypeofElement => runtime::typeof_element(engine, frame.get(instr.src1), frame.get(instr.src2))?,
        OpCode::DeleteName => {
            let id = frame.identifier(engine, instr.imm);
            runtime::delete_name(engine, id)?
        }
        OpCode::DeleteMember => {
            let id = frame.identifier(engine, instr.imm);
            runtime::delete_member(engine, frame.get(instr.src1), id)?
        }
        OpCode::DeleteElement => runtime::delete_element(engine, frame.get(instr.src1), frame.get(instr.src2))?,
        OpCode::Throw => return Err(runtime::throw_exception(engine, frame.get(instr.src1))),
        OpCode::ReThrow => return Err(ExceptionSignal),
        OpCode::UnwindException => runtime::unwind_exception(engine),
        OpCode::PushCatchScope => {
            let id = frame.identifier(engine, instr.imm);
            runtime::push_catch_scope(engine, id, frame.get(instr.src1));
            return Ok(Flow::Next);
        }
        OpCode::PushWithScope => {
            runtime::push_with_scope(engine, frame.get(instr.src1))?;
            return Ok(Flow::Next);
        }
        OpCode::PopScope => {
            runtime::pop_scope(engine);
            return Ok(Flow::Next);
        }
        OpCode::ForeachIterator => runtime::foreach_iterator_object(engine, frame.get(instr.src1))?,
        OpCode::ForeachNextName => runtime::foreach_next_property_name(engine, frame.get(instr.src1))?,
        OpCode::DeclareVar => {
            let id = frame.identifier(engine, instr.imm);
            runtime::declare_var(engine, instr.src1 != 0, id)?;
            return Ok(Flow::Next);
        }
        OpCode::DefineArray => {
            let values = frame
                .code
                .args(instr.imm)
                .iter()
                .map(|&r| if r == NO_REGISTER { Value::empty() } else { frame.get(r) })
                .collect();
            runtime::define_array(engine, values)?
        }
        OpCode::DefineObjectLiteral => {
            let entries = frame.code.literals.get(instr.imm as usize).map_or(&[][..], |l| l.as_slice());
            let mut properties = Vec::with_capacity(entries.len());
            for &(key, kind, r) in entries {
                let v = frame.get(r);
                let p = match kind {
                    LiteralKind::Data => LiteralProperty::Data(v),
                    LiteralKind::Getter => LiteralProperty::Getter(v),
                    LiteralKind::Setter => LiteralProperty::Setter(v),
                };
                properties.push((frame.string(engine, key), p));
            }
            let class = frame.literal_class(engine, instr.src1);
            runtime::define_object_literal(engine, class, properties)?
        }
        OpCode::SetupArguments => runtime::setup_arguments_object(engine)?,
        OpCode::ConvertThis => {
            runtime::convert_this_to_object(engine)?;
            return Ok(Flow::Next);
        }

        // ── Operators ──
        OpCode::Unop => {
            let op = AluOp::from_code(instr.imm).unwrap_or(AluOp::UPlus);
            runtime::unop(engine, op, frame.get(instr.src1))?
        }
        OpCode::Binop => {
            let op = AluOp::from_code(instr.imm).unwrap_or(AluOp::Add);
            runtime::binop(engine, op, frame.get(instr.src1), frame.get(instr.src2))?
        }

        // ── Control flow ──
        OpCode::Jump => return Ok(Flow::Jump(instr.imm as usize)),
        OpCode::JumpIfTrue => {
            return Ok(if runtime::to_boolean(engine, frame.get(instr.src1)) {
                Flow::Jump(instr.imm as usize)
            } else {
                Flow::Next
            })
        }
        OpCode::JumpIfFalse => {
            return Ok(if runtime::to_boolean(engine, frame.get(instr.src1)) {
                Flow::Next
            } else {
                Flow::Jump(instr.imm as usize)
            })
        }
        OpCode::SetExceptionHandler => {
            let h = if instr.imm == NO_HANDLER { None } else { Some(instr.imm as usize) };
            return Ok(Flow::SetHandler(h));
        }
        OpCode::Ret => return Ok(Flow::Return(frame.get(instr.src1))),
    };
    frame.set(instr.dst, value);
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::config::{Backend, EngineConfig};
    use crate::runner::context::ContextKind;
    use crate::runner::function::{CodeRef, FunctionFlags};
    use crate::runner::moth::instr::Instruction;

    fn bare_function(engine: &mut ExecutionEngine, code: BytecodeFunction) -> (Rc<Function>, Rc<BytecodeFunction>) {
        let code = Rc::new(code);
        let name = engine.ids.empty;
        let f = Function::new(
            &mut engine.classes,
            &mut engine.identifiers,
            name,
            Vec::new(),
            Vec::new(),
            FunctionFlags::default(),
            0,
            0,
            CodeRef::Bytecode(code.clone()),
        );
        (Rc::new(f), code)
    }

    #[test]
    fn test_arithmetic_and_jumps() {
        let mut e = ExecutionEngine::new(EngineConfig::default().with_backend(Backend::Interpreter));
        let mut c = BytecodeFunction::new();
        c.set_register_count(3);
        let zero = c.add_constant(Value::from_int32(0));
        let one = c.add_constant(Value::from_int32(1));
        let ten = c.add_constant(Value::from_int32(10));
        c.emit(Instruction::with_dst_imm(OpCode::LoadConst, 0, zero));
        c.emit(Instruction::with_dst_imm(OpCode::LoadConst, 1, one));
        c.emit(Instruction::with_dst_imm(OpCode::LoadConst, 2, ten));
        // loop: r0 = r0 + r1; if r0 < r2 goto loop
        let top = c.current_pos() as u32;
        c.emit(Instruction::new(OpCode::Binop, 0, 0, 1, AluOp::Add.code()));
        c.emit(Instruction::new(OpCode::Binop, 1, 0, 2, AluOp::Lt.code()));
        c.emit(Instruction::with_src_imm(OpCode::JumpIfFalse, 1, 0));
        c.emit(Instruction::with_dst_imm(OpCode::LoadConst, 1, one));
        c.emit(Instruction::with_src_imm(OpCode::Jump, 0, top));
        let exit = c.current_pos() as u32;
        c.patch_jump(5, exit);
        c.emit(Instruction::with_src_imm(OpCode::Ret, 0, 0));
        let (f, code) = bare_function(&mut e, c);
        let ctx = e.current_context;
        let r = run(&mut e, ctx, &f, &code);
        assert_eq!(r.map(|v| v.int_32()), Ok(10));
    }

    #[test]
    fn test_throw_reaches_handler() {
        let mut e = ExecutionEngine::default();
        let mut c = BytecodeFunction::new();
        c.set_register_count(2);
        let k = c.add_constant(Value::from_int32(42));
        c.emit(Instruction::with_dst_imm(OpCode::SetExceptionHandler, NO_REGISTER, 3));
        c.emit(Instruction::with_dst_imm(OpCode::LoadConst, 0, k));
        c.emit(Instruction::with_src_imm(OpCode::Throw, 0, 0));
        c.emit(Instruction::with_dst_imm(OpCode::SetExceptionHandler, NO_REGISTER, NO_HANDLER));
        c.emit(Instruction::with_dst(OpCode::UnwindException, 1));
        c.emit(Instruction::with_src_imm(OpCode::Ret, 1, 0));
        let (f, code) = bare_function(&mut e, c);
        let ctx = e.current_context;
        let r = run(&mut e, ctx, &f, &code);
        assert_eq!(r.map(|v| v.int_32()), Ok(42));
        assert!(!e.has_exception);
    }

    #[test]
    fn test_uncaught_throw_propagates() {
        let mut e = ExecutionEngine::default();
        let mut c = BytecodeFunction::new();
        c.set_register_count(1);
        c.emit(Instruction::with_src_imm(OpCode::Throw, 0, 0));
        let (f, code) = bare_function(&mut e, c);
        let ctx = e.current_context;
        assert_eq!(run(&mut e, ctx, &f, &code), Err(ExceptionSignal));
        assert!(e.has_exception);
        assert!(e.catch_exception().is_undefined());
    }

    #[test]
    fn test_with_scope_is_popped() {
        let mut e = ExecutionEngine::default();
        let mut c = BytecodeFunction::new();
        c.set_register_count(1);
        c.emit(Instruction::with_dst(OpCode::LoadThis, 0));
        c.emit(Instruction::with_src_imm(OpCode::PushWithScope, 0, 0));
        c.emit_op(OpCode::PopScope);
        c.emit(Instruction::with_src_imm(OpCode::Ret, 0, 0));
        let (f, code) = bare_function(&mut e, c);
        let ctx = e.current_context;
        let before = e.current_context;
        let r = run(&mut e, ctx, &f, &code);
        assert!(r.is_ok());
        assert_eq!(e.current_context, before);
        assert!(matches!(e.contexts.get(before).kind, ContextKind::Global));
    }
}
