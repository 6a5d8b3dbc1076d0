//! Moth bytecode: a register instruction set whose registers are the IR
//! temporaries of one function.
//!
//! Names are indices into the owning unit's string table; lookups and
//! regular expressions likewise index the unit's tables.

use std::rc::Rc;

use crate::runner::ds::value::Value;
use crate::runner::ir::{AluOp, Type};
use crate::runner::isel::LiteralKind;

/// `dst` of an instruction whose result is discarded; also marks array holes.
pub const NO_REGISTER: u32 = u32::MAX;

/// Operand of `SetExceptionHandler` when no handler is active.
pub const NO_HANDLER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // ── Loads ────────────────────────────────────────────────
    /// dst = constants[imm].
    LoadConst,
    /// dst = unit string imm.
    LoadString,
    /// dst = a new RegExp object from unit regexp imm.
    LoadRegExp,
    /// dst = a closure of unit function imm over the current context.
    LoadClosure,
    /// dst = this.
    LoadThis,
    /// dst = src1.
    Move,
    /// Exchanges src1 and src2.
    Swap,
    /// dst = src1 converted to the type with code imm.
    Convert,

    // ── Names ────────────────────────────────────────────────
    /// dst = the variable named by string imm.
    LoadName,
    /// variable named by string imm = src1.
    StoreName,
    /// dst = global property through lookup imm.
    LoadGlobalLookup,

    // ── Properties ───────────────────────────────────────────
    /// dst = src1.name, name is string imm.
    LoadProperty,
    /// src2.name = src1, name is string imm.
    StoreProperty,
    /// dst = src1.name through lookup imm.
    GetLookup,
    /// src2.name = src1 through lookup imm.
    SetLookup,
    /// dst = src1[src2].
    LoadElement,
    /// src1[src2] = dst.
    StoreElement,

    // ── Calls (arguments are the registers in call_args[imm]) ─
    /// dst = src1(args...).
    CallValue,
    /// dst = src1.name(args...), name is string src2.
    CallProperty,
    /// dst = src1[src2](args...).
    CallElement,
    /// dst = name(args...), name is string src1.
    CallName,
    /// dst = new src1(args...).
    ConstructValue,
    /// dst = new src1.name(args...), name is string src2.
    ConstructProperty,
    /// dst = new name(args...), name is string src1.
    ConstructName,

    // ── Builtins ─────────────────────────────────────────────
    /// dst = typeof src1.
    TypeofValue,
    /// dst = typeof name, name is string imm.
    TypeofName,
    /// dst = typeof src1.name.
    TypeofMember,
    /// dst = typeof src1[src2].
    TypeofElement,
    /// dst = delete name.
    DeleteName,
    /// dst = delete src1.name.
    DeleteMember,
    /// dst = delete src1[src2].
    DeleteElement,
    /// Throws src1.
    Throw,
    /// Throws the exception still pending in the engine.
    ReThrow,
    /// dst = the pending exception, which is cleared.
    UnwindException,
    /// Pushes a catch scope binding string imm to src1.
    PushCatchScope,
    /// Pushes a with scope on object src1.
    PushWithScope,
    PopScope,
    /// dst = for-in iterator over src1.
    ForeachIterator,
    /// dst = next key of iterator src1, null when done.
    ForeachNextName,
    /// Declares global variable string imm; deletable when src1 != 0.
    DeclareVar,
    /// dst = array of the registers in call_args[imm].
    DefineArray,
    /// dst = object of the unit's literal class src1, filled from literals[imm].
    DefineObjectLiteral,
    /// dst = arguments object of the current call.
    SetupArguments,
    ConvertThis,

    // ── Operators ────────────────────────────────────────────
    /// dst = op src1, op has code imm.
    Unop,
    /// dst = src1 op src2, op has code imm.
    Binop,

    // ── Control flow ─────────────────────────────────────────
    /// ip = imm.
    Jump,
    /// if src1 then ip = imm.
    JumpIfTrue,
    /// if !src1 then ip = imm.
    JumpIfFalse,
    /// Exceptions thrown from here on continue at imm.
    SetExceptionHandler,
    /// return src1.
    Ret,
}

/// A single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: OpCode,
    pub dst: u32,
    pub src1: u32,
    pub src2: u32,
    pub imm: u32,
}

impl Instruction {
    pub fn new(op: OpCode, dst: u32, src1: u32, src2: u32, imm: u32) -> Self {
        Instruction { op, dst, src1, src2, imm }
    }

    pub fn simple(op: OpCode) -> Self {
        Instruction::new(op, NO_REGISTER, 0, 0, 0)
    }

    pub fn with_dst(op: OpCode, dst: u32) -> Self {
        Instruction::new(op, dst, 0, 0, 0)
    }

    pub fn with_dst_src(op: OpCode, dst: u32, src1: u32) -> Self {
        Instruction::new(op, dst, src1, 0, 0)
    }

    pub fn with_dst_srcs(op: OpCode, dst: u32, src1: u32, src2: u32) -> Self {
        Instruction::new(op, dst, src1, src2, 0)
    }

    pub fn with_dst_imm(op: OpCode, dst: u32, imm: u32) -> Self {
        Instruction::new(op, dst, 0, 0, imm)
    }

    pub fn with_src_imm(op: OpCode, src1: u32, imm: u32) -> Self {
        Instruction::new(op, NO_REGISTER, src1, 0, imm)
    }

    pub fn with_srcs_imm(op: OpCode, src1: u32, src2: u32, imm: u32) -> Self {
        Instruction::new(op, NO_REGISTER, src1, src2, imm)
    }

    pub fn is_jump(&self) -> bool {
        matches!(
            self.op,
            OpCode::Jump | OpCode::JumpIfTrue | OpCode::JumpIfFalse | OpCode::SetExceptionHandler
        )
    }
}

/// Compiled code of one function.
#[derive(Debug, Clone, Default)]
pub struct BytecodeFunction {
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
    /// Register lists of calls and array literals.
    pub call_args: Vec<Vec<u32>>,
    /// `(key string, kind, value register)` lists of object literals.
    pub literals: Vec<Vec<(u32, LiteralKind, u32)>>,
    pub register_count: u32,
}

impl BytecodeFunction {
    pub fn new() -> Self {
        BytecodeFunction::default()
    }

    /// Emit an instruction and return its index.
    pub fn emit(&mut self, instr: Instruction) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    pub fn emit_op(&mut self, op: OpCode) -> usize {
        self.emit(Instruction::simple(op))
    }

    pub fn current_pos(&self) -> usize {
        self.code.len()
    }

    /// Points the jump at `pos` to `target`.
    pub fn patch_jump(&mut self, pos: usize, target: u32) {
        if let Some(instr) = self.code.get_mut(pos) {
            instr.imm = target;
        }
    }

    pub fn add_constant(&mut self, value: Value) -> u32 {
        if let Some(i) = self.constants.iter().position(|c| c.raw() == value.raw()) {
            return i as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    pub fn add_args(&mut self, registers: Vec<u32>) -> u32 {
        self.call_args.push(registers);
        (self.call_args.len() - 1) as u32
    }

    pub fn add_literal(&mut self, properties: Vec<(u32, LiteralKind, u32)>) -> u32 {
        self.literals.push(properties);
        (self.literals.len() - 1) as u32
    }

    pub fn set_register_count(&mut self, count: u32) {
        self.register_count = count;
    }

    pub fn args(&self, index: u32) -> &[u32] {
        self.call_args.get(index as usize).map_or(&[], |a| a.as_slice())
    }

    pub fn disassemble(&self, name: &str) -> String {
        self.disassemble_with(name, &[])
    }

    /// Listing with names resolved against `strings`, the unit's table.
    pub fn disassemble_with(&self, name: &str, strings: &[Rc<str>]) -> String {
        let string = |i: u32| -> String {
            match strings.get(i as usize) {
                Some(s) => format!("\"{}\"", s),
                None => format!("#{}", i),
            }
        };
        let reg = |r: u32| -> String {
            if r == NO_REGISTER {
                "_".to_string()
            } else {
                format!("r{}", r)
            }
        };
        let mut out = format!("== {} ==\n", name);
        for (i, instr) in self.code.iter().enumerate() {
            out.push_str(&format!(
                "{:04}  {:?} dst={} src1={} src2={} imm={}",
                i,
                instr.op,
                reg(instr.dst),
                instr.src1,
                instr.src2,
                instr.imm
            ));
            match instr.op {
                OpCode::LoadConst => {
                    if let Some(val) = self.constants.get(instr.imm as usize) {
                        out.push_str(&format!("  const={:?}", val));
                    }
                }
                OpCode::LoadString
                | OpCode::LoadName
                | OpCode::StoreName
                | OpCode::LoadProperty
                | OpCode::StoreProperty
                | OpCode::TypeofName
                | OpCode::TypeofMember
                | OpCode::DeleteName
                | OpCode::DeleteMember
                | OpCode::PushCatchScope
                | OpCode::DeclareVar => out.push_str(&format!("  name={}", string(instr.imm))),
                OpCode::CallName | OpCode::ConstructName => {
                    out.push_str(&format!("  name={}", string(instr.src1)));
                }
                OpCode::CallProperty | OpCode::ConstructProperty => {
                    out.push_str(&format!("  method={}", string(instr.src2)));
                }
                OpCode::Unop | OpCode::Binop => {
                    if let Some(op) = AluOp::from_code(instr.imm) {
                        out.push_str(&format!("  op={}", op.symbol()));
                    }
                }
                OpCode::Convert => {
                    if let Some(ty) = Type::from_code(instr.imm) {
                        out.push_str(&format!("  to={:?}", ty));
                    }
                }
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                    out.push_str(&format!("  -> {:04}", instr.imm));
                }
                OpCode::SetExceptionHandler if instr.imm != NO_HANDLER => {
                    out.push_str(&format!("  -> {:04}", instr.imm));
                }
                _ => {}
            }
            if matches!(
                instr.op,
                OpCode::CallValue
                    | OpCode::CallProperty
                    | OpCode::CallElement
                    | OpCode::CallName
                    | OpCode::ConstructValue
                    | OpCode::ConstructProperty
                    | OpCode::ConstructName
                    | OpCode::DefineArray
            ) {
                let args: Vec<String> = self.args(instr.imm).iter().map(|r| reg(*r)).collect();
                out.push_str(&format!("  args=({})", args.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_deduplicated() {
        let mut f = BytecodeFunction::new();
        let a = f.add_constant(Value::from_int32(1));
        let b = f.add_constant(Value::from_double(1.5));
        assert_eq!(f.add_constant(Value::from_int32(1)), a);
        assert_ne!(a, b);
        // +0 and -0 are different constants
        assert_ne!(f.add_constant(Value::from_double(0.0)), f.add_constant(Value::from_double(-0.0)));
    }

    #[test]
    fn test_patch_and_disassemble() {
        let mut f = BytecodeFunction::new();
        let c = f.add_constant(Value::from_int32(7));
        f.emit(Instruction::with_dst_imm(OpCode::LoadConst, 0, c));
        let j = f.emit(Instruction::with_src_imm(OpCode::JumpIfFalse, 0, 0));
        let args = f.add_args(vec![0, 0]);
        f.emit(Instruction::new(OpCode::CallName, 1, 0, 0, args));
        let end = f.current_pos() as u32;
        f.patch_jump(j, end);
        f.emit(Instruction::with_src_imm(OpCode::Ret, 1, 0));
        let strings: Vec<Rc<str>> = vec![Rc::from("print")];
        let text = f.disassemble_with("f", &strings);
        assert!(text.starts_with("== f ==\n"));
        assert!(text.contains("0000  LoadConst dst=r0"));
        assert!(text.contains("const=Value::Integer(7)"));
        assert!(text.contains("-> 0003"));
        assert!(text.contains("name=\"print\"  args=(r0, r0)"));
        assert!(f.code[j].is_jump());
    }
}
