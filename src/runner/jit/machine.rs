//! Executes generated code.
//!
//! The machine models the register file, flags and memory of the target
//! the code was generated for: a read-only code region holding the
//! function and its constant pool, a private stack, and the context block
//! the context register points at. Calls to addresses in the runtime
//! window trap into [`runtime_calls::invoke`]; returning to the entry
//! sentinel ends the run.

use std::rc::Rc;

use thiserror::Error;

use crate::runner::config::TargetKind;
use crate::runner::context::ContextId;
use crate::runner::ds::error::{ErrorType, ExceptionSignal, ReturnedValue};
use crate::runner::ds::value::Value;
use crate::runner::engine::ExecutionEngine;
use crate::runner::function::{CodeRef, Function};
use crate::runner::jit::assembler::CONTEXT_EXCEPTION_FLAG;
use crate::runner::jit::masm::{AluOp32, AluOp64, Cond, DecodeError, Insn, Reg, UnaryOp32, FPR_COUNT, GPR_COUNT};
use crate::runner::jit::runtime_calls::{self, RuntimeCall};
use crate::runner::jit::target::{descriptor, TargetDescriptor};

pub const STACK_BASE: u64 = 0x7000_0000;
pub const STACK_SIZE: usize = 64 * 1024;
pub const CONTEXT_BASE: u64 = 0x6000_0000;
const CONTEXT_BLOCK_SIZE: usize = 16;

/// Return address planted by the entry sequence.
const ENTRY_SENTINEL: u64 = 0xdead_0000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("bad memory access at {address:#x} ({len} bytes)")]
    BadMemoryAccess { address: u64, len: usize },
    #[error("stack pointer {sp:#x} misaligned at call to {target:#x}")]
    MisalignedStack { sp: u64, target: u64 },
    #[error("cannot decode instruction at {pc:#x}: {error}")]
    UnknownOpcode { pc: u64, error: DecodeError },
    #[error("call to {0:#x}, which is neither a runtime function nor code")]
    BadCallTarget(u64),
    #[error("argument {index} of runtime call {call} is invalid")]
    BadRuntimeArgument { call: &'static str, index: usize },
}

/// The address space of one run.
pub struct Memory {
    code_base: u64,
    code: Vec<u8>,
    stack: Vec<u8>,
    context: [u8; CONTEXT_BLOCK_SIZE],
}

enum Region {
    Code,
    Stack,
    Context,
}

impl Memory {
    pub fn new(code_base: u64, code: Vec<u8>) -> Self {
        Memory {
            code_base,
            code,
            stack: vec![0; STACK_SIZE],
            context: [0; CONTEXT_BLOCK_SIZE],
        }
    }

    fn locate(&self, address: u64, len: usize) -> Result<(Region, usize), MachineError> {
        let bad = MachineError::BadMemoryAccess { address, len };
        let within = |base: u64, size: usize| {
            address >= base && address.checked_add(len as u64).map_or(false, |end| end <= base + size as u64)
        };
        if within(STACK_BASE, self.stack.len()) {
            Ok((Region::Stack, (address - STACK_BASE) as usize))
        } else if within(CONTEXT_BASE, CONTEXT_BLOCK_SIZE) {
            Ok((Region::Context, (address - CONTEXT_BASE) as usize))
        } else if within(self.code_base, self.code.len()) {
            Ok((Region::Code, (address - self.code_base) as usize))
        } else {
            Err(bad)
        }
    }

    pub fn read(&self, address: u64, len: usize) -> Result<&[u8], MachineError> {
        let (region, offset) = self.locate(address, len)?;
        Ok(match region {
            Region::Code => &self.code[offset..offset + len],
            Region::Stack => &self.stack[offset..offset + len],
            Region::Context => &self.context[offset..offset + len],
        })
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), MachineError> {
        let len = bytes.len();
        match self.locate(address, len)? {
            (Region::Stack, offset) => self.stack[offset..offset + len].copy_from_slice(bytes),
            (Region::Context, offset) => self.context[offset..offset + len].copy_from_slice(bytes),
            (Region::Code, _) => return Err(MachineError::BadMemoryAccess { address, len }),
        }
        Ok(())
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, MachineError> {
        let b = self.read(address, 8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    pub fn read_u32(&self, address: u64) -> Result<u32, MachineError> {
        let b = self.read(address, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_value(&self, address: u64) -> Result<Value, MachineError> {
        self.read_u64(address).map(Value::from_raw)
    }

    /// Code bytes from `address` to the end of the code region.
    fn code_at(&self, address: u64) -> Result<&[u8], MachineError> {
        if address < self.code_base || address >= self.code_base + self.code.len() as u64 {
            return Err(MachineError::BadMemoryAccess { address, len: 1 });
        }
        Ok(&self.code[(address - self.code_base) as usize..])
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    zero: bool,
    less: bool,
    below: bool,
    overflow: bool,
}

impl Flags {
    fn holds(self, cond: Cond) -> bool {
        match cond {
            Cond::Eq => self.zero,
            Cond::Ne => !self.zero,
            Cond::Lt => self.less,
            Cond::Le => self.less || self.zero,
            Cond::Gt => !self.less && !self.zero,
            Cond::Ge => !self.less,
            Cond::Below => self.below,
            Cond::AboveEq => !self.below,
            Cond::Overflow => self.overflow,
            Cond::NoOverflow => !self.overflow,
        }
    }

    fn result32(r: u32, overflow: bool) -> Flags {
        Flags {
            zero: r == 0,
            less: (r as i32) < 0,
            below: false,
            overflow,
        }
    }
}

struct Machine {
    target: &'static dyn TargetDescriptor,
    regs: [u64; GPR_COUNT],
    fregs: [f64; FPR_COUNT],
    flags: Flags,
    pc: u64,
    memory: Memory,
    unit: usize,
}

enum Step {
    Continue,
    Halt,
}

impl Machine {
    fn new(target: &'static dyn TargetDescriptor, memory: Memory, unit: usize) -> Self {
        Machine {
            target,
            regs: [0; GPR_COUNT],
            fregs: [0.0; FPR_COUNT],
            flags: Flags::default(),
            pc: 0,
            memory,
            unit,
        }
    }

    fn pointer_mask(&self) -> u64 {
        if self.target.pointer_size() == 4 {
            0xffff_ffff
        } else {
            u64::MAX
        }
    }

    fn reg(&self, r: Reg) -> u64 {
        self.regs[r.0 as usize]
    }

    fn set(&mut self, r: Reg, v: u64) {
        self.regs[r.0 as usize] = v;
    }

    fn sp(&self) -> u64 {
        self.reg(self.target.stack_pointer())
    }

    fn address(&self, base: Reg, disp: i32) -> u64 {
        self.reg(base).wrapping_add(disp as i64 as u64) & self.pointer_mask()
    }

    fn push(&mut self, v: u64) -> Result<(), MachineError> {
        let size = self.target.pointer_size() as u64;
        let sp = self.sp().wrapping_sub(size);
        self.set(self.target.stack_pointer(), sp);
        if size == 8 {
            self.memory.write(sp, &v.to_le_bytes())
        } else {
            self.memory.write(sp, &(v as u32).to_le_bytes())
        }
    }

    fn pop(&mut self) -> Result<u64, MachineError> {
        let size = self.target.pointer_size() as u64;
        let sp = self.sp();
        let v = if size == 8 {
            self.memory.read_u64(sp)?
        } else {
            self.memory.read_u32(sp)? as u64
        };
        self.set(self.target.stack_pointer(), sp.wrapping_add(size));
        Ok(v)
    }

    /// Sets up registers and stack as the target's caller would, with the
    /// context block pointer as the only argument.
    fn enter(&mut self, entry: u64) -> Result<(), MachineError> {
        let t = self.target;
        let top = STACK_BASE + STACK_SIZE as u64;
        match t.argument_registers().first() {
            Some(&r) => self.set(r, CONTEXT_BASE),
            None => {
                // cdecl: the argument sits at the aligned stack pointer
                let sp = top - 16;
                self.set(t.stack_pointer(), sp);
                self.memory.write(sp, &(CONTEXT_BASE as u32).to_le_bytes())?;
            }
        }
        if !t.argument_registers().is_empty() {
            let sp = top - t.shadow_space() as u64;
            self.set(t.stack_pointer(), sp);
        }
        match t.link_register() {
            Some(lr) => self.set(lr, ENTRY_SENTINEL),
            None => self.push(ENTRY_SENTINEL)?,
        }
        self.pc = entry;
        Ok(())
    }

    fn run(&mut self, engine: &mut ExecutionEngine) -> Result<Value, MachineError> {
        loop {
            if let Step::Halt = self.step(engine)? {
                return Ok(Value::from_raw(self.reg(self.target.return_value_register())));
            }
        }
    }

    fn step(&mut self, engine: &mut ExecutionEngine) -> Result<Step, MachineError> {
        let pc = self.pc;
        let (insn, len) = Insn::decode(self.memory.code_at(pc)?).map_err(|error| MachineError::UnknownOpcode { pc, error })?;
        self.pc = pc + len as u64;
        match insn {
            Insn::MovImm64 { dst, imm } => self.set(dst, imm),
            Insn::Mov { dst, src } => self.set(dst, self.reg(src)),
            Insn::Load64 { dst, base, disp } => {
                let v = self.memory.read_u64(self.address(base, disp))?;
                self.set(dst, v);
            }
            Insn::Load32 { dst, base, disp } => {
                let v = self.memory.read_u32(self.address(base, disp))?;
                self.set(dst, v as u64);
            }
            Insn::Load8 { dst, base, disp } => {
                let v = self.memory.read(self.address(base, disp), 1)?[0];
                self.set(dst, v as u64);
            }
            Insn::Store64 { src, base, disp } => {
                let (a, v) = (self.address(base, disp), self.reg(src));
                self.memory.write(a, &v.to_le_bytes())?;
            }
            Insn::Store32 { src, base, disp } => {
                let (a, v) = (self.address(base, disp), self.reg(src) as u32);
                self.memory.write(a, &v.to_le_bytes())?;
            }
            Insn::Lea { dst, base, disp } => self.set(dst, self.address(base, disp)),
            Insn::Alu64 { op, dst, src } => {
                let (a, b) = (self.reg(dst), self.reg(src));
                let r = match op {
                    AluOp64::Add => a.wrapping_add(b),
                    AluOp64::Sub => a.wrapping_sub(b),
                    AluOp64::And => a & b,
                    AluOp64::Or => a | b,
                    AluOp64::Xor => a ^ b,
                };
                self.set(dst, r);
                self.flags = Flags {
                    zero: r == 0,
                    less: (r as i64) < 0,
                    below: false,
                    overflow: false,
                };
            }
            Insn::AddImm { dst, imm } => {
                let r = self.reg(dst).wrapping_add(imm as i64 as u64) & self.pointer_mask();
                self.set(dst, r);
            }
            Insn::ShrImm { dst, amount } => self.set(dst, self.reg(dst) >> (amount & 63)),
            Insn::Alu32 { op, dst, src } => {
                let (a, b) = (self.reg(dst) as u32, self.reg(src) as u32);
                let (r, overflow) = match op {
                    AluOp32::Add => {
                        let (r, o) = (a as i32).overflowing_add(b as i32);
                        (r as u32, o)
                    }
                    AluOp32::Sub => {
                        let (r, o) = (a as i32).overflowing_sub(b as i32);
                        (r as u32, o)
                    }
                    AluOp32::Mul => {
                        let (r, o) = (a as i32).overflowing_mul(b as i32);
                        (r as u32, o)
                    }
                    AluOp32::And => (a & b, false),
                    AluOp32::Or => (a | b, false),
                    AluOp32::Xor => (a ^ b, false),
                    AluOp32::Shl => (a << (b & 31), false),
                    AluOp32::Sar => (((a as i32) >> (b & 31)) as u32, false),
                    AluOp32::Shr => (a >> (b & 31), false),
                };
                self.set(dst, r as u64);
                self.flags = Flags::result32(r, overflow);
            }
            Insn::Unary32 { op, dst } => {
                let a = self.reg(dst) as u32;
                let (r, overflow) = match op {
                    UnaryOp32::Neg => {
                        let (r, o) = (a as i32).overflowing_neg();
                        (r as u32, o)
                    }
                    UnaryOp32::Not => (!a, false),
                };
                self.set(dst, r as u64);
                self.flags = Flags::result32(r, overflow);
            }
            Insn::Cmp { a, b } => {
                let (x, y) = (self.reg(a), self.reg(b));
                self.flags = Flags {
                    zero: x == y,
                    less: (x as i64) < (y as i64),
                    below: x < y,
                    overflow: false,
                };
            }
            Insn::Cmp32 { a, b } => {
                let (x, y) = (self.reg(a) as u32, self.reg(b) as u32);
                self.flags = Flags {
                    zero: x == y,
                    less: (x as i32) < (y as i32),
                    below: x < y,
                    overflow: false,
                };
            }
            Insn::CmpImm { a, imm } => {
                let (x, y) = (self.reg(a), imm as i64 as u64);
                self.flags = Flags {
                    zero: x == y,
                    less: (x as i64) < (y as i64),
                    below: x < y,
                    overflow: false,
                };
            }
            Insn::Jcc { cond, rel } => {
                if self.flags.holds(cond) {
                    self.pc = self.pc.wrapping_add(rel as i64 as u64);
                }
            }
            Insn::Jmp { rel } => self.pc = self.pc.wrapping_add(rel as i64 as u64),
            Insn::Push { src } => self.push(self.reg(src))?,
            Insn::Pop { dst } => {
                let v = self.pop()?;
                self.set(dst, v);
            }
            Insn::CallReg { target } => self.call(engine, self.reg(target))?,
            Insn::Ret => {
                let to = match self.target.link_register() {
                    Some(lr) => self.reg(lr),
                    None => self.pop()?,
                };
                if to == ENTRY_SENTINEL {
                    return Ok(Step::Halt);
                }
                self.pc = to;
            }
            Insn::CvtU32ToF64 { dst, src } => self.fregs[dst.0 as usize] = self.reg(src) as u32 as f64,
            Insn::MovFromF64 { dst, src } => self.set(dst, self.fregs[src.0 as usize].to_bits()),
        }
        Ok(Step::Continue)
    }

    fn call(&mut self, engine: &mut ExecutionEngine, target: u64) -> Result<(), MachineError> {
        let call = RuntimeCall::from_address(target).ok_or(MachineError::BadCallTarget(target))?;
        let sp = self.sp();
        if sp % self.target.stack_alignment() as u64 != 0 {
            return Err(MachineError::MisalignedStack { sp, target });
        }
        let t = self.target;
        let registers = t.argument_registers();
        let mask = self.pointer_mask();
        let mut args = Vec::with_capacity(call.arg_count());
        for i in 0..call.arg_count() {
            let word = match registers.get(i) {
                Some(r) => self.reg(*r),
                None => {
                    let slot = sp + (t.shadow_space() + (i - registers.len()) as u32 * t.pointer_size()) as u64;
                    if t.pointer_size() == 8 {
                        self.memory.read_u64(slot)?
                    } else {
                        self.memory.read_u32(slot)? as u64
                    }
                }
            };
            args.push(word & mask);
        }
        let result = runtime_calls::invoke(engine, &self.memory, self.unit, call, &args)?;
        self.set(t.return_value_register(), result.raw());
        let flag = CONTEXT_BASE + CONTEXT_EXCEPTION_FLAG as u64;
        self.memory.write(flag, &[engine.has_exception as u8])?;
        Ok(())
    }
}

/// Runs the native code of `function` at `address`, generated for
/// `target`, in context `ctx`.
pub fn run(
    engine: &mut ExecutionEngine,
    ctx: ContextId,
    function: &Rc<Function>,
    target: TargetKind,
    address: u64,
) -> ReturnedValue {
    let span = tracing::trace_span!(target: "jsv4::engine", "native", function = function.index, context = ctx.index());
    let _guard = span.enter();
    let size = match &function.code {
        CodeRef::Native { size, .. } => *size as usize,
        CodeRef::Bytecode(_) => 0,
    };
    let result = engine
        .executable_allocator
        .read(address, size)
        .map_err(|_| MachineError::BadMemoryAccess { address, len: size })
        .and_then(|code| {
            let mut m = Machine::new(descriptor(target), Memory::new(address, code), function.unit);
            m.enter(address)?;
            m.run(engine)
        });
    match result {
        Ok(v) if engine.has_exception => {
            tracing::trace!(target: "jsv4::jit", value = ?v, "returned through the exception exit");
            Err(ExceptionSignal)
        }
        Ok(v) => Ok(v),
        Err(e) => {
            tracing::error!(target: "jsv4::jit", error = %e, address, "machine fault");
            let message = format!("machine fault: {}", e);
            engine.fault = Some(e);
            Err(engine.throw_error(ErrorType::Error, &message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(kind: TargetKind, insns: &[Insn]) -> Machine {
        let mut code = Vec::new();
        for i in insns {
            i.encode(&mut code);
        }
        let base = 0x1000_0000;
        let mut m = Machine::new(descriptor(kind), Memory::new(base, code), 0);
        m.enter(base).unwrap();
        m
    }

    fn run_pure(m: &mut Machine) -> Result<u64, MachineError> {
        let mut engine = ExecutionEngine::default();
        m.run(&mut engine).map(|v| v.raw())
    }

    #[test]
    fn test_entry_returns_to_the_sentinel() {
        for kind in TargetKind::ALL {
            let ret = descriptor(kind).return_value_register();
            let mut m = machine(kind, &[Insn::MovImm64 { dst: ret, imm: 42 }, Insn::Ret]);
            assert_eq!(run_pure(&mut m), Ok(42), "{}", kind);
        }
    }

    #[test]
    fn test_context_argument_follows_convention() {
        let m = machine(TargetKind::X86_64Win64, &[Insn::Ret]);
        assert_eq!(m.regs[1], CONTEXT_BASE);
        let m = machine(TargetKind::Arm, &[Insn::Ret]);
        assert_eq!(m.regs[0], CONTEXT_BASE);
        assert_eq!(m.regs[14], ENTRY_SENTINEL);
        let m = machine(TargetKind::X86, &[Insn::Ret]);
        let sp = m.regs[4];
        assert_eq!(m.memory.read_u32(sp + 4).unwrap() as u64, CONTEXT_BASE);
    }

    #[test]
    fn test_overflow_flag() {
        let mut m = machine(
            TargetKind::X86_64SysV,
            &[
                Insn::MovImm64 { dst: Reg(0), imm: i32::MAX as u64 },
                Insn::MovImm64 { dst: Reg(1), imm: 1 },
                Insn::Alu32 {
                    op: AluOp32::Add,
                    dst: Reg(0),
                    src: Reg(1),
                },
                Insn::Jcc {
                    cond: Cond::Overflow,
                    rel: 10,
                },
                Insn::MovImm64 { dst: Reg(0), imm: 7 },
                Insn::Ret,
            ],
        );
        assert_eq!(run_pure(&mut m), Ok(i32::MIN as u32 as u64));
    }

    #[test]
    fn test_code_is_read_only() {
        let mut m = machine(
            TargetKind::X86_64SysV,
            &[
                Insn::MovImm64 {
                    dst: Reg(1),
                    imm: 0x1000_0000,
                },
                Insn::Store64 {
                    src: Reg(0),
                    base: Reg(1),
                    disp: 0,
                },
                Insn::Ret,
            ],
        );
        assert_eq!(
            run_pure(&mut m),
            Err(MachineError::BadMemoryAccess {
                address: 0x1000_0000,
                len: 8
            })
        );
    }

    #[test]
    fn test_misaligned_call_faults() {
        let scratch = Reg(10);
        let mut m = machine(
            TargetKind::X86_64SysV,
            &[
                // the pushed sentinel leaves sp 8 off alignment
                Insn::MovImm64 {
                    dst: scratch,
                    imm: RuntimeCall::PopScope.address(),
                },
                Insn::CallReg { target: scratch },
                Insn::Ret,
            ],
        );
        assert!(matches!(run_pure(&mut m), Err(MachineError::MisalignedStack { .. })));
    }

    #[test]
    fn test_unknown_opcode() {
        let base = 0x1000_0000;
        let mut m = Machine::new(descriptor(TargetKind::Arm), Memory::new(base, vec![0xee]), 0);
        m.enter(base).unwrap();
        assert_eq!(
            run_pure(&mut m),
            Err(MachineError::UnknownOpcode {
                pc: base,
                error: DecodeError::UnknownOpcode(0xee)
            })
        );
    }
}
