//! Emits the instructions of one function: frame setup, temp access,
//! runtime calls with exception checks, labels and the double constant pool.

use crate::runner::ds::value::Value;
use crate::runner::ir::Temp;
use crate::runner::jit::masm::{self, AluOp64, Cond, DecodeError, Insn, Reg};
use crate::runner::jit::runtime_calls::RuntimeCall;
use crate::runner::jit::stack_layout::{Address, StackLayout};
use crate::runner::jit::target::TargetDescriptor;

/// Byte offset of the exception flag inside the context block the
/// context register points at.
pub const CONTEXT_EXCEPTION_FLAG: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// One native argument of a runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    ContextRegister,
    Imm(u64),
    /// Address of a stack slot.
    Pointer(Address),
    /// Address of a temp's slot.
    Temp(Temp),
    /// Index into the unit's string table.
    StringRef(u32),
}

pub struct Assembler {
    target: &'static dyn TargetDescriptor,
    layout: StackLayout,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    jumps: Vec<(usize, Label)>,
    /// Jumps to the shared "return with exception" stub.
    exception_exits: Vec<usize>,
    catch_label: Option<Label>,
    constants: Vec<Value>,
    /// `(MovImm64 position, constant index)`.
    constant_refs: Vec<(usize, usize)>,
}

/// A finished function, ready to be placed at its final address.
#[derive(Debug, Clone)]
pub struct AssembledFunction {
    pub code: Vec<u8>,
    pub pool_offset: usize,
    pub constants: Vec<Value>,
    constant_refs: Vec<(usize, usize)>,
}

impl AssembledFunction {
    /// Code plus constant pool.
    pub fn size(&self) -> usize {
        self.pool_offset + 8 * self.constants.len()
    }

    /// Bytes to write at `base`, with every pool reference resolved.
    pub fn link(&self, base: u64) -> Result<Vec<u8>, DecodeError> {
        let mut out = self.code.clone();
        out.resize(self.pool_offset, 0);
        for (at, index) in &self.constant_refs {
            let address = base + (self.pool_offset + 8 * index) as u64;
            masm::patch_imm64(&mut out, *at, address)?;
        }
        for c in &self.constants {
            out.extend_from_slice(&c.raw().to_le_bytes());
        }
        Ok(out)
    }
}

impl Assembler {
    pub fn new(target: &'static dyn TargetDescriptor, layout: StackLayout) -> Self {
        Assembler {
            target,
            layout,
            code: Vec::with_capacity(256),
            labels: Vec::new(),
            jumps: Vec::new(),
            exception_exits: Vec::new(),
            catch_label: None,
            constants: Vec::new(),
            constant_refs: Vec::new(),
        }
    }

    pub fn target(&self) -> &'static dyn TargetDescriptor {
        self.target
    }

    pub fn layout(&self) -> &StackLayout {
        &self.layout
    }

    pub fn emit(&mut self, insn: Insn) -> usize {
        let at = self.code.len();
        insn.encode(&mut self.code);
        at
    }

    pub fn position(&self) -> usize {
        self.code.len()
    }

    // ── Labels and jumps ──

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    pub fn jump(&mut self, label: Label) {
        let at = self.emit(Insn::Jmp { rel: 0 });
        self.jumps.push((at, label));
    }

    pub fn branch(&mut self, cond: Cond, label: Label) {
        let at = self.emit(Insn::Jcc { cond, rel: 0 });
        self.jumps.push((at, label));
    }

    /// Handler for exceptions raised by the code emitted next, `None` to
    /// leave the function.
    pub fn set_catch_label(&mut self, label: Option<Label>) {
        self.catch_label = label;
    }

    // ── Frame ──

    pub fn enter_standard_stack_frame(&mut self) {
        let t = self.target;
        let frame_size = self.layout.calculate_stack_frame_size() as i32;
        if let Some(lr) = t.link_register() {
            self.emit(Insn::Push { src: lr });
        }
        self.emit(Insn::Push { src: t.frame_pointer() });
        self.emit(Insn::Mov {
            dst: t.frame_pointer(),
            src: t.stack_pointer(),
        });
        self.emit(Insn::Push { src: t.context_register() });
        self.emit(Insn::Push { src: t.locals_register() });
        self.emit(Insn::Lea {
            dst: t.locals_register(),
            base: t.frame_pointer(),
            disp: self.layout.locals_offset(),
        });
        if frame_size != 0 {
            self.emit(Insn::AddImm {
                dst: t.stack_pointer(),
                imm: -frame_size,
            });
        }
        match t.argument_registers().first() {
            Some(&r) => {
                self.emit(Insn::Mov {
                    dst: t.context_register(),
                    src: r,
                });
            }
            None => {
                let a = self.layout.incoming_stack_argument(0);
                self.load_pointer(t.context_register(), a);
            }
        }
    }

    pub fn leave_standard_stack_frame(&mut self) {
        let t = self.target;
        let frame_size = self.layout.calculate_stack_frame_size() as i32;
        if frame_size != 0 {
            self.emit(Insn::AddImm {
                dst: t.stack_pointer(),
                imm: frame_size,
            });
        }
        self.emit(Insn::Pop { dst: t.locals_register() });
        self.emit(Insn::Pop { dst: t.context_register() });
        self.emit(Insn::Pop { dst: t.frame_pointer() });
        if let Some(lr) = t.link_register() {
            self.emit(Insn::Pop { dst: lr });
        }
    }

    /// Loads the return value register and leaves the function.
    pub fn emit_return(&mut self, value: Temp) {
        let ret = self.target.return_value_register();
        self.load_temp(ret, value);
        self.leave_standard_stack_frame();
        self.emit(Insn::Ret);
    }

    // ── Values ──

    fn load_pointer(&mut self, dst: Reg, a: Address) {
        if self.target.pointer_size() == 8 {
            self.emit(Insn::Load64 {
                dst,
                base: a.base,
                disp: a.offset,
            });
        } else {
            self.emit(Insn::Load32 {
                dst,
                base: a.base,
                disp: a.offset,
            });
        }
    }

    fn store_pointer(&mut self, src: Reg, a: Address) {
        if self.target.pointer_size() == 8 {
            self.emit(Insn::Store64 {
                src,
                base: a.base,
                disp: a.offset,
            });
        } else {
            self.emit(Insn::Store32 {
                src,
                base: a.base,
                disp: a.offset,
            });
        }
    }

    pub fn temp_address(&self, t: Temp) -> Address {
        self.layout.stack_slot_pointer(t.index)
    }

    pub fn load_value(&mut self, dst: Reg, a: Address) {
        self.emit(Insn::Load64 {
            dst,
            base: a.base,
            disp: a.offset,
        });
    }

    pub fn store_value(&mut self, src: Reg, a: Address) {
        self.emit(Insn::Store64 {
            src,
            base: a.base,
            disp: a.offset,
        });
    }

    pub fn load_temp(&mut self, dst: Reg, t: Temp) {
        let a = self.temp_address(t);
        self.load_value(dst, a);
    }

    pub fn store_temp(&mut self, src: Reg, t: Temp) {
        let a = self.temp_address(t);
        self.store_value(src, a);
    }

    pub fn copy_value(&mut self, from: Address, to: Address) {
        let s = self.target.scratch_register();
        self.load_value(s, from);
        self.store_value(s, to);
    }

    /// Stores a constant whose encoding fits an immediate.
    pub fn store_immediate(&mut self, value: Value, to: Address) {
        let s = self.target.scratch_register();
        self.emit(Insn::MovImm64 { dst: s, imm: value.raw() });
        self.store_value(s, to);
    }

    /// Stores a double through the constant pool.
    pub fn store_double(&mut self, value: Value, to: Address) {
        let s = self.target.scratch_register();
        let index = match self.constants.iter().position(|c| c.raw() == value.raw()) {
            Some(i) => i,
            None => {
                self.constants.push(value);
                self.constants.len() - 1
            }
        };
        let at = self.emit(Insn::MovImm64 { dst: s, imm: 0 });
        self.constant_refs.push((at, index));
        self.emit(Insn::Load64 { dst: s, base: s, disp: 0 });
        self.store_value(s, to);
    }

    // ── Runtime calls ──

    fn load_argument(&mut self, arg: Arg, dst: Reg) {
        match arg {
            Arg::ContextRegister => {
                self.emit(Insn::Mov {
                    dst,
                    src: self.target.context_register(),
                });
            }
            Arg::Imm(imm) => {
                self.emit(Insn::MovImm64 { dst, imm });
            }
            Arg::StringRef(index) => {
                self.emit(Insn::MovImm64 { dst, imm: index as u64 });
            }
            Arg::Pointer(a) => {
                self.emit(Insn::Lea {
                    dst,
                    base: a.base,
                    disp: a.offset,
                });
            }
            Arg::Temp(t) => {
                let a = self.temp_address(t);
                self.emit(Insn::Lea {
                    dst,
                    base: a.base,
                    disp: a.offset,
                });
            }
        }
    }

    /// Calls `call` with `args` placed per the target's calling convention
    /// and stores its result into `result`. Calls that can throw are
    /// followed by an exception check.
    pub fn generate_function_call_imp(&mut self, result: Option<Temp>, call: RuntimeCall, args: &[Arg]) {
        debug_assert_eq!(args.len(), call.arg_count(), "{}", call.name());
        let registers = self.target.argument_registers();
        let scratch = self.target.scratch_register();
        // stack arguments first: loading them goes through the scratch register
        for (i, arg) in args.iter().enumerate().skip(registers.len()) {
            self.load_argument(*arg, scratch);
            let slot = self.layout.outgoing_stack_argument((i - registers.len()) as u32);
            self.store_pointer(scratch, slot);
        }
        for (arg, reg) in args.iter().zip(registers) {
            self.load_argument(*arg, *reg);
        }
        self.emit(Insn::MovImm64 {
            dst: scratch,
            imm: call.address(),
        });
        self.emit(Insn::CallReg { target: scratch });
        if call.needs_exception_check() {
            self.check_exception();
        }
        if let Some(t) = result {
            let ret = self.target.return_value_register();
            self.store_temp(ret, t);
        }
    }

    /// Branches to the current handler when the engine's exception flag
    /// is set.
    pub fn check_exception(&mut self) {
        let s = self.target.scratch_register();
        self.emit(Insn::Load8 {
            dst: s,
            base: self.target.context_register(),
            disp: CONTEXT_EXCEPTION_FLAG,
        });
        self.emit(Insn::CmpImm { a: s, imm: 0 });
        match self.catch_label {
            Some(l) => self.branch(Cond::Ne, l),
            None => {
                let at = self.emit(Insn::Jcc { cond: Cond::Ne, rel: 0 });
                self.exception_exits.push(at);
            }
        }
    }

    pub fn jump_to_exception_handler(&mut self) {
        match self.catch_label {
            Some(l) => self.jump(l),
            None => {
                let at = self.emit(Insn::Jmp { rel: 0 });
                self.exception_exits.push(at);
            }
        }
    }

    // ── Inline helpers ──

    pub fn xor_imm64(&mut self, dst: Reg, imm: u64) {
        let s2 = self.target.scratch_register2();
        debug_assert_ne!(dst, s2);
        self.emit(Insn::MovImm64 { dst: s2, imm });
        self.emit(Insn::Alu64 {
            op: AluOp64::Xor,
            dst,
            src: s2,
        });
    }

    pub fn or_imm64(&mut self, dst: Reg, imm: u64) {
        let s2 = self.target.scratch_register2();
        debug_assert_ne!(dst, s2);
        self.emit(Insn::MovImm64 { dst: s2, imm });
        self.emit(Insn::Alu64 {
            op: AluOp64::Or,
            dst,
            src: s2,
        });
    }

    /// Emits the shared exception exit, resolves every jump and returns the
    /// finished function.
    pub fn finish(mut self) -> Result<AssembledFunction, DecodeError> {
        if !self.exception_exits.is_empty() {
            let stub = self.code.len();
            let ret = self.target.return_value_register();
            self.emit(Insn::MovImm64 {
                dst: ret,
                imm: Value::undefined().raw(),
            });
            self.leave_standard_stack_frame();
            self.emit(Insn::Ret);
            for at in std::mem::take(&mut self.exception_exits) {
                masm::patch_jump(&mut self.code, at, stub)?;
            }
        }
        for (at, label) in std::mem::take(&mut self.jumps) {
            let target = self.labels[label.0].ok_or(DecodeError::Truncated)?;
            masm::patch_jump(&mut self.code, at, target)?;
        }
        let pool_offset = (self.code.len() + 7) & !7;
        Ok(AssembledFunction {
            code: self.code,
            pool_offset,
            constants: self.constants,
            constant_refs: self.constant_refs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::config::TargetKind;
    use crate::runner::ir::Type;
    use crate::runner::jit::target::descriptor;

    fn decode_all(code: &[u8]) -> Vec<Insn> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < code.len() {
            let (i, len) = Insn::decode(&code[pos..]).unwrap();
            out.push(i);
            pos += len;
        }
        out
    }

    fn assembler(kind: TargetKind) -> Assembler {
        let d = descriptor(kind);
        Assembler::new(d, StackLayout::new(d, 2, 1, 2))
    }

    #[test]
    fn test_frame_is_balanced() {
        for kind in TargetKind::ALL {
            let mut a = assembler(kind);
            a.enter_standard_stack_frame();
            a.leave_standard_stack_frame();
            let insns = decode_all(&a.finish().unwrap().code);
            let pushes = insns.iter().filter(|i| matches!(i, Insn::Push { .. })).count();
            let pops = insns.iter().filter(|i| matches!(i, Insn::Pop { .. })).count();
            assert_eq!(pushes, pops, "{}", kind);
            let adjust: i32 = insns
                .iter()
                .filter_map(|i| match i {
                    Insn::AddImm { imm, .. } => Some(*imm),
                    _ => None,
                })
                .sum();
            assert_eq!(adjust, 0);
        }
    }

    #[test]
    fn test_context_comes_from_first_argument() {
        let mut a = assembler(TargetKind::X86_64SysV);
        a.enter_standard_stack_frame();
        let insns = decode_all(&a.finish().unwrap().code);
        assert_eq!(insns.last(), Some(&Insn::Mov { dst: Reg(14), src: Reg(7) }));

        let mut a = assembler(TargetKind::X86);
        a.enter_standard_stack_frame();
        let insns = decode_all(&a.finish().unwrap().code);
        assert_eq!(
            insns.last(),
            Some(&Insn::Load32 {
                dst: Reg(6),
                base: Reg(5),
                disp: 8
            })
        );
    }

    #[test]
    fn test_call_uses_registers_then_stack() {
        let t = Temp { index: 1, ty: Type::Var };
        let mut a = assembler(TargetKind::X86_64Win64);
        a.generate_function_call_imp(
            Some(t),
            RuntimeCall::CallProperty,
            &[Arg::ContextRegister, Arg::Temp(t), Arg::StringRef(3), Arg::Imm(0), Arg::Imm(0)],
        );
        let insns = decode_all(&a.finish().unwrap().code);
        // fifth argument goes above the 32 byte shadow space
        assert!(insns.contains(&Insn::Store64 {
            src: Reg(10),
            base: Reg(4),
            disp: 32
        }));
        assert!(insns.contains(&Insn::MovImm64 { dst: Reg(8), imm: 3 }));
        assert!(insns.contains(&Insn::CallReg { target: Reg(10) }));
        assert!(insns.iter().any(|i| matches!(i, Insn::Load8 { .. })));
    }

    #[test]
    fn test_calls_that_cannot_throw_are_not_checked() {
        let mut a = assembler(TargetKind::Arm);
        a.generate_function_call_imp(None, RuntimeCall::PopScope, &[Arg::ContextRegister]);
        let insns = decode_all(&a.finish().unwrap().code);
        assert!(!insns.iter().any(|i| matches!(i, Insn::Jcc { .. })));
    }

    #[test]
    fn test_exception_exits_share_one_stub() {
        let mut a = assembler(TargetKind::X86_64SysV);
        a.enter_standard_stack_frame();
        a.check_exception();
        a.jump_to_exception_handler();
        let f = a.finish().unwrap();
        let rets = decode_all(&f.code).iter().filter(|i| matches!(i, Insn::Ret)).count();
        assert_eq!(rets, 1);
    }

    #[test]
    fn test_pool_is_linked_after_code() {
        let t = Temp { index: 0, ty: Type::Double };
        let mut a = assembler(TargetKind::X86_64SysV);
        let at = a.temp_address(t);
        a.store_double(Value::from_double(1.5), at);
        a.store_double(Value::from_double(1.5), at);
        a.emit(Insn::Ret);
        let f = a.finish().unwrap();
        assert_eq!(f.constants.len(), 1);
        assert_eq!(f.pool_offset % 8, 0);
        let bytes = f.link(0x1000).unwrap();
        assert_eq!(bytes.len(), f.size());
        let expected = Insn::MovImm64 {
            dst: Reg(10),
            imm: 0x1000 + f.pool_offset as u64,
        };
        assert_eq!(Insn::decode(&bytes).unwrap().0, expected);
        let raw = u64::from_le_bytes(bytes[f.pool_offset..f.pool_offset + 8].try_into().unwrap());
        assert_eq!(Value::from_raw(raw), Value::from_double(1.5));
    }
}
