//! Register conventions and ABI constants of each code generation target.
//!
//! A descriptor is picked once, when the JIT backend is created, so one
//! process can produce code for every target side by side.

use crate::runner::config::TargetKind;
use crate::runner::jit::masm::{FReg, Reg};

pub trait TargetDescriptor: Sync {
    fn kind(&self) -> TargetKind;

    fn frame_pointer(&self) -> Reg;
    fn stack_pointer(&self) -> Reg;
    /// Base of the temporaries of the running function.
    fn locals_register(&self) -> Reg;
    /// Holds the execution context pointer for the whole function.
    fn context_register(&self) -> Reg;
    fn return_value_register(&self) -> Reg;
    fn scratch_register(&self) -> Reg;
    /// Second scratch, used by the inline fast paths.
    fn scratch_register2(&self) -> Reg;
    fn fp_scratch_register1(&self) -> FReg;
    fn fp_scratch_register2(&self) -> FReg;

    /// Registers carrying the first call arguments, in order.
    fn argument_registers(&self) -> &'static [Reg];
    fn pointer_size(&self) -> u32;
    /// Bytes the caller reserves below the stack arguments for the callee.
    fn shadow_space(&self) -> u32 {
        0
    }
    /// Required alignment of the stack pointer at every call.
    fn stack_alignment(&self) -> u32;
    /// Calls leave the return address in a register instead of on the stack.
    fn link_register(&self) -> Option<Reg> {
        None
    }

    fn argument_register_count(&self) -> usize {
        self.argument_registers().len()
    }

    fn register_name(&self, r: Reg) -> String {
        format!("r{}", r.0)
    }
}

/// 32-bit x86, cdecl: every argument goes on the stack.
pub struct X86;

/// x86-64 System V.
pub struct X86_64SysV;

/// x86-64 Windows: four argument registers and 32 bytes of shadow space.
pub struct X86_64Win64;

/// 32-bit ARM, AAPCS.
pub struct Arm32;

const EAX: Reg = Reg(0);
const ECX: Reg = Reg(1);
const EDX: Reg = Reg(2);
const ESP: Reg = Reg(4);
const EBP: Reg = Reg(5);
const ESI: Reg = Reg(6);
const EDI: Reg = Reg(7);
const R8: Reg = Reg(8);
const R9: Reg = Reg(9);
const R10: Reg = Reg(10);
const R11: Reg = Reg(11);
const R12: Reg = Reg(12);
const R14: Reg = Reg(14);

const X86_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
const X64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

impl TargetDescriptor for X86 {
    fn kind(&self) -> TargetKind {
        TargetKind::X86
    }
    fn frame_pointer(&self) -> Reg {
        EBP
    }
    fn stack_pointer(&self) -> Reg {
        ESP
    }
    fn locals_register(&self) -> Reg {
        EDI
    }
    fn context_register(&self) -> Reg {
        ESI
    }
    fn return_value_register(&self) -> Reg {
        EAX
    }
    fn scratch_register(&self) -> Reg {
        ECX
    }
    fn scratch_register2(&self) -> Reg {
        EDX
    }
    fn fp_scratch_register1(&self) -> FReg {
        FReg(0)
    }
    fn fp_scratch_register2(&self) -> FReg {
        FReg(1)
    }
    fn argument_registers(&self) -> &'static [Reg] {
        &[]
    }
    fn pointer_size(&self) -> u32 {
        4
    }
    fn stack_alignment(&self) -> u32 {
        16
    }
    fn register_name(&self, r: Reg) -> String {
        X86_NAMES.get(r.0 as usize).map_or_else(|| format!("r{}", r.0), |n| n.to_string())
    }
}

impl TargetDescriptor for X86_64SysV {
    fn kind(&self) -> TargetKind {
        TargetKind::X86_64SysV
    }
    fn frame_pointer(&self) -> Reg {
        EBP
    }
    fn stack_pointer(&self) -> Reg {
        ESP
    }
    fn locals_register(&self) -> Reg {
        R12
    }
    fn context_register(&self) -> Reg {
        R14
    }
    fn return_value_register(&self) -> Reg {
        EAX
    }
    fn scratch_register(&self) -> Reg {
        R10
    }
    fn scratch_register2(&self) -> Reg {
        R11
    }
    fn fp_scratch_register1(&self) -> FReg {
        FReg(0)
    }
    fn fp_scratch_register2(&self) -> FReg {
        FReg(1)
    }
    fn argument_registers(&self) -> &'static [Reg] {
        &[EDI, ESI, EDX, ECX, R8, R9]
    }
    fn pointer_size(&self) -> u32 {
        8
    }
    fn stack_alignment(&self) -> u32 {
        16
    }
    fn register_name(&self, r: Reg) -> String {
        X64_NAMES.get(r.0 as usize).map_or_else(|| format!("r{}", r.0), |n| n.to_string())
    }
}

impl TargetDescriptor for X86_64Win64 {
    fn kind(&self) -> TargetKind {
        TargetKind::X86_64Win64
    }
    fn frame_pointer(&self) -> Reg {
        EBP
    }
    fn stack_pointer(&self) -> Reg {
        ESP
    }
    fn locals_register(&self) -> Reg {
        R12
    }
    fn context_register(&self) -> Reg {
        R14
    }
    fn return_value_register(&self) -> Reg {
        EAX
    }
    fn scratch_register(&self) -> Reg {
        R10
    }
    fn scratch_register2(&self) -> Reg {
        R11
    }
    fn fp_scratch_register1(&self) -> FReg {
        FReg(0)
    }
    fn fp_scratch_register2(&self) -> FReg {
        FReg(1)
    }
    fn argument_registers(&self) -> &'static [Reg] {
        &[ECX, EDX, R8, R9]
    }
    fn pointer_size(&self) -> u32 {
        8
    }
    fn shadow_space(&self) -> u32 {
        32
    }
    fn stack_alignment(&self) -> u32 {
        16
    }
    fn register_name(&self, r: Reg) -> String {
        X64_NAMES.get(r.0 as usize).map_or_else(|| format!("r{}", r.0), |n| n.to_string())
    }
}

impl TargetDescriptor for Arm32 {
    fn kind(&self) -> TargetKind {
        TargetKind::Arm
    }
    fn frame_pointer(&self) -> Reg {
        Reg(4)
    }
    fn stack_pointer(&self) -> Reg {
        Reg(13)
    }
    fn locals_register(&self) -> Reg {
        Reg(7)
    }
    fn context_register(&self) -> Reg {
        Reg(5)
    }
    fn return_value_register(&self) -> Reg {
        Reg(0)
    }
    fn scratch_register(&self) -> Reg {
        Reg(6)
    }
    fn scratch_register2(&self) -> Reg {
        Reg(12)
    }
    fn fp_scratch_register1(&self) -> FReg {
        FReg(0)
    }
    fn fp_scratch_register2(&self) -> FReg {
        FReg(1)
    }
    fn argument_registers(&self) -> &'static [Reg] {
        &[Reg(0), Reg(1), Reg(2), Reg(3)]
    }
    fn pointer_size(&self) -> u32 {
        4
    }
    fn stack_alignment(&self) -> u32 {
        8
    }
    fn link_register(&self) -> Option<Reg> {
        Some(R14)
    }
    fn register_name(&self, r: Reg) -> String {
        match r.0 {
            13 => "sp".to_string(),
            14 => "lr".to_string(),
            15 => "pc".to_string(),
            n => format!("r{}", n),
        }
    }
}

pub fn descriptor(kind: TargetKind) -> &'static dyn TargetDescriptor {
    match kind {
        TargetKind::X86 => &X86,
        TargetKind::X86_64SysV => &X86_64SysV,
        TargetKind::X86_64Win64 => &X86_64Win64,
        TargetKind::Arm => &Arm32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_registers() {
        assert_eq!(descriptor(TargetKind::X86).argument_register_count(), 0);
        assert_eq!(descriptor(TargetKind::X86_64SysV).argument_register_count(), 6);
        assert_eq!(descriptor(TargetKind::X86_64Win64).argument_register_count(), 4);
        assert_eq!(descriptor(TargetKind::Arm).argument_register_count(), 4);
        assert_eq!(descriptor(TargetKind::X86_64Win64).shadow_space(), 32);
    }

    #[test]
    fn test_alignment_and_pointer_size() {
        for kind in TargetKind::ALL {
            let d = descriptor(kind);
            assert_eq!(d.kind(), kind);
            let expected = if kind == TargetKind::Arm { 8 } else { 16 };
            assert_eq!(d.stack_alignment(), expected);
            assert_eq!(d.pointer_size() == 8, matches!(kind, TargetKind::X86_64SysV | TargetKind::X86_64Win64));
        }
    }

    #[test]
    fn test_reserved_registers_are_not_arguments() {
        for kind in TargetKind::ALL {
            let d = descriptor(kind);
            let reserved = [
                d.frame_pointer(),
                d.stack_pointer(),
                d.locals_register(),
                d.context_register(),
                d.scratch_register(),
                d.scratch_register2(),
            ];
            for r in reserved {
                assert!(!d.argument_registers().contains(&r), "{} {}", kind, d.register_name(r));
            }
            assert_ne!(d.fp_scratch_register1(), d.fp_scratch_register2());
        }
        assert_eq!(descriptor(TargetKind::X86_64SysV).register_name(Reg(7)), "rdi");
        assert_eq!(descriptor(TargetKind::Arm).register_name(Reg(13)), "sp");
    }
}
