//! The machine instruction set shared by all targets.
//!
//! Instructions are variable length: one opcode byte followed by fixed
//! operand fields (register numbers as bytes, displacements and relative
//! jump offsets as little-endian `i32`, immediates as little-endian `u64`).
//! What differs between targets is the register assignment, the pointer
//! width of `Push`/`Pop` and the calling convention, all of which come from
//! the target descriptor.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FReg(pub u8);

pub const GPR_COUNT: usize = 16;
pub const FPR_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed.
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned.
    Below,
    AboveEq,
    Overflow,
    NoOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp64 {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// 32-bit operations. Results are zero-extended into the destination and
/// `Add`, `Sub` and `Mul` report signed overflow in the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp32 {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Sar,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp32 {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    MovImm64 { dst: Reg, imm: u64 },
    Mov { dst: Reg, src: Reg },
    Load64 { dst: Reg, base: Reg, disp: i32 },
    /// Zero-extending.
    Load32 { dst: Reg, base: Reg, disp: i32 },
    Load8 { dst: Reg, base: Reg, disp: i32 },
    Store64 { src: Reg, base: Reg, disp: i32 },
    Store32 { src: Reg, base: Reg, disp: i32 },
    Lea { dst: Reg, base: Reg, disp: i32 },
    Alu64 { op: AluOp64, dst: Reg, src: Reg },
    AddImm { dst: Reg, imm: i32 },
    ShrImm { dst: Reg, amount: u8 },
    Alu32 { op: AluOp32, dst: Reg, src: Reg },
    Unary32 { op: UnaryOp32, dst: Reg },
    Cmp { a: Reg, b: Reg },
    /// Compares the low halves as signed 32-bit integers.
    Cmp32 { a: Reg, b: Reg },
    /// The immediate is sign-extended.
    CmpImm { a: Reg, imm: i32 },
    /// `rel` counts from the end of the instruction.
    Jcc { cond: Cond, rel: i32 },
    Jmp { rel: i32 },
    Push { src: Reg },
    Pop { dst: Reg },
    CallReg { target: Reg },
    Ret,
    CvtU32ToF64 { dst: FReg, src: Reg },
    MovFromF64 { dst: Reg, src: FReg },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("instruction truncated")]
    Truncated,
}

mod op {
    pub const MOV_IMM64: u8 = 0x01;
    pub const MOV: u8 = 0x02;
    pub const LOAD64: u8 = 0x10;
    pub const LOAD32: u8 = 0x11;
    pub const LOAD8: u8 = 0x12;
    pub const STORE64: u8 = 0x14;
    pub const STORE32: u8 = 0x15;
    pub const LEA: u8 = 0x18;
    pub const ALU64: u8 = 0x20;
    pub const ADD_IMM: u8 = 0x21;
    pub const SHR_IMM: u8 = 0x22;
    pub const ALU32: u8 = 0x28;
    pub const UNARY32: u8 = 0x29;
    pub const CMP: u8 = 0x30;
    pub const CMP32: u8 = 0x31;
    pub const CMP_IMM: u8 = 0x32;
    pub const JCC: u8 = 0x38;
    pub const JMP: u8 = 0x39;
    pub const PUSH: u8 = 0x40;
    pub const POP: u8 = 0x41;
    pub const CALL_REG: u8 = 0x48;
    pub const RET: u8 = 0x49;
    pub const CVT_U32_F64: u8 = 0x50;
    pub const MOV_FROM_F64: u8 = 0x51;
}

impl Cond {
    const ALL: [Cond; 10] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Le,
        Cond::Gt,
        Cond::Ge,
        Cond::Below,
        Cond::AboveEq,
        Cond::Overflow,
        Cond::NoOverflow,
    ];

    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Below => Cond::AboveEq,
            Cond::AboveEq => Cond::Below,
            Cond::Overflow => Cond::NoOverflow,
            Cond::NoOverflow => Cond::Overflow,
        }
    }

    fn code(self) -> u8 {
        Cond::ALL.iter().position(|c| *c == self).unwrap_or(0) as u8
    }

    fn from_code(c: u8) -> Option<Cond> {
        Cond::ALL.get(c as usize).copied()
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Ge => "ge",
            Cond::Below => "b",
            Cond::AboveEq => "ae",
            Cond::Overflow => "o",
            Cond::NoOverflow => "no",
        }
    }
}

const ALU64_OPS: [AluOp64; 5] = [AluOp64::Add, AluOp64::Sub, AluOp64::And, AluOp64::Or, AluOp64::Xor];
const ALU32_OPS: [AluOp32; 9] = [
    AluOp32::Add,
    AluOp32::Sub,
    AluOp32::Mul,
    AluOp32::And,
    AluOp32::Or,
    AluOp32::Xor,
    AluOp32::Shl,
    AluOp32::Sar,
    AluOp32::Shr,
];
const UNARY32_OPS: [UnaryOp32; 2] = [UnaryOp32::Neg, UnaryOp32::Not];

fn index_of<T: PartialEq>(table: &[T], v: &T) -> u8 {
    table.iter().position(|x| x == v).unwrap_or(0) as u8
}

/// Bounds-checked little-endian reader over one instruction.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn reg(&mut self) -> Result<Reg, DecodeError> {
        self.u8().map(Reg)
    }

    fn freg(&mut self) -> Result<FReg, DecodeError> {
        self.u8().map(FReg)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let end = self.pos + 4;
        let b = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let end = self.pos + 8;
        let b = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn table<T: Copy>(&mut self, table: &[T]) -> Result<T, DecodeError> {
        let at = self.pos;
        let i = self.u8()?;
        table
            .get(i as usize)
            .copied()
            .ok_or(DecodeError::UnknownOpcode(self.bytes.get(at).copied().unwrap_or(0)))
    }
}

impl Insn {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mem = |out: &mut Vec<u8>, code: u8, a: Reg, base: Reg, disp: i32| {
            out.push(code);
            out.push(a.0);
            out.push(base.0);
            out.extend_from_slice(&disp.to_le_bytes());
        };
        match *self {
            Insn::MovImm64 { dst, imm } => {
                out.push(op::MOV_IMM64);
                out.push(dst.0);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Insn::Mov { dst, src } => out.extend_from_slice(&[op::MOV, dst.0, src.0]),
            Insn::Load64 { dst, base, disp } => mem(out, op::LOAD64, dst, base, disp),
            Insn::Load32 { dst, base, disp } => mem(out, op::LOAD32, dst, base, disp),
            Insn::Load8 { dst, base, disp } => mem(out, op::LOAD8, dst, base, disp),
            Insn::Store64 { src, base, disp } => mem(out, op::STORE64, src, base, disp),
            Insn::Store32 { src, base, disp } => mem(out, op::STORE32, src, base, disp),
            Insn::Lea { dst, base, disp } => mem(out, op::LEA, dst, base, disp),
            Insn::Alu64 { op: o, dst, src } => out.extend_from_slice(&[op::ALU64, index_of(&ALU64_OPS, &o), dst.0, src.0]),
            Insn::AddImm { dst, imm } => {
                out.push(op::ADD_IMM);
                out.push(dst.0);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Insn::ShrImm { dst, amount } => out.extend_from_slice(&[op::SHR_IMM, dst.0, amount]),
            Insn::Alu32 { op: o, dst, src } => out.extend_from_slice(&[op::ALU32, index_of(&ALU32_OPS, &o), dst.0, src.0]),
            Insn::Unary32 { op: o, dst } => out.extend_from_slice(&[op::UNARY32, index_of(&UNARY32_OPS, &o), dst.0]),
            Insn::Cmp { a, b } => out.extend_from_slice(&[op::CMP, a.0, b.0]),
            Insn::Cmp32 { a, b } => out.extend_from_slice(&[op::CMP32, a.0, b.0]),
            Insn::CmpImm { a, imm } => {
                out.push(op::CMP_IMM);
                out.push(a.0);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Insn::Jcc { cond, rel } => {
                out.push(op::JCC);
                out.push(cond.code());
                out.extend_from_slice(&rel.to_le_bytes());
            }
            Insn::Jmp { rel } => {
                out.push(op::JMP);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            Insn::Push { src } => out.extend_from_slice(&[op::PUSH, src.0]),
            Insn::Pop { dst } => out.extend_from_slice(&[op::POP, dst.0]),
            Insn::CallReg { target } => out.extend_from_slice(&[op::CALL_REG, target.0]),
            Insn::Ret => out.push(op::RET),
            Insn::CvtU32ToF64 { dst, src } => out.extend_from_slice(&[op::CVT_U32_F64, dst.0, src.0]),
            Insn::MovFromF64 { dst, src } => out.extend_from_slice(&[op::MOV_FROM_F64, dst.0, src.0]),
        }
    }

    /// Decodes the instruction at the start of `bytes`, returning it with
    /// its length.
    pub fn decode(bytes: &[u8]) -> Result<(Insn, usize), DecodeError> {
        let mut r = Reader { bytes, pos: 0 };
        let code = r.u8()?;
        let insn = match code {
            op::MOV_IMM64 => Insn::MovImm64 {
                dst: r.reg()?,
                imm: r.u64()?,
            },
            op::MOV => Insn::Mov {
                dst: r.reg()?,
                src: r.reg()?,
            },
            op::LOAD64 => Insn::Load64 {
                dst: r.reg()?,
                base: r.reg()?,
                disp: r.i32()?,
            },
            op::LOAD32 => Insn::Load32 {
                dst: r.reg()?,
                base: r.reg()?,
                disp: r.i32()?,
            },
            op::LOAD8 => Insn::Load8 {
                dst: r.reg()?,
                base: r.reg()?,
                disp: r.i32()?,
            },
            op::STORE64 => Insn::Store64 {
                src: r.reg()?,
                base: r.reg()?,
                disp: r.i32()?,
            },
            op::STORE32 => Insn::Store32 {
                src: r.reg()?,
                base: r.reg()?,
                disp: r.i32()?,
            },
            op::LEA => Insn::Lea {
                dst: r.reg()?,
                base: r.reg()?,
                disp: r.i32()?,
            },
            op::ALU64 => Insn::Alu64 {
                op: r.table(&ALU64_OPS)?,
                dst: r.reg()?,
                src: r.reg()?,
            },
            op::ADD_IMM => Insn::AddImm {
                dst: r.reg()?,
                imm: r.i32()?,
            },
            op::SHR_IMM => Insn::ShrImm {
                dst: r.reg()?,
                amount: r.u8()?,
            },
            op::ALU32 => Insn::Alu32 {
                op: r.table(&ALU32_OPS)?,
                dst: r.reg()?,
                src: r.reg()?,
            },
            op::UNARY32 => Insn::Unary32 {
                op: r.table(&UNARY32_OPS)?,
                dst: r.reg()?,
            },
            op::CMP => Insn::Cmp {
                a: r.reg()?,
                b: r.reg()?,
            },
            op::CMP32 => Insn::Cmp32 {
                a: r.reg()?,
                b: r.reg()?,
            },
            op::CMP_IMM => Insn::CmpImm {
                a: r.reg()?,
                imm: r.i32()?,
            },
            op::JCC => {
                let c = r.u8()?;
                Insn::Jcc {
                    cond: Cond::from_code(c).ok_or(DecodeError::UnknownOpcode(code))?,
                    rel: r.i32()?,
                }
            }
            op::JMP => Insn::Jmp { rel: r.i32()? },
            op::PUSH => Insn::Push { src: r.reg()? },
            op::POP => Insn::Pop { dst: r.reg()? },
            op::CALL_REG => Insn::CallReg { target: r.reg()? },
            op::RET => Insn::Ret,
            op::CVT_U32_F64 => Insn::CvtU32ToF64 {
                dst: r.freg()?,
                src: r.reg()?,
            },
            op::MOV_FROM_F64 => Insn::MovFromF64 {
                dst: r.reg()?,
                src: r.freg()?,
            },
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        if insn.registers_valid() {
            Ok((insn, r.pos))
        } else {
            Err(DecodeError::UnknownOpcode(code))
        }
    }

    fn registers_valid(&self) -> bool {
        let g = |r: Reg| (r.0 as usize) < GPR_COUNT;
        let f = |r: FReg| (r.0 as usize) < FPR_COUNT;
        match *self {
            Insn::MovImm64 { dst, .. }
            | Insn::AddImm { dst, .. }
            | Insn::ShrImm { dst, .. }
            | Insn::Unary32 { dst, .. }
            | Insn::Pop { dst } => g(dst),
            Insn::Push { src } => g(src),
            Insn::CallReg { target } => g(target),
            Insn::CmpImm { a, .. } => g(a),
            Insn::Mov { dst, src } | Insn::Alu64 { dst, src, .. } | Insn::Alu32 { dst, src, .. } => g(dst) && g(src),
            Insn::Cmp { a, b } | Insn::Cmp32 { a, b } => g(a) && g(b),
            Insn::Load64 { dst, base, .. }
            | Insn::Load32 { dst, base, .. }
            | Insn::Load8 { dst, base, .. }
            | Insn::Lea { dst, base, .. } => g(dst) && g(base),
            Insn::Store64 { src, base, .. } | Insn::Store32 { src, base, .. } => g(src) && g(base),
            Insn::CvtU32ToF64 { dst, src } => f(dst) && g(src),
            Insn::MovFromF64 { dst, src } => g(dst) && f(src),
            Insn::Jcc { .. } | Insn::Jmp { .. } | Insn::Ret => true,
        }
    }

    pub fn len(&self) -> usize {
        let mut v = Vec::with_capacity(16);
        self.encode(&mut v);
        v.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for FReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

fn fmt_mem(base: Reg, disp: i32) -> String {
    if disp < 0 {
        format!("[{} - {:#x}]", base, -(disp as i64))
    } else {
        format!("[{} + {:#x}]", base, disp)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Insn::MovImm64 { dst, imm } => write!(f, "mov {}, {:#x}", dst, imm),
            Insn::Mov { dst, src } => write!(f, "mov {}, {}", dst, src),
            Insn::Load64 { dst, base, disp } => write!(f, "load64 {}, {}", dst, fmt_mem(base, disp)),
            Insn::Load32 { dst, base, disp } => write!(f, "load32 {}, {}", dst, fmt_mem(base, disp)),
            Insn::Load8 { dst, base, disp } => write!(f, "load8 {}, {}", dst, fmt_mem(base, disp)),
            Insn::Store64 { src, base, disp } => write!(f, "store64 {}, {}", fmt_mem(base, disp), src),
            Insn::Store32 { src, base, disp } => write!(f, "store32 {}, {}", fmt_mem(base, disp), src),
            Insn::Lea { dst, base, disp } => write!(f, "lea {}, {}", dst, fmt_mem(base, disp)),
            Insn::Alu64 { op, dst, src } => write!(f, "{} {}, {}", format!("{:?}", op).to_lowercase(), dst, src),
            Insn::AddImm { dst, imm } => write!(f, "add {}, {}", dst, imm),
            Insn::ShrImm { dst, amount } => write!(f, "shr {}, {}", dst, amount),
            Insn::Alu32 { op, dst, src } => write!(f, "{}32 {}, {}", format!("{:?}", op).to_lowercase(), dst, src),
            Insn::Unary32 { op, dst } => write!(f, "{}32 {}", format!("{:?}", op).to_lowercase(), dst),
            Insn::Cmp { a, b } => write!(f, "cmp {}, {}", a, b),
            Insn::Cmp32 { a, b } => write!(f, "cmp32 {}, {}", a, b),
            Insn::CmpImm { a, imm } => write!(f, "cmp {}, {}", a, imm),
            Insn::Jcc { cond, rel } => write!(f, "j{} {:+}", cond.mnemonic(), rel),
            Insn::Jmp { rel } => write!(f, "jmp {:+}", rel),
            Insn::Push { src } => write!(f, "push {}", src),
            Insn::Pop { dst } => write!(f, "pop {}", dst),
            Insn::CallReg { target } => write!(f, "call {}", target),
            Insn::Ret => write!(f, "ret"),
            Insn::CvtU32ToF64 { dst, src } => write!(f, "cvtu32 {}, {}", dst, src),
            Insn::MovFromF64 { dst, src } => write!(f, "movq {}, {}", dst, src),
        }
    }
}

/// Points the relative jump that starts at `at` to `target`.
pub fn patch_jump(code: &mut [u8], at: usize, target: usize) -> Result<(), DecodeError> {
    let (insn, len) = Insn::decode(code.get(at..).ok_or(DecodeError::Truncated)?)?;
    if !matches!(insn, Insn::Jcc { .. } | Insn::Jmp { .. }) {
        return Err(DecodeError::UnknownOpcode(code[at]));
    }
    let end = at + len;
    let rel = (target as i64 - end as i64) as i32;
    code[end - 4..end].copy_from_slice(&rel.to_le_bytes());
    Ok(())
}

/// Rewrites the immediate of the `MovImm64` that starts at `at`.
pub fn patch_imm64(code: &mut [u8], at: usize, imm: u64) -> Result<(), DecodeError> {
    match Insn::decode(code.get(at..).ok_or(DecodeError::Truncated)?)? {
        (Insn::MovImm64 { .. }, len) => {
            code[at + 2..at + len].copy_from_slice(&imm.to_le_bytes());
            Ok(())
        }
        _ => Err(DecodeError::UnknownOpcode(code[at])),
    }
}
