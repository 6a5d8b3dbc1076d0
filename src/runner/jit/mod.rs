//! The machine-code backend.
//!
//! ```text
//! IR → JitInstructionSelection → Assembler → ExecutableAllocator → machine
//! ```
//!
//! [`isel`] walks IR statements and asks the [`assembler::Assembler`] for
//! instructions from the shared [`masm`] set. Register use and calling
//! convention come from a [`target::TargetDescriptor`], frame offsets from
//! [`stack_layout::StackLayout`]. Finished functions are placed in
//! executable memory and run by [`machine`], which traps calls into
//! [`runtime_calls`].

pub mod assembler;
pub mod isel;
pub mod machine;
pub mod masm;
pub mod runtime_calls;
pub mod stack_layout;
pub mod target;

use std::fmt::Write as _;

use self::masm::Insn;
use self::runtime_calls::RuntimeCall;

/// Listing of `bytes`, assumed to start at address `base`. Calls through a
/// register loaded with a runtime function address are annotated with its
/// name; bytes that do not decode are shown raw.
pub fn disassemble(bytes: &[u8], base: u64) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let address = base + pos as u64;
        match Insn::decode(&bytes[pos..]) {
            Ok((insn, len)) => {
                let _ = write!(out, "{:#010x}  {}", address, insn);
                if let Insn::MovImm64 { imm, .. } = insn {
                    if let Some(call) = RuntimeCall::from_address(imm) {
                        let _ = write!(out, "    ; {}", call.name());
                    }
                }
                out.push('\n');
                pos += len;
            }
            Err(_) => {
                let _ = writeln!(out, "{:#010x}  .byte {:#04x}", address, bytes[pos]);
                pos += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::masm::Reg;
    use super::*;

    #[test]
    fn test_disassemble_annotates_runtime_calls() {
        let mut code = Vec::new();
        Insn::MovImm64 {
            dst: Reg(10),
            imm: RuntimeCall::GetProperty.address(),
        }
        .encode(&mut code);
        Insn::CallReg { target: Reg(10) }.encode(&mut code);
        code.push(0xee);
        let text = disassemble(&code, 0x1000);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0x00001000  mov r10"));
        assert!(lines[0].ends_with("; GetProperty"));
        assert_eq!(lines[1], "0x0000100a  call r10");
        assert_eq!(lines[2], "0x0000100c  .byte 0xee");
    }
}
