//! Moth, the bytecode backend: [`isel`] turns IR into the register
//! instructions of [`instr`], [`vm`] interprets them.

pub mod instr;
pub mod isel;
pub mod vm;
