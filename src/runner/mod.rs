//! Compilation and execution.
//!
//! A [`script::Script`] runs source through the parser, lowers it to the
//! [`ir`], hands the module to one of the two instruction selections
//! ([`moth`] bytecode or [`jit`] machine code) and links the resulting
//! [`isel::unit::CompilationUnit`] into an [`engine::ExecutionEngine`].

pub mod builtins;
pub mod config;
pub mod context;
pub mod ds;
pub mod engine;
pub mod executable_allocator;
pub mod function;
pub mod ir;
pub mod isel;
pub mod jit;
pub mod moth;
pub mod runtime;
pub mod script;

pub use self::config::{Backend, EngineConfig, HeapConfig, TargetKind};
pub use self::engine::ExecutionEngine;
pub use self::script::{EngineError, Script};
