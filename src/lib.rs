//! # jsv4 - a JavaScript execution core
//!
//! A small ECMAScript 5 engine organised around a register-free IR and two
//! interchangeable backends:
//! - PEG parser producing an ESTree-like AST
//! - AST to IR code generator
//! - Bytecode instruction selection with an interpreter
//! - Machine-code instruction selection for x86, x86-64 (System V and
//!   Win64) and ARM32 calling conventions, run on a built-in simulator
//! - NaN-boxed values, hidden classes with memoized transitions and
//!   sparse arrays backed by an order-statistic red-black tree
//!
//! ## Quick Start
//!
//! ```
//! use jsv4::runner::{EngineConfig, ExecutionEngine, Script};
//!
//! let mut engine = ExecutionEngine::new(EngineConfig::default());
//! let mut script = Script::new("example.js", "var x = 5 + 3; x * 2");
//! let value = script.execute(&mut engine).unwrap();
//! assert_eq!(value.as_number(), Some(16.0));
//! ```
//!
//! ### Choosing a backend
//!
//! ```
//! use jsv4::runner::{Backend, EngineConfig, ExecutionEngine, Script, TargetKind};
//!
//! let config = EngineConfig::default().with_backend(Backend::Jit(TargetKind::Arm));
//! let mut engine = ExecutionEngine::new(config);
//! let mut script = Script::new("loop.js", "var s = 0; for (var i = 0; i < 10; i++) s += i; s");
//! assert_eq!(script.execute(&mut engine).unwrap().as_number(), Some(45.0));
//! ```
//!
//! ## Architecture
//!
//! - **[`parser`]** - PEG parser and AST types
//! - **[`runner`]** - Compilation and execution
//!   - **[`runner::ds`]** - Values, managed cells, internal classes, properties
//!   - **[`runner::ir`]** - IR and the code generator
//!   - **[`runner::isel`]** - Shared statement decoding and compilation units
//!   - **[`runner::moth`]** - Bytecode backend
//!   - **[`runner::jit`]** - Machine-code backend
//!   - **[`runner::script`]** - Host entry point

pub mod parser;
pub mod runner;
