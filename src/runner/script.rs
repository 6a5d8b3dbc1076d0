//! Host entry point: compile a piece of source and run it in an engine.

use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

use crate::parser::ast::{JsError, ProgramData};
use crate::parser::parse_program;
use crate::runner::config::Backend;
use crate::runner::context::ContextId;
use crate::runner::ds::error::{ErrorType, ExceptionSignal, ReturnedValue};
use crate::runner::ds::value::Value;
use crate::runner::engine::ExecutionEngine;
use crate::runner::executable_allocator::{AllocatorError, ExecutableAllocator};
use crate::runner::function::Function;
use crate::runner::ir::codegen::{generate, CompilationMode};
use crate::runner::ir::Module;
use crate::runner::isel::unit::CompilationUnit;
use crate::runner::isel::{self, IselError};
use crate::runner::jit::machine::MachineError;
use crate::runner::runtime;

/// Failures as the embedding host sees them.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{file}:{line}:{column}: SyntaxError: {message}")]
    Syntax {
        file: String,
        line: u32,
        column: u32,
        message: String,
    },
    #[error("Uncaught {0}")]
    UncaughtException(String),
    #[error("out of executable memory: {0}")]
    ExecutableMemory(#[from] AllocatorError),
    #[error("machine fault: {0}")]
    MachineFault(#[from] MachineError),
    #[error("compilation failed: {0}")]
    Compile(String),
}

impl From<IselError> for EngineError {
    fn from(e: IselError) -> Self {
        match e {
            IselError::ExecutableMemory(e) => EngineError::ExecutableMemory(e),
            other => EngineError::Compile(other.to_string()),
        }
    }
}

pub struct Script {
    pub source_file: String,
    /// Position of the first character of `source` in `source_file`.
    pub line: u32,
    pub column: u32,
    pub source: String,
    pub strict_mode: bool,
    /// Run inside the context that was current when the script was created
    /// instead of the global one. Declarations stay deletable and inline
    /// property caches are off.
    pub inherit_context: bool,
    scope: Option<ContextId>,
    parsed: bool,
    unit: Option<Rc<CompilationUnit>>,
    vm_function: Option<Rc<Function>>,
}

impl Script {
    pub fn new(source_file: impl Into<String>, source: impl Into<String>) -> Self {
        Script {
            source_file: source_file.into(),
            line: 1,
            column: 1,
            source: source.into(),
            strict_mode: false,
            inherit_context: false,
            scope: None,
            parsed: false,
            unit: None,
            vm_function: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = line.max(1);
        self.column = column.max(1);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    /// Binds the script to the engine's current context.
    pub fn inheriting(mut self, engine: &ExecutionEngine) -> Self {
        self.inherit_context = true;
        self.scope = Some(engine.current_context);
        self
    }

    /// A script for an already compiled unit. The unit is linked right away
    /// and the script counts as parsed.
    pub fn from_unit(
        engine: &mut ExecutionEngine,
        source_file: impl Into<String>,
        unit: Rc<CompilationUnit>,
    ) -> Result<Script, EngineError> {
        let mut script = Script::new(source_file, String::new());
        script.parsed = true;
        script.link(engine, unit)?;
        Ok(script)
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    pub fn compilation_unit(&self) -> Option<&Rc<CompilationUnit>> {
        self.unit.as_ref()
    }

    fn mode(&self) -> CompilationMode {
        if self.inherit_context {
            CompilationMode::EvalCode
        } else {
            CompilationMode::GlobalCode
        }
    }

    fn syntax_error(&self, e: JsError) -> EngineError {
        let line = self.line + e.line - 1;
        let column = if e.line == 1 { self.column + e.column - 1 } else { e.column };
        EngineError::Syntax {
            file: self.source_file.clone(),
            line,
            column,
            message: e.message,
        }
    }

    fn program(&self) -> Result<ProgramData, EngineError> {
        parse_program(&self.source, self.strict_mode).map_err(|e| self.syntax_error(e))
    }

    /// The IR the script compiles to, for listings.
    pub fn module(&self) -> Result<Module, EngineError> {
        let program = self.program()?;
        Ok(generate(&program, &self.source_file, self.mode()))
    }

    /// Compiles the source and links it into `engine`. Only the first call
    /// has an effect. Failures are also thrown into the engine, a syntax
    /// error as a SyntaxError and anything else as an Error.
    pub fn parse(&mut self, engine: &mut ExecutionEngine) -> Result<(), EngineError> {
        if self.parsed {
            return Ok(());
        }
        self.parsed = true;
        let span = tracing::debug_span!(target: "jsv4::script", "parse", file = %self.source_file);
        let _guard = span.enter();

        let module = match self.module() {
            Ok(m) => m,
            Err(e) => {
                if let EngineError::Syntax { message, line, column, .. } = &e {
                    tracing::debug!(target: "jsv4::script", line, column, %message, "syntax error");
                    engine.throw_syntax_error(message);
                }
                return Err(e);
            }
        };
        let use_fast_lookups = engine.config.use_fast_lookups && !self.inherit_context;
        let isel = isel::create(engine.config.backend, engine.executable_allocator.clone(), use_fast_lookups);
        let unit = match isel.compile(&module) {
            Ok(u) => Rc::new(u),
            Err(e) => {
                let e = EngineError::from(e);
                tracing::warn!(target: "jsv4::script", error = %e, "compilation failed");
                engine.throw_error(ErrorType::Error, &e.to_string());
                return Err(e);
            }
        };
        self.link(engine, unit)
    }

    fn link(&mut self, engine: &mut ExecutionEngine, unit: Rc<CompilationUnit>) -> Result<(), EngineError> {
        let index = match unit.link_to_engine(engine) {
            Ok(i) => i,
            Err(ExceptionSignal) => {
                let v = engine.exception_value;
                return Err(EngineError::UncaughtException(runtime::describe_exception(engine, v)));
            }
        };
        self.vm_function = engine.units[index].runtime_functions.first().cloned();
        tracing::debug!(target: "jsv4::script", unit = %unit.id, index, "script linked");
        self.unit = Some(unit);
        Ok(())
    }

    /// Runs the script's top level code. A thrown exception stays pending
    /// in the engine. A script that failed to compile yields undefined.
    pub fn run(&mut self, engine: &mut ExecutionEngine) -> ReturnedValue {
        if self.parse(engine).is_err() {
            return Err(ExceptionSignal);
        }
        let function = match &self.vm_function {
            Some(f) => f.clone(),
            None => return Ok(Value::undefined()),
        };
        let unit_id = self.unit.as_ref().map(|u| u.id.to_string()).unwrap_or_default();
        let span = tracing::debug_span!(target: "jsv4::script", "run", file = %self.source_file, unit = %unit_id);
        let _guard = span.enter();

        let scope = self.scope.unwrap_or(engine.root_context);
        let saved = engine.current_context;
        let saved_strict = engine.contexts.get(scope).strict;
        engine.current_context = scope;
        engine.contexts.get_mut(scope).strict = function.is_strict();
        engine.fault = None;
        let result = engine.run_code(&function, scope);
        engine.contexts.get_mut(scope).strict = saved_strict;
        engine.current_context = saved;
        result
    }

    /// The compiled top level function, compiling on first use.
    pub fn function(&mut self, engine: &mut ExecutionEngine) -> Result<Option<Rc<Function>>, EngineError> {
        self.parse(engine)?;
        Ok(self.vm_function.clone())
    }

    /// Runs the script and turns a pending exception into an error, taking
    /// it out of the engine.
    pub fn execute(&mut self, engine: &mut ExecutionEngine) -> Result<Value, EngineError> {
        if self.parsed && self.vm_function.is_none() {
            return Ok(Value::undefined());
        }
        if let Err(e) = self.parse(engine) {
            engine.catch_exception();
            return Err(e);
        }
        match self.run(engine) {
            Ok(v) => Ok(v),
            Err(ExceptionSignal) => {
                let v = engine.catch_exception();
                match engine.fault.take() {
                    Some(fault) => Err(EngineError::MachineFault(fault)),
                    None => Err(EngineError::UncaughtException(runtime::describe_exception(engine, v))),
                }
            }
        }
    }

    /// Compiles `source` for `backend` without an engine. Errors are
    /// reported instead of thrown.
    pub fn precompile(
        backend: Backend,
        allocator: Arc<ExecutableAllocator>,
        source_file: &str,
        source: &str,
    ) -> Result<CompilationUnit, Vec<EngineError>> {
        let script = Script::new(source_file, source);
        let module = script.module().map_err(|e| vec![e])?;
        let isel = isel::create(backend, allocator, false);
        isel.compile(&module).map_err(|e| vec![EngineError::from(e)])
    }

    /// Parses and runs `source` in the current context. Exceptions are
    /// swallowed and give undefined.
    pub fn evaluate(engine: &mut ExecutionEngine, source: &str) -> Value {
        let mut script = Script::new(String::new(), source).inheriting(engine);
        let result = match script.parse(engine) {
            Ok(()) if !engine.has_exception => script.run(engine),
            _ => Err(ExceptionSignal),
        };
        match result {
            Ok(v) if !engine.has_exception => v,
            _ => {
                engine.catch_exception();
                Value::undefined()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::config::{EngineConfig, TargetKind};
    use crate::runner::executable_allocator::HeapPageAllocator;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(EngineConfig::default())
    }

    #[test]
    fn test_run_returns_completion_value() {
        let mut e = engine();
        let mut s = Script::new("t.js", "var x = 20; x + 22;");
        let v = s.run(&mut e).unwrap();
        assert_eq!(v.as_number(), Some(42.0));
    }

    #[test]
    fn test_parse_is_idempotent() {
        let mut e = engine();
        let mut s = Script::new("t.js", "1");
        s.parse(&mut e).unwrap();
        let units = e.units.len();
        s.parse(&mut e).unwrap();
        assert_eq!(e.units.len(), units);
        assert!(s.is_parsed());
    }

    #[test]
    fn test_syntax_error_offsets_by_script_position() {
        let mut e = engine();
        let mut s = Script::new("page.html", "var = ;").at(10, 5);
        match s.parse(&mut e) {
            Err(EngineError::Syntax { file, line, column, .. }) => {
                assert_eq!(file, "page.html");
                assert_eq!(line, 10);
                assert!(column >= 5);
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
        assert!(e.has_exception);
        let ex = e.catch_exception();
        assert_eq!(e.error_type_of(ex), Some(ErrorType::SyntaxError));
        // A failed parse is not retried.
        assert!(s.function(&mut e).unwrap().is_none());
        assert!(s.run(&mut e).unwrap().is_undefined());
    }

    #[test]
    fn test_function_parses_lazily() {
        let mut e = engine();
        let mut s = Script::new("t.js", "1");
        assert!(!s.is_parsed());
        let f = s.function(&mut e).unwrap();
        assert!(f.is_some());
        assert!(s.is_parsed());
    }

    #[test]
    fn test_execute_reports_uncaught_exception() {
        let mut e = engine();
        let mut s = Script::new("t.js", "throw new TypeError('bad');");
        match s.execute(&mut e) {
            Err(EngineError::UncaughtException(msg)) => assert!(msg.contains("TypeError")),
            other => panic!("expected exception, got {:?}", other),
        }
        assert!(!e.has_exception);
    }

    #[test]
    fn test_evaluate_swallows_exceptions() {
        let mut e = engine();
        assert!(Script::evaluate(&mut e, "null.x").is_undefined());
        assert!(!e.has_exception);
        assert_eq!(Script::evaluate(&mut e, "6 * 7").as_number(), Some(42.0));
        assert!(Script::evaluate(&mut e, "var = ;").is_undefined());
        assert!(!e.has_exception);
    }

    #[test]
    fn test_precompile_needs_no_engine() {
        let allocator = Arc::new(ExecutableAllocator::new(HeapPageAllocator::default(), 4096));
        let unit = Script::precompile(Backend::Jit(TargetKind::X86_64SysV), allocator.clone(), "a.js", "var a = 1; a")
            .unwrap();
        assert_eq!(unit.function_count(), 1);
        assert!(format!("{:?}", unit).contains("a.js"));
        let errors = Script::precompile(Backend::Interpreter, allocator, "b.js", "if (").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], EngineError::Syntax { .. }));
    }

    #[test]
    fn test_precompiled_unit_runs() {
        let mut e = engine();
        let unit = Script::precompile(Backend::Interpreter, e.executable_allocator.clone(), "a.js", "3 + 4").unwrap();
        let mut s = Script::from_unit(&mut e, "a.js", Rc::new(unit)).unwrap();
        assert_eq!(s.run(&mut e).unwrap().as_number(), Some(7.0));
    }

    #[test]
    fn test_inherited_context_disables_lookups() {
        let mut e = engine();
        let code = "var o = {x: 1}; o.x";
        let mut plain = Script::new("a.js", code);
        plain.parse(&mut e).unwrap();
        let mut inherited = Script::new("b.js", code).inheriting(&e);
        inherited.parse(&mut e).unwrap();
        assert!(!plain.compilation_unit().unwrap().data.lookups.is_empty());
        assert!(inherited.compilation_unit().unwrap().data.lookups.is_empty());
    }
}
