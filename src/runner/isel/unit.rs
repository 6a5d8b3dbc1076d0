//! The output of instruction selection for one script.

use std::fmt::{self, Write as _};
use std::rc::Rc;
use std::sync::Arc;

use uuid::Uuid;

use crate::runner::config::TargetKind;
use crate::runner::ds::error::ExceptionSignal;
use crate::runner::ds::lookup::{Lookup, LookupKind};
use crate::runner::ds::property::PropertyAttributes;
use crate::runner::ds::value::Value;
use crate::runner::engine::{ExecutionEngine, LinkedUnit};
use crate::runner::executable_allocator::{Allocation, ExecutableAllocator};
use crate::runner::function::{CodeRef, Function, FunctionFlags};
use crate::runner::jit;
use crate::runner::moth::instr::BytecodeFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupEntry {
    pub kind: LookupKind,
    /// Index into the unit's string table.
    pub name: u32,
}

/// One member of an object literal's shape, in first-definition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JsClassMember {
    /// Index into the unit's string table.
    pub name: u32,
    /// Whether the last definition of the name in the literal is a getter
    /// or setter.
    pub is_accessor: bool,
}

/// Static description of one function. Names are string table indices.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub name: Option<u32>,
    pub formals: Vec<u32>,
    pub locals: Vec<u32>,
    pub flags: FunctionFlags,
    pub nested: Vec<usize>,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Default)]
pub struct UnitData {
    pub file_name: String,
    pub strings: Vec<Rc<str>>,
    pub lookups: Vec<LookupEntry>,
    pub regexps: Vec<(Rc<str>, Rc<str>)>,
    pub js_classes: Vec<Vec<JsClassMember>>,
    pub functions: Vec<CompiledFunction>,
}

/// Machine code of every function of a unit. The allocations go back to
/// the allocator when the unit is dropped.
pub struct NativeCode {
    pub target: TargetKind,
    /// One block of executable memory per function.
    pub code_refs: Vec<Allocation>,
    /// Bytes actually used in each block: code followed by its constants.
    pub code_sizes: Vec<u32>,
    /// Where each function's constant pool starts inside its block.
    pub pool_offsets: Vec<u32>,
    /// Per-function constant pools, as written after the code.
    pub constant_values: Vec<Vec<Value>>,
    pub allocator: Arc<ExecutableAllocator>,
}

impl Drop for NativeCode {
    fn drop(&mut self) {
        for a in self.code_refs.drain(..) {
            self.allocator.free(a);
        }
    }
}

pub enum BackendCode {
    Moth(Vec<Rc<BytecodeFunction>>),
    Jit(NativeCode),
}

pub struct CompilationUnit {
    pub id: Uuid,
    pub data: UnitData,
    pub backend: BackendCode,
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match &self.backend {
            BackendCode::Moth(_) => "moth".to_string(),
            BackendCode::Jit(native) => native.target.to_string(),
        };
        f.debug_struct("CompilationUnit")
            .field("id", &self.id)
            .field("file_name", &self.data.file_name)
            .field("functions", &self.data.functions.len())
            .field("backend", &backend)
            .finish()
    }
}

impl CompilationUnit {
    pub fn new(data: UnitData, backend: BackendCode) -> Self {
        CompilationUnit {
            id: Uuid::new_v4(),
            data,
            backend,
        }
    }

    pub fn function_count(&self) -> usize {
        self.data.functions.len()
    }

    fn code_ref(&self, index: usize) -> Option<CodeRef> {
        match &self.backend {
            BackendCode::Moth(functions) => functions.get(index).cloned().map(CodeRef::Bytecode),
            BackendCode::Jit(native) => {
                let a = native.code_refs.get(index)?;
                Some(CodeRef::Native {
                    target: native.target,
                    address: a.start,
                    size: native.code_sizes.get(index).copied().unwrap_or(0),
                })
            }
        }
    }

    /// Makes the unit runnable in `engine`: interns its names, allocates its
    /// string constants, builds its literal classes, creates its lookups and
    /// runtime functions. Returns
    /// the index of the linked unit.
    pub fn link_to_engine(self: &Rc<Self>, engine: &mut ExecutionEngine) -> Result<usize, ExceptionSignal> {
        let unit_index = engine.units.len();
        let mut runtime_strings = Vec::with_capacity(self.data.strings.len());
        let mut runtime_identifiers = Vec::with_capacity(self.data.strings.len());
        for s in &self.data.strings {
            runtime_strings.push(engine.new_string_rc(s.clone())?);
            runtime_identifiers.push(engine.identifiers.intern(s));
        }
        let lookups = self
            .data
            .lookups
            .iter()
            .map(|l| Lookup::new(l.kind, runtime_identifiers[l.name as usize]))
            .collect();
        let mut runtime_classes = Vec::with_capacity(self.data.js_classes.len());
        for members in &self.data.js_classes {
            let mut class = engine.object_classes.object;
            for m in members {
                let attrs = if m.is_accessor {
                    PropertyAttributes::accessor()
                } else {
                    PropertyAttributes::data()
                };
                class = engine.classes.add_member(class, runtime_identifiers[m.name as usize], attrs).0;
            }
            runtime_classes.push(class);
        }
        let mut runtime_functions = Vec::with_capacity(self.data.functions.len());
        for (index, cf) in self.data.functions.iter().enumerate() {
            let code = match self.code_ref(index) {
                Some(code) => code,
                None => return Err(engine.throw_syntax_error("compilation unit has no code for a function")),
            };
            let name = match cf.name {
                Some(n) => runtime_identifiers[n as usize],
                None => engine.ids.empty,
            };
            let formals = cf.formals.iter().map(|&n| runtime_identifiers[n as usize]).collect();
            let locals = cf.locals.iter().map(|&n| runtime_identifiers[n as usize]).collect();
            let mut f = Function::new(
                &mut engine.classes,
                &mut engine.identifiers,
                name,
                formals,
                locals,
                cf.flags,
                unit_index,
                index,
                code,
            );
            f.line = cf.line;
            f.column = cf.column;
            runtime_functions.push(Rc::new(f));
        }
        engine.units.push(LinkedUnit {
            unit: self.clone(),
            runtime_strings,
            runtime_identifiers,
            runtime_functions,
            runtime_classes,
            lookups,
        });
        tracing::debug!(
            target: "jsv4::isel",
            unit = %self.id,
            index = unit_index,
            functions = self.data.functions.len(),
            "linked"
        );
        Ok(unit_index)
    }

    /// Listing of the generated code.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let name_of = |i: usize| -> String {
            self.data.functions[i]
                .name
                .map(|n| self.data.strings[n as usize].to_string())
                .unwrap_or_else(|| "%anonymous".to_string())
        };
        match &self.backend {
            BackendCode::Moth(functions) => {
                for (i, f) in functions.iter().enumerate() {
                    out.push_str(&f.disassemble(&name_of(i)));
                }
            }
            BackendCode::Jit(native) => {
                for (i, a) in native.code_refs.iter().enumerate() {
                    let _ = writeln!(out, "== {} @ {:#x} ({}) ==", name_of(i), a.start, native.target);
                    let len = native.pool_offsets.get(i).copied().unwrap_or(0) as usize;
                    match native.allocator.read(a.start, len) {
                        Ok(bytes) => out.push_str(&jit::disassemble(&bytes, a.start)),
                        Err(e) => {
                            let _ = writeln!(out, "<{}>", e);
                        }
                    }
                    for (k, v) in native.constant_values[i].iter().enumerate() {
                        let _ = writeln!(out, "  const[{}] = {:?}", k, v);
                    }
                }
            }
        }
        out
    }
}
