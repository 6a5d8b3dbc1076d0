//! Instruction selection.
//!
//! [`IrDecoder`] recognises the statement shapes the code generator
//! produces and turns each into exactly one hook call. Both backends (the
//! bytecode emitter in `moth` and the machine-code emitter in `jit`)
//! implement the hooks; neither has to look at IR trees itself.
//!
//! [`EvalInstructionSelection`] drives a backend over a whole module and
//! packages the result as a [`CompilationUnit`].

pub mod generator;
pub mod unit;

use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

use crate::runner::config::Backend;
use crate::runner::executable_allocator::{AllocatorError, ExecutableAllocator};
use crate::runner::ir::{AluOp, BlockId, Builtin, Expr, Function, Module, Stmt, Temp, Type};
use crate::runner::jit::isel::JitInstructionSelection;
use crate::runner::jit::masm::DecodeError;
use crate::runner::moth::isel::MothInstructionSelection;

use self::generator::JsUnitGenerator;
use self::unit::{BackendCode, CompilationUnit};

#[derive(Debug, Error)]
pub enum IselError {
    #[error("cannot select instructions for `{statement}` in {function}")]
    UnsupportedStatement { function: String, statement: String },
    #[error("out of executable memory: {0}")]
    ExecutableMemory(#[from] AllocatorError),
    #[error("cannot link generated code: {0}")]
    Link(#[from] DecodeError),
}

/// How an object literal defines one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    Data,
    Getter,
    Setter,
}

impl LiteralKind {
    pub fn from_code(code: u32) -> LiteralKind {
        match code {
            1 => LiteralKind::Getter,
            2 => LiteralKind::Setter,
            _ => LiteralKind::Data,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            LiteralKind::Data => 0,
            LiteralKind::Getter => 1,
            LiteralKind::Setter => 2,
        }
    }
}

/// One hook per IR shape. `result` is `None` when the value of a call is
/// discarded.
pub trait IrDecoder {
    /// A statement none of the other hooks accepts.
    fn call_builtin_invalid(&mut self, stmt: &Stmt);

    fn call_builtin_typeof_member(&mut self, base: Temp, name: &Rc<str>, result: Option<Temp>);
    fn call_builtin_typeof_subscript(&mut self, base: Temp, index: Temp, result: Option<Temp>);
    fn call_builtin_typeof_name(&mut self, name: &Rc<str>, result: Option<Temp>);
    fn call_builtin_typeof_value(&mut self, value: Temp, result: Option<Temp>);
    fn call_builtin_delete_member(&mut self, base: Temp, name: &Rc<str>, result: Option<Temp>);
    fn call_builtin_delete_subscript(&mut self, base: Temp, index: Temp, result: Option<Temp>);
    fn call_builtin_delete_name(&mut self, name: &Rc<str>, result: Option<Temp>);
    fn call_builtin_delete_value(&mut self, result: Option<Temp>);
    fn call_builtin_throw(&mut self, arg: Temp);
    /// Re-raises the exception that is still pending in the engine.
    fn call_builtin_rethrow(&mut self);
    fn call_builtin_unwind_exception(&mut self, result: Option<Temp>);
    fn call_builtin_push_catch_scope(&mut self, name: &Rc<str>, value: Temp);
    fn call_builtin_foreach_iterator_object(&mut self, arg: Temp, result: Option<Temp>);
    fn call_builtin_foreach_next_property_name(&mut self, arg: Temp, result: Option<Temp>);
    fn call_builtin_push_with_scope(&mut self, arg: Temp);
    fn call_builtin_pop_scope(&mut self);
    fn call_builtin_declare_vars(&mut self, deletable: bool, names: &[Rc<str>]);
    /// `None` elements are holes.
    fn call_builtin_define_array(&mut self, result: Option<Temp>, elements: &[Option<Temp>]);
    fn call_builtin_define_object_literal(&mut self, result: Option<Temp>, properties: &[(Rc<str>, LiteralKind, Temp)]);
    fn call_builtin_setup_arguments_object(&mut self, result: Option<Temp>);
    fn call_builtin_convert_this_to_object(&mut self);

    fn call_value(&mut self, value: Temp, args: &[Temp], result: Option<Temp>);
    fn call_property(&mut self, base: Temp, name: &Rc<str>, args: &[Temp], result: Option<Temp>);
    fn call_subscript(&mut self, base: Temp, index: Temp, args: &[Temp], result: Option<Temp>);
    fn call_activation_property(&mut self, name: &Rc<str>, args: &[Temp], result: Option<Temp>);
    fn construct_activation_property(&mut self, name: &Rc<str>, args: &[Temp], result: Option<Temp>);
    fn construct_property(&mut self, base: Temp, name: &Rc<str>, args: &[Temp], result: Option<Temp>);
    fn construct_value(&mut self, value: Temp, args: &[Temp], result: Option<Temp>);

    fn load_this_object(&mut self, target: Temp);
    fn load_const(&mut self, ty: Type, value: f64, target: Temp);
    fn load_string(&mut self, s: &Rc<str>, target: Temp);
    fn load_regexp(&mut self, source: &Rc<str>, flags: &Rc<str>, target: Temp);
    fn get_activation_property(&mut self, name: &Rc<str>, global: bool, target: Temp);
    fn set_activation_property(&mut self, source: Temp, name: &Rc<str>);
    fn init_closure(&mut self, function: usize, target: Temp);
    fn get_property(&mut self, base: Temp, name: &Rc<str>, target: Temp);
    fn set_property(&mut self, source: Temp, base: Temp, name: &Rc<str>);
    fn get_element(&mut self, base: Temp, index: Temp, target: Temp);
    fn set_element(&mut self, source: Temp, base: Temp, index: Temp);
    fn copy_value(&mut self, source: Temp, target: Temp);
    fn swap_values(&mut self, a: Temp, b: Temp);
    fn convert_type(&mut self, source: Temp, target: Temp, ty: Type);
    fn unop(&mut self, op: AluOp, source: Temp, target: Temp);
    fn binop(&mut self, op: AluOp, left: Temp, right: Temp, target: Temp);

    fn visit_jump(&mut self, target: BlockId);
    fn visit_cjump(&mut self, cond: Temp, iftrue: BlockId, iffalse: BlockId);
    fn visit_ret(&mut self, value: Temp);

    fn visit_statement(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Jump(b) => self.visit_jump(*b),
            Stmt::CJump { cond, iftrue, iffalse } => match cond.as_temp() {
                Some(c) => self.visit_cjump(c, *iftrue, *iffalse),
                None => self.call_builtin_invalid(stmt),
            },
            Stmt::Ret(e) => match e.as_temp() {
                Some(t) => self.visit_ret(t),
                None => self.call_builtin_invalid(stmt),
            },
            Stmt::Exp(e) => match e {
                Expr::Call { base, args } => self.visit_call(stmt, base, args, None),
                Expr::New { base, args } => self.visit_new(stmt, base, args, None),
                _ => self.call_builtin_invalid(stmt),
            },
            Stmt::Move { target, source, swap } => self.visit_move(stmt, target, source, *swap),
        }
    }

    fn visit_move(&mut self, stmt: &Stmt, target: &Expr, source: &Expr, swap: bool) {
        let t = match target.as_temp() {
            Some(t) => t,
            None => {
                // stores: the source of every store is a temp
                match (target, source.as_temp()) {
                    (Expr::Name { id, .. }, Some(s)) => self.set_activation_property(s, id),
                    (Expr::Member { base, name }, Some(s)) => match base.as_temp() {
                        Some(b) => self.set_property(s, b, name),
                        None => self.call_builtin_invalid(stmt),
                    },
                    (Expr::Subscript { base, index }, Some(s)) => match (base.as_temp(), index.as_temp()) {
                        (Some(b), Some(i)) => self.set_element(s, b, i),
                        _ => self.call_builtin_invalid(stmt),
                    },
                    _ => self.call_builtin_invalid(stmt),
                }
                return;
            }
        };
        if swap {
            match source.as_temp() {
                Some(s) => self.swap_values(t, s),
                None => self.call_builtin_invalid(stmt),
            }
            return;
        }
        match source {
            Expr::Const { ty, value } => self.load_const(*ty, *value, t),
            Expr::String(s) => self.load_string(s, t),
            Expr::RegExp { source, flags } => self.load_regexp(source, flags, t),
            Expr::Name {
                builtin: Builtin::This, ..
            } => self.load_this_object(t),
            Expr::Name {
                id,
                builtin: Builtin::Invalid,
                global,
            } => self.get_activation_property(id, *global, t),
            Expr::Temp(s) => self.copy_value(*s, t),
            Expr::Closure(index) => self.init_closure(*index, t),
            Expr::Convert { expr, ty } => match expr.as_temp() {
                Some(s) => self.convert_type(s, t, *ty),
                None => self.call_builtin_invalid(stmt),
            },
            Expr::Unop { op, expr } => match expr.as_temp() {
                Some(s) => self.unop(*op, s, t),
                None => self.call_builtin_invalid(stmt),
            },
            Expr::Binop { op, left, right } => match (left.as_temp(), right.as_temp()) {
                (Some(l), Some(r)) => self.binop(*op, l, r, t),
                _ => self.call_builtin_invalid(stmt),
            },
            Expr::Call { base, args } => self.visit_call(stmt, base, args, Some(t)),
            Expr::New { base, args } => self.visit_new(stmt, base, args, Some(t)),
            Expr::Member { base, name } => match base.as_temp() {
                Some(b) => self.get_property(b, name, t),
                None => self.call_builtin_invalid(stmt),
            },
            Expr::Subscript { base, index } => match (base.as_temp(), index.as_temp()) {
                (Some(b), Some(i)) => self.get_element(b, i, t),
                _ => self.call_builtin_invalid(stmt),
            },
            Expr::Name { .. } => self.call_builtin_invalid(stmt),
        }
    }

    fn visit_call(&mut self, stmt: &Stmt, base: &Expr, args: &[Expr], result: Option<Temp>) {
        match base {
            Expr::Name {
                builtin: Builtin::Invalid,
                id,
                ..
            } => match temps(args) {
                Some(a) => self.call_activation_property(id, &a, result),
                None => self.call_builtin_invalid(stmt),
            },
            Expr::Name { builtin, .. } => self.visit_builtin(stmt, *builtin, args, result),
            Expr::Member { base, name } => match (base.as_temp(), temps(args)) {
                (Some(b), Some(a)) => self.call_property(b, name, &a, result),
                _ => self.call_builtin_invalid(stmt),
            },
            Expr::Subscript { base, index } => match (base.as_temp(), index.as_temp(), temps(args)) {
                (Some(b), Some(i), Some(a)) => self.call_subscript(b, i, &a, result),
                _ => self.call_builtin_invalid(stmt),
            },
            Expr::Temp(f) => match temps(args) {
                Some(a) => self.call_value(*f, &a, result),
                None => self.call_builtin_invalid(stmt),
            },
            _ => self.call_builtin_invalid(stmt),
        }
    }

    fn visit_new(&mut self, stmt: &Stmt, base: &Expr, args: &[Expr], result: Option<Temp>) {
        let a = match temps(args) {
            Some(a) => a,
            None => return self.call_builtin_invalid(stmt),
        };
        match base {
            Expr::Name {
                builtin: Builtin::Invalid,
                id,
                ..
            } => self.construct_activation_property(id, &a, result),
            Expr::Member { base, name } => match base.as_temp() {
                Some(b) => self.construct_property(b, name, &a, result),
                None => self.call_builtin_invalid(stmt),
            },
            Expr::Temp(f) => self.construct_value(*f, &a, result),
            _ => self.call_builtin_invalid(stmt),
        }
    }

    fn visit_builtin(&mut self, stmt: &Stmt, builtin: Builtin, args: &[Expr], result: Option<Temp>) {
        match (builtin, args) {
            (Builtin::Typeof, [arg]) | (Builtin::Delete, [arg]) => {
                let typeof_ = builtin == Builtin::Typeof;
                match arg {
                    Expr::Member { base, name } => match base.as_temp() {
                        Some(b) if typeof_ => self.call_builtin_typeof_member(b, name, result),
                        Some(b) => self.call_builtin_delete_member(b, name, result),
                        None => self.call_builtin_invalid(stmt),
                    },
                    Expr::Subscript { base, index } => match (base.as_temp(), index.as_temp()) {
                        (Some(b), Some(i)) if typeof_ => self.call_builtin_typeof_subscript(b, i, result),
                        (Some(b), Some(i)) => self.call_builtin_delete_subscript(b, i, result),
                        _ => self.call_builtin_invalid(stmt),
                    },
                    Expr::Name { id, .. } if typeof_ => self.call_builtin_typeof_name(id, result),
                    Expr::Name { id, .. } => self.call_builtin_delete_name(id, result),
                    Expr::Temp(t) if typeof_ => self.call_builtin_typeof_value(*t, result),
                    Expr::Temp(_) => self.call_builtin_delete_value(result),
                    _ => self.call_builtin_invalid(stmt),
                }
            }
            (Builtin::Throw, [arg]) => match arg.as_temp() {
                Some(t) => self.call_builtin_throw(t),
                None => self.call_builtin_invalid(stmt),
            },
            (Builtin::ReThrow, []) => self.call_builtin_rethrow(),
            (Builtin::UnwindException, []) => self.call_builtin_unwind_exception(result),
            (Builtin::PushCatchScope, [name, value]) => match (name.as_string(), value.as_temp()) {
                (Some(n), Some(v)) => self.call_builtin_push_catch_scope(n, v),
                _ => self.call_builtin_invalid(stmt),
            },
            (Builtin::ForeachIteratorObject, [arg]) => match arg.as_temp() {
                Some(t) => self.call_builtin_foreach_iterator_object(t, result),
                None => self.call_builtin_invalid(stmt),
            },
            (Builtin::ForeachNextPropertyName, [arg]) => match arg.as_temp() {
                Some(t) => self.call_builtin_foreach_next_property_name(t, result),
                None => self.call_builtin_invalid(stmt),
            },
            (Builtin::PushWithScope, [arg]) => match arg.as_temp() {
                Some(t) => self.call_builtin_push_with_scope(t),
                None => self.call_builtin_invalid(stmt),
            },
            (Builtin::PopScope, []) => self.call_builtin_pop_scope(),
            (Builtin::DeclareVars, [deletable, names @ ..]) => {
                let deletable = match deletable.as_const() {
                    Some((Type::Bool, v)) => v != 0.0,
                    _ => return self.call_builtin_invalid(stmt),
                };
                let names: Option<Vec<Rc<str>>> = names.iter().map(|n| n.as_string().cloned()).collect();
                match names {
                    Some(n) => self.call_builtin_declare_vars(deletable, &n),
                    None => self.call_builtin_invalid(stmt),
                }
            }
            (Builtin::DefineArray, elements) => {
                let mut out = Vec::with_capacity(elements.len());
                for e in elements {
                    match e {
                        Expr::Temp(t) => out.push(Some(*t)),
                        Expr::Const { ty: Type::Missing, .. } => out.push(None),
                        _ => return self.call_builtin_invalid(stmt),
                    }
                }
                self.call_builtin_define_array(result, &out)
            }
            (Builtin::DefineObjectLiteral, triples) if triples.len() % 3 == 0 => {
                let mut out = Vec::with_capacity(triples.len() / 3);
                for p in triples.chunks(3) {
                    match (p[0].as_string(), p[1].as_const(), p[2].as_temp()) {
                        (Some(k), Some((_, kind)), Some(v)) => out.push((k.clone(), LiteralKind::from_code(kind as u32), v)),
                        _ => return self.call_builtin_invalid(stmt),
                    }
                }
                self.call_builtin_define_object_literal(result, &out)
            }
            (Builtin::SetupArgumentsObject, []) => self.call_builtin_setup_arguments_object(result),
            (Builtin::ConvertThisToObject, []) => self.call_builtin_convert_this_to_object(),
            _ => self.call_builtin_invalid(stmt),
        }
    }
}

fn temps(args: &[Expr]) -> Option<Vec<Temp>> {
    args.iter().map(Expr::as_temp).collect()
}

/// A backend that lowers one module function at a time.
pub trait EvalInstructionSelection {
    fn generator(&mut self) -> &mut JsUnitGenerator;

    fn use_fast_lookups(&self) -> bool;

    fn set_use_fast_lookups(&mut self, on: bool);

    /// Lowers function `index` of the module.
    fn run(&mut self, index: usize, function: &Function) -> Result<(), IselError>;

    /// Code for every function lowered so far, in module order.
    fn finish(self: Box<Self>) -> Result<BackendCode, IselError>;

    fn compile(mut self: Box<Self>, module: &Module) -> Result<CompilationUnit, IselError> {
        let span = tracing::debug_span!(target: "jsv4::isel", "compile", file = %module.file_name);
        let _guard = span.enter();
        for function in &module.functions {
            self.generator().register_function(function);
        }
        for (i, function) in module.functions.iter().enumerate() {
            tracing::trace!(target: "jsv4::isel", index = i, name = function.display_name(), "lowering");
            self.run(i, function)?;
        }
        let data = self.generator().generate_unit_data(&module.file_name);
        let backend = self.finish()?;
        let unit = CompilationUnit::new(data, backend);
        tracing::debug!(
            target: "jsv4::isel",
            unit = %unit.id,
            functions = module.functions.len(),
            "compiled"
        );
        Ok(unit)
    }
}

/// Instruction selection for `backend`.
pub fn create(
    backend: Backend,
    allocator: Arc<ExecutableAllocator>,
    use_fast_lookups: bool,
) -> Box<dyn EvalInstructionSelection> {
    let mut isel: Box<dyn EvalInstructionSelection> = match backend {
        Backend::Interpreter => Box::new(MothInstructionSelection::new()),
        Backend::Jit(target) => Box::new(JitInstructionSelection::new(target, allocator)),
    };
    isel.set_use_fast_lookups(use_fast_lookups);
    isel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::runner::ir::codegen::{generate, CompilationMode};

    /// Records which hook fired for each statement.
    #[derive(Default)]
    struct Recorder {
        hooks: Vec<String>,
    }

    impl Recorder {
        fn note(&mut self, s: impl Into<String>) {
            self.hooks.push(s.into());
        }
    }

    impl IrDecoder for Recorder {
        fn call_builtin_invalid(&mut self, stmt: &Stmt) {
            self.note(format!("invalid {}", stmt));
        }
        fn call_builtin_typeof_member(&mut self, _: Temp, name: &Rc<str>, _: Option<Temp>) {
            self.note(format!("typeof_member {}", name));
        }
        fn call_builtin_typeof_subscript(&mut self, _: Temp, _: Temp, _: Option<Temp>) {
            self.note("typeof_subscript");
        }
        fn call_builtin_typeof_name(&mut self, name: &Rc<str>, _: Option<Temp>) {
            self.note(format!("typeof_name {}", name));
        }
        fn call_builtin_typeof_value(&mut self, _: Temp, _: Option<Temp>) {
            self.note("typeof_value");
        }
        fn call_builtin_delete_member(&mut self, _: Temp, name: &Rc<str>, _: Option<Temp>) {
            self.note(format!("delete_member {}", name));
        }
        fn call_builtin_delete_subscript(&mut self, _: Temp, _: Temp, _: Option<Temp>) {
            self.note("delete_subscript");
        }
        fn call_builtin_delete_name(&mut self, name: &Rc<str>, _: Option<Temp>) {
            self.note(format!("delete_name {}", name));
        }
        fn call_builtin_delete_value(&mut self, _: Option<Temp>) {
            self.note("delete_value");
        }
        fn call_builtin_throw(&mut self, _: Temp) {
            self.note("throw");
        }
        fn call_builtin_rethrow(&mut self) {
            self.note("rethrow");
        }
        fn call_builtin_unwind_exception(&mut self, _: Option<Temp>) {
            self.note("unwind_exception");
        }
        fn call_builtin_push_catch_scope(&mut self, name: &Rc<str>, _: Temp) {
            self.note(format!("push_catch_scope {}", name));
        }
        fn call_builtin_foreach_iterator_object(&mut self, _: Temp, _: Option<Temp>) {
            self.note("foreach_iterator_object");
        }
        fn call_builtin_foreach_next_property_name(&mut self, _: Temp, _: Option<Temp>) {
            self.note("foreach_next_property_name");
        }
        fn call_builtin_push_with_scope(&mut self, _: Temp) {
            self.note("push_with_scope");
        }
        fn call_builtin_pop_scope(&mut self) {
            self.note("pop_scope");
        }
        fn call_builtin_declare_vars(&mut self, deletable: bool, names: &[Rc<str>]) {
            let names: Vec<&str> = names.iter().map(|n| &**n).collect();
            self.note(format!("declare_vars {} {}", deletable, names.join(",")));
        }
        fn call_builtin_define_array(&mut self, _: Option<Temp>, elements: &[Option<Temp>]) {
            let holes = elements.iter().filter(|e| e.is_none()).count();
            self.note(format!("define_array {} {}", elements.len(), holes));
        }
        fn call_builtin_define_object_literal(&mut self, _: Option<Temp>, properties: &[(Rc<str>, LiteralKind, Temp)]) {
            let keys: Vec<String> = properties.iter().map(|(k, kind, _)| format!("{}:{:?}", k, kind)).collect();
            self.note(format!("define_object_literal {}", keys.join(",")));
        }
        fn call_builtin_setup_arguments_object(&mut self, _: Option<Temp>) {
            self.note("setup_arguments_object");
        }
        fn call_builtin_convert_this_to_object(&mut self) {
            self.note("convert_this_to_object");
        }
        fn call_value(&mut self, _: Temp, args: &[Temp], _: Option<Temp>) {
            self.note(format!("call_value {}", args.len()));
        }
        fn call_property(&mut self, _: Temp, name: &Rc<str>, args: &[Temp], _: Option<Temp>) {
            self.note(format!("call_property {} {}", name, args.len()));
        }
        fn call_subscript(&mut self, _: Temp, _: Temp, args: &[Temp], _: Option<Temp>) {
            self.note(format!("call_subscript {}", args.len()));
        }
        fn call_activation_property(&mut self, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
            self.note(format!("call_activation_property {} {} {}", name, args.len(), result.is_some()));
        }
        fn construct_activation_property(&mut self, name: &Rc<str>, _: &[Temp], _: Option<Temp>) {
            self.note(format!("construct_activation_property {}", name));
        }
        fn construct_property(&mut self, _: Temp, name: &Rc<str>, _: &[Temp], _: Option<Temp>) {
            self.note(format!("construct_property {}", name));
        }
        fn construct_value(&mut self, _: Temp, _: &[Temp], _: Option<Temp>) {
            self.note("construct_value");
        }
        fn load_this_object(&mut self, _: Temp) {
            self.note("load_this_object");
        }
        fn load_const(&mut self, ty: Type, _: f64, _: Temp) {
            self.note(format!("load_const {:?}", ty));
        }
        fn load_string(&mut self, s: &Rc<str>, _: Temp) {
            self.note(format!("load_string {}", s));
        }
        fn load_regexp(&mut self, source: &Rc<str>, _: &Rc<str>, _: Temp) {
            self.note(format!("load_regexp {}", source));
        }
        fn get_activation_property(&mut self, name: &Rc<str>, global: bool, _: Temp) {
            self.note(format!("get_activation_property {} {}", name, global));
        }
        fn set_activation_property(&mut self, _: Temp, name: &Rc<str>) {
            self.note(format!("set_activation_property {}", name));
        }
        fn init_closure(&mut self, function: usize, _: Temp) {
            self.note(format!("init_closure {}", function));
        }
        fn get_property(&mut self, _: Temp, name: &Rc<str>, _: Temp) {
            self.note(format!("get_property {}", name));
        }
        fn set_property(&mut self, _: Temp, _: Temp, name: &Rc<str>) {
            self.note(format!("set_property {}", name));
        }
        fn get_element(&mut self, _: Temp, _: Temp, _: Temp) {
            self.note("get_element");
        }
        fn set_element(&mut self, _: Temp, _: Temp, _: Temp) {
            self.note("set_element");
        }
        fn copy_value(&mut self, _: Temp, _: Temp) {
            self.note("copy_value");
        }
        fn swap_values(&mut self, _: Temp, _: Temp) {
            self.note("swap_values");
        }
        fn convert_type(&mut self, _: Temp, _: Temp, ty: Type) {
            self.note(format!("convert_type {:?}", ty));
        }
        fn unop(&mut self, op: AluOp, _: Temp, _: Temp) {
            self.note(format!("unop {}", op.symbol()));
        }
        fn binop(&mut self, op: AluOp, _: Temp, _: Temp, _: Temp) {
            self.note(format!("binop {}", op.symbol()));
        }
        fn visit_jump(&mut self, _: BlockId) {
            self.note("jump");
        }
        fn visit_cjump(&mut self, _: Temp, _: BlockId, _: BlockId) {
            self.note("cjump");
        }
        fn visit_ret(&mut self, _: Temp) {
            self.note("ret");
        }
    }

    fn hooks(script: &str) -> Vec<String> {
        let program = match parse_program(script, false) {
            Ok(p) => p,
            Err(e) => panic!("{} did not parse: {}", script, e),
        };
        let module = generate(&program, "test.js", CompilationMode::GlobalCode);
        let mut r = Recorder::default();
        for f in &module.functions {
            for b in &f.blocks {
                for s in &b.statements {
                    r.visit_statement(s);
                }
            }
        }
        r.hooks
    }

    fn has(hooks: &[String], h: &str) -> bool {
        hooks.iter().any(|x| x == h)
    }

    #[test]
    fn test_every_generated_shape_is_recognised() {
        let h = hooks(
            r#"
            var o = { a: 1, get b() { return 2; } }, arr = [1,,3];
            function f(x) { return typeof x + typeof o.a + typeof o[0] + typeof nothing + typeof 1; }
            if (o) o.d = 1;
            for (var k in o) { delete o[k]; delete o.a; delete k; delete 1; }
            try { throw f(1); } catch (e) { o.c = e; } finally { arr[0] = this; }
            with (o) { a = /x+/g; }
            new f(1); new o.f(); o.f(1, 2); o[0](); (f)(1);
            var n = -o.a, m = o.a >>> 1, b = !n;
            "#,
        );
        assert!(h.iter().all(|x| !x.starts_with("invalid")), "{:?}", h);
        assert!(has(&h, "declare_vars false o,arr,k,n,m,b,f"));
        assert!(has(&h, "define_object_literal a:Data,b:Getter"));
        assert!(has(&h, "define_array 3 1"));
        assert!(has(&h, "typeof_value"));
        assert!(has(&h, "typeof_member a"));
        assert!(has(&h, "typeof_subscript"));
        assert!(has(&h, "typeof_name nothing"));
        assert!(has(&h, "delete_subscript"));
        assert!(has(&h, "delete_member a"));
        assert!(has(&h, "delete_name k"));
        assert!(has(&h, "push_catch_scope e"));
        assert!(has(&h, "push_with_scope"));
        assert!(has(&h, "load_regexp x+"));
        assert!(has(&h, "construct_activation_property f"));
        assert!(has(&h, "construct_property f"));
        assert!(has(&h, "call_property f 2"));
        assert!(has(&h, "call_subscript 0"));
        assert!(has(&h, "binop >>>"));
        assert!(has(&h, "unop -"));
        assert!(has(&h, "convert_type Bool"));
        assert!(has(&h, "load_this_object"));
        assert!(has(&h, "foreach_next_property_name"));
        assert!(has(&h, "rethrow"));
    }

    #[test]
    fn test_discarded_call_has_no_result() {
        let h = hooks("f(1);");
        assert!(has(&h, "call_activation_property f 1 true"));
        let stmt = Stmt::Exp(Expr::Call {
            base: Box::new(Expr::name("g")),
            args: vec![],
        });
        let mut r = Recorder::default();
        r.visit_statement(&stmt);
        assert_eq!(r.hooks, vec!["call_activation_property g 0 false"]);
    }

    #[test]
    fn test_unknown_shape_is_invalid() {
        let mut r = Recorder::default();
        r.visit_statement(&Stmt::Ret(Expr::name("x")));
        r.visit_statement(&Stmt::Exp(Expr::Call {
            base: Box::new(Expr::builtin(Builtin::PopScope)),
            args: vec![Expr::name("x")],
        }));
        assert_eq!(r.hooks.len(), 2);
        assert!(r.hooks.iter().all(|h| h.starts_with("invalid")));
    }
}
