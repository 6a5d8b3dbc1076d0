//! Lowers a parsed program into an IR [`Module`].
//!
//! Every value passes through a temporary: names, members and subscripts are
//! only ever moved into or out of temps, which keeps the statement shapes the
//! instruction selectors have to recognise small.

use std::rc::Rc;

use ahash::AHashSet;

use crate::parser::ast::{
    BinaryOperator, ExpressionType, ForInTarget, ForInit, FunctionData, LiteralData, LogicalOperator,
    ProgramData, PropertyKind, StatementType, UnaryOperator, UpdateOperator,
};
use crate::runner::ir::{AluOp, BlockId, Builtin, Expr, Function, Module, Stmt, Temp, Type};

/// How top level declarations bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationMode {
    /// `var` and function declarations become non-deletable properties of
    /// the global object.
    GlobalCode,
    /// Code run inside an inherited context: declarations are deletable and
    /// no name is assumed to be global.
    EvalCode,
}

/// Generates the module for `program`. Function 0 is the top level code.
pub fn generate(program: &ProgramData, file_name: &str, mode: CompilationMode) -> Module {
    let mut cg = Codegen {
        module: Module {
            functions: Vec::new(),
            file_name: file_name.to_string(),
        },
        mode,
        scopes: Vec::new(),
        fs: FunctionState::new(0),
    };
    cg.global_code(program);
    tracing::debug!(
        target: "jsv4::codegen",
        file = file_name,
        functions = cg.module.functions.len(),
        "generated module"
    );
    cg.module
}

#[derive(Default)]
struct Declarations {
    vars: Vec<Rc<str>>,
    functions: Vec<Rc<FunctionData>>,
    has_with_or_catch: bool,
}

impl Declarations {
    fn of(body: &[StatementType]) -> Declarations {
        let mut d = Declarations::default();
        let mut seen = AHashSet::new();
        for s in body {
            d.scan(s, &mut seen);
        }
        d
    }

    fn add_var(&mut self, name: &Rc<str>, seen: &mut AHashSet<Rc<str>>) {
        if seen.insert(name.clone()) {
            self.vars.push(name.clone());
        }
    }

    fn scan(&mut self, s: &StatementType, seen: &mut AHashSet<Rc<str>>) {
        match s {
            StatementType::VarDeclaration { declarations, .. } => {
                for d in declarations {
                    self.add_var(&d.name, seen);
                }
            }
            StatementType::FunctionDeclaration(f) => self.functions.push(f.clone()),
            StatementType::BlockStatement { body, .. } => body.iter().for_each(|s| self.scan(s, seen)),
            StatementType::IfStatement {
                consequent, alternate, ..
            } => {
                self.scan(consequent, seen);
                if let Some(a) = alternate {
                    self.scan(a, seen);
                }
            }
            StatementType::WhileStatement { body, .. } | StatementType::DoWhileStatement { body, .. } => {
                self.scan(body, seen)
            }
            StatementType::ForStatement { init, body, .. } => {
                if let Some(ForInit::VarDeclaration(declarations)) = init {
                    for d in declarations {
                        self.add_var(&d.name, seen);
                    }
                }
                self.scan(body, seen);
            }
            StatementType::ForInStatement { left, body, .. } => {
                if let ForInTarget::Var { name, .. } = left {
                    self.add_var(name, seen);
                }
                self.scan(body, seen);
            }
            StatementType::WithStatement { body, .. } => {
                self.has_with_or_catch = true;
                self.scan(body, seen);
            }
            StatementType::TryStatement {
                block,
                handler,
                finalizer,
                ..
            } => {
                block.iter().for_each(|s| self.scan(s, seen));
                if let Some(h) = handler {
                    self.has_with_or_catch = true;
                    h.body.iter().for_each(|s| self.scan(s, seen));
                }
                if let Some(f) = finalizer {
                    f.iter().for_each(|s| self.scan(s, seen));
                }
            }
            _ => {}
        }
    }
}

/// Names bound by one enclosing function (or the global code).
struct Scope {
    names: AHashSet<Rc<str>>,
    has_with_or_catch: bool,
}

/// Work a jump out of a protected region has to do on its way out.
enum Unwind {
    With,
    Catch,
    Finally {
        body: Vec<StatementType>,
        handler: Option<BlockId>,
    },
}

struct Loop {
    break_target: BlockId,
    continue_target: BlockId,
    unwind_depth: usize,
}

struct FunctionState {
    index: usize,
    block: BlockId,
    handler: Option<BlockId>,
    loops: Vec<Loop>,
    unwind: Vec<Unwind>,
    /// Completion value of the top level code.
    result: Option<Temp>,
    is_function: bool,
}

impl FunctionState {
    fn new(index: usize) -> Self {
        FunctionState {
            index,
            block: 0,
            handler: None,
            loops: Vec::new(),
            unwind: Vec::new(),
            result: None,
            is_function: false,
        }
    }
}

enum Reference {
    Name(Rc<str>),
    Member(Temp, Rc<str>),
    Subscript(Temp, Temp),
}

fn alu_op(op: BinaryOperator) -> AluOp {
    match op {
        BinaryOperator::Equal => AluOp::Equal,
        BinaryOperator::NotEqual => AluOp::NotEqual,
        BinaryOperator::StrictlyEqual => AluOp::StrictEqual,
        BinaryOperator::StrictlyUnequal => AluOp::StrictNotEqual,
        BinaryOperator::LessThan => AluOp::Lt,
        BinaryOperator::LessThanEqual => AluOp::Le,
        BinaryOperator::GreaterThan => AluOp::Gt,
        BinaryOperator::GreaterThanEqual => AluOp::Ge,
        BinaryOperator::ShiftLeft => AluOp::LShift,
        BinaryOperator::ShiftRight => AluOp::RShift,
        BinaryOperator::UnsignedShiftRight => AluOp::URShift,
        BinaryOperator::Add => AluOp::Add,
        BinaryOperator::Subtract => AluOp::Sub,
        BinaryOperator::Multiply => AluOp::Mul,
        BinaryOperator::Divide => AluOp::Div,
        BinaryOperator::Modulo => AluOp::Mod,
        BinaryOperator::BitwiseOr => AluOp::BitOr,
        BinaryOperator::BitwiseXor => AluOp::BitXor,
        BinaryOperator::BitwiseAnd => AluOp::BitAnd,
        BinaryOperator::In => AluOp::In,
        BinaryOperator::InstanceOf => AluOp::InstanceOf,
    }
}

fn number_const(n: f64) -> Expr {
    let is_int = n.fract() == 0.0
        && n >= i32::MIN as f64
        && n <= i32::MAX as f64
        && !(n == 0.0 && n.is_sign_negative());
    Expr::Const {
        ty: if is_int { Type::SInt32 } else { Type::Double },
        value: n,
    }
}

fn call(builtin: Builtin, args: Vec<Expr>) -> Expr {
    Expr::Call {
        base: Box::new(Expr::builtin(builtin)),
        args,
    }
}

struct Codegen {
    module: Module,
    mode: CompilationMode,
    scopes: Vec<Scope>,
    fs: FunctionState,
}

impl Codegen {
    // ── Emission helpers ──

    fn func(&mut self) -> &mut Function {
        &mut self.module.functions[self.fs.index]
    }

    fn emit(&mut self, s: Stmt) {
        let b = self.fs.block;
        let block = &mut self.module.functions[self.fs.index].blocks[b];
        // anything after a terminator is unreachable
        if !block.is_terminated() {
            block.statements.push(s);
        }
    }

    fn new_block(&mut self) -> BlockId {
        let handler = self.fs.handler;
        self.func().new_block(handler)
    }

    fn enter(&mut self, b: BlockId) {
        self.fs.block = b;
    }

    fn jump(&mut self, target: BlockId) {
        self.emit(Stmt::Jump(target));
    }

    /// Jumps away and continues in a fresh, unreachable block.
    fn jump_out(&mut self, target: BlockId) {
        self.jump(target);
        let dead = self.new_block();
        self.enter(dead);
    }

    fn temp(&mut self, ty: Type) -> Temp {
        self.func().new_temp(ty)
    }

    fn move_to_temp(&mut self, ty: Type, source: Expr) -> Temp {
        let t = self.temp(ty);
        self.emit(Stmt::Move {
            target: Expr::Temp(t),
            source,
            swap: false,
        });
        t
    }

    fn store(&mut self, target: Expr, value: Temp) {
        self.emit(Stmt::Move {
            target,
            source: Expr::Temp(value),
            swap: false,
        });
    }

    fn note_call(&mut self, argc: usize) {
        let f = self.func();
        f.max_call_args = f.max_call_args.max(argc as u32);
    }

    fn undefined_temp(&mut self) -> Temp {
        self.move_to_temp(
            Type::Undefined,
            Expr::Const {
                ty: Type::Undefined,
                value: 0.0,
            },
        )
    }

    fn name_expr(&self, id: &Rc<str>) -> Expr {
        let global = self.mode == CompilationMode::GlobalCode
            && self
                .scopes
                .iter()
                .all(|s| !s.has_with_or_catch && !s.names.contains(id));
        Expr::Name {
            id: id.clone(),
            builtin: Builtin::Invalid,
            global,
        }
    }

    /// Every block ends in a jump or return, including unreachable ones.
    fn seal_blocks(&mut self) {
        let f = self.fs.index;
        for b in 0..self.module.functions[f].blocks.len() {
            if !self.module.functions[f].blocks[b].is_terminated() {
                self.enter(b);
                let u = self.undefined_temp();
                self.emit(Stmt::Ret(Expr::Temp(u)));
            }
        }
    }

    // ── Functions ──

    fn global_code(&mut self, program: &ProgramData) {
        self.module.functions.push(Function {
            name: Some(Rc::from("%entry")),
            line: program.meta.line,
            column: program.meta.column,
            ..Function::default()
        });
        self.func().flags.strict = program.strict;
        let decls = Declarations::of(&program.body);
        self.func().flags.has_with_or_catch = decls.has_with_or_catch;
        self.scopes.push(Scope {
            names: AHashSet::new(),
            has_with_or_catch: decls.has_with_or_catch,
        });
        let hoisted = self.nested_declarations(&decls);

        let entry = self.new_block();
        let start = self.new_block();
        self.enter(start);
        let result = self.temp(Type::Var);
        self.fs.result = Some(result);
        self.statements(&program.body);
        self.emit(Stmt::Ret(Expr::Temp(result)));

        self.enter(entry);
        let deletable = self.mode == CompilationMode::EvalCode;
        let mut names: Vec<Rc<str>> = decls.vars.clone();
        for f in &decls.functions {
            if let Some(n) = &f.name {
                if !names.contains(n) {
                    names.push(n.clone());
                }
            }
        }
        if !names.is_empty() {
            let mut args = vec![Expr::Const {
                ty: Type::Bool,
                value: if deletable { 1.0 } else { 0.0 },
            }];
            args.extend(names.into_iter().map(Expr::String));
            self.note_call(args.len());
            self.emit(Stmt::Exp(call(Builtin::DeclareVars, args)));
        }
        self.hoist(&hoisted);
        self.emit(Stmt::Move {
            target: Expr::Temp(result),
            source: Expr::Const {
                ty: Type::Undefined,
                value: 0.0,
            },
            swap: false,
        });
        self.jump(start);
        self.seal_blocks();
        self.scopes.pop();
    }

    /// Compiles the hoisted function declarations of the current scope.
    fn nested_declarations(&mut self, decls: &Declarations) -> Vec<(Rc<str>, usize)> {
        let mut hoisted = Vec::new();
        for f in &decls.functions {
            let index = self.function(f);
            if let Some(name) = &f.name {
                hoisted.push((name.clone(), index));
            }
        }
        if !hoisted.is_empty() {
            self.func().flags.has_nested_functions = true;
        }
        hoisted
    }

    fn hoist(&mut self, hoisted: &[(Rc<str>, usize)]) {
        for (name, index) in hoisted {
            let t = self.move_to_temp(Type::Var, Expr::Closure(*index));
            let target = self.name_expr(name);
            self.store(target, t);
        }
    }

    /// Compiles `data` into a new module function and returns its index.
    fn function(&mut self, data: &FunctionData) -> usize {
        let index = self.module.functions.len();
        let parent = self.fs.index;
        self.module.functions[parent].nested.push(index);
        self.module.functions.push(Function {
            name: data.name.clone(),
            formals: data.params.clone(),
            line: data.meta.line,
            column: data.meta.column,
            ..Function::default()
        });
        let saved = std::mem::replace(&mut self.fs, FunctionState::new(index));
        self.fs.is_function = true;

        let decls = Declarations::of(&data.body);
        let mut names: AHashSet<Rc<str>> = data.params.iter().cloned().collect();
        let mut locals = Vec::new();
        let declared = decls
            .vars
            .iter()
            .cloned()
            .chain(decls.functions.iter().filter_map(|f| f.name.clone()));
        for name in declared {
            if names.insert(name.clone()) {
                locals.push(name);
            }
        }
        if data.is_expression {
            if let Some(n) = &data.name {
                names.insert(n.clone());
            }
        }
        names.insert(Rc::from("arguments"));
        {
            let f = self.func();
            f.locals = locals;
            f.flags.strict = data.strict;
            f.flags.is_named_expression = data.is_expression && data.name.is_some();
            f.flags.has_with_or_catch = decls.has_with_or_catch;
        }
        self.scopes.push(Scope {
            names,
            has_with_or_catch: decls.has_with_or_catch,
        });
        let hoisted = self.nested_declarations(&decls);

        let entry = self.new_block();
        let start = self.new_block();
        self.enter(start);
        self.statements(&data.body);
        let u = self.undefined_temp();
        self.emit(Stmt::Ret(Expr::Temp(u)));

        self.enter(entry);
        let (uses_this, uses_arguments, strict) = {
            let flags = &self.module.functions[index].flags;
            (flags.uses_this, flags.uses_arguments, flags.strict)
        };
        if uses_this && !strict {
            self.emit(Stmt::Exp(call(Builtin::ConvertThisToObject, Vec::new())));
        }
        if uses_arguments {
            let arguments: Rc<str> = Rc::from("arguments");
            if !self.module.functions[index].locals.contains(&arguments) {
                self.func().locals.push(arguments.clone());
            }
            let t = self.move_to_temp(Type::Var, call(Builtin::SetupArgumentsObject, Vec::new()));
            let target = self.name_expr(&arguments);
            self.store(target, t);
        }
        self.hoist(&hoisted);
        self.jump(start);
        self.seal_blocks();

        self.scopes.pop();
        self.fs = saved;
        index
    }

    // ── Statements ──

    fn statements(&mut self, body: &[StatementType]) {
        for s in body {
            self.statement(s);
        }
    }

    fn statement(&mut self, s: &StatementType) {
        match s {
            StatementType::EmptyStatement { .. } | StatementType::FunctionDeclaration(_) => {}
            StatementType::ExpressionStatement { expression, .. } => {
                let t = self.expression(expression);
                if let Some(result) = self.fs.result {
                    self.emit(Stmt::Move {
                        target: Expr::Temp(result),
                        source: Expr::Temp(t),
                        swap: false,
                    });
                }
            }
            StatementType::VarDeclaration { declarations, .. } => {
                for d in declarations {
                    if let Some(init) = &d.init {
                        let t = self.expression(init);
                        let target = self.name_expr(&d.name);
                        self.store(target, t);
                    }
                }
            }
            StatementType::BlockStatement { body, .. } => self.statements(body),
            StatementType::IfStatement {
                test,
                consequent,
                alternate,
                ..
            } => {
                let then_block = self.new_block();
                let end = self.new_block();
                let else_block = if alternate.is_some() { self.new_block() } else { end };
                self.cond_jump(test, then_block, else_block);
                self.enter(then_block);
                self.statement(consequent);
                self.jump(end);
                if let Some(a) = alternate {
                    self.enter(else_block);
                    self.statement(a);
                    self.jump(end);
                }
                self.enter(end);
            }
            StatementType::WhileStatement { test, body, .. } => {
                let cond = self.new_block();
                let body_block = self.new_block();
                let end = self.new_block();
                self.jump(cond);
                self.enter(cond);
                self.cond_jump(test, body_block, end);
                self.enter(body_block);
                self.loop_body(body, end, cond);
                self.jump(cond);
                self.enter(end);
            }
            StatementType::DoWhileStatement { body, test, .. } => {
                let body_block = self.new_block();
                let cond = self.new_block();
                let end = self.new_block();
                self.jump(body_block);
                self.enter(body_block);
                self.loop_body(body, end, cond);
                self.jump(cond);
                self.enter(cond);
                self.cond_jump(test, body_block, end);
                self.enter(end);
            }
            StatementType::ForStatement {
                init,
                test,
                update,
                body,
                ..
            } => {
                match init {
                    Some(ForInit::VarDeclaration(declarations)) => {
                        for d in declarations {
                            if let Some(e) = &d.init {
                                let t = self.expression(e);
                                let target = self.name_expr(&d.name);
                                self.store(target, t);
                            }
                        }
                    }
                    Some(ForInit::Expression(e)) => {
                        self.expression(e);
                    }
                    None => {}
                }
                let cond = self.new_block();
                let body_block = self.new_block();
                let step = self.new_block();
                let end = self.new_block();
                self.jump(cond);
                self.enter(cond);
                match test {
                    Some(t) => self.cond_jump(t, body_block, end),
                    None => self.jump(body_block),
                }
                self.enter(body_block);
                self.loop_body(body, end, step);
                self.jump(step);
                self.enter(step);
                if let Some(u) = update {
                    self.expression(u);
                }
                self.jump(cond);
                self.enter(end);
            }
            StatementType::ForInStatement { left, right, body, .. } => {
                let object = self.expression(right);
                let iterator = self.move_to_temp(
                    Type::Var,
                    call(Builtin::ForeachIteratorObject, vec![Expr::Temp(object)]),
                );
                self.note_call(1);
                let cond = self.new_block();
                let body_block = self.new_block();
                let end = self.new_block();
                self.jump(cond);
                self.enter(cond);
                let key = self.move_to_temp(
                    Type::Var,
                    call(Builtin::ForeachNextPropertyName, vec![Expr::Temp(iterator)]),
                );
                let null = self.move_to_temp(
                    Type::Null,
                    Expr::Const {
                        ty: Type::Null,
                        value: 0.0,
                    },
                );
                let more = self.move_to_temp(
                    Type::Bool,
                    Expr::Binop {
                        op: AluOp::StrictNotEqual,
                        left: Box::new(Expr::Temp(key)),
                        right: Box::new(Expr::Temp(null)),
                    },
                );
                self.emit(Stmt::CJump {
                    cond: Expr::Temp(more),
                    iftrue: body_block,
                    iffalse: end,
                });
                self.enter(body_block);
                let target = match left {
                    ForInTarget::Var { name, .. } => Reference::Name(name.clone()),
                    ForInTarget::Expression(e) => self.reference(e),
                };
                self.store_reference(&target, key);
                self.loop_body(body, end, cond);
                self.jump(cond);
                self.enter(end);
            }
            StatementType::ContinueStatement { .. } => {
                if let Some((target, depth)) = self.fs.loops.last().map(|l| (l.continue_target, l.unwind_depth)) {
                    self.unwind_to(depth);
                    self.jump_out(target);
                }
            }
            StatementType::BreakStatement { .. } => {
                if let Some((target, depth)) = self.fs.loops.last().map(|l| (l.break_target, l.unwind_depth)) {
                    self.unwind_to(depth);
                    self.jump_out(target);
                }
            }
            StatementType::ReturnStatement { argument, .. } => {
                let value = match argument {
                    Some(e) => self.expression(e),
                    None => self.undefined_temp(),
                };
                self.unwind_to(0);
                self.emit(Stmt::Ret(Expr::Temp(value)));
                let dead = self.new_block();
                self.enter(dead);
            }
            StatementType::ThrowStatement { argument, .. } => {
                let value = self.expression(argument);
                self.note_call(1);
                self.emit(Stmt::Exp(call(Builtin::Throw, vec![Expr::Temp(value)])));
            }
            StatementType::WithStatement { object, body, .. } => self.with_statement(object, body),
            StatementType::TryStatement {
                block,
                handler,
                finalizer,
                ..
            } => self.try_statement(block, handler.as_ref().map(|h| (&h.param, &h.body[..])), finalizer.as_deref()),
        }
    }

    fn loop_body(&mut self, body: &StatementType, break_target: BlockId, continue_target: BlockId) {
        let unwind_depth = self.fs.unwind.len();
        self.fs.loops.push(Loop {
            break_target,
            continue_target,
            unwind_depth,
        });
        self.statement(body);
        self.fs.loops.pop();
    }

    /// Emits the scope pops and inlined `finally` bodies between the current
    /// position and unwind depth `depth`.
    fn unwind_to(&mut self, depth: usize) {
        let saved_handler = self.fs.handler;
        let mut i = self.fs.unwind.len();
        while i > depth {
            i -= 1;
            match &self.fs.unwind[i] {
                Unwind::With | Unwind::Catch => {
                    self.note_call(0);
                    self.emit(Stmt::Exp(call(Builtin::PopScope, Vec::new())));
                }
                Unwind::Finally { body, handler } => {
                    let body = body.clone();
                    self.fs.handler = *handler;
                    let inner = self.new_block();
                    self.jump(inner);
                    self.enter(inner);
                    // the finally body runs outside the region it protects
                    let rest = self.fs.unwind.split_off(i);
                    let loops = std::mem::take(&mut self.fs.loops);
                    let result = self.fs.result.take();
                    self.statements(&body);
                    self.fs.result = result;
                    self.fs.loops = loops;
                    self.fs.unwind.extend(rest);
                }
            }
        }
        if self.fs.handler != saved_handler {
            self.fs.handler = saved_handler;
        }
    }

    fn with_statement(&mut self, object: &ExpressionType, body: &StatementType) {
        let value = self.expression(object);
        self.note_call(1);
        self.emit(Stmt::Exp(call(Builtin::PushWithScope, vec![Expr::Temp(value)])));

        let outer = self.fs.handler;
        let cleanup = self.new_block();
        self.fs.handler = Some(cleanup);
        let body_block = self.new_block();
        self.jump(body_block);
        self.enter(body_block);
        self.fs.unwind.push(Unwind::With);
        self.statement(body);
        self.fs.unwind.pop();
        self.emit(Stmt::Exp(call(Builtin::PopScope, Vec::new())));
        self.fs.handler = outer;
        let end = self.new_block();
        self.jump(end);

        self.enter(cleanup);
        self.emit(Stmt::Exp(call(Builtin::PopScope, Vec::new())));
        self.emit(Stmt::Exp(call(Builtin::ReThrow, Vec::new())));
        self.jump(end);
        self.enter(end);
    }

    fn try_statement(
        &mut self,
        block: &[StatementType],
        handler: Option<(&Rc<str>, &[StatementType])>,
        finalizer: Option<&[StatementType]>,
    ) {
        let outer = self.fs.handler;
        let exception = self.temp(Type::Var);
        let end = self.new_block();

        // Finally plumbing: the handler that parks the exception and the
        // block that runs the finally code on every path.
        let finally = finalizer.map(|body| {
            let has_exception = self.temp(Type::Bool);
            self.emit(Stmt::Move {
                target: Expr::Temp(has_exception),
                source: Expr::Const {
                    ty: Type::Bool,
                    value: 0.0,
                },
                swap: false,
            });
            let park = self.new_block();
            let run = self.new_block();
            (body, has_exception, park, run)
        });
        let after_protected = finally.as_ref().map_or(end, |f| f.3);
        let catch_outer = finally.as_ref().map(|f| f.2).or(outer);

        if let Some((body, _, _, _)) = &finally {
            self.fs.unwind.push(Unwind::Finally {
                body: body.to_vec(),
                handler: outer,
            });
        }

        let catch_entry = handler.map(|_| {
            self.fs.handler = catch_outer;
            self.new_block()
        });
        self.fs.handler = catch_entry.or(catch_outer);
        let try_block = self.new_block();
        self.jump(try_block);
        self.enter(try_block);
        self.statements(block);
        self.jump(after_protected);

        if let (Some((param, body)), Some(entry)) = (handler, catch_entry) {
            self.fs.handler = catch_outer;
            self.enter(entry);
            let caught = self.move_to_temp(Type::Var, call(Builtin::UnwindException, Vec::new()));
            self.emit(Stmt::Move {
                target: Expr::Temp(exception),
                source: Expr::Temp(caught),
                swap: false,
            });
            self.note_call(2);
            self.emit(Stmt::Exp(call(
                Builtin::PushCatchScope,
                vec![Expr::String(param.clone()), Expr::Temp(exception)],
            )));
            let cleanup = self.new_block();
            self.fs.handler = Some(cleanup);
            let body_block = self.new_block();
            self.jump(body_block);
            self.enter(body_block);
            self.fs.unwind.push(Unwind::Catch);
            self.statements(body);
            self.fs.unwind.pop();
            self.emit(Stmt::Exp(call(Builtin::PopScope, Vec::new())));
            self.jump(after_protected);

            self.fs.handler = catch_outer;
            self.enter(cleanup);
            self.emit(Stmt::Exp(call(Builtin::PopScope, Vec::new())));
            self.emit(Stmt::Exp(call(Builtin::ReThrow, Vec::new())));
            self.jump(after_protected);
        }

        self.fs.handler = outer;
        if let Some((body, has_exception, park, run)) = finally {
            self.fs.unwind.pop();
            self.enter(park);
            let caught = self.move_to_temp(Type::Var, call(Builtin::UnwindException, Vec::new()));
            self.emit(Stmt::Move {
                target: Expr::Temp(exception),
                source: Expr::Temp(caught),
                swap: false,
            });
            self.emit(Stmt::Move {
                target: Expr::Temp(has_exception),
                source: Expr::Const {
                    ty: Type::Bool,
                    value: 1.0,
                },
                swap: false,
            });
            self.jump(run);

            self.enter(run);
            let result = self.fs.result.take();
            self.statements(body);
            self.fs.result = result;
            let rethrow = self.new_block();
            self.emit(Stmt::CJump {
                cond: Expr::Temp(has_exception),
                iftrue: rethrow,
                iffalse: end,
            });
            self.enter(rethrow);
            self.note_call(1);
            self.emit(Stmt::Exp(call(Builtin::Throw, vec![Expr::Temp(exception)])));
            self.jump(end);
        }
        self.enter(end);
    }

    // ── Conditions ──

    /// Branches on the truth of `e` without materialising a value where the
    /// expression is a comparison or a logical operator.
    fn cond_jump(&mut self, e: &ExpressionType, iftrue: BlockId, iffalse: BlockId) {
        match e {
            ExpressionType::UnaryExpression {
                operator: UnaryOperator::LogicalNot,
                argument,
                ..
            } => self.cond_jump(argument, iffalse, iftrue),
            ExpressionType::LogicalExpression {
                operator, left, right, ..
            } => {
                let rhs = self.new_block();
                match operator {
                    LogicalOperator::And => self.cond_jump(left, rhs, iffalse),
                    LogicalOperator::Or => self.cond_jump(left, iftrue, rhs),
                }
                self.enter(rhs);
                self.cond_jump(right, iftrue, iffalse);
            }
            _ => {
                let v = self.expression(e);
                let cond = if v.ty == Type::Bool {
                    v
                } else {
                    self.to_bool(v)
                };
                self.emit(Stmt::CJump {
                    cond: Expr::Temp(cond),
                    iftrue,
                    iffalse,
                });
            }
        }
    }

    fn to_bool(&mut self, v: Temp) -> Temp {
        self.move_to_temp(
            Type::Bool,
            Expr::Convert {
                expr: Box::new(Expr::Temp(v)),
                ty: Type::Bool,
            },
        )
    }

    // ── References ──

    fn reference(&mut self, e: &ExpressionType) -> Reference {
        match e {
            ExpressionType::Identifier { name, .. } => {
                self.note_identifier(name);
                Reference::Name(name.clone())
            }
            ExpressionType::MemberExpression { object, property, .. } => {
                let base = self.expression(object);
                Reference::Member(base, property.clone())
            }
            ExpressionType::IndexExpression { object, index, .. } => {
                let base = self.expression(object);
                let index = self.expression(index);
                Reference::Subscript(base, index)
            }
            other => {
                // rejected by the parser; keep the side effects
                let t = self.expression(other);
                Reference::Subscript(t, t)
            }
        }
    }

    fn reference_expr(&self, r: &Reference) -> Expr {
        match r {
            Reference::Name(id) => self.name_expr(id),
            Reference::Member(base, name) => Expr::Member {
                base: Box::new(Expr::Temp(*base)),
                name: name.clone(),
            },
            Reference::Subscript(base, index) => Expr::Subscript {
                base: Box::new(Expr::Temp(*base)),
                index: Box::new(Expr::Temp(*index)),
            },
        }
    }

    fn load_reference(&mut self, r: &Reference) -> Temp {
        let source = self.reference_expr(r);
        self.move_to_temp(Type::Var, source)
    }

    fn store_reference(&mut self, r: &Reference, value: Temp) {
        let target = self.reference_expr(r);
        self.store(target, value);
    }

    fn note_identifier(&mut self, name: &str) {
        if name == "arguments" && self.fs.is_function {
            let f = self.func();
            if !f.formals.iter().any(|p| &**p == "arguments") {
                f.flags.uses_arguments = true;
            }
        }
    }

    // ── Expressions ──

    fn arguments(&mut self, args: &[ExpressionType]) -> Vec<Expr> {
        let temps: Vec<Expr> = args.iter().map(|a| Expr::Temp(self.expression(a))).collect();
        self.note_call(temps.len());
        temps
    }

    fn expression(&mut self, e: &ExpressionType) -> Temp {
        match e {
            ExpressionType::Literal { value, .. } => match value {
                LiteralData::Null => self.move_to_temp(
                    Type::Null,
                    Expr::Const {
                        ty: Type::Null,
                        value: 0.0,
                    },
                ),
                LiteralData::Boolean(b) => self.move_to_temp(
                    Type::Bool,
                    Expr::Const {
                        ty: Type::Bool,
                        value: if *b { 1.0 } else { 0.0 },
                    },
                ),
                LiteralData::Number(n) => {
                    let c = number_const(*n);
                    self.move_to_temp(c.ty(), c)
                }
                LiteralData::String(s) => self.move_to_temp(Type::String, Expr::String(s.clone())),
                LiteralData::RegExp { pattern, flags } => self.move_to_temp(
                    Type::Var,
                    Expr::RegExp {
                        source: pattern.clone(),
                        flags: flags.clone(),
                    },
                ),
            },
            ExpressionType::ThisExpression { .. } => {
                self.func().flags.uses_this = true;
                self.move_to_temp(Type::Var, Expr::builtin(Builtin::This))
            }
            ExpressionType::Identifier { name, .. } => {
                self.note_identifier(name);
                let source = self.name_expr(name);
                self.move_to_temp(Type::Var, source)
            }
            ExpressionType::ArrayExpression { elements, .. } => {
                let args: Vec<Expr> = elements
                    .iter()
                    .map(|el| match el {
                        Some(e) => Expr::Temp(self.expression(e)),
                        None => Expr::Const {
                            ty: Type::Missing,
                            value: 0.0,
                        },
                    })
                    .collect();
                self.note_call(args.len());
                self.move_to_temp(Type::Var, call(Builtin::DefineArray, args))
            }
            ExpressionType::ObjectExpression { properties, .. } => {
                let mut args = Vec::with_capacity(properties.len() * 3);
                for p in properties {
                    let value = self.expression(&p.value);
                    let kind = match p.kind {
                        PropertyKind::Init => 0.0,
                        PropertyKind::Get => 1.0,
                        PropertyKind::Set => 2.0,
                    };
                    args.push(Expr::String(p.key.clone()));
                    args.push(Expr::Const {
                        ty: Type::SInt32,
                        value: kind,
                    });
                    args.push(Expr::Temp(value));
                }
                self.note_call(args.len());
                self.move_to_temp(Type::Var, call(Builtin::DefineObjectLiteral, args))
            }
            ExpressionType::FunctionExpression(f) => {
                let index = self.function(f);
                self.func().flags.has_nested_functions = true;
                self.move_to_temp(Type::Var, Expr::Closure(index))
            }
            ExpressionType::UnaryExpression { operator, argument, .. } => self.unary(*operator, argument),
            ExpressionType::UpdateExpression {
                operator,
                argument,
                prefix,
                ..
            } => {
                let r = self.reference(argument);
                let old = self.load_reference(&r);
                let number = self.move_to_temp(
                    Type::Var,
                    Expr::Unop {
                        op: AluOp::UPlus,
                        expr: Box::new(Expr::Temp(old)),
                    },
                );
                let one = self.move_to_temp(
                    Type::SInt32,
                    Expr::Const {
                        ty: Type::SInt32,
                        value: 1.0,
                    },
                );
                let op = match operator {
                    UpdateOperator::Increment => AluOp::Add,
                    UpdateOperator::Decrement => AluOp::Sub,
                };
                let updated = self.move_to_temp(
                    Type::Var,
                    Expr::Binop {
                        op,
                        left: Box::new(Expr::Temp(number)),
                        right: Box::new(Expr::Temp(one)),
                    },
                );
                self.store_reference(&r, updated);
                if *prefix {
                    updated
                } else {
                    number
                }
            }
            ExpressionType::BinaryExpression {
                operator, left, right, ..
            } => {
                let l = self.expression(left);
                let r = self.expression(right);
                self.binop(alu_op(*operator), l, r)
            }
            ExpressionType::LogicalExpression {
                operator, left, right, ..
            } => {
                let result = self.temp(Type::Var);
                let l = self.expression(left);
                self.store(Expr::Temp(result), l);
                let rhs = self.new_block();
                let end = self.new_block();
                let cond = self.to_bool(l);
                let (iftrue, iffalse) = match operator {
                    LogicalOperator::And => (rhs, end),
                    LogicalOperator::Or => (end, rhs),
                };
                self.emit(Stmt::CJump {
                    cond: Expr::Temp(cond),
                    iftrue,
                    iffalse,
                });
                self.enter(rhs);
                let r = self.expression(right);
                self.store(Expr::Temp(result), r);
                self.jump(end);
                self.enter(end);
                result
            }
            ExpressionType::AssignmentExpression {
                operator, left, right, ..
            } => {
                let r = self.reference(left);
                let value = match operator {
                    None => self.expression(right),
                    Some(op) => {
                        let old = self.load_reference(&r);
                        let rhs = self.expression(right);
                        self.binop(alu_op(*op), old, rhs)
                    }
                };
                self.store_reference(&r, value);
                value
            }
            ExpressionType::ConditionalExpression {
                test,
                consequent,
                alternate,
                ..
            } => {
                let result = self.temp(Type::Var);
                let then_block = self.new_block();
                let else_block = self.new_block();
                let end = self.new_block();
                self.cond_jump(test, then_block, else_block);
                self.enter(then_block);
                let v = self.expression(consequent);
                self.store(Expr::Temp(result), v);
                self.jump(end);
                self.enter(else_block);
                let v = self.expression(alternate);
                self.store(Expr::Temp(result), v);
                self.jump(end);
                self.enter(end);
                result
            }
            ExpressionType::CallExpression { callee, arguments, .. } => {
                let base = self.callee(callee);
                let args = self.arguments(arguments);
                self.move_to_temp(
                    Type::Var,
                    Expr::Call {
                        base: Box::new(base),
                        args,
                    },
                )
            }
            ExpressionType::NewExpression { callee, arguments, .. } => {
                let base = match &**callee {
                    ExpressionType::Identifier { name, .. } => {
                        self.note_identifier(name);
                        self.name_expr(name)
                    }
                    ExpressionType::MemberExpression { object, property, .. } => {
                        let b = self.expression(object);
                        Expr::Member {
                            base: Box::new(Expr::Temp(b)),
                            name: property.clone(),
                        }
                    }
                    other => Expr::Temp(self.expression(other)),
                };
                let args = self.arguments(arguments);
                self.move_to_temp(
                    Type::Var,
                    Expr::New {
                        base: Box::new(base),
                        args,
                    },
                )
            }
            ExpressionType::MemberExpression { object, property, .. } => {
                let b = self.expression(object);
                self.move_to_temp(
                    Type::Var,
                    Expr::Member {
                        base: Box::new(Expr::Temp(b)),
                        name: property.clone(),
                    },
                )
            }
            ExpressionType::IndexExpression { object, index, .. } => {
                let b = self.expression(object);
                let i = self.expression(index);
                self.move_to_temp(
                    Type::Var,
                    Expr::Subscript {
                        base: Box::new(Expr::Temp(b)),
                        index: Box::new(Expr::Temp(i)),
                    },
                )
            }
            ExpressionType::SequenceExpression { expressions, .. } => {
                let mut last = None;
                for e in expressions {
                    last = Some(self.expression(e));
                }
                match last {
                    Some(t) => t,
                    None => self.undefined_temp(),
                }
            }
        }
    }

    fn callee(&mut self, callee: &ExpressionType) -> Expr {
        match callee {
            ExpressionType::Identifier { name, .. } => {
                self.note_identifier(name);
                self.name_expr(name)
            }
            ExpressionType::MemberExpression { object, property, .. } => {
                let b = self.expression(object);
                Expr::Member {
                    base: Box::new(Expr::Temp(b)),
                    name: property.clone(),
                }
            }
            ExpressionType::IndexExpression { object, index, .. } => {
                let b = self.expression(object);
                let i = self.expression(index);
                Expr::Subscript {
                    base: Box::new(Expr::Temp(b)),
                    index: Box::new(Expr::Temp(i)),
                }
            }
            other => Expr::Temp(self.expression(other)),
        }
    }

    fn binop(&mut self, op: AluOp, l: Temp, r: Temp) -> Temp {
        self.move_to_temp(
            op.result_type(),
            Expr::Binop {
                op,
                left: Box::new(Expr::Temp(l)),
                right: Box::new(Expr::Temp(r)),
            },
        )
    }

    fn unary(&mut self, operator: UnaryOperator, argument: &ExpressionType) -> Temp {
        let op = match operator {
            UnaryOperator::Minus => AluOp::UMinus,
            UnaryOperator::Plus => AluOp::UPlus,
            UnaryOperator::LogicalNot => AluOp::Not,
            UnaryOperator::BitwiseNot => AluOp::Compl,
            UnaryOperator::Void => {
                self.expression(argument);
                return self.undefined_temp();
            }
            UnaryOperator::TypeOf | UnaryOperator::Delete => {
                let builtin = if operator == UnaryOperator::TypeOf {
                    Builtin::Typeof
                } else {
                    Builtin::Delete
                };
                let arg = match argument {
                    ExpressionType::Identifier { name, .. } => {
                        self.note_identifier(name);
                        self.name_expr(name)
                    }
                    ExpressionType::MemberExpression { .. } | ExpressionType::IndexExpression { .. } => {
                        let r = self.reference(argument);
                        self.reference_expr(&r)
                    }
                    other => {
                        let t = self.expression(other);
                        if builtin == Builtin::Delete {
                            return self.move_to_temp(
                                Type::Bool,
                                Expr::Const {
                                    ty: Type::Bool,
                                    value: 1.0,
                                },
                            );
                        }
                        Expr::Temp(t)
                    }
                };
                self.note_call(1);
                let ty = if builtin == Builtin::Typeof { Type::String } else { Type::Var };
                return self.move_to_temp(ty, call(builtin, vec![arg]));
            }
        };
        let v = self.expression(argument);
        self.move_to_temp(
            op.result_type(),
            Expr::Unop {
                op,
                expr: Box::new(Expr::Temp(v)),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn module(script: &str) -> Module {
        let program = match parse_program(script, false) {
            Ok(p) => p,
            Err(e) => panic!("{} did not parse: {}", script, e),
        };
        generate(&program, "test.js", CompilationMode::GlobalCode)
    }

    fn calls_of(f: &Function, builtin: Builtin) -> usize {
        let mut n = 0;
        for b in &f.blocks {
            for s in &b.statements {
                let e = match s {
                    Stmt::Exp(e) => e,
                    Stmt::Move { source, .. } => source,
                    _ => continue,
                };
                if let Expr::Call { base, .. } = e {
                    if matches!(**base, Expr::Name { builtin: b, .. } if b == builtin) {
                        n += 1;
                    }
                }
            }
        }
        n
    }

    #[test]
    fn test_every_block_is_terminated() {
        let m = module(
            "var i = 0; while (i < 3) { if (i == 1) break; i++ } \
             function f(a) { return a ? 1 : 2; return 3 } try { f() } catch (e) {} finally { i = 0 }",
        );
        for f in &m.functions {
            for b in &f.blocks {
                assert!(b.is_terminated(), "L{} of {}\n{}", b.index, f.display_name(), f);
            }
        }
    }

    #[test]
    fn test_global_declarations() {
        let m = module("var x = 1; function f(a, a) { return a } f(1, 2)");
        let root = m.root().unwrap();
        assert_eq!(calls_of(root, Builtin::DeclareVars), 1);
        let text = root.to_string();
        assert!(text.contains("builtin_declare_vars(false, \"x\", \"f\")"), "{}", text);
        assert!(text.contains("f = %"), "{}", text);
        assert_eq!(m.functions.len(), 2);
        assert_eq!(root.nested, vec![1]);
        assert_eq!(m.functions[1].formals.len(), 2);
        assert!(root.flags.has_nested_functions);
    }

    #[test]
    fn test_global_flag_on_names() {
        let m = module("var g; function f(a) { var l; return a + l + g } ");
        let f = &m.functions[1];
        let mut names = Vec::new();
        for b in &f.blocks {
            for s in &b.statements {
                if let Stmt::Move {
                    source: Expr::Name { id, global, .. },
                    ..
                } = s
                {
                    names.push((id.to_string(), *global));
                }
            }
        }
        assert!(names.contains(&("a".to_string(), false)));
        assert!(names.contains(&("l".to_string(), false)));
        assert!(names.contains(&("g".to_string(), true)));
    }

    #[test]
    fn test_with_disables_global_names() {
        let m = module("with (o) { x }");
        let root = m.root().unwrap();
        assert!(root.flags.has_with_or_catch);
        assert!(!root.to_string().is_empty());
        for b in &root.blocks {
            for s in &b.statements {
                if let Stmt::Move {
                    source: Expr::Name { global, .. },
                    ..
                } = s
                {
                    assert!(!global);
                }
            }
        }
        assert_eq!(calls_of(root, Builtin::PushWithScope), 1);
        // once on the way out, once in the exception cleanup
        assert_eq!(calls_of(root, Builtin::PopScope), 2);
    }

    #[test]
    fn test_arguments_becomes_a_local() {
        let m = module("function f() { return arguments.length }");
        let f = &m.functions[1];
        assert!(f.flags.uses_arguments);
        assert!(f.locals.iter().any(|l| &**l == "arguments"));
        assert_eq!(calls_of(f, Builtin::SetupArgumentsObject), 1);
    }

    #[test]
    fn test_sloppy_this_is_converted() {
        let m = module("function f() { return this } function g() { 'use strict'; return this }");
        assert_eq!(calls_of(&m.functions[1], Builtin::ConvertThisToObject), 1);
        assert_eq!(calls_of(&m.functions[2], Builtin::ConvertThisToObject), 0);
        assert!(m.functions[2].flags.uses_this);
    }

    #[test]
    fn test_try_blocks_have_handlers() {
        let m = module("try { a() } catch (e) { b(e) }");
        let root = m.root().unwrap();
        assert!(root.blocks.iter().any(|b| b.catch_block.is_some()));
        assert_eq!(calls_of(root, Builtin::UnwindException), 1);
        assert_eq!(calls_of(root, Builtin::PushCatchScope), 1);
        assert_eq!(calls_of(root, Builtin::ReThrow), 1);
    }

    #[test]
    fn test_return_inlines_finally() {
        let m = module("function f() { try { return 1 } finally { g() } }");
        let f = &m.functions[1];
        let calls_to_g = f
            .blocks
            .iter()
            .flat_map(|b| b.statements.iter())
            .filter(|s| s.to_string().contains("g("))
            .count();
        // once on the return path, once in the shared finally block
        assert_eq!(calls_to_g, 2);
    }

    #[test]
    fn test_array_holes_are_missing() {
        let m = module("[1,,2]");
        let text = m.root().unwrap().to_string();
        assert!(text.contains("builtin_define_array(%"), "{}", text);
        assert!(text.contains("<hole>"), "{}", text);
    }

    #[test]
    fn test_typed_temps() {
        let m = module("var a = 1, b = 2; a | b; a >>> b; a < b; -0; 1.5");
        let root = m.root().unwrap();
        let mut types = Vec::new();
        for b in &root.blocks {
            for s in &b.statements {
                if let Stmt::Move {
                    target: Expr::Temp(t),
                    source: Expr::Binop { .. } | Expr::Const { .. },
                    ..
                } = s
                {
                    types.push(t.ty);
                }
            }
        }
        assert!(types.contains(&Type::SInt32));
        assert!(types.contains(&Type::UInt32));
        assert!(types.contains(&Type::Bool));
        assert!(types.contains(&Type::Double));
    }

    #[test]
    fn test_call_shapes_and_max_args() {
        let m = module("o.m(1, 2, 3); o[k](); f(); (g)(1)");
        let root = m.root().unwrap();
        assert_eq!(root.max_call_args, 3);
        let text = root.to_string();
        assert!(text.contains(".m(%"), "{}", text);
        assert!(text.contains("f()"), "{}", text);
    }

    #[test]
    fn test_eval_code_names_are_not_global() {
        let program = parse_program("var x = y", false).unwrap();
        let m = generate(&program, "eval.js", CompilationMode::EvalCode);
        let text = m.root().unwrap().to_string();
        assert!(text.contains("builtin_declare_vars(true, \"x\")"), "{}", text);
        for b in &m.root().unwrap().blocks {
            for s in &b.statements {
                if let Stmt::Move {
                    source: Expr::Name { global, .. },
                    ..
                } = s
                {
                    assert!(!global);
                }
            }
        }
    }
}
