//! Lowers IR functions to moth bytecode.
//!
//! Every IR temporary is a register. Blocks are laid out in index order;
//! jumps are resolved once the whole function has been emitted.

use std::rc::Rc;

use crate::runner::ir::{AluOp, BlockId, Function, Stmt, Temp, Type};
use crate::runner::isel::generator::JsUnitGenerator;
use crate::runner::isel::unit::BackendCode;
use crate::runner::isel::{EvalInstructionSelection, IrDecoder, IselError, LiteralKind};
use crate::runner::moth::instr::{BytecodeFunction, Instruction, OpCode, NO_HANDLER, NO_REGISTER};
use crate::runner::runtime;

fn reg(t: Temp) -> u32 {
    t.index
}

fn result_reg(result: Option<Temp>) -> u32 {
    result.map_or(NO_REGISTER, reg)
}

pub struct MothInstructionSelection {
    generator: JsUnitGenerator,
    use_fast_lookups: bool,
    functions: Vec<Rc<BytecodeFunction>>,
    current: BytecodeFunction,
    function_name: String,
    /// `(instruction, block)` pairs waiting for the block's address.
    patches: Vec<(usize, BlockId)>,
    error: Option<IselError>,
}

impl MothInstructionSelection {
    pub fn new() -> Self {
        MothInstructionSelection {
            generator: JsUnitGenerator::new(),
            use_fast_lookups: true,
            functions: Vec::new(),
            current: BytecodeFunction::new(),
            function_name: String::new(),
            patches: Vec::new(),
            error: None,
        }
    }

    fn emit(&mut self, instr: Instruction) -> usize {
        self.current.emit(instr)
    }

    fn name(&mut self, name: &str) -> u32 {
        self.generator.register_string(name)
    }

    fn jump_to(&mut self, op: OpCode, cond: u32, target: BlockId) {
        let pos = self.emit(Instruction::with_src_imm(op, cond, 0));
        self.patches.push((pos, target));
    }

    fn emit_call(&mut self, op: OpCode, dst: u32, src1: u32, src2: u32, args: &[Temp]) {
        let args = self.current.add_args(args.iter().map(|t| reg(*t)).collect());
        self.emit(Instruction::new(op, dst, src1, src2, args));
    }
}

impl Default for MothInstructionSelection {
    fn default() -> Self {
        MothInstructionSelection::new()
    }
}

impl IrDecoder for MothInstructionSelection {
    fn call_builtin_invalid(&mut self, stmt: &Stmt) {
        if self.error.is_none() {
            self.error = Some(IselError::UnsupportedStatement {
                function: self.function_name.clone(),
                statement: stmt.to_string(),
            });
        }
    }

    fn call_builtin_typeof_member(&mut self, base: Temp, name: &Rc<str>, result: Option<Temp>) {
        let n = self.name(name);
        self.emit(Instruction::new(OpCode::TypeofMember, result_reg(result), reg(base), 0, n));
    }

    fn call_builtin_typeof_subscript(&mut self, base: Temp, index: Temp, result: Option<Temp>) {
        self.emit(Instruction::with_dst_srcs(OpCode::TypeofElement, result_reg(result), reg(base), reg(index)));
    }

    fn call_builtin_typeof_name(&mut self, name: &Rc<str>, result: Option<Temp>) {
        let n = self.name(name);
        self.emit(Instruction::with_dst_imm(OpCode::TypeofName, result_reg(result), n));
    }

    fn call_builtin_typeof_value(&mut self, value: Temp, result: Option<Temp>) {
        self.emit(Instruction::with_dst_src(OpCode::TypeofValue, result_reg(result), reg(value)));
    }

    fn call_builtin_delete_member(&mut self, base: Temp, name: &Rc<str>, result: Option<Temp>) {
        let n = self.name(name);
        self.emit(Instruction::new(OpCode::DeleteMember, result_reg(result), reg(base), 0, n));
    }

    fn call_builtin_delete_subscript(&mut self, base: Temp, index: Temp, result: Option<Temp>) {
        self.emit(Instruction::with_dst_srcs(OpCode::DeleteElement, result_reg(result), reg(base), reg(index)));
    }

    fn call_builtin_delete_name(&mut self, name: &Rc<str>, result: Option<Temp>) {
        let n = self.name(name);
        self.emit(Instruction::with_dst_imm(OpCode::DeleteName, result_reg(result), n));
    }

    fn call_builtin_delete_value(&mut self, result: Option<Temp>) {
        if let Some(t) = result {
            let c = self.current.add_constant(runtime::constant_value(Type::Bool, 0.0));
            self.emit(Instruction::with_dst_imm(OpCode::LoadConst, reg(t), c));
        }
    }

    fn call_builtin_throw(&mut self, arg: Temp) {
        self.emit(Instruction::with_src_imm(OpCode::Throw, reg(arg), 0));
    }

    fn call_builtin_rethrow(&mut self) {
        self.current.emit_op(OpCode::ReThrow);
    }

    fn call_builtin_unwind_exception(&mut self, result: Option<Temp>) {
        self.emit(Instruction::with_dst(OpCode::UnwindException, result_reg(result)));
    }

    fn call_builtin_push_catch_scope(&mut self, name: &Rc<str>, value: Temp) {
        let n = self.name(name);
        self.emit(Instruction::with_src_imm(OpCode::PushCatchScope, reg(value), n));
    }

    fn call_builtin_foreach_iterator_object(&mut self, arg: Temp, result: Option<Temp>) {
        self.emit(Instruction::with_dst_src(OpCode::ForeachIterator, result_reg(result), reg(arg)));
    }

    fn call_builtin_foreach_next_property_name(&mut self, arg: Temp, result: Option<Temp>) {
        self.emit(Instruction::with_dst_src(OpCode::ForeachNextName, result_reg(result), reg(arg)));
    }

    fn call_builtin_push_with_scope(&mut self, arg: Temp) {
        self.emit(Instruction::with_src_imm(OpCode::PushWithScope, reg(arg), 0));
    }

    fn call_builtin_pop_scope(&mut self) {
        self.current.emit_op(OpCode::PopScope);
    }

    fn call_builtin_declare_vars(&mut self, deletable: bool, names: &[Rc<str>]) {
        for name in names {
            let n = self.name(name);
            self.emit(Instruction::with_src_imm(OpCode::DeclareVar, deletable as u32, n));
        }
    }

    fn call_builtin_define_array(&mut self, result: Option<Temp>, elements: &[Option<Temp>]) {
        let regs = elements.iter().map(|e| e.map_or(NO_REGISTER, reg)).collect();
        let args = self.current.add_args(regs);
        self.emit(Instruction::with_dst_imm(OpCode::DefineArray, result_reg(result), args));
    }

    fn call_builtin_define_object_literal(&mut self, result: Option<Temp>, properties: &[(Rc<str>, LiteralKind, Temp)]) {
        let shape: Vec<(&str, bool)> = properties
            .iter()
            .map(|(key, kind, _)| (&**key, *kind != LiteralKind::Data))
            .collect();
        let class = self.generator.register_js_class(&shape);
        let mut entries = Vec::with_capacity(properties.len());
        for (key, kind, value) in properties {
            entries.push((self.name(key), *kind, reg(*value)));
        }
        let literal = self.current.add_literal(entries);
        self.emit(Instruction::new(
            OpCode::DefineObjectLiteral,
            result_reg(result),
            class,
            0,
            literal,
        ));
    }

    fn call_builtin_setup_arguments_object(&mut self, result: Option<Temp>) {
        self.emit(Instruction::with_dst(OpCode::SetupArguments, result_reg(result)));
    }

    fn call_builtin_convert_this_to_object(&mut self) {
        self.current.emit_op(OpCode::ConvertThis);
    }

    fn call_value(&mut self, value: Temp, args: &[Temp], result: Option<Temp>) {
        self.emit_call(OpCode::CallValue, result_reg(result), reg(value), 0, args);
    }

    fn call_property(&mut self, base: Temp, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        self.emit_call(OpCode::CallProperty, result_reg(result), reg(base), n, args);
    }

    fn call_subscript(&mut self, base: Temp, index: Temp, args: &[Temp], result: Option<Temp>) {
        self.emit_call(OpCode::CallElement, result_reg(result), reg(base), reg(index), args);
    }

    fn call_activation_property(&mut self, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        self.emit_call(OpCode::CallName, result_reg(result), n, 0, args);
    }

    fn construct_activation_property(&mut self, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        self.emit_call(OpCode::ConstructName, result_reg(result), n, 0, args);
    }

    fn construct_property(&mut self, base: Temp, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        self.emit_call(OpCode::ConstructProperty, result_reg(result), reg(base), n, args);
    }

    fn construct_value(&mut self, value: Temp, args: &[Temp], result: Option<Temp>) {
        self.emit_call(OpCode::ConstructValue, result_reg(result), reg(value), 0, args);
    }

    fn load_this_object(&mut self, target: Temp) {
        self.emit(Instruction::with_dst(OpCode::LoadThis, reg(target)));
    }

    fn load_const(&mut self, ty: Type, value: f64, target: Temp) {
        let c = self.current.add_constant(runtime::constant_value(ty, value));
        self.emit(Instruction::with_dst_imm(OpCode::LoadConst, reg(target), c));
    }

    fn load_string(&mut self, s: &Rc<str>, target: Temp) {
        let n = self.name(s);
        self.emit(Instruction::with_dst_imm(OpCode::LoadString, reg(target), n));
    }

    fn load_regexp(&mut self, source: &Rc<str>, flags: &Rc<str>, target: Temp) {
        let r = self.generator.register_regexp(source, flags);
        self.emit(Instruction::with_dst_imm(OpCode::LoadRegExp, reg(target), r));
    }

    fn get_activation_property(&mut self, name: &Rc<str>, global: bool, target: Temp) {
        if self.use_fast_lookups && global {
            let l = self.generator.register_global_getter_lookup(name);
            self.emit(Instruction::with_dst_imm(OpCode::LoadGlobalLookup, reg(target), l));
        } else {
            let n = self.name(name);
            self.emit(Instruction::with_dst_imm(OpCode::LoadName, reg(target), n));
        }
    }

    fn set_activation_property(&mut self, source: Temp, name: &Rc<str>) {
        let n = self.name(name);
        self.emit(Instruction::with_src_imm(OpCode::StoreName, reg(source), n));
    }

    fn init_closure(&mut self, function: usize, target: Temp) {
        self.emit(Instruction::with_dst_imm(OpCode::LoadClosure, reg(target), function as u32));
    }

    fn get_property(&mut self, base: Temp, name: &Rc<str>, target: Temp) {
        if self.use_fast_lookups {
            let l = self.generator.register_getter_lookup(name);
            self.emit(Instruction::new(OpCode::GetLookup, reg(target), reg(base), 0, l));
        } else {
            let n = self.name(name);
            self.emit(Instruction::new(OpCode::LoadProperty, reg(target), reg(base), 0, n));
        }
    }

    fn set_property(&mut self, source: Temp, base: Temp, name: &Rc<str>) {
        if self.use_fast_lookups {
            let l = self.generator.register_setter_lookup(name);
            self.emit(Instruction::with_srcs_imm(OpCode::SetLookup, reg(source), reg(base), l));
        } else {
            let n = self.name(name);
            self.emit(Instruction::with_srcs_imm(OpCode::StoreProperty, reg(source), reg(base), n));
        }
    }

    fn get_element(&mut self, base: Temp, index: Temp, target: Temp) {
        self.emit(Instruction::with_dst_srcs(OpCode::LoadElement, reg(target), reg(base), reg(index)));
    }

    fn set_element(&mut self, source: Temp, base: Temp, index: Temp) {
        self.emit(Instruction::with_dst_srcs(OpCode::StoreElement, reg(source), reg(base), reg(index)));
    }

    fn copy_value(&mut self, source: Temp, target: Temp) {
        if source.index != target.index {
            self.emit(Instruction::with_dst_src(OpCode::Move, reg(target), reg(source)));
        }
    }

    fn swap_values(&mut self, a: Temp, b: Temp) {
        self.emit(Instruction::with_srcs_imm(OpCode::Swap, reg(a), reg(b), 0));
    }

    fn convert_type(&mut self, source: Temp, target: Temp, ty: Type) {
        self.emit(Instruction::new(OpCode::Convert, reg(target), reg(source), 0, ty.code()));
    }

    fn unop(&mut self, op: AluOp, source: Temp, target: Temp) {
        self.emit(Instruction::new(OpCode::Unop, reg(target), reg(source), 0, op.code()));
    }

    fn binop(&mut self, op: AluOp, left: Temp, right: Temp, target: Temp) {
        self.emit(Instruction::new(OpCode::Binop, reg(target), reg(left), reg(right), op.code()));
    }

    fn visit_jump(&mut self, target: BlockId) {
        self.jump_to(OpCode::Jump, 0, target);
    }

    fn visit_cjump(&mut self, cond: Temp, iftrue: BlockId, iffalse: BlockId) {
        self.jump_to(OpCode::JumpIfTrue, reg(cond), iftrue);
        self.jump_to(OpCode::Jump, 0, iffalse);
    }

    fn visit_ret(&mut self, value: Temp) {
        self.emit(Instruction::with_src_imm(OpCode::Ret, reg(value), 0));
    }
}

impl EvalInstructionSelection for MothInstructionSelection {
    fn generator(&mut self) -> &mut JsUnitGenerator {
        &mut self.generator
    }

    fn use_fast_lookups(&self) -> bool {
        self.use_fast_lookups
    }

    fn set_use_fast_lookups(&mut self, on: bool) {
        self.use_fast_lookups = on;
    }

    fn run(&mut self, _index: usize, function: &Function) -> Result<(), IselError> {
        self.current = BytecodeFunction::new();
        self.current.set_register_count(function.temp_count);
        self.function_name = function.display_name().to_string();
        self.patches.clear();

        let has_handlers = function.blocks.iter().any(|b| b.catch_block.is_some());
        let mut block_starts = Vec::with_capacity(function.blocks.len());
        let mut handler_patches = Vec::new();
        for block in &function.blocks {
            block_starts.push(self.current.current_pos() as u32);
            if has_handlers {
                let pos = self.emit(Instruction::with_dst_imm(OpCode::SetExceptionHandler, NO_REGISTER, NO_HANDLER));
                if let Some(c) = block.catch_block {
                    handler_patches.push((pos, c));
                }
            }
            for stmt in &block.statements {
                self.visit_statement(stmt);
            }
        }
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        for (pos, block) in self.patches.drain(..).chain(handler_patches) {
            self.current.patch_jump(pos, block_starts[block]);
        }

        let code = std::mem::take(&mut self.current);
        tracing::trace!(
            target: "jsv4::isel",
            function = %self.function_name,
            instructions = code.code.len(),
            registers = code.register_count,
            "moth function"
        );
        self.functions.push(Rc::new(code));
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<BackendCode, IselError> {
        Ok(BackendCode::Moth(self.functions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::runner::ir::codegen::{generate, CompilationMode};
    use crate::runner::isel::unit::CompilationUnit;

    fn compile(script: &str, fast: bool) -> CompilationUnit {
        let program = match parse_program(script, false) {
            Ok(p) => p,
            Err(e) => panic!("{}", e),
        };
        let module = generate(&program, "test.js", CompilationMode::GlobalCode);
        let mut isel: Box<dyn EvalInstructionSelection> = Box::new(MothInstructionSelection::new());
        isel.set_use_fast_lookups(fast);
        match isel.compile(&module) {
            Ok(u) => u,
            Err(e) => panic!("{}", e),
        }
    }

    fn functions(unit: &CompilationUnit) -> &[Rc<BytecodeFunction>] {
        match &unit.backend {
            BackendCode::Moth(f) => f,
            BackendCode::Jit(_) => panic!("expected bytecode"),
        }
    }

    fn ops(f: &BytecodeFunction) -> Vec<OpCode> {
        f.code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn test_lookups_follow_the_switch() {
        let fast = compile("var o = {}; o.a = o.b;", true);
        let slow = compile("var o = {}; o.a = o.b;", false);
        let f = ops(&functions(&fast)[0]);
        assert!(f.contains(&OpCode::GetLookup));
        assert!(f.contains(&OpCode::SetLookup));
        assert!(!fast.data.lookups.is_empty());
        let s = ops(&functions(&slow)[0]);
        assert!(s.contains(&OpCode::LoadProperty));
        assert!(s.contains(&OpCode::StoreProperty));
        assert!(!s.contains(&OpCode::GetLookup));
        assert!(slow.data.lookups.is_empty());
    }

    #[test]
    fn test_jumps_land_on_block_starts() {
        let unit = compile("var i = 0; while (i < 3) i = i + 1;", true);
        let f = &functions(&unit)[0];
        for instr in &f.code {
            if matches!(instr.op, OpCode::Jump | OpCode::JumpIfTrue | OpCode::JumpIfFalse) {
                assert!((instr.imm as usize) < f.code.len());
            }
        }
        assert_eq!(f.code.last().map(|i| i.op), Some(OpCode::Ret));
    }

    #[test]
    fn test_handlers_are_set_per_block() {
        let unit = compile("try { x(); } catch (e) { }", true);
        let f = &functions(&unit)[0];
        let handlers: Vec<&Instruction> = f.code.iter().filter(|i| i.op == OpCode::SetExceptionHandler).collect();
        assert!(handlers.iter().any(|i| i.imm != NO_HANDLER));
        assert!(handlers.iter().any(|i| i.imm == NO_HANDLER));

        let plain = compile("x();", true);
        assert!(!ops(&functions(&plain)[0]).contains(&OpCode::SetExceptionHandler));
    }

    #[test]
    fn test_nested_functions_get_their_own_code() {
        let unit = compile("function f(a) { return a + 1; }", true);
        assert_eq!(functions(&unit).len(), 2);
        assert_eq!(unit.function_count(), 2);
        let f = &functions(&unit)[1];
        assert!(ops(f).contains(&OpCode::Binop));
        assert!(unit.dump().contains("== f =="));
    }
}
