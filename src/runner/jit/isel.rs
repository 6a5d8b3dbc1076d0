//! Lowers IR functions to machine code.
//!
//! Every temp lives in its own stack slot; each statement loads what it
//! needs into scratch registers and stores the result back. Arithmetic on
//! integers and boolean negation get inline fast paths, everything else
//! calls into the runtime.

use std::rc::Rc;
use std::sync::Arc;

use crate::runner::config::TargetKind;
use crate::runner::ds::value::{Value, NAN_ENCODE_MASK, TAG_SHIFT};
use crate::runner::executable_allocator::{Allocation, ExecutableAllocator};
use crate::runner::ir::{AluOp, BlockId, Expr, Function, Stmt, Temp, Type};
use crate::runner::isel::generator::JsUnitGenerator;
use crate::runner::isel::unit::{BackendCode, NativeCode};
use crate::runner::isel::{EvalInstructionSelection, IrDecoder, IselError, LiteralKind};
use crate::runner::jit::assembler::{Arg, Assembler, Label};
use crate::runner::jit::masm::{AluOp32, Cond, Insn, Reg, UnaryOp32};
use crate::runner::jit::runtime_calls::RuntimeCall;
use crate::runner::jit::stack_layout::StackLayout;
use crate::runner::jit::target::{descriptor, TargetDescriptor};
use crate::runner::runtime;

/// Stack slots reserved for values in flight, used by `swap_values`.
const SAVED_VALUE_COUNT: u32 = 1;

const INTEGER_TAG: u64 = 5;
const BOOLEAN_TRUE: u64 = Value::from_bool(true).raw();
const BOOLEAN_FALSE: u64 = Value::from_bool(false).raw();

fn int_alu(op: AluOp) -> Option<AluOp32> {
    Some(match op {
        AluOp::Add => AluOp32::Add,
        AluOp::Sub => AluOp32::Sub,
        AluOp::Mul => AluOp32::Mul,
        AluOp::BitAnd => AluOp32::And,
        AluOp::BitOr => AluOp32::Or,
        AluOp::BitXor => AluOp32::Xor,
        AluOp::LShift => AluOp32::Shl,
        AluOp::RShift => AluOp32::Sar,
        AluOp::URShift => AluOp32::Shr,
        _ => return None,
    })
}

fn int_compare(op: AluOp) -> Option<Cond> {
    Some(match op {
        AluOp::Gt => Cond::Gt,
        AluOp::Lt => Cond::Lt,
        AluOp::Ge => Cond::Ge,
        AluOp::Le => Cond::Le,
        AluOp::Equal | AluOp::StrictEqual => Cond::Eq,
        AluOp::NotEqual | AluOp::StrictNotEqual => Cond::Ne,
        _ => return None,
    })
}

/// Largest argument array any statement of `function` builds.
fn max_call_args(function: &Function) -> u32 {
    fn visit(e: &Expr, max: &mut u32) {
        match e {
            Expr::Call { base, args } | Expr::New { base, args } => {
                *max = (*max).max(args.len() as u32);
                visit(base, max);
                for a in args {
                    visit(a, max);
                }
            }
            Expr::Convert { expr, .. } | Expr::Unop { expr, .. } => visit(expr, max),
            Expr::Binop { left, right, .. } => {
                visit(left, max);
                visit(right, max);
            }
            Expr::Member { base, .. } => visit(base, max),
            Expr::Subscript { base, index } => {
                visit(base, max);
                visit(index, max);
            }
            _ => {}
        }
    }
    let mut max = function.max_call_args;
    for block in &function.blocks {
        for stmt in &block.statements {
            match stmt {
                Stmt::Move { target, source, .. } => {
                    visit(target, &mut max);
                    visit(source, &mut max);
                }
                Stmt::Exp(e) | Stmt::Ret(e) | Stmt::CJump { cond: e, .. } => visit(e, &mut max),
                Stmt::Jump(_) => {}
            }
        }
    }
    max
}

pub struct JitInstructionSelection {
    target: &'static dyn TargetDescriptor,
    allocator: Arc<ExecutableAllocator>,
    generator: JsUnitGenerator,
    use_fast_lookups: bool,
    asm: Assembler,
    block_labels: Vec<Label>,
    next_block: Option<BlockId>,
    function_name: String,
    error: Option<IselError>,

    code_refs: Vec<Allocation>,
    code_sizes: Vec<u32>,
    pool_offsets: Vec<u32>,
    constant_values: Vec<Vec<Value>>,
}

impl JitInstructionSelection {
    pub fn new(target: TargetKind, allocator: Arc<ExecutableAllocator>) -> Self {
        let d = descriptor(target);
        JitInstructionSelection {
            target: d,
            allocator,
            generator: JsUnitGenerator::new(),
            use_fast_lookups: true,
            asm: Assembler::new(d, StackLayout::new(d, 0, 0, 0)),
            block_labels: Vec::new(),
            next_block: None,
            function_name: String::new(),
            error: None,
            code_refs: Vec::new(),
            code_sizes: Vec::new(),
            pool_offsets: Vec::new(),
            constant_values: Vec::new(),
        }
    }

    fn name(&mut self, name: &str) -> u32 {
        self.generator.register_string(name)
    }

    fn call(&mut self, result: Option<Temp>, call: RuntimeCall, args: &[Arg]) {
        self.asm.generate_function_call_imp(result, call, args);
    }

    /// Copies `args` into the outgoing argument array and returns the
    /// array pointer and count arguments.
    fn prepare_call_args(&mut self, args: &[Temp]) -> [Arg; 2] {
        for (i, t) in args.iter().enumerate() {
            let from = self.asm.temp_address(*t);
            let to = self.asm.layout().call_argument(i as u32);
            self.asm.copy_value(from, to);
        }
        [
            Arg::Pointer(self.asm.layout().call_arguments_base()),
            Arg::Imm(args.len() as u64),
        ]
    }

    fn scratch(&self) -> Reg {
        self.target.scratch_register()
    }

    /// Jumps to `slow` unless the value in `r` is tagged as an integer.
    fn branch_if_not_integer(&mut self, r: Reg, slow: Label) {
        let s2 = self.target.scratch_register2();
        self.asm.emit(Insn::Mov { dst: s2, src: r });
        self.asm.emit(Insn::ShrImm {
            dst: s2,
            amount: TAG_SHIFT as u8,
        });
        self.asm.emit(Insn::CmpImm {
            a: s2,
            imm: INTEGER_TAG as i32,
        });
        self.asm.branch(Cond::Ne, slow);
    }

    fn load_integer_operand(&mut self, r: Reg, t: Temp, slow: Label) {
        self.asm.load_temp(r, t);
        if t.ty != Type::SInt32 {
            self.branch_if_not_integer(r, slow);
        }
    }

    fn box_integer(&mut self, r: Reg) {
        self.asm.or_imm64(r, INTEGER_TAG << TAG_SHIFT);
    }

    fn inline_int_binop(&mut self, op: AluOp, alu: AluOp32, left: Temp, right: Temp, target: Temp) {
        let s = self.scratch();
        let r = self.target.return_value_register();
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        self.load_integer_operand(s, left, slow);
        self.load_integer_operand(r, right, slow);
        self.asm.emit(Insn::Alu32 { op: alu, dst: s, src: r });
        if matches!(alu, AluOp32::Add | AluOp32::Sub | AluOp32::Mul) {
            self.asm.branch(Cond::Overflow, slow);
        }
        if alu == AluOp32::Mul {
            // a zero product may have to be -0
            self.asm.branch(Cond::Eq, slow);
        }
        if op == AluOp::URShift {
            let as_double = self.asm.new_label();
            self.asm.emit(Insn::CmpImm {
                a: s,
                imm: i32::MAX,
            });
            self.asm.branch(Cond::AboveEq, as_double);
            self.box_integer(s);
            self.asm.store_temp(s, target);
            self.asm.jump(done);

            self.asm.bind(as_double);
            let f = self.target.fp_scratch_register1();
            self.asm.emit(Insn::CvtU32ToF64 { dst: f, src: s });
            self.asm.emit(Insn::MovFromF64 { dst: s, src: f });
            self.asm.xor_imm64(s, NAN_ENCODE_MASK);
            self.asm.store_temp(s, target);
            self.asm.jump(done);
        } else {
            self.box_integer(s);
            self.asm.store_temp(s, target);
            self.asm.jump(done);
        }

        self.asm.bind(slow);
        self.call(
            Some(target),
            RuntimeCall::Binop,
            &[Arg::ContextRegister, Arg::Imm(op.code() as u64), Arg::Temp(left), Arg::Temp(right)],
        );
        self.asm.bind(done);
    }

    fn inline_int_compare(&mut self, op: AluOp, cond: Cond, left: Temp, right: Temp, target: Temp) {
        let s = self.scratch();
        let r = self.target.return_value_register();
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let is_true = self.asm.new_label();
        let store = self.asm.new_label();
        self.load_integer_operand(s, left, slow);
        self.load_integer_operand(r, right, slow);
        self.asm.emit(Insn::Cmp32 { a: s, b: r });
        self.asm.branch(cond, is_true);
        self.asm.emit(Insn::MovImm64 {
            dst: s,
            imm: BOOLEAN_FALSE,
        });
        self.asm.jump(store);
        self.asm.bind(is_true);
        self.asm.emit(Insn::MovImm64 { dst: s, imm: BOOLEAN_TRUE });
        self.asm.bind(store);
        self.asm.store_temp(s, target);
        self.asm.jump(done);

        self.asm.bind(slow);
        self.call(
            Some(target),
            RuntimeCall::Binop,
            &[Arg::ContextRegister, Arg::Imm(op.code() as u64), Arg::Temp(left), Arg::Temp(right)],
        );
        self.asm.bind(done);
    }

    fn runtime_unop(&mut self, op: AluOp, source: Temp, target: Temp) {
        self.call(
            Some(target),
            RuntimeCall::Unop,
            &[Arg::ContextRegister, Arg::Imm(op.code() as u64), Arg::Temp(source)],
        );
    }
}

impl Drop for JitInstructionSelection {
    fn drop(&mut self) {
        for a in self.code_refs.drain(..) {
            self.allocator.free(a);
        }
    }
}

impl IrDecoder for JitInstructionSelection {
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
        self.call(
            result,
            RuntimeCall::TypeofMember,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::StringRef(n)],
        );
    }

    fn call_builtin_typeof_subscript(&mut self, base: Temp, index: Temp, result: Option<Temp>) {
        self.call(
            result,
            RuntimeCall::TypeofElement,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::Temp(index)],
        );
    }

    fn call_builtin_typeof_name(&mut self, name: &Rc<str>, result: Option<Temp>) {
        let n = self.name(name);
        self.call(result, RuntimeCall::TypeofName, &[Arg::ContextRegister, Arg::StringRef(n)]);
    }

    fn call_builtin_typeof_value(&mut self, value: Temp, result: Option<Temp>) {
        self.call(result, RuntimeCall::TypeofValue, &[Arg::ContextRegister, Arg::Temp(value)]);
    }

    fn call_builtin_delete_member(&mut self, base: Temp, name: &Rc<str>, result: Option<Temp>) {
        let n = self.name(name);
        self.call(
            result,
            RuntimeCall::DeleteMember,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::StringRef(n)],
        );
    }

    fn call_builtin_delete_subscript(&mut self, base: Temp, index: Temp, result: Option<Temp>) {
        self.call(
            result,
            RuntimeCall::DeleteElement,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::Temp(index)],
        );
    }

    fn call_builtin_delete_name(&mut self, name: &Rc<str>, result: Option<Temp>) {
        let n = self.name(name);
        self.call(result, RuntimeCall::DeleteName, &[Arg::ContextRegister, Arg::StringRef(n)]);
    }

    fn call_builtin_delete_value(&mut self, result: Option<Temp>) {
        if let Some(t) = result {
            let to = self.asm.temp_address(t);
            self.asm.store_immediate(Value::from_bool(false), to);
        }
    }

    fn call_builtin_throw(&mut self, arg: Temp) {
        self.call(None, RuntimeCall::Throw, &[Arg::ContextRegister, Arg::Temp(arg)]);
    }

    fn call_builtin_rethrow(&mut self) {
        self.asm.jump_to_exception_handler();
    }

    fn call_builtin_unwind_exception(&mut self, result: Option<Temp>) {
        self.call(result, RuntimeCall::UnwindException, &[Arg::ContextRegister]);
    }

    fn call_builtin_push_catch_scope(&mut self, name: &Rc<str>, value: Temp) {
        let n = self.name(name);
        self.call(
            None,
            RuntimeCall::PushCatchScope,
            &[Arg::ContextRegister, Arg::StringRef(n), Arg::Temp(value)],
        );
    }

    fn call_builtin_foreach_iterator_object(&mut self, arg: Temp, result: Option<Temp>) {
        self.call(result, RuntimeCall::ForeachIteratorObject, &[Arg::ContextRegister, Arg::Temp(arg)]);
    }

    fn call_builtin_foreach_next_property_name(&mut self, arg: Temp, result: Option<Temp>) {
        self.call(result, RuntimeCall::ForeachNextPropertyName, &[Arg::ContextRegister, Arg::Temp(arg)]);
    }

    fn call_builtin_push_with_scope(&mut self, arg: Temp) {
        self.call(None, RuntimeCall::PushWithScope, &[Arg::ContextRegister, Arg::Temp(arg)]);
    }

    fn call_builtin_pop_scope(&mut self) {
        self.call(None, RuntimeCall::PopScope, &[Arg::ContextRegister]);
    }

    fn call_builtin_declare_vars(&mut self, deletable: bool, names: &[Rc<str>]) {
        for name in names {
            let n = self.name(name);
            self.call(
                None,
                RuntimeCall::DeclareVar,
                &[Arg::ContextRegister, Arg::Imm(deletable as u64), Arg::StringRef(n)],
            );
        }
    }

    fn call_builtin_define_array(&mut self, result: Option<Temp>, elements: &[Option<Temp>]) {
        for (i, e) in elements.iter().enumerate() {
            let to = self.asm.layout().call_argument(i as u32);
            match e {
                Some(t) => {
                    let from = self.asm.temp_address(*t);
                    self.asm.copy_value(from, to);
                }
                None => self.asm.store_immediate(Value::empty(), to),
            }
        }
        let base = self.asm.layout().call_arguments_base();
        self.call(
            result,
            RuntimeCall::DefineArray,
            &[Arg::ContextRegister, Arg::Pointer(base), Arg::Imm(elements.len() as u64)],
        );
    }

    fn call_builtin_define_object_literal(&mut self, result: Option<Temp>, properties: &[(Rc<str>, LiteralKind, Temp)]) {
        let shape: Vec<(&str, bool)> = properties
            .iter()
            .map(|(key, kind, _)| (&**key, *kind != LiteralKind::Data))
            .collect();
        let class = self.generator.register_js_class(&shape);
        for (i, (key, kind, value)) in properties.iter().enumerate() {
            let k = self.name(key);
            let slot = 3 * i as u32;
            let layout = self.asm.layout().clone();
            self.asm
                .store_immediate(Value::from_int32(k as i32), layout.call_argument(slot));
            self.asm
                .store_immediate(Value::from_int32(kind.code() as i32), layout.call_argument(slot + 1));
            let from = self.asm.temp_address(*value);
            self.asm.copy_value(from, layout.call_argument(slot + 2));
        }
        let base = self.asm.layout().call_arguments_base();
        self.call(
            result,
            RuntimeCall::DefineObjectLiteral,
            &[
                Arg::ContextRegister,
                Arg::Pointer(base),
                Arg::Imm(properties.len() as u64),
                Arg::Imm(class as u64),
            ],
        );
    }

    fn call_builtin_setup_arguments_object(&mut self, result: Option<Temp>) {
        self.call(result, RuntimeCall::SetupArgumentsObject, &[Arg::ContextRegister]);
    }

    fn call_builtin_convert_this_to_object(&mut self) {
        self.call(None, RuntimeCall::ConvertThisToObject, &[Arg::ContextRegister]);
    }

    fn call_value(&mut self, value: Temp, args: &[Temp], result: Option<Temp>) {
        let [ptr, argc] = self.prepare_call_args(args);
        self.call(
            result,
            RuntimeCall::CallValue,
            &[Arg::ContextRegister, Arg::Temp(value), ptr, argc],
        );
    }

    fn call_property(&mut self, base: Temp, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        let [ptr, argc] = self.prepare_call_args(args);
        self.call(
            result,
            RuntimeCall::CallProperty,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::StringRef(n), ptr, argc],
        );
    }

    fn call_subscript(&mut self, base: Temp, index: Temp, args: &[Temp], result: Option<Temp>) {
        let [ptr, argc] = self.prepare_call_args(args);
        self.call(
            result,
            RuntimeCall::CallElement,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::Temp(index), ptr, argc],
        );
    }

    fn call_activation_property(&mut self, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        let [ptr, argc] = self.prepare_call_args(args);
        self.call(
            result,
            RuntimeCall::CallActivationProperty,
            &[Arg::ContextRegister, Arg::StringRef(n), ptr, argc],
        );
    }

    fn construct_activation_property(&mut self, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        let [ptr, argc] = self.prepare_call_args(args);
        self.call(
            result,
            RuntimeCall::ConstructActivationProperty,
            &[Arg::ContextRegister, Arg::StringRef(n), ptr, argc],
        );
    }

    fn construct_property(&mut self, base: Temp, name: &Rc<str>, args: &[Temp], result: Option<Temp>) {
        let n = self.name(name);
        let [ptr, argc] = self.prepare_call_args(args);
        self.call(
            result,
            RuntimeCall::ConstructProperty,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::StringRef(n), ptr, argc],
        );
    }

    fn construct_value(&mut self, value: Temp, args: &[Temp], result: Option<Temp>) {
        let [ptr, argc] = self.prepare_call_args(args);
        self.call(
            result,
            RuntimeCall::ConstructValue,
            &[Arg::ContextRegister, Arg::Temp(value), ptr, argc],
        );
    }

    fn load_this_object(&mut self, target: Temp) {
        self.call(Some(target), RuntimeCall::LoadThis, &[Arg::ContextRegister]);
    }

    fn load_const(&mut self, ty: Type, value: f64, target: Temp) {
        let v = runtime::constant_value(ty, value);
        let to = self.asm.temp_address(target);
        if v.is_double() {
            self.asm.store_double(v, to);
        } else {
            self.asm.store_immediate(v, to);
        }
    }

    fn load_string(&mut self, s: &Rc<str>, target: Temp) {
        let n = self.name(s);
        self.call(Some(target), RuntimeCall::LoadString, &[Arg::ContextRegister, Arg::StringRef(n)]);
    }

    fn load_regexp(&mut self, source: &Rc<str>, flags: &Rc<str>, target: Temp) {
        let r = self.generator.register_regexp(source, flags);
        self.call(
            Some(target),
            RuntimeCall::LoadRegExp,
            &[Arg::ContextRegister, Arg::Imm(r as u64)],
        );
    }

    fn get_activation_property(&mut self, name: &Rc<str>, global: bool, target: Temp) {
        if self.use_fast_lookups && global {
            let l = self.generator.register_global_getter_lookup(name);
            self.call(
                Some(target),
                RuntimeCall::GetGlobalLookup,
                &[Arg::ContextRegister, Arg::Imm(l as u64)],
            );
        } else {
            let n = self.name(name);
            self.call(
                Some(target),
                RuntimeCall::GetActivationProperty,
                &[Arg::ContextRegister, Arg::StringRef(n)],
            );
        }
    }

    fn set_activation_property(&mut self, source: Temp, name: &Rc<str>) {
        let n = self.name(name);
        self.call(
            None,
            RuntimeCall::SetActivationProperty,
            &[Arg::ContextRegister, Arg::StringRef(n), Arg::Temp(source)],
        );
    }

    fn init_closure(&mut self, function: usize, target: Temp) {
        self.call(
            Some(target),
            RuntimeCall::Closure,
            &[Arg::ContextRegister, Arg::Imm(function as u64)],
        );
    }

    fn get_property(&mut self, base: Temp, name: &Rc<str>, target: Temp) {
        if self.use_fast_lookups {
            let l = self.generator.register_getter_lookup(name);
            self.call(
                Some(target),
                RuntimeCall::GetPropertyLookup,
                &[Arg::ContextRegister, Arg::Imm(l as u64), Arg::Temp(base)],
            );
        } else {
            let n = self.name(name);
            self.call(
                Some(target),
                RuntimeCall::GetProperty,
                &[Arg::ContextRegister, Arg::Temp(base), Arg::StringRef(n)],
            );
        }
    }

    fn set_property(&mut self, source: Temp, base: Temp, name: &Rc<str>) {
        if self.use_fast_lookups {
            let l = self.generator.register_setter_lookup(name);
            self.call(
                None,
                RuntimeCall::SetPropertyLookup,
                &[Arg::ContextRegister, Arg::Imm(l as u64), Arg::Temp(base), Arg::Temp(source)],
            );
        } else {
            let n = self.name(name);
            self.call(
                None,
                RuntimeCall::SetProperty,
                &[Arg::ContextRegister, Arg::Temp(base), Arg::StringRef(n), Arg::Temp(source)],
            );
        }
    }

    fn get_element(&mut self, base: Temp, index: Temp, target: Temp) {
        self.call(
            Some(target),
            RuntimeCall::GetElement,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::Temp(index)],
        );
    }

    fn set_element(&mut self, source: Temp, base: Temp, index: Temp) {
        self.call(
            None,
            RuntimeCall::SetElement,
            &[Arg::ContextRegister, Arg::Temp(base), Arg::Temp(index), Arg::Temp(source)],
        );
    }

    fn copy_value(&mut self, source: Temp, target: Temp) {
        if source.index != target.index {
            let from = self.asm.temp_address(source);
            let to = self.asm.temp_address(target);
            self.asm.copy_value(from, to);
        }
    }

    fn swap_values(&mut self, a: Temp, b: Temp) {
        let saved = self.asm.layout().saved_register_pointer(0);
        let pa = self.asm.temp_address(a);
        let pb = self.asm.temp_address(b);
        self.asm.copy_value(pa, saved);
        self.asm.copy_value(pb, pa);
        self.asm.copy_value(saved, pb);
    }

    fn convert_type(&mut self, source: Temp, target: Temp, ty: Type) {
        if source.ty == ty {
            self.copy_value(source, target);
            return;
        }
        self.call(
            Some(target),
            RuntimeCall::ConvertType,
            &[Arg::ContextRegister, Arg::Imm(ty.code() as u64), Arg::Temp(source)],
        );
    }

    fn unop(&mut self, op: AluOp, source: Temp, target: Temp) {
        let s = self.scratch();
        match op {
            AluOp::Not if source.ty == Type::Bool => {
                self.asm.load_temp(s, source);
                self.asm.xor_imm64(s, 1);
                self.asm.store_temp(s, target);
            }
            AluOp::UMinus | AluOp::Compl => {
                let slow = self.asm.new_label();
                let done = self.asm.new_label();
                self.load_integer_operand(s, source, slow);
                if op == AluOp::UMinus {
                    self.asm.emit(Insn::Unary32 {
                        op: UnaryOp32::Neg,
                        dst: s,
                    });
                    self.asm.branch(Cond::Overflow, slow);
                    // -0 is a double
                    self.asm.branch(Cond::Eq, slow);
                } else {
                    self.asm.emit(Insn::Unary32 {
                        op: UnaryOp32::Not,
                        dst: s,
                    });
                }
                self.box_integer(s);
                self.asm.store_temp(s, target);
                self.asm.jump(done);
                self.asm.bind(slow);
                self.runtime_unop(op, source, target);
                self.asm.bind(done);
            }
            _ => self.runtime_unop(op, source, target),
        }
    }

    fn binop(&mut self, op: AluOp, left: Temp, right: Temp, target: Temp) {
        if let Some(alu) = int_alu(op) {
            self.inline_int_binop(op, alu, left, right, target);
        } else if let Some(cond) = int_compare(op) {
            self.inline_int_compare(op, cond, left, right, target);
        } else {
            self.call(
                Some(target),
                RuntimeCall::Binop,
                &[Arg::ContextRegister, Arg::Imm(op.code() as u64), Arg::Temp(left), Arg::Temp(right)],
            );
        }
    }

    fn visit_jump(&mut self, target: BlockId) {
        if self.next_block != Some(target) {
            self.asm.jump(self.block_labels[target]);
        }
    }

    fn visit_cjump(&mut self, cond: Temp, iftrue: BlockId, iffalse: BlockId) {
        if cond.ty == Type::Bool {
            let s = self.scratch();
            let a = self.asm.temp_address(cond);
            self.asm.emit(Insn::Load32 {
                dst: s,
                base: a.base,
                disp: a.offset,
            });
            self.asm.emit(Insn::CmpImm { a: s, imm: 0 });
        } else {
            self.call(None, RuntimeCall::ToBoolean, &[Arg::ContextRegister, Arg::Temp(cond)]);
            let r = self.target.return_value_register();
            // the payload of the returned boolean
            self.asm.emit(Insn::Alu32 {
                op: AluOp32::And,
                dst: r,
                src: r,
            });
        }
        self.asm.branch(Cond::Ne, self.block_labels[iftrue]);
        self.visit_jump(iffalse);
    }

    fn visit_ret(&mut self, value: Temp) {
        self.asm.emit_return(value);
    }
}

impl EvalInstructionSelection for JitInstructionSelection {
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
        self.function_name = function.display_name().to_string();
        let layout = StackLayout::new(self.target, function.temp_count, max_call_args(function), SAVED_VALUE_COUNT);
        self.asm = Assembler::new(self.target, layout);
        self.asm.enter_standard_stack_frame();
        self.block_labels = function.blocks.iter().map(|_| self.asm.new_label()).collect();

        for (i, block) in function.blocks.iter().enumerate() {
            self.asm.bind(self.block_labels[i]);
            let catch = block.catch_block.map(|c| self.block_labels[c]);
            self.asm.set_catch_label(catch);
            self.next_block = if i + 1 < function.blocks.len() { Some(i + 1) } else { None };
            for stmt in &block.statements {
                self.visit_statement(stmt);
            }
        }
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        // falling off the last block returns undefined
        self.asm.set_catch_label(None);
        self.asm.emit(Insn::MovImm64 {
            dst: self.target.return_value_register(),
            imm: Value::undefined().raw(),
        });
        self.asm.leave_standard_stack_frame();
        self.asm.emit(Insn::Ret);

        let d = self.target;
        let asm = std::mem::replace(&mut self.asm, Assembler::new(d, StackLayout::new(d, 0, 0, 0)));
        let assembled = asm.finish()?;
        let allocation = self.allocator.allocate(assembled.size())?;
        let bytes = match assembled.link(allocation.start) {
            Ok(b) => b,
            Err(e) => {
                self.allocator.free(allocation);
                return Err(e.into());
            }
        };
        if let Err(e) = self.allocator.write(allocation.start, &bytes) {
            self.allocator.free(allocation);
            return Err(e.into());
        }
        tracing::trace!(
            target: "jsv4::jit",
            function = %self.function_name,
            address = allocation.start,
            code = assembled.pool_offset,
            constants = assembled.constants.len(),
            "native function"
        );
        self.code_refs.push(allocation);
        self.code_sizes.push(bytes.len() as u32);
        self.pool_offsets.push(assembled.pool_offset as u32);
        self.constant_values.push(assembled.constants);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<BackendCode, IselError> {
        Ok(BackendCode::Jit(NativeCode {
            target: self.target.kind(),
            code_refs: std::mem::take(&mut self.code_refs),
            code_sizes: std::mem::take(&mut self.code_sizes),
            pool_offsets: std::mem::take(&mut self.pool_offsets),
            constant_values: std::mem::take(&mut self.constant_values),
            allocator: self.allocator.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::runner::executable_allocator::HeapPageAllocator;
    use crate::runner::ir::codegen::{generate, CompilationMode};
    use crate::runner::isel::unit::CompilationUnit;
    use crate::runner::jit::masm::Insn;

    fn compile(script: &str, target: TargetKind, fast: bool) -> CompilationUnit {
        let program = match parse_program(script, false) {
            Ok(p) => p,
            Err(e) => panic!("{}", e),
        };
        let module = generate(&program, "test.js", CompilationMode::GlobalCode);
        let allocator = Arc::new(ExecutableAllocator::new(HeapPageAllocator::default(), 4096));
        let mut isel: Box<dyn EvalInstructionSelection> = Box::new(JitInstructionSelection::new(target, allocator));
        isel.set_use_fast_lookups(fast);
        match isel.compile(&module) {
            Ok(u) => u,
            Err(e) => panic!("{}", e),
        }
    }

    fn native(unit: &CompilationUnit) -> &NativeCode {
        match &unit.backend {
            BackendCode::Jit(n) => n,
            BackendCode::Moth(_) => panic!("expected native code"),
        }
    }

    fn instructions(unit: &CompilationUnit, index: usize) -> Vec<Insn> {
        let n = native(unit);
        let a = n.code_refs[index];
        let bytes = n.allocator.read(a.start, n.pool_offsets[index] as usize).unwrap();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            // the pool is aligned with zero bytes after the last instruction
            match Insn::decode(&bytes[pos..]) {
                Ok((i, len)) => {
                    out.push(i);
                    pos += len;
                }
                Err(_) => break,
            }
        }
        out
    }

    fn calls(insns: &[Insn]) -> Vec<RuntimeCall> {
        insns
            .iter()
            .filter_map(|i| match i {
                Insn::MovImm64 { imm, .. } => RuntimeCall::from_address(*imm),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_every_function_gets_code() {
        for target in TargetKind::ALL {
            let unit = compile("function f(a, b) { return a + b; } f(1, 2);", target, true);
            let n = native(&unit);
            assert_eq!(n.code_refs.len(), 2);
            assert_eq!(n.target, target);
            for (i, a) in n.code_refs.iter().enumerate() {
                assert!(n.code_sizes[i] as usize <= a.size);
                assert!(n.pool_offsets[i] <= n.code_sizes[i]);
            }
        }
    }

    #[test]
    fn test_lookups_follow_the_switch() {
        let fast = compile("var o = {}; o.a = o.b;", TargetKind::X86_64SysV, true);
        let c = calls(&instructions(&fast, 0));
        assert!(c.contains(&RuntimeCall::GetPropertyLookup));
        assert!(c.contains(&RuntimeCall::SetPropertyLookup));

        let slow = compile("var o = {}; o.a = o.b;", TargetKind::X86_64SysV, false);
        let c = calls(&instructions(&slow, 0));
        assert!(c.contains(&RuntimeCall::GetProperty));
        assert!(c.contains(&RuntimeCall::SetProperty));
        assert!(!c.contains(&RuntimeCall::GetPropertyLookup));
    }

    #[test]
    fn test_integer_add_is_inlined() {
        let unit = compile("function f(a, b) { return a + b; }", TargetKind::X86_64SysV, true);
        let insns = instructions(&unit, 1);
        assert!(insns.iter().any(|i| matches!(
            i,
            Insn::Alu32 {
                op: AluOp32::Add,
                ..
            }
        )));
        assert!(insns.iter().any(|i| matches!(
            i,
            Insn::Jcc {
                cond: Cond::Overflow,
                ..
            }
        )));
        assert!(calls(&insns).contains(&RuntimeCall::Binop));
    }

    #[test]
    fn test_doubles_go_to_the_pool() {
        let unit = compile("var x = 1.5; var y = 2;", TargetKind::Arm, true);
        let n = native(&unit);
        assert_eq!(n.constant_values[0], vec![Value::from_double(1.5)]);
    }

    #[test]
    fn test_max_call_args_covers_literals() {
        let program = match parse_program("var o = {a: 1, b: 2};", false) {
            Ok(p) => p,
            Err(e) => panic!("{}", e),
        };
        let module = generate(&program, "t.js", CompilationMode::GlobalCode);
        let root = module.root().unwrap();
        assert!(max_call_args(root) >= 6);
    }

    #[test]
    fn test_failed_unit_returns_its_memory() {
        let allocator = Arc::new(ExecutableAllocator::new(HeapPageAllocator::default(), 4096));
        {
            let mut isel = Box::new(JitInstructionSelection::new(TargetKind::X86, allocator.clone()));
            let program = parse_program("function g() {} g();", false).unwrap();
            let module = generate(&program, "t.js", CompilationMode::GlobalCode);
            isel.run(0, &module.functions[0]).unwrap();
            assert!(allocator.blocks().iter().any(|(_, _, free)| !free));
        }
        assert!(allocator.blocks().iter().all(|(_, _, free)| *free));
    }
}
