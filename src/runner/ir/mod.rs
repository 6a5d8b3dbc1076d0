//! Intermediate representation.
//!
//! A [`Module`] holds every function of one script; function 0 is the global
//! code. Function bodies are basic blocks of three-address statements whose
//! operands are temporaries. Variables are always reached by name; the
//! backends resolve them at run time.

pub mod codegen;

use std::fmt;
use std::rc::Rc;

/// Static type of a temporary, as far as code generation knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Undefined,
    Null,
    Bool,
    SInt32,
    UInt32,
    Double,
    String,
    /// Any value.
    Var,
    /// An array literal hole.
    Missing,
}

impl Type {
    pub const ALL: [Type; 9] = [
        Type::Undefined,
        Type::Null,
        Type::Bool,
        Type::SInt32,
        Type::UInt32,
        Type::Double,
        Type::String,
        Type::Var,
        Type::Missing,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Type> {
        Type::ALL.get(code as usize).copied()
    }

    pub fn is_integral(self) -> bool {
        matches!(self, Type::SInt32 | Type::UInt32)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Type::SInt32 | Type::UInt32 | Type::Double)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Not,
    UMinus,
    UPlus,
    Compl,
    Increment,
    Decrement,

    BitAnd,
    BitOr,
    BitXor,

    Add,
    Sub,
    Mul,
    Div,
    Mod,

    LShift,
    RShift,
    URShift,

    Gt,
    Lt,
    Ge,
    Le,
    Equal,
    NotEqual,
    StrictEqual,
    StrictNotEqual,

    InstanceOf,
    In,

    And,
    Or,
}

impl AluOp {
    pub const ALL: [AluOp; 29] = [
        AluOp::Not,
        AluOp::UMinus,
        AluOp::UPlus,
        AluOp::Compl,
        AluOp::Increment,
        AluOp::Decrement,
        AluOp::BitAnd,
        AluOp::BitOr,
        AluOp::BitXor,
        AluOp::Add,
        AluOp::Sub,
        AluOp::Mul,
        AluOp::Div,
        AluOp::Mod,
        AluOp::LShift,
        AluOp::RShift,
        AluOp::URShift,
        AluOp::Gt,
        AluOp::Lt,
        AluOp::Ge,
        AluOp::Le,
        AluOp::Equal,
        AluOp::NotEqual,
        AluOp::StrictEqual,
        AluOp::StrictNotEqual,
        AluOp::InstanceOf,
        AluOp::In,
        AluOp::And,
        AluOp::Or,
    ];

    /// Position in [`AluOp::ALL`]; what the backends encode.
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<AluOp> {
        AluOp::ALL.get(code as usize).copied()
    }

    pub const BINARY: [AluOp; 21] = [
        AluOp::BitAnd,
        AluOp::BitOr,
        AluOp::BitXor,
        AluOp::Add,
        AluOp::Sub,
        AluOp::Mul,
        AluOp::Div,
        AluOp::Mod,
        AluOp::LShift,
        AluOp::RShift,
        AluOp::URShift,
        AluOp::Gt,
        AluOp::Lt,
        AluOp::Ge,
        AluOp::Le,
        AluOp::Equal,
        AluOp::NotEqual,
        AluOp::StrictEqual,
        AluOp::StrictNotEqual,
        AluOp::InstanceOf,
        AluOp::In,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            AluOp::Not => "!",
            AluOp::UMinus => "-",
            AluOp::UPlus => "+",
            AluOp::Compl => "~",
            AluOp::Increment => "++",
            AluOp::Decrement => "--",
            AluOp::BitAnd => "&",
            AluOp::BitOr => "|",
            AluOp::BitXor => "^",
            AluOp::Add => "+",
            AluOp::Sub => "-",
            AluOp::Mul => "*",
            AluOp::Div => "/",
            AluOp::Mod => "%",
            AluOp::LShift => "<<",
            AluOp::RShift => ">>",
            AluOp::URShift => ">>>",
            AluOp::Gt => ">",
            AluOp::Lt => "<",
            AluOp::Ge => ">=",
            AluOp::Le => "<=",
            AluOp::Equal => "==",
            AluOp::NotEqual => "!=",
            AluOp::StrictEqual => "===",
            AluOp::StrictNotEqual => "!==",
            AluOp::InstanceOf => "instanceof",
            AluOp::In => "in",
            AluOp::And => "&&",
            AluOp::Or => "||",
        }
    }

    /// Type of the result, independent of the operand types.
    pub fn result_type(self) -> Type {
        match self {
            AluOp::Not
            | AluOp::Gt
            | AluOp::Lt
            | AluOp::Ge
            | AluOp::Le
            | AluOp::Equal
            | AluOp::NotEqual
            | AluOp::StrictEqual
            | AluOp::StrictNotEqual
            | AluOp::InstanceOf
            | AluOp::In => Type::Bool,
            AluOp::Compl | AluOp::BitAnd | AluOp::BitOr | AluOp::BitXor | AluOp::LShift | AluOp::RShift => {
                Type::SInt32
            }
            AluOp::URShift => Type::UInt32,
            _ => Type::Var,
        }
    }

    pub fn is_comparison(self) -> bool {
        self.result_type() == Type::Bool && self != AluOp::Not
    }
}

/// Names the code generator gives special meaning to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// An ordinary variable.
    Invalid,
    This,
    Typeof,
    Delete,
    Throw,
    ReThrow,
    UnwindException,
    PushCatchScope,
    ForeachIteratorObject,
    ForeachNextPropertyName,
    PushWithScope,
    PopScope,
    DeclareVars,
    DefineArray,
    DefineObjectLiteral,
    SetupArgumentsObject,
    ConvertThisToObject,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Invalid => "builtin_invalid",
            Builtin::This => "this",
            Builtin::Typeof => "builtin_typeof",
            Builtin::Delete => "builtin_delete",
            Builtin::Throw => "builtin_throw",
            Builtin::ReThrow => "builtin_rethrow",
            Builtin::UnwindException => "builtin_unwind_exception",
            Builtin::PushCatchScope => "builtin_push_catch_scope",
            Builtin::ForeachIteratorObject => "builtin_foreach_iterator_object",
            Builtin::ForeachNextPropertyName => "builtin_foreach_next_property_name",
            Builtin::PushWithScope => "builtin_push_with_scope",
            Builtin::PopScope => "builtin_pop_scope",
            Builtin::DeclareVars => "builtin_declare_vars",
            Builtin::DefineArray => "builtin_define_array",
            Builtin::DefineObjectLiteral => "builtin_define_object_literal",
            Builtin::SetupArgumentsObject => "builtin_setup_arguments_object",
            Builtin::ConvertThisToObject => "builtin_convert_this_to_object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Temp {
    pub index: u32,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const { ty: Type, value: f64 },
    String(Rc<str>),
    RegExp { source: Rc<str>, flags: Rc<str> },
    /// `global` is set when no function or `with`/`catch` scope can bind
    /// the name, so it resolves on the global object.
    Name { id: Rc<str>, builtin: Builtin, global: bool },
    Temp(Temp),
    Closure(usize),
    Convert { expr: Box<Expr>, ty: Type },
    Unop { op: AluOp, expr: Box<Expr> },
    Binop { op: AluOp, left: Box<Expr>, right: Box<Expr> },
    Call { base: Box<Expr>, args: Vec<Expr> },
    New { base: Box<Expr>, args: Vec<Expr> },
    Subscript { base: Box<Expr>, index: Box<Expr> },
    Member { base: Box<Expr>, name: Rc<str> },
}

impl Expr {
    pub fn temp(index: u32, ty: Type) -> Expr {
        Expr::Temp(Temp { index, ty })
    }

    pub fn name(id: &str) -> Expr {
        Expr::Name {
            id: Rc::from(id),
            builtin: Builtin::Invalid,
            global: false,
        }
    }

    pub fn global_name(id: &str) -> Expr {
        Expr::Name {
            id: Rc::from(id),
            builtin: Builtin::Invalid,
            global: true,
        }
    }

    pub fn builtin(builtin: Builtin) -> Expr {
        Expr::Name {
            id: Rc::from(builtin.name()),
            builtin,
            global: false,
        }
    }

    pub fn as_temp(&self) -> Option<Temp> {
        match self {
            Expr::Temp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&Rc<str>> {
        match self {
            Expr::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<(Type, f64)> {
        match self {
            Expr::Const { ty, value } => Some((*ty, *value)),
            _ => None,
        }
    }

    /// Static type of the expression's value.
    pub fn ty(&self) -> Type {
        match self {
            Expr::Const { ty, .. } => *ty,
            Expr::String(_) => Type::String,
            Expr::Temp(t) => t.ty,
            Expr::Convert { ty, .. } => *ty,
            Expr::Unop { op, .. } | Expr::Binop { op, .. } => op.result_type(),
            _ => Type::Var,
        }
    }
}

pub type BlockId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Move { target: Expr, source: Expr, swap: bool },
    Exp(Expr),
    Jump(BlockId),
    CJump { cond: Expr, iftrue: BlockId, iffalse: BlockId },
    Ret(Expr),
}

impl Stmt {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Stmt::Jump(_) | Stmt::CJump { .. } | Stmt::Ret(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicBlock {
    pub index: BlockId,
    pub statements: Vec<Stmt>,
    /// Where control goes when a statement of this block throws.
    pub catch_block: Option<BlockId>,
}

impl BasicBlock {
    pub fn is_terminated(&self) -> bool {
        self.statements.last().map_or(false, Stmt::is_terminator)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    pub strict: bool,
    pub uses_arguments: bool,
    pub uses_this: bool,
    pub has_nested_functions: bool,
    pub is_named_expression: bool,
    pub has_with_or_catch: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Function {
    pub name: Option<Rc<str>>,
    pub formals: Vec<Rc<str>>,
    pub locals: Vec<Rc<str>>,
    /// Module indices of the functions defined directly inside this one.
    pub nested: Vec<usize>,
    pub blocks: Vec<BasicBlock>,
    pub temp_count: u32,
    /// Largest argument count of any call made by this function.
    pub max_call_args: u32,
    pub flags: FunctionFlags,
    pub line: u32,
    pub column: u32,
}

impl Function {
    pub fn new_block(&mut self, catch_block: Option<BlockId>) -> BlockId {
        let index = self.blocks.len();
        self.blocks.push(BasicBlock {
            index,
            statements: Vec::new(),
            catch_block,
        });
        index
    }

    pub fn new_temp(&mut self, ty: Type) -> Temp {
        let index = self.temp_count;
        self.temp_count += 1;
        Temp { index, ty }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("%anonymous")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub functions: Vec<Function>,
    pub file_name: String,
}

impl Module {
    pub fn root(&self) -> Option<&Function> {
        self.functions.first()
    }
}

// ── Printing ──

fn fmt_type(ty: Type) -> &'static str {
    match ty {
        Type::Undefined => "undefined",
        Type::Null => "null",
        Type::Bool => "bool",
        Type::SInt32 => "int32",
        Type::UInt32 => "uint32",
        Type::Double => "double",
        Type::String => "string",
        Type::Var => "var",
        Type::Missing => "missing",
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const { ty, value } => match ty {
                Type::Undefined => write!(f, "undefined"),
                Type::Null => write!(f, "null"),
                Type::Bool => write!(f, "{}", *value != 0.0),
                Type::Missing => write!(f, "<hole>"),
                _ => write!(f, "{}", value),
            },
            Expr::String(s) => write!(f, "{:?}", s),
            Expr::RegExp { source, flags } => write!(f, "/{}/{}", source, flags),
            Expr::Name { id, .. } => write!(f, "{}", id),
            Expr::Temp(t) => write!(f, "%{}", t.index),
            Expr::Closure(i) => write!(f, "closure(#{})", i),
            Expr::Convert { expr, ty } => write!(f, "convert {} to {}", expr, fmt_type(*ty)),
            Expr::Unop { op, expr } => write!(f, "{}{}", op.symbol(), expr),
            Expr::Binop { op, left, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::Call { base, args } | Expr::New { base, args } => {
                if matches!(self, Expr::New { .. }) {
                    write!(f, "new ")?;
                }
                write!(f, "{}(", base)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Subscript { base, index } => write!(f, "{}[{}]", base, index),
            Expr::Member { base, name } => write!(f, "{}.{}", base, name),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Move { target, source, swap } => {
                write!(f, "{} {} {}", target, if *swap { "<=>" } else { "=" }, source)?;
                if let Expr::Temp(t) = target {
                    if t.ty != Type::Var {
                        write!(f, " : {}", fmt_type(t.ty))?;
                    }
                }
                Ok(())
            }
            Stmt::Exp(e) => write!(f, "{}", e),
            Stmt::Jump(b) => write!(f, "goto L{}", b),
            Stmt::CJump { cond, iftrue, iffalse } => write!(f, "if {} goto L{} else goto L{}", cond, iftrue, iffalse),
            Stmt::Ret(e) => write!(f, "return {}", e),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {}(", self.display_name())?;
        for (i, a) in self.formals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", a)?;
        }
        writeln!(f, ") {{")?;
        if !self.locals.is_empty() {
            let locals: Vec<&str> = self.locals.iter().map(|l| &**l).collect();
            writeln!(f, "    locals: {}", locals.join(", "))?;
        }
        for b in &self.blocks {
            match b.catch_block {
                Some(c) => writeln!(f, "L{}: (catch L{})", b.index, c)?,
                None => writeln!(f, "L{}:", b.index)?,
            }
            for s in &b.statements {
                writeln!(f, "    {}", s)?;
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, func) in self.functions.iter().enumerate() {
            write!(f, "#{} ", i)?;
            fmt::Display::fmt(func, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_types() {
        assert_eq!(AluOp::BitAnd.result_type(), Type::SInt32);
        assert_eq!(AluOp::URShift.result_type(), Type::UInt32);
        assert_eq!(AluOp::Lt.result_type(), Type::Bool);
        assert_eq!(AluOp::Add.result_type(), Type::Var);
        assert!(AluOp::In.is_comparison());
        assert!(!AluOp::Not.is_comparison());
    }

    #[test]
    fn test_codes_round_trip() {
        for op in AluOp::ALL {
            assert_eq!(AluOp::from_code(op.code()), Some(op));
        }
        for ty in Type::ALL {
            assert_eq!(Type::from_code(ty.code()), Some(ty));
        }
        assert_eq!(AluOp::from_code(99), None);
    }

    #[test]
    fn test_print_function() {
        let mut f = Function {
            name: Some(Rc::from("f")),
            formals: vec![Rc::from("a")],
            ..Function::default()
        };
        let b = f.new_block(None);
        let t = f.new_temp(Type::Var);
        f.blocks[b].statements.push(Stmt::Move {
            target: Expr::Temp(t),
            source: Expr::name("a"),
            swap: false,
        });
        f.blocks[b].statements.push(Stmt::Ret(Expr::Temp(t)));
        let text = f.to_string();
        assert!(text.starts_with("function f(a) {"));
        assert!(text.contains("%0 = a"));
        assert!(text.contains("return %0"));
        assert!(f.blocks[b].is_terminated());
    }
}
