use std::fmt;
use std::rc::Rc;

/// Source position of a node: byte span plus 1-based line and column of its
/// first character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Meta {
    pub start_index: usize,
    pub end_index: usize,
    pub line: u32,
    pub column: u32,
}

pub trait HasMeta {
    fn get_meta(&self) -> &Meta;

    fn to_source<'a>(&self, script: &'a str) -> &'a str {
        let meta = self.get_meta();
        script.get(meta.start_index..meta.end_index).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralData {
    Null,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    RegExp { pattern: Rc<str>, flags: Rc<str> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Minus,
    Plus,
    LogicalNot,
    BitwiseNot,
    TypeOf,
    Void,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOperator {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    StrictlyEqual,
    StrictlyUnequal,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    In,
    InstanceOf,
}

impl BinaryOperator {
    pub fn from_token(token: &str) -> Option<BinaryOperator> {
        Some(match token {
            "==" => BinaryOperator::Equal,
            "!=" => BinaryOperator::NotEqual,
            "===" => BinaryOperator::StrictlyEqual,
            "!==" => BinaryOperator::StrictlyUnequal,
            "<" => BinaryOperator::LessThan,
            "<=" => BinaryOperator::LessThanEqual,
            ">" => BinaryOperator::GreaterThan,
            ">=" => BinaryOperator::GreaterThanEqual,
            "<<" => BinaryOperator::ShiftLeft,
            ">>" => BinaryOperator::ShiftRight,
            ">>>" => BinaryOperator::UnsignedShiftRight,
            "+" => BinaryOperator::Add,
            "-" => BinaryOperator::Subtract,
            "*" => BinaryOperator::Multiply,
            "/" => BinaryOperator::Divide,
            "%" => BinaryOperator::Modulo,
            "|" => BinaryOperator::BitwiseOr,
            "^" => BinaryOperator::BitwiseXor,
            "&" => BinaryOperator::BitwiseAnd,
            "in" => BinaryOperator::In,
            "instanceof" => BinaryOperator::InstanceOf,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    Or,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Init,
    Get,
    Set,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyData {
    pub meta: Meta,
    /// Property name as written; numeric keys are already canonicalised.
    pub key: Rc<str>,
    pub value: ExpressionType,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionData {
    pub meta: Meta,
    pub name: Option<Rc<str>>,
    pub params: Vec<Rc<str>>,
    pub body: Vec<StatementType>,
    pub strict: bool,
    /// Named function expression: the name is bound inside the body only.
    pub is_expression: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionType {
    Literal {
        meta: Meta,
        value: LiteralData,
    },
    ThisExpression {
        meta: Meta,
    },
    Identifier {
        meta: Meta,
        name: Rc<str>,
    },
    ArrayExpression {
        meta: Meta,
        /// `None` for elisions.
        elements: Vec<Option<ExpressionType>>,
    },
    ObjectExpression {
        meta: Meta,
        properties: Vec<PropertyData>,
    },
    FunctionExpression(Rc<FunctionData>),
    UnaryExpression {
        meta: Meta,
        operator: UnaryOperator,
        argument: Box<ExpressionType>,
    },
    UpdateExpression {
        meta: Meta,
        operator: UpdateOperator,
        argument: Box<ExpressionType>,
        prefix: bool,
    },
    BinaryExpression {
        meta: Meta,
        operator: BinaryOperator,
        left: Box<ExpressionType>,
        right: Box<ExpressionType>,
    },
    LogicalExpression {
        meta: Meta,
        operator: LogicalOperator,
        left: Box<ExpressionType>,
        right: Box<ExpressionType>,
    },
    /// `operator` is `None` for plain `=`.
    AssignmentExpression {
        meta: Meta,
        operator: Option<BinaryOperator>,
        left: Box<ExpressionType>,
        right: Box<ExpressionType>,
    },
    ConditionalExpression {
        meta: Meta,
        test: Box<ExpressionType>,
        consequent: Box<ExpressionType>,
        alternate: Box<ExpressionType>,
    },
    CallExpression {
        meta: Meta,
        callee: Box<ExpressionType>,
        arguments: Vec<ExpressionType>,
    },
    NewExpression {
        meta: Meta,
        callee: Box<ExpressionType>,
        arguments: Vec<ExpressionType>,
    },
    MemberExpression {
        meta: Meta,
        object: Box<ExpressionType>,
        property: Rc<str>,
    },
    IndexExpression {
        meta: Meta,
        object: Box<ExpressionType>,
        index: Box<ExpressionType>,
    },
    SequenceExpression {
        meta: Meta,
        expressions: Vec<ExpressionType>,
    },
}

impl ExpressionType {
    /// Identifiers and member accesses can be assigned to.
    pub fn is_valid_simple_assignment_target(&self) -> bool {
        matches!(
            self,
            ExpressionType::Identifier { .. }
                | ExpressionType::MemberExpression { .. }
                | ExpressionType::IndexExpression { .. }
        )
    }
}

impl HasMeta for ExpressionType {
    fn get_meta(&self) -> &Meta {
        match self {
            ExpressionType::Literal { meta, .. }
            | ExpressionType::ThisExpression { meta }
            | ExpressionType::Identifier { meta, .. }
            | ExpressionType::ArrayExpression { meta, .. }
            | ExpressionType::ObjectExpression { meta, .. }
            | ExpressionType::UnaryExpression { meta, .. }
            | ExpressionType::UpdateExpression { meta, .. }
            | ExpressionType::BinaryExpression { meta, .. }
            | ExpressionType::LogicalExpression { meta, .. }
            | ExpressionType::AssignmentExpression { meta, .. }
            | ExpressionType::ConditionalExpression { meta, .. }
            | ExpressionType::CallExpression { meta, .. }
            | ExpressionType::NewExpression { meta, .. }
            | ExpressionType::MemberExpression { meta, .. }
            | ExpressionType::IndexExpression { meta, .. }
            | ExpressionType::SequenceExpression { meta, .. } => meta,
            ExpressionType::FunctionExpression(f) => &f.meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclarationData {
    pub meta: Meta,
    pub name: Rc<str>,
    pub init: Option<ExpressionType>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForInit {
    VarDeclaration(Vec<VariableDeclarationData>),
    Expression(ExpressionType),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForInTarget {
    Var { meta: Meta, name: Rc<str> },
    Expression(ExpressionType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClauseData {
    pub meta: Meta,
    pub param: Rc<str>,
    pub body: Vec<StatementType>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementType {
    EmptyStatement {
        meta: Meta,
    },
    ExpressionStatement {
        meta: Meta,
        expression: ExpressionType,
    },
    VarDeclaration {
        meta: Meta,
        declarations: Vec<VariableDeclarationData>,
    },
    FunctionDeclaration(Rc<FunctionData>),
    BlockStatement {
        meta: Meta,
        body: Vec<StatementType>,
    },
    IfStatement {
        meta: Meta,
        test: ExpressionType,
        consequent: Box<StatementType>,
        alternate: Option<Box<StatementType>>,
    },
    WhileStatement {
        meta: Meta,
        test: ExpressionType,
        body: Box<StatementType>,
    },
    DoWhileStatement {
        meta: Meta,
        body: Box<StatementType>,
        test: ExpressionType,
    },
    ForStatement {
        meta: Meta,
        init: Option<ForInit>,
        test: Option<ExpressionType>,
        update: Option<ExpressionType>,
        body: Box<StatementType>,
    },
    ForInStatement {
        meta: Meta,
        left: ForInTarget,
        right: ExpressionType,
        body: Box<StatementType>,
    },
    ContinueStatement {
        meta: Meta,
    },
    BreakStatement {
        meta: Meta,
    },
    ReturnStatement {
        meta: Meta,
        argument: Option<ExpressionType>,
    },
    WithStatement {
        meta: Meta,
        object: ExpressionType,
        body: Box<StatementType>,
    },
    ThrowStatement {
        meta: Meta,
        argument: ExpressionType,
    },
    TryStatement {
        meta: Meta,
        block: Vec<StatementType>,
        handler: Option<CatchClauseData>,
        finalizer: Option<Vec<StatementType>>,
    },
}

impl HasMeta for StatementType {
    fn get_meta(&self) -> &Meta {
        match self {
            StatementType::EmptyStatement { meta }
            | StatementType::ExpressionStatement { meta, .. }
            | StatementType::VarDeclaration { meta, .. }
            | StatementType::BlockStatement { meta, .. }
            | StatementType::IfStatement { meta, .. }
            | StatementType::WhileStatement { meta, .. }
            | StatementType::DoWhileStatement { meta, .. }
            | StatementType::ForStatement { meta, .. }
            | StatementType::ForInStatement { meta, .. }
            | StatementType::ContinueStatement { meta }
            | StatementType::BreakStatement { meta }
            | StatementType::ReturnStatement { meta, .. }
            | StatementType::WithStatement { meta, .. }
            | StatementType::ThrowStatement { meta, .. }
            | StatementType::TryStatement { meta, .. } => meta,
            StatementType::FunctionDeclaration(f) => &f.meta,
        }
    }
}

/// A parsed script.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramData {
    pub meta: Meta,
    pub body: Vec<StatementType>,
    pub strict: bool,
}

/// A syntax error with the position it was detected at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl fmt::Display for JsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}
