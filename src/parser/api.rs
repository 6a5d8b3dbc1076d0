use std::rc::Rc;
use std::time::Instant;

use pest::error::{Error, ErrorVariant, LineColLocation};
use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use super::ast::*;
use crate::runner::ds::value::number_to_string;

#[derive(Parser)]
#[grammar = "parser/js_grammar.pest"] // relative to src
pub struct JsParser;

const TAB_WIDTH: usize = 2;

pub fn parse_to_token_tree(script: &str) -> Result<String, JsError> {
    let mut tree = vec![];
    let start = Instant::now();
    let result = JsParser::parse(Rule::script, script);
    tracing::debug!(
        target: "jsv4::parser",
        elapsed_ms = start.elapsed().as_millis() as u64,
        "token tree parsed"
    );
    for pair in result.map_err(to_js_error)? {
        tree.push(pair_to_string(pair, 0).join("\n"));
    }
    Ok(tree.join("\n"))
}

fn pair_to_string(pair: Pair<Rule>, level: usize) -> Vec<String> {
    let mut tree = vec![];
    let span = pair.as_span();
    let rule_name = format!(
        "{:?} => ({},{}) #{:?}",
        pair.as_rule(),
        span.start(),
        span.end(),
        span.as_str()
    );
    tree.push(format!("{}{}", " ".repeat(level * TAB_WIDTH), rule_name));
    for child_pair in pair.into_inner() {
        tree.append(pair_to_string(child_pair, level + 1).as_mut());
    }
    tree
}

/// Parses a whole script. Syntax errors and early errors both come back as
/// pest errors carrying the offending span.
pub fn parse_to_ast(script: &str) -> Result<ProgramData, Error<Rule>> {
    let start = Instant::now();
    let mut pairs = JsParser::parse(Rule::script, script)?;
    let script_pair = match pairs.next() {
        Some(p) => p,
        None => {
            return Err(Error::new_from_pos(
                ErrorVariant::CustomError {
                    message: "Empty parse result".to_string(),
                },
                pest::Position::from_start(script),
            ))
        }
    };
    let meta = get_meta(&script_pair);
    let mut builder = AstBuilder::default();
    let (body, strict) = builder.build_source_elements(script_pair.into_inner())?;
    tracing::debug!(
        target: "jsv4::parser",
        statements = body.len(),
        strict,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "parsed script"
    );
    Ok(ProgramData { meta, body, strict })
}

/// Like [`parse_to_ast`] with the error flattened to a line, column and
/// message. `strict` forces strict mode for the whole program.
pub fn parse_program(script: &str, strict: bool) -> Result<ProgramData, JsError> {
    const PREFIX: &str = "'use strict';";
    if !strict {
        return parse_to_ast(script).map_err(to_js_error);
    }
    let source = format!("{}{}", PREFIX, script);
    parse_to_ast(&source).map_err(|e| {
        let mut e = to_js_error(e);
        if e.line == 1 {
            e.column = e.column.saturating_sub(PREFIX.len() as u32).max(1);
        }
        e
    })
}

pub fn to_js_error(e: Error<Rule>) -> JsError {
    let (line, column) = match e.line_col {
        LineColLocation::Pos((l, c)) => (l, c),
        LineColLocation::Span((l, c), _) => (l, c),
    };
    let message = match &e.variant {
        ErrorVariant::CustomError { message } => message.clone(),
        ErrorVariant::ParsingError { .. } => "Unexpected token".to_string(),
    };
    JsError {
        line: line as u32,
        column: column as u32,
        message,
    }
}

fn get_meta(pair: &Pair<Rule>) -> Meta {
    let span = pair.as_span();
    let (line, column) = span.start_pos().line_col();
    Meta {
        start_index: span.start(),
        end_index: span.end(),
        line: line as u32,
        column: column as u32,
    }
}

fn join_meta(first: &Meta, last: &Meta) -> Meta {
    Meta {
        end_index: last.end_index,
        ..*first
    }
}

fn get_unexpected_error(id: i32, pair: &Pair<Rule>) -> Error<Rule> {
    let message = format!("Unexpected state reached [{:?}] - {}", pair.as_rule(), id);
    Error::new_from_span(ErrorVariant::CustomError { message }, pair.as_span())
}

fn get_early_error(message: &str, pair: &Pair<Rule>) -> Error<Rule> {
    Error::new_from_span(
        ErrorVariant::CustomError {
            message: message.to_string(),
        },
        pair.as_span(),
    )
}

fn next_pair<'i>(iter: &mut Pairs<'i, Rule>, parent: &Pair<'i, Rule>, id: i32) -> Result<Pair<'i, Rule>, Error<Rule>> {
    iter.next().ok_or_else(|| get_unexpected_error(id, parent))
}

fn is_restricted_name(name: &str) -> bool {
    name == "eval" || name == "arguments"
}

fn unescape_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let e = match chars.next() {
            Some(e) => e,
            None => break,
        };
        match e {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' if !chars.peek().map_or(false, |d| d.is_ascii_digit()) => out.push('\0'),
            'x' | 'u' => {
                let len = if e == 'x' { 2 } else { 4 };
                let digits: String = chars.clone().take(len).collect();
                match u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32) {
                    Some(ch) if digits.len() == len => {
                        out.push(ch);
                        for _ in 0..len {
                            chars.next();
                        }
                    }
                    _ => out.push(e),
                }
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            '\n' | '\u{2028}' | '\u{2029}' => {}
            other => out.push(other),
        }
    }
    out
}

fn parse_numeric_literal(text: &str) -> f64 {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return hex
            .chars()
            .filter_map(|c| c.to_digit(16))
            .fold(0.0, |acc, d| acc * 16.0 + d as f64);
    }
    text.parse::<f64>().unwrap_or(f64::NAN)
}

fn string_literal_value(pair: &Pair<Rule>) -> Rc<str> {
    let raw = pair.as_str();
    let inner = raw.get(1..raw.len().saturating_sub(1)).unwrap_or("");
    Rc::from(unescape_string(inner))
}

/// Walks pest pairs into the AST while tracking what early errors need:
/// strictness, loop nesting and whether we are inside a function.
#[derive(Default)]
struct AstBuilder {
    strict: bool,
    loop_depth: u32,
    function_depth: u32,
}

impl AstBuilder {
    fn build_source_elements(&mut self, pairs: Pairs<Rule>) -> Result<(Vec<StatementType>, bool), Error<Rule>> {
        let mut statements = vec![];
        let mut in_prologue = true;
        for pair in pairs {
            if pair.as_rule() == Rule::EOI {
                continue;
            }
            if in_prologue {
                if pair.as_rule() == Rule::expression_statement && is_directive(&pair) {
                    let text = pair.as_str().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
                    if text == "'use strict'" || text == "\"use strict\"" {
                        self.strict = true;
                    }
                } else {
                    in_prologue = false;
                }
            }
            statements.push(self.build_statement(pair)?);
        }
        Ok((statements, self.strict))
    }

    fn build_statement(&mut self, pair: Pair<Rule>) -> Result<StatementType, Error<Rule>> {
        let meta = get_meta(&pair);
        Ok(match pair.as_rule() {
            Rule::function_declaration => {
                StatementType::FunctionDeclaration(Rc::new(self.build_function(pair, false)?))
            }
            Rule::block => StatementType::BlockStatement {
                meta,
                body: self.build_block(pair)?,
            },
            Rule::variable_statement => {
                let mut inner = pair.clone().into_inner();
                let list = next_pair(&mut inner, &pair, 1)?;
                StatementType::VarDeclaration {
                    meta,
                    declarations: self.build_variable_declaration_list(list)?,
                }
            }
            Rule::empty_statement => StatementType::EmptyStatement { meta },
            Rule::expression_statement => {
                let mut inner = pair.clone().into_inner();
                StatementType::ExpressionStatement {
                    meta,
                    expression: self.build_expression(next_pair(&mut inner, &pair, 2)?)?,
                }
            }
            Rule::if_statement => {
                let mut inner = pair.clone().into_inner();
                let test = self.build_expression(next_pair(&mut inner, &pair, 3)?)?;
                let consequent = Box::new(self.build_statement(next_pair(&mut inner, &pair, 4)?)?);
                let alternate = match inner.next() {
                    Some(p) => Some(Box::new(self.build_statement(p)?)),
                    None => None,
                };
                StatementType::IfStatement {
                    meta,
                    test,
                    consequent,
                    alternate,
                }
            }
            Rule::do_while_statement => {
                let mut inner = pair.clone().into_inner();
                let body = Box::new(self.build_loop_body(next_pair(&mut inner, &pair, 5)?)?);
                let test = self.build_expression(next_pair(&mut inner, &pair, 6)?)?;
                StatementType::DoWhileStatement { meta, body, test }
            }
            Rule::while_statement => {
                let mut inner = pair.clone().into_inner();
                let test = self.build_expression(next_pair(&mut inner, &pair, 7)?)?;
                let body = Box::new(self.build_loop_body(next_pair(&mut inner, &pair, 8)?)?);
                StatementType::WhileStatement { meta, test, body }
            }
            Rule::for_statement => self.build_for_statement(pair)?,
            Rule::for_in_statement => self.build_for_in_statement(pair)?,
            Rule::continue_statement => {
                if self.loop_depth == 0 {
                    return Err(get_early_error("Illegal continue statement", &pair));
                }
                StatementType::ContinueStatement { meta }
            }
            Rule::break_statement => {
                if self.loop_depth == 0 {
                    return Err(get_early_error("Illegal break statement", &pair));
                }
                StatementType::BreakStatement { meta }
            }
            Rule::return_statement => {
                if self.function_depth == 0 {
                    return Err(get_early_error("Illegal return statement", &pair));
                }
                let argument = match pair.clone().into_inner().next() {
                    Some(p) => Some(self.build_expression(p)?),
                    None => None,
                };
                StatementType::ReturnStatement { meta, argument }
            }
            Rule::with_statement => {
                if self.strict {
                    return Err(get_early_error(
                        "Strict mode code may not include a with statement",
                        &pair,
                    ));
                }
                let mut inner = pair.clone().into_inner();
                let object = self.build_expression(next_pair(&mut inner, &pair, 9)?)?;
                let body = Box::new(self.build_statement(next_pair(&mut inner, &pair, 10)?)?);
                StatementType::WithStatement { meta, object, body }
            }
            Rule::throw_statement => {
                let mut inner = pair.clone().into_inner();
                StatementType::ThrowStatement {
                    meta,
                    argument: self.build_expression(next_pair(&mut inner, &pair, 11)?)?,
                }
            }
            Rule::try_statement => self.build_try_statement(pair)?,
            _ => return Err(get_unexpected_error(12, &pair)),
        })
    }

    fn build_block(&mut self, pair: Pair<Rule>) -> Result<Vec<StatementType>, Error<Rule>> {
        let mut body = vec![];
        for p in pair.into_inner() {
            body.push(self.build_statement(p)?);
        }
        Ok(body)
    }

    fn build_loop_body(&mut self, pair: Pair<Rule>) -> Result<StatementType, Error<Rule>> {
        self.loop_depth += 1;
        let body = self.build_statement(pair);
        self.loop_depth -= 1;
        body
    }

    fn check_binding_name(&self, pair: &Pair<Rule>) -> Result<Rc<str>, Error<Rule>> {
        let name = pair.as_str();
        if self.strict && is_restricted_name(name) {
            return Err(get_early_error(
                &format!("Unexpected eval or arguments in strict mode: '{}'", name),
                pair,
            ));
        }
        Ok(Rc::from(name))
    }

    fn build_variable_declaration_list(&mut self, pair: Pair<Rule>) -> Result<Vec<VariableDeclarationData>, Error<Rule>> {
        let mut declarations = vec![];
        for decl in pair.into_inner() {
            if decl.as_rule() != Rule::variable_declaration {
                return Err(get_unexpected_error(13, &decl));
            }
            let meta = get_meta(&decl);
            let mut inner = decl.clone().into_inner();
            let name = self.check_binding_name(&next_pair(&mut inner, &decl, 14)?)?;
            let init = match inner.next() {
                Some(p) => Some(self.build_expression(p)?),
                None => None,
            };
            declarations.push(VariableDeclarationData { meta, name, init });
        }
        Ok(declarations)
    }

    fn build_for_statement(&mut self, pair: Pair<Rule>) -> Result<StatementType, Error<Rule>> {
        let meta = get_meta(&pair);
        let mut init = None;
        let mut test = None;
        let mut update = None;
        let mut body = None;
        for p in pair.clone().into_inner() {
            match p.as_rule() {
                Rule::for_init => {
                    let mut inner = p.clone().into_inner();
                    let i = next_pair(&mut inner, &p, 15)?;
                    init = Some(if i.as_rule() == Rule::variable_declaration_list {
                        ForInit::VarDeclaration(self.build_variable_declaration_list(i)?)
                    } else {
                        ForInit::Expression(self.build_expression(i)?)
                    });
                }
                Rule::for_test => {
                    let mut inner = p.clone().into_inner();
                    test = Some(self.build_expression(next_pair(&mut inner, &p, 16)?)?);
                }
                Rule::for_update => {
                    let mut inner = p.clone().into_inner();
                    update = Some(self.build_expression(next_pair(&mut inner, &p, 17)?)?);
                }
                _ => body = Some(Box::new(self.build_loop_body(p)?)),
            }
        }
        let body = body.ok_or_else(|| get_unexpected_error(18, &pair))?;
        Ok(StatementType::ForStatement {
            meta,
            init,
            test,
            update,
            body,
        })
    }

    fn build_for_in_statement(&mut self, pair: Pair<Rule>) -> Result<StatementType, Error<Rule>> {
        let meta = get_meta(&pair);
        let mut inner = pair.clone().into_inner();
        let target = next_pair(&mut inner, &pair, 19)?;
        let left = if target.as_rule() == Rule::for_var {
            let mut var_inner = target.clone().into_inner();
            let id = next_pair(&mut var_inner, &target, 20)?;
            ForInTarget::Var {
                meta: get_meta(&target),
                name: self.check_binding_name(&id)?,
            }
        } else {
            let e = self.build_expression(target.clone())?;
            self.check_assignment_target(&e, &target)?;
            ForInTarget::Expression(e)
        };
        let right = self.build_expression(next_pair(&mut inner, &pair, 21)?)?;
        let body = Box::new(self.build_loop_body(next_pair(&mut inner, &pair, 22)?)?);
        Ok(StatementType::ForInStatement {
            meta,
            left,
            right,
            body,
        })
    }

    fn build_try_statement(&mut self, pair: Pair<Rule>) -> Result<StatementType, Error<Rule>> {
        let meta = get_meta(&pair);
        let mut inner = pair.clone().into_inner();
        let block = self.build_block(next_pair(&mut inner, &pair, 23)?)?;
        let mut handler = None;
        let mut finalizer = None;
        for p in inner {
            match p.as_rule() {
                Rule::catch_clause => {
                    let catch_meta = get_meta(&p);
                    let mut c = p.clone().into_inner();
                    let param = self.check_binding_name(&next_pair(&mut c, &p, 24)?)?;
                    let body = self.build_block(next_pair(&mut c, &p, 25)?)?;
                    handler = Some(CatchClauseData {
                        meta: catch_meta,
                        param,
                        body,
                    });
                }
                Rule::finally_clause => {
                    let mut c = p.clone().into_inner();
                    finalizer = Some(self.build_block(next_pair(&mut c, &p, 26)?)?);
                }
                _ => return Err(get_unexpected_error(27, &p)),
            }
        }
        Ok(StatementType::TryStatement {
            meta,
            block,
            handler,
            finalizer,
        })
    }

    /// Builds a function declaration, function expression, getter or setter.
    fn build_function(&mut self, pair: Pair<Rule>, is_expression: bool) -> Result<FunctionData, Error<Rule>> {
        let meta = get_meta(&pair);
        let mut name = None;
        let mut name_pair = None;
        let mut params = vec![];
        let mut param_pairs = vec![];
        let mut body_pair = None;
        for p in pair.clone().into_inner() {
            match p.as_rule() {
                Rule::identifier if body_pair.is_none() && pair.as_rule() == Rule::setter => {
                    params.push(Rc::from(p.as_str()));
                    param_pairs.push(p);
                }
                Rule::identifier => {
                    name = Some(Rc::from(p.as_str()));
                    name_pair = Some(p);
                }
                Rule::property_name => {}
                Rule::formal_parameters => {
                    for id in p.into_inner() {
                        params.push(Rc::from(id.as_str()));
                        param_pairs.push(id);
                    }
                }
                Rule::function_body => body_pair = Some(p),
                _ => return Err(get_unexpected_error(28, &p)),
            }
        }
        let body_pair = body_pair.ok_or_else(|| get_unexpected_error(29, &pair))?;

        let saved = (self.strict, self.loop_depth);
        self.loop_depth = 0;
        self.function_depth += 1;
        let built = self.build_source_elements(body_pair.into_inner());
        self.function_depth -= 1;
        let strict = self.strict;
        self.strict = saved.0;
        self.loop_depth = saved.1;
        let (body, _) = built?;

        if strict {
            if let Some(p) = &name_pair {
                if is_restricted_name(p.as_str()) {
                    return Err(get_early_error("Unexpected eval or arguments in strict mode", p));
                }
            }
            for (i, p) in param_pairs.iter().enumerate() {
                if is_restricted_name(p.as_str()) {
                    return Err(get_early_error("Unexpected eval or arguments in strict mode", p));
                }
                if param_pairs[..i].iter().any(|q| q.as_str() == p.as_str()) {
                    return Err(get_early_error("Duplicate parameter name not allowed in this context", p));
                }
            }
        }

        Ok(FunctionData {
            meta,
            name,
            params,
            body,
            strict,
            is_expression,
        })
    }

    fn check_assignment_target(&self, e: &ExpressionType, pair: &Pair<Rule>) -> Result<(), Error<Rule>> {
        if !e.is_valid_simple_assignment_target() {
            return Err(get_early_error("Invalid left-hand side in assignment", pair));
        }
        if let ExpressionType::Identifier { name, .. } = e {
            if self.strict && is_restricted_name(name) {
                return Err(get_early_error("Unexpected eval or arguments in strict mode", pair));
            }
        }
        Ok(())
    }

    fn build_expression(&mut self, pair: Pair<Rule>) -> Result<ExpressionType, Error<Rule>> {
        let meta = get_meta(&pair);
        Ok(match pair.as_rule() {
            Rule::expression => {
                let mut expressions = vec![];
                for p in pair.into_inner() {
                    expressions.push(self.build_expression(p)?);
                }
                if expressions.len() == 1 {
                    expressions.remove(0)
                } else {
                    ExpressionType::SequenceExpression { meta, expressions }
                }
            }
            Rule::assignment_expression => {
                let mut inner = pair.clone().into_inner();
                let first = next_pair(&mut inner, &pair, 30)?;
                match inner.next() {
                    None => self.build_expression(first)?,
                    Some(op) => {
                        let left = self.build_expression(first.clone())?;
                        self.check_assignment_target(&left, &first)?;
                        let right = self.build_expression(next_pair(&mut inner, &pair, 31)?)?;
                        let token = op.as_str();
                        let operator = if token == "=" {
                            None
                        } else {
                            let bin = BinaryOperator::from_token(&token[..token.len() - 1]);
                            Some(bin.ok_or_else(|| get_unexpected_error(32, &op))?)
                        };
                        ExpressionType::AssignmentExpression {
                            meta,
                            operator,
                            left: Box::new(left),
                            right: Box::new(right),
                        }
                    }
                }
            }
            Rule::conditional_expression => {
                let mut inner = pair.clone().into_inner();
                let test = self.build_expression(next_pair(&mut inner, &pair, 33)?)?;
                match inner.next() {
                    None => test,
                    Some(c) => {
                        let consequent = self.build_expression(c)?;
                        let alternate = self.build_expression(next_pair(&mut inner, &pair, 34)?)?;
                        ExpressionType::ConditionalExpression {
                            meta,
                            test: Box::new(test),
                            consequent: Box::new(consequent),
                            alternate: Box::new(alternate),
                        }
                    }
                }
            }
            Rule::logical_or_expression
            | Rule::logical_and_expression
            | Rule::bitwise_or_expression
            | Rule::bitwise_xor_expression
            | Rule::bitwise_and_expression
            | Rule::equality_expression
            | Rule::relational_expression
            | Rule::shift_expression
            | Rule::additive_expression
            | Rule::multiplicative_expression => self.build_binary_chain(pair)?,
            Rule::unary_expression => {
                let mut inner = pair.clone().into_inner();
                let first = next_pair(&mut inner, &pair, 35)?;
                if first.as_rule() != Rule::prefix_op {
                    return self.build_expression(first);
                }
                let operand_pair = next_pair(&mut inner, &pair, 36)?;
                let argument = self.build_expression(operand_pair.clone())?;
                match first.as_str() {
                    "++" | "--" => {
                        self.check_assignment_target(&argument, &operand_pair)?;
                        ExpressionType::UpdateExpression {
                            meta,
                            operator: if first.as_str() == "++" {
                                UpdateOperator::Increment
                            } else {
                                UpdateOperator::Decrement
                            },
                            argument: Box::new(argument),
                            prefix: true,
                        }
                    }
                    token => {
                        let operator = match token {
                            "-" => UnaryOperator::Minus,
                            "+" => UnaryOperator::Plus,
                            "!" => UnaryOperator::LogicalNot,
                            "~" => UnaryOperator::BitwiseNot,
                            "typeof" => UnaryOperator::TypeOf,
                            "void" => UnaryOperator::Void,
                            "delete" => UnaryOperator::Delete,
                            _ => return Err(get_unexpected_error(37, &first)),
                        };
                        if operator == UnaryOperator::Delete && self.strict {
                            if let ExpressionType::Identifier { .. } = argument {
                                return Err(get_early_error(
                                    "Delete of an unqualified identifier in strict mode.",
                                    &operand_pair,
                                ));
                            }
                        }
                        ExpressionType::UnaryExpression {
                            meta,
                            operator,
                            argument: Box::new(argument),
                        }
                    }
                }
            }
            Rule::postfix_expression => {
                let mut inner = pair.clone().into_inner();
                let operand_pair = next_pair(&mut inner, &pair, 38)?;
                let argument = self.build_expression(operand_pair.clone())?;
                match inner.next() {
                    None => argument,
                    Some(op) => {
                        self.check_assignment_target(&argument, &operand_pair)?;
                        ExpressionType::UpdateExpression {
                            meta,
                            operator: if op.as_str() == "++" {
                                UpdateOperator::Increment
                            } else {
                                UpdateOperator::Decrement
                            },
                            argument: Box::new(argument),
                            prefix: false,
                        }
                    }
                }
            }
            Rule::left_hand_side_expression => {
                let mut inner = pair.clone().into_inner();
                let base = self.build_expression(next_pair(&mut inner, &pair, 39)?)?;
                self.apply_suffixes(base, inner, meta)?
            }
            Rule::new_expression => {
                let mut inner = pair.clone().into_inner();
                let base = self.build_expression(next_pair(&mut inner, &pair, 40)?)?;
                let mut callee = base;
                let mut arguments = vec![];
                for p in inner {
                    if p.as_rule() == Rule::arguments {
                        arguments = self.build_arguments(p)?;
                    } else {
                        callee = self.apply_member(callee, p, meta)?;
                    }
                }
                ExpressionType::NewExpression {
                    meta,
                    callee: Box::new(callee),
                    arguments,
                }
            }
            Rule::this_expression => ExpressionType::ThisExpression { meta },
            Rule::identifier => ExpressionType::Identifier {
                meta,
                name: Rc::from(pair.as_str()),
            },
            Rule::null_literal => ExpressionType::Literal {
                meta,
                value: LiteralData::Null,
            },
            Rule::boolean_literal => ExpressionType::Literal {
                meta,
                value: LiteralData::Boolean(pair.as_str() == "true"),
            },
            Rule::numeric_literal => ExpressionType::Literal {
                meta,
                value: LiteralData::Number(parse_numeric_literal(pair.as_str())),
            },
            Rule::string_literal => ExpressionType::Literal {
                meta,
                value: LiteralData::String(string_literal_value(&pair)),
            },
            Rule::regex_literal => {
                let mut inner = pair.clone().into_inner();
                let body = next_pair(&mut inner, &pair, 41)?;
                let flags = inner.next().map_or("", |f| f.as_str());
                ExpressionType::Literal {
                    meta,
                    value: LiteralData::RegExp {
                        pattern: Rc::from(body.as_str()),
                        flags: Rc::from(flags),
                    },
                }
            }
            Rule::paren_expression => {
                let mut inner = pair.clone().into_inner();
                self.build_expression(next_pair(&mut inner, &pair, 42)?)?
            }
            Rule::array_literal => {
                let mut elements = vec![];
                let mut pending_hole = true;
                for p in pair.into_inner() {
                    match p.as_rule() {
                        Rule::elision => {
                            if pending_hole {
                                elements.push(None);
                            }
                            pending_hole = true;
                        }
                        _ => {
                            let mut inner = p.clone().into_inner();
                            elements.push(Some(self.build_expression(next_pair(&mut inner, &p, 43)?)?));
                            pending_hole = false;
                        }
                    }
                }
                ExpressionType::ArrayExpression { meta, elements }
            }
            Rule::object_literal => {
                let mut properties = vec![];
                for p in pair.into_inner() {
                    properties.push(self.build_property(p)?);
                }
                ExpressionType::ObjectExpression { meta, properties }
            }
            Rule::function_expression => {
                ExpressionType::FunctionExpression(Rc::new(self.build_function(pair, true)?))
            }
            _ => return Err(get_unexpected_error(44, &pair)),
        })
    }

    /// Folds `a op b op c` to the left.
    fn build_binary_chain(&mut self, pair: Pair<Rule>) -> Result<ExpressionType, Error<Rule>> {
        let mut inner = pair.clone().into_inner();
        let mut left = self.build_expression(next_pair(&mut inner, &pair, 45)?)?;
        while let Some(op) = inner.next() {
            let right = self.build_expression(next_pair(&mut inner, &pair, 46)?)?;
            let meta = join_meta(left.get_meta(), right.get_meta());
            left = match op.as_rule() {
                Rule::or_op | Rule::and_op => ExpressionType::LogicalExpression {
                    meta,
                    operator: if op.as_rule() == Rule::or_op {
                        LogicalOperator::Or
                    } else {
                        LogicalOperator::And
                    },
                    left: Box::new(left),
                    right: Box::new(right),
                },
                _ => ExpressionType::BinaryExpression {
                    meta,
                    operator: BinaryOperator::from_token(op.as_str())
                        .ok_or_else(|| get_unexpected_error(47, &op))?,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        Ok(left)
    }

    fn apply_suffixes(&mut self, base: ExpressionType, suffixes: Pairs<Rule>, meta: Meta) -> Result<ExpressionType, Error<Rule>> {
        let mut e = base;
        for p in suffixes {
            let m = Meta {
                end_index: p.as_span().end(),
                ..meta
            };
            e = if p.as_rule() == Rule::arguments {
                ExpressionType::CallExpression {
                    meta: m,
                    callee: Box::new(e),
                    arguments: self.build_arguments(p)?,
                }
            } else {
                self.apply_member(e, p, meta)?
            };
        }
        Ok(e)
    }

    fn apply_member(&mut self, object: ExpressionType, p: Pair<Rule>, meta: Meta) -> Result<ExpressionType, Error<Rule>> {
        let m = Meta {
            end_index: p.as_span().end(),
            ..meta
        };
        let mut inner = p.clone().into_inner();
        let child = next_pair(&mut inner, &p, 48)?;
        Ok(match p.as_rule() {
            Rule::dot_member => ExpressionType::MemberExpression {
                meta: m,
                object: Box::new(object),
                property: Rc::from(child.as_str()),
            },
            Rule::index_member => ExpressionType::IndexExpression {
                meta: m,
                object: Box::new(object),
                index: Box::new(self.build_expression(child)?),
            },
            _ => return Err(get_unexpected_error(49, &p)),
        })
    }

    fn build_arguments(&mut self, pair: Pair<Rule>) -> Result<Vec<ExpressionType>, Error<Rule>> {
        let mut args = vec![];
        for p in pair.into_inner() {
            args.push(self.build_expression(p)?);
        }
        Ok(args)
    }

    fn build_property(&mut self, pair: Pair<Rule>) -> Result<PropertyData, Error<Rule>> {
        let meta = get_meta(&pair);
        let mut inner = pair.clone().into_inner();
        let name_pair = next_pair(&mut inner, &pair, 50)?;
        let key = property_key(&name_pair)?;
        Ok(match pair.as_rule() {
            Rule::data_property => PropertyData {
                meta,
                key,
                value: self.build_expression(next_pair(&mut inner, &pair, 51)?)?,
                kind: PropertyKind::Init,
            },
            Rule::getter | Rule::setter => {
                let kind = if pair.as_rule() == Rule::getter {
                    PropertyKind::Get
                } else {
                    PropertyKind::Set
                };
                let f = self.build_function(pair, true)?;
                PropertyData {
                    meta,
                    key,
                    value: ExpressionType::FunctionExpression(Rc::new(f)),
                    kind,
                }
            }
            _ => return Err(get_unexpected_error(52, &pair)),
        })
    }
}

fn property_key(pair: &Pair<Rule>) -> Result<Rc<str>, Error<Rule>> {
    let inner = pair
        .clone()
        .into_inner()
        .next()
        .ok_or_else(|| get_unexpected_error(53, pair))?;
    Ok(match inner.as_rule() {
        Rule::identifier_name => Rc::from(inner.as_str()),
        Rule::string_literal => string_literal_value(&inner),
        Rule::numeric_literal => Rc::from(number_to_string(parse_numeric_literal(inner.as_str()))),
        _ => return Err(get_unexpected_error(54, &inner)),
    })
}

fn is_directive(pair: &Pair<Rule>) -> bool {
    let text = pair.as_str().trim_start();
    let text = text.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    let quoted = |q: char| text.len() >= 2 && text.starts_with(q) && text.ends_with(q);
    (quoted('"') || quoted('\'')) && !text[1..text.len() - 1].contains(|c| c == '"' || c == '\'')
}
