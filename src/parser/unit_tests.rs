use super::api::{parse_program, parse_to_ast, parse_to_token_tree, JsParser, Rule};
use super::ast::*;

use pest::consumes_to;
use pest::parses_to;
use pest::Parser;
use std::time::Instant;

fn parse_ok(script: &str) -> ProgramData {
    match parse_to_ast(script) {
        Ok(p) => p,
        Err(e) => panic!("{} did not parse: {}", script, e),
    }
}

fn single_expression(script: &str) -> ExpressionType {
    let program = parse_ok(script);
    match program.body.into_iter().next() {
        Some(StatementType::ExpressionStatement { expression, .. }) => expression,
        other => panic!("expected an expression statement, got {:?}", other),
    }
}

fn early_error(script: &str) -> String {
    match parse_program(script, false) {
        Ok(p) => panic!("{} parsed to {:?}", script, p),
        Err(e) => e.message,
    }
}

#[test]
fn test_decimal_number_with_no_dot() {
    parses_to! {
        parser: JsParser,
        input: "10",
        rule: Rule::numeric_literal,
        tokens: [
            numeric_literal(0, 2)
        ]
    };
}

#[test]
fn test_decimal_number_with_dot_at_start_with_exp() {
    parses_to! {
        parser: JsParser,
        input: ".123E1",
        rule: Rule::numeric_literal,
        tokens: [
            numeric_literal(0, 6)
        ]
    };
}

#[test]
fn test_number_followed_by_identifier_fails() {
    assert!(JsParser::parse(Rule::numeric_literal, "3in").is_err());
}

#[test]
fn test_regex_literal() {
    parses_to! {
        parser: JsParser,
        input: "/a[/]+\\//gi",
        rule: Rule::regex_literal,
        tokens: [
            regex_literal(0, 11, [
                regex_body(1, 8),
                regex_flags(9, 11)
            ])
        ]
    };
}

#[test]
fn test_formal_parameters() {
    parses_to! {
        parser: JsParser,
        input: "(a, b)",
        rule: Rule::formal_parameters,
        tokens: [
            formal_parameters(0, 6, [
                identifier(1, 2),
                identifier(4, 5)
            ])
        ]
    };
}

#[test]
fn test_array_elision() {
    parses_to! {
        parser: JsParser,
        input: "[,]",
        rule: Rule::array_literal,
        tokens: [
            array_literal(0, 3, [
                elision(1, 2)
            ])
        ]
    };
}

#[test]
fn test_keywords_are_not_identifiers() {
    assert!(JsParser::parse(Rule::identifier, "for").is_err());
    assert!(JsParser::parse(Rule::identifier, "instanceof").is_err());
    assert_eq!(
        JsParser::parse(Rule::identifier, "fortune")
            .ok()
            .map(|p| p.as_str().to_string()),
        Some("fortune".to_string())
    );
}

#[test]
fn test_operator_precedence() {
    let e = single_expression("1 + 2 * 3;");
    match e {
        ExpressionType::BinaryExpression {
            operator: BinaryOperator::Add,
            right,
            ..
        } => assert!(matches!(
            *right,
            ExpressionType::BinaryExpression {
                operator: BinaryOperator::Multiply,
                ..
            }
        )),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_left_associative_subtraction() {
    let e = single_expression("a - b - c");
    match e {
        ExpressionType::BinaryExpression { left, .. } => assert!(matches!(
            *left,
            ExpressionType::BinaryExpression {
                operator: BinaryOperator::Subtract,
                ..
            }
        )),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_compound_assignment() {
    let e = single_expression("x >>>= 2");
    assert!(matches!(
        e,
        ExpressionType::AssignmentExpression {
            operator: Some(BinaryOperator::UnsignedShiftRight),
            ..
        }
    ));
}

#[test]
fn test_new_and_member_chain() {
    let e = single_expression("new a.B(1).c");
    match e {
        ExpressionType::MemberExpression { object, property, .. } => {
            assert_eq!(&*property, "c");
            match *object {
                ExpressionType::NewExpression { callee, arguments, .. } => {
                    assert_eq!(arguments.len(), 1);
                    assert!(matches!(*callee, ExpressionType::MemberExpression { .. }));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_object_literal_accessors() {
    let e = single_expression("({ get a() { return 1; }, set a(v) {}, get: 2, 1.50: 3, 'q': 4 })");
    match e {
        ExpressionType::ObjectExpression { properties, .. } => {
            let kinds: Vec<_> = properties.iter().map(|p| (p.key.to_string(), p.kind)).collect();
            assert_eq!(
                kinds,
                vec![
                    ("a".to_string(), PropertyKind::Get),
                    ("a".to_string(), PropertyKind::Set),
                    ("get".to_string(), PropertyKind::Init),
                    ("1.5".to_string(), PropertyKind::Init),
                    ("q".to_string(), PropertyKind::Init),
                ]
            );
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_array_holes() {
    let e = single_expression("[1,,2,]");
    match e {
        ExpressionType::ArrayExpression { elements, .. } => {
            assert_eq!(elements.len(), 3);
            assert!(elements[1].is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_string_escapes() {
    let e = single_expression(r#""a\n\x41B\'""#);
    assert!(matches!(
        e,
        ExpressionType::Literal { value: LiteralData::String(ref s), .. } if &**s == "a\nAB'"
    ));
}

#[test]
fn test_use_strict_directive() {
    assert!(parse_ok("'use strict'; var x;").strict);
    assert!(!parse_ok("var x; 'use strict';").strict);
    let program = parse_ok("function f() { \"use strict\"; return 1; }");
    assert!(!program.strict);
    match &program.body[0] {
        StatementType::FunctionDeclaration(f) => assert!(f.strict),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_statements() {
    let program = parse_ok(
        r#"
        var i = 0, o = {};
        for (var k in o) { continue; }
        for (i = 0; i < 3; i++) if (i) break; else ;
        do { i-- } while (i > 0)
        while (false) {}
        try { throw 1 } catch (e) { } finally { }
        with (o) { x = 1 }
        "#,
    );
    let names: Vec<&str> = program
        .body
        .iter()
        .map(|s| match s {
            StatementType::VarDeclaration { .. } => "var",
            StatementType::ForInStatement { .. } => "for-in",
            StatementType::ForStatement { .. } => "for",
            StatementType::DoWhileStatement { .. } => "do",
            StatementType::WhileStatement { .. } => "while",
            StatementType::TryStatement { .. } => "try",
            StatementType::WithStatement { .. } => "with",
            _ => "other",
        })
        .collect();
    assert_eq!(names, vec!["var", "for-in", "for", "do", "while", "try", "with"]);
}

#[test]
fn test_positions() {
    let program = parse_ok("var a;\n  b = 1;");
    let meta = program.body[1].get_meta();
    assert_eq!((meta.line, meta.column), (2, 3));
}

#[test]
fn test_early_errors() {
    assert_eq!(early_error("break;"), "Illegal break statement");
    assert_eq!(early_error("return 1"), "Illegal return statement");
    assert_eq!(early_error("1 = 2"), "Invalid left-hand side in assignment");
    assert_eq!(
        early_error("'use strict'; with (a) {}"),
        "Strict mode code may not include a with statement"
    );
    assert_eq!(
        early_error("function f(a, a) { 'use strict' }"),
        "Duplicate parameter name not allowed in this context"
    );
    assert_eq!(
        early_error("'use strict'; delete x"),
        "Delete of an unqualified identifier in strict mode."
    );
    assert!(parse_program("function f(a, a) { return a }", false).is_ok());
}

#[test]
fn test_syntax_error_position() {
    let e = parse_program("var x = ;", false).unwrap_err();
    assert_eq!(e.line, 1);
    assert!(e.column > 1);
}

#[test]
fn test_perf1() {
    let start = Instant::now();
    let result = parse_to_token_tree("[[[[]]]]");
    let end = Instant::now();
    match result {
        Ok(_) => {
            assert!(
                end.saturating_duration_since(start).as_millis() < 800,
                "Script taking too long to run."
            );
        }
        Err(e) => {
            assert!(false, "There was an error {}", e);
        }
    }
}
