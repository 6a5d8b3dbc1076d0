//! End-to-end tests: every program runs on the interpreter and on each
//! machine-code target, and all of them have to agree.

extern crate jsv4;

use jsv4::runner::ds::error::ErrorType;
use jsv4::runner::ds::value::Value;
use jsv4::runner::runtime;
use jsv4::runner::{Backend, EngineConfig, EngineError, ExecutionEngine, Script, TargetKind};

fn backends() -> Vec<Backend> {
    let mut all = vec![Backend::Interpreter];
    all.extend(TargetKind::ALL.iter().map(|&t| Backend::Jit(t)));
    all
}

fn engine_for(backend: Backend) -> ExecutionEngine {
    ExecutionEngine::new(EngineConfig::default().with_backend(backend))
}

/// Runs `code` on every backend and renders the completion value.
fn run_get_string(code: &str) -> String {
    let mut results = Vec::new();
    for backend in backends() {
        let mut engine = engine_for(backend);
        let v = match Script::new("test.js", code).execute(&mut engine) {
            Ok(v) => v,
            Err(e) => panic!("{:?}: {}", backend, e),
        };
        results.push((backend, runtime::display_value(&mut engine, v)));
    }
    let (_, first) = results[0].clone();
    for (backend, r) in &results {
        assert_eq!(r, &first, "{:?} disagrees with the interpreter", backend);
    }
    first
}

fn run_get_number(code: &str) -> f64 {
    let mut results = Vec::new();
    for backend in backends() {
        let mut engine = engine_for(backend);
        match Script::new("test.js", code).execute(&mut engine) {
            Ok(v) => match v.as_number() {
                Some(n) => results.push(n),
                None => panic!("{:?}: {:?} is not a number", backend, v),
            },
            Err(e) => panic!("{:?}: {}", backend, e),
        }
    }
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.to_bits(), results[0].to_bits(), "backend #{} disagrees", i);
    }
    results[0]
}

fn run_get_int(code: &str) -> i64 {
    let n = run_get_number(code);
    assert_eq!(n.fract(), 0.0, "{} is not an integer", n);
    n as i64
}

fn run_get_bool(code: &str) -> bool {
    match run_get_string(code).as_str() {
        "true" => true,
        "false" => false,
        other => panic!("{} is not a boolean", other),
    }
}

/// Error type thrown out of `code` on every backend.
fn run_get_error(code: &str) -> ErrorType {
    let mut seen = None;
    for backend in backends() {
        let mut engine = engine_for(backend);
        let mut script = Script::new("test.js", code);
        let ty = match script.run(&mut engine) {
            Ok(v) => panic!("{:?}: expected an exception, got {:?}", backend, v),
            Err(_) => {
                let ex = engine.catch_exception();
                engine.error_type_of(ex)
            }
        };
        let ty = ty.unwrap_or_else(|| panic!("{:?}: thrown value is not an error", backend));
        if let Some(prev) = seen {
            assert_eq!(prev, ty, "{:?} disagrees", backend);
        }
        seen = Some(ty);
    }
    seen.unwrap()
}

// ── Basics ──

#[test]
fn test_duplicate_formals_last_one_wins() {
    assert_eq!(run_get_int("var x = 1; function f(a, a) { return a; } f(1, 2);"), 2);
    assert_eq!(run_get_int("function f(a, b, a) { return a * 10 + b; } f(1, 2, 3);"), 32);
}

#[test]
fn test_missing_property_is_undefined() {
    assert_eq!(run_get_string("({}).nonExistent"), "undefined");
}

#[test]
fn test_member_of_null_throws_type_error() {
    assert_eq!(run_get_error("null.x"), ErrorType::TypeError);
}

#[test]
fn test_arithmetic() {
    assert_eq!(run_get_int("var x = 3 + 4 * 2; x"), 11);
    assert_eq!(run_get_number("7 / 2"), 3.5);
    assert_eq!(run_get_int("17 % 5"), 2);
    assert_eq!(run_get_int("-(3 - 10)"), 7);
}

#[test]
fn test_int_overflow_falls_back_to_doubles() {
    assert_eq!(run_get_number("2147483647 + 1"), 2147483648.0);
    assert_eq!(run_get_number("-2147483648 - 1"), -2147483649.0);
    assert_eq!(run_get_number("65536 * 65536"), 4294967296.0);
    assert_eq!(run_get_number("var a = -2147483648; -a"), 2147483648.0);
}

#[test]
fn test_negative_zero_from_int_multiply() {
    assert_eq!(run_get_number("var z = 0 * -1; 1 / z"), f64::NEG_INFINITY);
}

#[test]
fn test_bit_operations() {
    assert_eq!(run_get_int("(0xff00 | 0x0f) & 0x0ff0"), 0x0f00);
    assert_eq!(run_get_int("5 ^ 3"), 6);
    assert_eq!(run_get_int("1 << 10"), 1024);
    assert_eq!(run_get_int("-16 >> 2"), -4);
    assert_eq!(run_get_int("~5"), -6);
}

#[test]
fn test_unsigned_shift_produces_uint32() {
    assert_eq!(run_get_number("-1 >>> 0"), 4294967295.0);
    assert_eq!(run_get_int("-16 >>> 28"), 15);
    assert_eq!(run_get_number("var x = -1; x >>> 0"), 4294967295.0);
}

#[test]
fn test_comparisons_and_logic() {
    assert!(run_get_bool("1 < 2 && 2 <= 2 && 3 > 2 && 3 >= 3"));
    assert!(run_get_bool("1 == '1'"));
    assert!(!run_get_bool("1 === '1'"));
    assert!(run_get_bool("null == undefined"));
    assert!(!run_get_bool("!1"));
    assert_eq!(run_get_int("0 || 5"), 5);
    assert_eq!(run_get_int("3 && 4"), 4);
    assert_eq!(run_get_string("1 ? 'yes' : 'no'"), "yes");
}

#[test]
fn test_strings() {
    assert_eq!(run_get_string("'a' + 'b' + 1"), "ab1");
    assert_eq!(run_get_string("1 + 2 + 'x'"), "3x");
    assert_eq!(run_get_int("'hello'.length"), 5);
}

#[test]
fn test_typeof() {
    assert_eq!(run_get_string("typeof 1"), "number");
    assert_eq!(run_get_string("typeof 'x'"), "string");
    assert_eq!(run_get_string("typeof undefinedName"), "undefined");
    assert_eq!(run_get_string("typeof {}"), "object");
    assert_eq!(run_get_string("typeof function() {}"), "function");
    assert_eq!(run_get_string("var o = {a: true}; typeof o.a"), "boolean");
}

// ── Control flow ──

#[test]
fn test_loops() {
    assert_eq!(run_get_int("var s = 0; for (var i = 0; i < 5; i++) s += i; s"), 10);
    assert_eq!(run_get_int("var i = 0; while (i < 7) i = i + 1; i"), 7);
    assert_eq!(run_get_int("var i = 10; do { i--; } while (i > 3); i"), 3);
    let code = r#"
var count = 0;
for (var i = 0; i < 10; i++) {
    if (i == 2) continue;
    if (i == 6) break;
    count++;
}
count
"#;
    assert_eq!(run_get_int(code), 5);
}

#[test]
fn test_nested_loops() {
    let code = r#"
var count = 0;
for (var i = 0; i < 3; i = i + 1) {
    for (var j = 0; j < 4; j = j + 1) {
        count = count + 1;
    }
}
count
"#;
    assert_eq!(run_get_int(code), 12);
}

#[test]
fn test_for_in_visits_keys_in_order() {
    let code = "var o = {a: 1, b: 2, c: 3}; var s = ''; for (var k in o) s += k; s";
    assert_eq!(run_get_string(code), "abc");
}

#[test]
fn test_try_catch_finally() {
    let code = r#"
var log = '';
try {
    log += 'a';
    throw 'boom';
} catch (e) {
    log += e;
} finally {
    log += 'z';
}
log
"#;
    assert_eq!(run_get_string(code), "aboomz");
}

#[test]
fn test_exception_crosses_function_boundary() {
    let code = r#"
function inner() { null.x; }
function outer() { inner(); return 1; }
var r;
try { outer(); r = 'no'; } catch (e) { r = e instanceof TypeError; }
r
"#;
    assert!(run_get_bool(code));
}

#[test]
fn test_uncaught_throw_of_error_subtypes() {
    assert_eq!(run_get_error("throw new RangeError('r')"), ErrorType::RangeError);
    assert_eq!(run_get_error("undefinedVariable"), ErrorType::ReferenceError);
    assert_eq!(run_get_error("var f = 1; f()"), ErrorType::TypeError);
}

#[test]
fn test_with_statement() {
    assert_eq!(run_get_int("var o = {p: 41}; var r; with (o) { r = p + 1; } r"), 42);
}

// ── Functions ──

#[test]
fn test_recursion() {
    let code = "function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); } fib(15)";
    assert_eq!(run_get_int(code), 610);
}

#[test]
fn test_closures_capture_their_scope() {
    let code = r#"
function counter() {
    var n = 0;
    return function() { n = n + 1; return n; };
}
var c = counter();
c(); c();
c()
"#;
    assert_eq!(run_get_int(code), 3);
}

#[test]
fn test_arguments_object() {
    assert_eq!(run_get_int("function f() { return arguments.length; } f(1, 2, 3)"), 3);
    assert_eq!(run_get_int("function f(a) { return arguments[1]; } f(1, 9)"), 9);
}

#[test]
fn test_constructors_and_this() {
    let code = r#"
function Point(x, y) { this.x = x; this.y = y; }
var p = new Point(3, 4);
p.x * p.y
"#;
    assert_eq!(run_get_int(code), 12);
    assert!(run_get_bool("function P() {} var p = new P(); p instanceof P"));
}

#[test]
fn test_runaway_recursion_is_a_range_error() {
    assert_eq!(run_get_error("function r() { return r(); } r()"), ErrorType::RangeError);
}

#[test]
fn test_strict_mode_rejects_undeclared_assignment() {
    assert_eq!(run_get_error("'use strict'; undeclared = 1;"), ErrorType::ReferenceError);
    assert_eq!(run_get_int("sloppy = 5; sloppy"), 5);
}

// ── Objects and arrays ──

#[test]
fn test_object_literals() {
    assert_eq!(run_get_int("var o = {a: 1, 'b': 2, 3: 4}; o.a + o.b + o[3]"), 7);
    let code = r#"
var o = {
    v: 2,
    get double() { return this.v * 2; },
    set double(x) { this.v = x / 2; }
};
o.double = 10;
o.double + o.v
"#;
    assert_eq!(run_get_int(code), 15);
}

#[test]
fn test_object_literal_index_keys() {
    assert_eq!(run_get_int("var o = {3: 4}; o[3]"), 4);
    assert_eq!(run_get_int("var o = {'3': 4}; o[3]"), 4);
    assert_eq!(run_get_int("var o = {3: 4}; o['3']"), 4);
    assert_eq!(run_get_string("var o = {'03': 1}; typeof o[3]"), "undefined");
    assert_eq!(run_get_int("var o = {x: 1, x: 2}; o.x"), 2);
    assert_eq!(run_get_int("var o = {get x() { return 1; }, x: 5}; o.x"), 5);
    assert_eq!(run_get_int("var o = {x: 5, get x() { return 1; }}; o.x"), 1);
}

#[test]
fn test_object_literals_share_their_class() {
    let code = r#"
function make(a) { return {x: a, y: a}; }
var p = make(1);
var q = make(2);
var r = {x: 0, y: 0};
var s = {};
s.x = 1;
s.y = 2;
"#;
    for backend in backends() {
        let mut engine = engine_for(backend);
        Script::new("shapes.js", code).execute(&mut engine).unwrap();
        let mut class_of = |name: &str| {
            let v = Script::new("get.js", name).execute(&mut engine).unwrap();
            engine.class_of(v.as_managed().unwrap())
        };
        let p = class_of("p");
        assert_eq!(class_of("q"), p, "{:?}", backend);
        assert_eq!(class_of("r"), p, "{:?}", backend);
        assert_eq!(class_of("s"), p, "{:?}", backend);
    }
}

#[test]
fn test_arrays() {
    assert_eq!(run_get_int("var a = [1, , 3]; a.length"), 3);
    assert_eq!(run_get_string("var a = [1, , 3]; typeof a[1]"), "undefined");
    assert_eq!(run_get_string("var a = [1, 2]; a.push(3); a.join('-')"), "1-2-3");
    assert_eq!(run_get_int("var a = [1, 2, 3]; a.pop() + a.shift()"), 4);
    assert_eq!(run_get_string("var a = [2]; a.unshift(1); a.join()"), "1,2");
    assert_eq!(run_get_int("var a = []; a[1000] = 1; a.length"), 1001);
}

#[test]
fn test_delete() {
    assert!(run_get_bool("var o = {a: 1}; delete o.a; !('a' in o)"));
    assert!(!run_get_bool("var v = 1; delete v"));
}

#[test]
fn test_frozen_objects_ignore_writes() {
    let code = "var o = {a: 1}; Object.freeze(o); o.a = 2; o.b = 3; o.a + (o.b === undefined ? 0 : 100)";
    assert_eq!(run_get_int(code), 1);
    assert!(run_get_bool("var o = {}; Object.seal(o); Object.isSealed(o)"));
    assert_eq!(run_get_error("'use strict'; var o = Object.freeze({a: 1}); o.a = 2;"), ErrorType::TypeError);
}

#[test]
fn test_prototype_chain() {
    let code = r#"
function A() {}
A.prototype.greet = function() { return 'hi'; };
var a = new A();
Object.getPrototypeOf(a) === A.prototype && a.greet() == 'hi'
"#;
    assert!(run_get_bool(code));
}

#[test]
fn test_object_keys() {
    assert_eq!(run_get_string("Object.keys({x: 1, y: 2}).join()"), "x,y");
}

// ── Host surface ──

#[test]
fn test_print_collects_output() {
    for backend in backends() {
        let mut engine = engine_for(backend);
        Script::new("p.js", "print('a', 1); print(true)").execute(&mut engine).unwrap();
        assert_eq!(engine.take_output(), vec!["a 1".to_string(), "true".to_string()]);
    }
}

#[test]
fn test_syntax_error_reports_position() {
    let mut engine = engine_for(Backend::Interpreter);
    match Script::new("bad.js", "var x = 1;\nvar = ;").execute(&mut engine) {
        Err(EngineError::Syntax { file, line, .. }) => {
            assert_eq!(file, "bad.js");
            assert_eq!(line, 2);
        }
        other => panic!("expected a syntax error, got {:?}", other),
    }
    assert!(!engine.has_exception);
}

#[test]
fn test_uncaught_exception_is_rendered() {
    let mut engine = engine_for(Backend::Jit(TargetKind::X86));
    match Script::new("t.js", "throw new Error('nope')").execute(&mut engine) {
        Err(EngineError::UncaughtException(msg)) => assert_eq!(msg, "Error: nope"),
        other => panic!("expected an uncaught exception, got {:?}", other),
    }
}

#[test]
fn test_scripts_share_the_global_object() {
    for backend in backends() {
        let mut engine = engine_for(backend);
        Script::new("a.js", "var shared = 20; function twice(x) { return x * 2; }")
            .execute(&mut engine)
            .unwrap();
        let v = Script::new("b.js", "twice(shared) + 2").execute(&mut engine).unwrap();
        assert_eq!(v.as_number(), Some(42.0), "{:?}", backend);
    }
}

#[test]
fn test_evaluate_inherits_context() {
    let mut engine = engine_for(Backend::Interpreter);
    Script::new("a.js", "var base = 40;").execute(&mut engine).unwrap();
    assert_eq!(Script::evaluate(&mut engine, "base + 2").as_number(), Some(42.0));
    assert_eq!(Script::evaluate(&mut engine, "throw 1"), Value::undefined());
}

#[test]
fn test_lookups_can_be_disabled() {
    let code = "var o = {x: 1}; var s = 0; for (var i = 0; i < 5; i++) s += o.x; s";
    for backend in backends() {
        let config = EngineConfig::default().with_backend(backend).with_fast_lookups(false);
        let mut engine = ExecutionEngine::new(config);
        let v = Script::new("t.js", code).execute(&mut engine).unwrap();
        assert_eq!(v.as_number(), Some(5.0), "{:?}", backend);
    }
}
