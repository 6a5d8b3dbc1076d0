/// Benchmark runner comparing the bytecode interpreter with the machine-code
/// backend on each simulated target.

extern crate jsv4;

use std::time::{Duration, Instant};

use jsv4::runner::{Backend, EngineConfig, ExecutionEngine, Script, TargetKind};

fn backends() -> Vec<(String, Backend)> {
    let mut all = vec![("interp".to_string(), Backend::Interpreter)];
    for t in TargetKind::ALL {
        all.push((format!("jit/{}", t), Backend::Jit(t)));
    }
    all
}

/// Compile and run `code` `iterations` times on fresh engines.
fn run_benchmark(name: &str, code: &str, backend: Backend, iterations: u32) -> Duration {
    let start = Instant::now();
    for _ in 0..iterations {
        let mut engine = ExecutionEngine::new(EngineConfig::default().with_backend(backend));
        if let Err(e) = Script::new(name, code).execute(&mut engine) {
            eprintln!("{} failed: {}", name, e);
            break;
        }
    }
    start.elapsed()
}

/// Value of global `var_name` after running `code`, or -1.
fn run_and_get_var(code: &str, var_name: &str, backend: Backend) -> i64 {
    let mut engine = ExecutionEngine::new(EngineConfig::default().with_backend(backend));
    let source = format!("{}\n{};", code, var_name);
    match Script::new("verify.js", source).execute(&mut engine) {
        Ok(v) => v.as_number().map_or(-1, |n| n as i64),
        Err(_) => -1,
    }
}

// ============================================================================
// Benchmark definitions
// ============================================================================

const BENCH_FIBONACCI: &str = r#"
var n = 20;
var a = 0;
var b = 1;
for (var i = 0; i < n; i = i + 1) {
    var temp = a;
    a = b;
    b = temp + b;
}
"#;

const BENCH_LOOP_SUM: &str = r#"
var sum = 0;
for (var i = 0; i < 10000; i = i + 1) {
    sum = sum + i;
}
"#;

const BENCH_NESTED_LOOPS: &str = r#"
var count = 0;
for (var i = 0; i < 100; i = i + 1) {
    for (var j = 0; j < 100; j = j + 1) {
        count = count + 1;
    }
}
"#;

const BENCH_BITWISE: &str = r#"
var result = 0;
for (var i = 0; i < 1000; i = i + 1) {
    result = (result ^ i) & 0xFFFF;
}
"#;

const BENCH_CONDITIONALS: &str = r#"
var count = 0;
for (var i = 0; i < 1000; i = i + 1) {
    if (i % 2 === 0) {
        count = count + 1;
    } else {
        count = count + 2;
    }
}
"#;

const BENCH_WHILE_LOOP: &str = r#"
var i = 0;
var sum = 0;
while (i < 5000) {
    sum = sum + i;
    i = i + 1;
}
"#;

const BENCH_ARITHMETIC: &str = r#"
var result = 0;
for (var i = 1; i < 1000; i = i + 1) {
    result = result + i * 2 - i / 2;
}
"#;

const BENCH_FACTORIAL: &str = r#"
var n = 12;
var result = 1;
for (var i = 2; i <= n; i = i + 1) {
    result = result * i;
}
"#;

const BENCH_PRIME_SIEVE: &str = r#"
var count = 0;
for (var n = 2; n < 100; n = n + 1) {
    var isPrime = true;
    for (var i = 2; i * i <= n; i = i + 1) {
        if (n % i === 0) {
            isPrime = false;
            break;
        }
    }
    if (isPrime) {
        count = count + 1;
    }
}
"#;

const BENCH_GCD: &str = r#"
var result = 0;
for (var k = 0; k < 100; k = k + 1) {
    var a = 48;
    var b = 18;
    while (b !== 0) {
        var temp = b;
        b = a % b;
        a = temp;
    }
    result = result + a;
}
"#;

fn main() {
    println!("=======================================================");
    println!("  jsv4 - Performance Benchmarks");
    println!("  Bytecode Interpreter vs Simulated Machine Code");
    println!("=======================================================\n");

    let benchmarks: Vec<(&str, &str, u32)> = vec![
        ("Fibonacci (n=20)", BENCH_FIBONACCI, 200),
        ("Loop Sum (10K iterations)", BENCH_LOOP_SUM, 20),
        ("Nested Loops (100x100)", BENCH_NESTED_LOOPS, 20),
        ("Bitwise Operations (1K)", BENCH_BITWISE, 100),
        ("Conditionals (1K)", BENCH_CONDITIONALS, 100),
        ("While Loop (5K)", BENCH_WHILE_LOOP, 20),
        ("Arithmetic (1K)", BENCH_ARITHMETIC, 100),
        ("Factorial (n=12)", BENCH_FACTORIAL, 1000),
        ("Prime Sieve (<100)", BENCH_PRIME_SIEVE, 50),
        ("GCD (100 iterations)", BENCH_GCD, 50),
    ];
    let backends = backends();

    print!("{:<28}", "Benchmark");
    for (label, _) in &backends {
        print!(" {:>12}", label);
    }
    println!();
    println!("{}", "-".repeat(28 + 13 * backends.len()));

    let mut totals = vec![Duration::ZERO; backends.len()];
    for (name, code, iterations) in &benchmarks {
        print!("{:<28}", name);
        for (i, (_, backend)) in backends.iter().enumerate() {
            let d = run_benchmark(name, code, *backend, *iterations);
            totals[i] += d;
            print!(" {:>10.2?}", d);
        }
        println!();
    }
    println!("{}", "-".repeat(28 + 13 * backends.len()));
    print!("{:<28}", "TOTAL");
    for d in &totals {
        print!(" {:>10.2?}", d);
    }
    println!();

    println!("\n=======================================================");
    println!("  Correctness Verification");
    println!("=======================================================\n");

    let verifications: Vec<(&str, &str, &str, i64)> = vec![
        ("Fibonacci", BENCH_FIBONACCI, "a", 6765),
        ("Loop Sum", BENCH_LOOP_SUM, "sum", 49995000),
        ("Nested Loops", BENCH_NESTED_LOOPS, "count", 10000),
        ("Factorial", BENCH_FACTORIAL, "result", 479001600),
        ("Prime Count", BENCH_PRIME_SIEVE, "count", 25),
    ];

    for (name, code, var, expected) in verifications {
        print!("{:<20} {:>12}", name, expected);
        for (label, backend) in &backends {
            let got = run_and_get_var(code, var, *backend);
            let status = if got == expected { "ok" } else { "MISMATCH" };
            print!("  {}={} {}", label, got, status);
        }
        println!();
    }
}
