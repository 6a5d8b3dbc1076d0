//! Command line front end.
//!
//! Usage:
//!   jsv4 <file.js>              # Execute a JavaScript file
//!   jsv4 -e "code"              # Evaluate JavaScript code
//!   jsv4                        # Start REPL (interactive mode)

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use jsv4::runner::ds::value::Value;
use jsv4::runner::runtime;
use jsv4::runner::{Backend, EngineConfig, EngineError, ExecutionEngine, Script, TargetKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Interp,
    Jit,
}

#[derive(Parser)]
#[command(name = "jsv4", version, about = "Run JavaScript on the jsv4 engine")]
struct Cli {
    /// Script to run; omit for a REPL.
    file: Option<PathBuf>,

    /// Evaluate CODE instead of a file.
    #[arg(short = 'e', long = "eval", value_name = "CODE", conflicts_with = "file")]
    code: Option<String>,

    #[arg(long, value_enum, default_value_t = BackendArg::Interp)]
    backend: BackendArg,

    /// Calling convention for the JIT; implies `--backend jit`.
    #[arg(long, value_name = "x86|x86-64|win64|arm")]
    target: Option<TargetKind>,

    /// Turn off inline property caches.
    #[arg(long)]
    no_fast_lookups: bool,

    /// Print the IR before running.
    #[arg(long)]
    dump_ir: bool,

    /// Print the generated bytecode or machine code before running.
    #[arg(long)]
    dump_code: bool,
}

impl Cli {
    fn config(&self) -> EngineConfig {
        let backend = match (self.backend, self.target) {
            (_, Some(t)) => Backend::Jit(t),
            (BackendArg::Jit, None) => Backend::Jit(TargetKind::host()),
            (BackendArg::Interp, None) => Backend::Interpreter,
        };
        EngineConfig::default()
            .with_backend(backend)
            .with_fast_lookups(!self.no_fast_lookups)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut engine = ExecutionEngine::new(cli.config());

    let (name, source) = match (&cli.file, &cli.code) {
        (Some(path), _) => match fs::read_to_string(path) {
            Ok(content) => (path.display().to_string(), content),
            Err(e) => {
                eprintln!("Error reading file '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        (None, Some(code)) => ("<eval>".to_string(), code.clone()),
        (None, None) => {
            run_repl(&mut engine);
            return ExitCode::SUCCESS;
        }
    };

    let mut script = Script::new(name, source);
    match run_script(&cli, &mut engine, &mut script) {
        Ok(value) => {
            flush_output(&mut engine);
            if cli.code.is_some() && !value.is_undefined() {
                println!("{}", runtime::display_value(&mut engine, value));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            flush_output(&mut engine);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_script(cli: &Cli, engine: &mut ExecutionEngine, script: &mut Script) -> Result<Value, EngineError> {
    if cli.dump_ir {
        print!("{}", script.module()?);
    }
    if cli.dump_code {
        if let Err(e) = script.parse(engine) {
            engine.catch_exception();
            return Err(e);
        }
        if let Some(unit) = script.compilation_unit() {
            print!("{}", unit.dump());
        }
    }
    script.execute(engine)
}

fn flush_output(engine: &mut ExecutionEngine) {
    for line in engine.take_output() {
        println!("{}", line);
    }
}

fn run_repl(engine: &mut ExecutionEngine) {
    println!("jsv4 v{} - type .exit to quit", env!("CARGO_PKG_VERSION"));
    let stdin = io::stdin();
    let mut line_no = 0u32;
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        match stdin.lock().read_line(&mut input) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
        line_no += 1;
        let input = input.trim();
        if input == ".exit" || input == ".quit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        let mut script = Script::new("<repl>", input).at(line_no, 1);
        let result = script.execute(engine);
        flush_output(engine);
        match result {
            Ok(v) if v.is_undefined() => {}
            Ok(v) => println!("{}", runtime::display_value(engine, v)),
            Err(e) => eprintln!("{}", e),
        }
    }
}
