// Entry point: dispatches to the REPL or to running a single script file,
// matching the book's `clox` CLI contract exactly (spec §2.2, §6).

mod builtins;
mod chunk;
mod compiler;
mod disasm;
mod errors;
mod gc;
mod lexer;
mod repl;
mod value;
mod vm;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use errors::InterpretError;
use repl::Repl;
use vm::Vm;

#[derive(Parser)]
#[command(name = "loxide", about = "loxide — a bytecode compiler and stack VM", version)]
struct Cli {
    /// Script to run. Omit to start the REPL.
    file: Option<PathBuf>,

    /// Any further positional arguments are a usage error (spec: "more
    /// than one argument is a usage error").
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    extra: Vec<String>,

    #[arg(long, hide = true)]
    stress_gc: bool,

    #[arg(long, hide = true)]
    log_gc: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if !cli.extra.is_empty() {
        eprintln!("Usage: loxide [path]");
        return ExitCode::from(64);
    }

    match cli.file {
        None => {
            let mut repl = match Repl::new() {
                Ok(repl) => repl,
                Err(err) => {
                    eprintln!("{}", format!("Failed to start REPL: {err}").red());
                    return ExitCode::from(74);
                }
            };
            match repl.run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("{}", format!("REPL error: {err}").red());
                    ExitCode::from(74)
                }
            }
        }
        Some(path) => run_file(&path, cli.stress_gc, cli.log_gc),
    }
}

fn run_file(path: &PathBuf, stress_gc: bool, log_gc: bool) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {err}", path.display());
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new();
    vm.set_stress_gc(stress_gc);
    vm.set_log_gc(log_gc);

    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(_)) => ExitCode::from(65),
        Err(InterpretError::Runtime(_)) => ExitCode::from(70),
    }
}
