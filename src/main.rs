// File: src/main.rs
//
// Command-line entry point for the Cinder interpreter. With no script
// argument an interactive REPL starts; with one, the script runs to
// completion. Exit codes follow the BSD sysexits conventions: 64 for usage
// errors, 65 for compile errors, 70 for runtime errors, 74 for unreadable
// files.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use colored::Colorize;

use cinder::repl::Repl;
use cinder::scanner::Dialect;
use cinder::vm::Vm;

#[derive(Parser)]
#[command(
    name = "cinder",
    about = "Cinder: a small scripting language on a bytecode VM",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Script to run; omit to start the REPL
    script: Option<PathBuf>,

    /// Keyword table to scan with
    #[arg(long, value_enum, default_value_t = Dialect::Standard)]
    dialect: Dialect,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => process::exit(0),
                _ => process::exit(64),
            }
        }
    };

    match cli.script {
        Some(path) => run_file(&path, cli.dialect),
        None => match Repl::new(cli.dialect) {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("{} {}", "REPL error:".bright_red(), err);
                    process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("{} {}", "Failed to start REPL:".bright_red(), err);
                process::exit(1);
            }
        },
    }
}

fn run_file(path: &PathBuf, dialect: Dialect) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}.", path.display(), err);
            process::exit(74);
        }
    };

    let mut vm = Vm::new(dialect);
    if let Err(err) = vm.interpret(&source) {
        process::exit(err.exit_code());
    }
}
