//! qi CLI: execute a script file or run the REPL.

use std::env;
use std::fs;
use std::process;

use qi_lang::{QiError, Vm};

mod repl;

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl::run(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: qi [script]");
            process::exit(64);
        }
    }
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read \"{}\": {}", path, err);
            process::exit(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(err @ QiError::Compile(_)) => {
            eprintln!("{}", err);
            process::exit(65);
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(70);
        }
    }
}
