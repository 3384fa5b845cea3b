//! Interactive REPL. One VM lives for the whole session, so globals defined
//! on earlier lines stay visible.

use std::path::PathBuf;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use qi_lang::Vm;

const HISTORY_FILE: &str = ".qi_history";

pub fn run() {
    println!("qi {}", env!("CARGO_PKG_VERSION"));

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start the REPL: {}", err);
            return;
        }
    };

    let history_path = history_path();
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    let mut vm = Vm::new();
    loop {
        match editor.readline(">>> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "quit" {
                    break;
                }
                let _ = editor.add_history_entry(line);
                if let Err(err) = vm.interpret(line) {
                    eprintln!("{}", err);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Read error: {}", err);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }
}

fn history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(HISTORY_FILE))
}
