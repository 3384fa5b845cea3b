//! qi: a small dynamically-typed scripting language written in Chinese.
//!
//! Source is lexed from CJK characters and full-width punctuation, compiled
//! in a single pass to bytecode, and executed on a stack-based VM with
//! closures, classes, and interned strings.
//!
//! ```
//! use qi_lang::Vm;
//!
//! let mut vm = Vm::new();
//! vm.interpret("变量 甲 = 1 + 2; 打印 甲;").unwrap();
//! assert_eq!(vm.output, vec!["3"]);
//! ```

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod vm;

pub use error::QiError;
pub use vm::Vm;

/// Compile and run a complete program in a fresh VM.
pub fn interpret(source: &str) -> Result<(), QiError> {
    let mut vm = Vm::new();
    vm.interpret(source)
}
