//! The single-pass compiler: tokens in, bytecode out.

#[allow(clippy::module_inception)]
pub mod compiler;
pub mod compiler_classes;
pub mod compiler_exprs;
pub mod compiler_stmts;
pub mod precedence;
#[cfg(test)]
mod tests;

pub use compiler::Compiler;
pub use compiler_classes::INITIALIZER_NAME;
