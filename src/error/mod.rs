//! Error types for compilation and execution.

use std::fmt;

use thiserror::Error;

/// A single compile diagnostic:
/// `[line N] Error at '<lexeme>': <message>`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: usize,
    /// Where the error was noticed: at a lexeme, at end of input, or
    /// nowhere in particular (lexer error tokens carry their own message).
    pub location: Location,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum Location {
    Lexeme(String),
    Eof,
    None,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            Location::Lexeme(lexeme) => write!(f, " at '{}'", lexeme)?,
            Location::Eof => write!(f, " at end")?,
            Location::None => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// All diagnostics produced by one compilation. Panic-mode recovery means a
/// single run can report several.
#[derive(Debug)]
pub struct CompileErrors(pub Vec<Diagnostic>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", diagnostic)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

/// A runtime error: the message followed by a stack trace of call sites,
/// innermost frame first.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum QiError {
    #[error("{0}")]
    Compile(#[from] CompileErrors),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
