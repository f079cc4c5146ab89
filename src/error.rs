//! §7 Error handling — structured error types for the compiler and VM,
//! mirroring how `atlas-runtime` models its own `RuntimeError` with
//! `thiserror`.

use thiserror::Error;

/// A frame in a runtime stack trace, innermost first — §6 "a stack trace
/// listing each frame's line and function name from innermost outward".
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "[line {}] in script", self.line)
        } else {
            write!(f, "[line {}] in {}()", self.line, self.name)
        }
    }
}

/// Diagnostics are printed as they're found via `Reporter`; this only
/// signals that `had_error` latched (§4.2).
#[derive(Debug, Error)]
#[error("compilation failed")]
pub struct CompileError;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self {
            message: message.into(),
            trace,
        }
    }
}

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl InterpretError {
    /// §6 CLI exit codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretError::Compile(_) => exitcode::DATAERR,
            InterpretError::Runtime(_) => exitcode::SOFTWARE,
        }
    }
}
