//! Compile-time diagnostics.
//!
//! The compiler never throws: syntax and resolution errors are handed to a
//! `Reporter`, which is responsible for printing them (or, in tests,
//! collecting them). This mirrors the teacher's reporter/report split but
//! drops the AST-phase distinction — this compiler only has two phases.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scanning,
    Compiling,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Scanning => write!(f, "scan"),
            Phase::Compiling => write!(f, "compile"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub phase: Phase,
    pub message: String,
    pub line: u32,
    /// Set when the error is anchored at EOF rather than a real lexeme.
    pub at_eof: bool,
    pub lexeme: String,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        if self.at_eof {
            write!(f, " at end")?;
        } else if !self.lexeme.is_empty() {
            write!(f, " at '{}'", self.lexeme)?;
        }
        write!(f, ": {}", self.message)
    }
}

pub trait Reporter {
    fn error(&mut self, report: Report);
}

/// The CLI's reporter: prints every diagnostic to stderr as it arrives.
pub struct CliReporter {
    pub error_count: usize,
}

impl CliReporter {
    pub fn new() -> Self {
        Self { error_count: 0 }
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for CliReporter {
    fn error(&mut self, report: Report) {
        self.error_count += 1;
        eprintln!("{report}");
    }
}

/// A reporter that just accumulates reports, for tests.
#[derive(Default)]
pub struct CollectingReporter {
    pub reports: Vec<Report>,
}

impl Reporter for CollectingReporter {
    fn error(&mut self, report: Report) {
        self.reports.push(report);
    }
}
