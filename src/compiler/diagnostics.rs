use crate::compiler::intern::Atom;

/// A position in the original source: interned file name, 1-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcLoc {
    pub file: Atom,
    pub line: u32,
    pub col: u32,
}

impl SrcLoc {
    pub fn new(file: Atom, line: u32, col: u32) -> Self {
        SrcLoc { file, line, col }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Counted diagnostic sink. Messages go to stderr in
/// `file:line:col: level: message` form; the pipeline keeps running and the
/// driver checks the error count at stage boundaries.
#[derive(Debug, Default)]
pub struct Diagnostics {
    error_count: u32,
    warning_count: u32,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn report(&mut self, severity: Severity, file: &str, line: u32, col: u32, msg: &str) {
        let level = match severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        eprintln!("{}:{}:{}: {}: {}", file, line, col, level, msg);
        self.bump(severity);
    }

    /// Report without a source location prefix.
    pub fn report_noloc(&mut self, severity: Severity, msg: &str) {
        let level = match severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        eprintln!("{}: {}", level, msg);
        self.bump(severity);
    }

    fn bump(&mut self, severity: Severity) {
        match severity {
            Severity::Error => self.error_count += 1,
            Severity::Warning => self.warning_count += 1,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}
