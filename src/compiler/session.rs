use crate::compiler::diagnostics::{Diagnostics, Severity, SrcLoc};
use crate::compiler::intern::{Atom, Interner};

/// Per-compilation context shared by every pipeline stage: the string pool
/// and the diagnostic counters. A fresh `Session` is created for each
/// compilation; nothing here is process-global.
#[derive(Debug, Default)]
pub struct Session {
    pub interner: Interner,
    pub diags: Diagnostics,
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    pub fn intern(&mut self, s: &str) -> Atom {
        self.interner.intern(s)
    }

    pub fn str(&self, atom: Atom) -> &str {
        self.interner.str(atom)
    }

    pub fn error_at(&mut self, loc: SrcLoc, msg: impl AsRef<str>) {
        let file = self.interner.str(loc.file).to_string();
        self.diags
            .report(Severity::Error, &file, loc.line, loc.col, msg.as_ref());
    }

    pub fn warn_at(&mut self, loc: SrcLoc, msg: impl AsRef<str>) {
        let file = self.interner.str(loc.file).to_string();
        self.diags
            .report(Severity::Warning, &file, loc.line, loc.col, msg.as_ref());
    }

    pub fn error(&mut self, msg: impl AsRef<str>) {
        self.diags.report_noloc(Severity::Error, msg.as_ref());
    }
}
