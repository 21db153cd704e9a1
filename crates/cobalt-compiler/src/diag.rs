//! Diagnostics shared by every phase.
//!
//! A diagnostic is a kind, a message, and a position; the driver
//! renders them as `path:line:col: kind: message`. Phases accumulate
//! diagnostics and keep going so one compilation surfaces as many
//! errors as practical.

use std::fmt;

use crate::pos::Pos;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagKind {
    /// Lexical: unterminated string, unknown escape, bad literal.
    Lexical,
    /// Syntactic: unexpected token, missing delimiter.
    Syntax,
    /// Semantic: undefined names, type mismatches, arity errors.
    Semantic,
    /// Lowering: a construct the lowerer does not support yet.
    Lowering,
    /// Internal compiler error: an invariant violated after the input
    /// already passed every earlier phase.
    Internal,
}

impl DiagKind {
    fn label(self) -> &'static str {
        match self {
            DiagKind::Lexical => "lexical error",
            DiagKind::Syntax => "syntax error",
            DiagKind::Semantic => "error",
            DiagKind::Lowering => "error",
            DiagKind::Internal => "internal compiler error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub message: String,
    pub pos: Pos,
}

impl Diagnostic {
    pub fn new(kind: DiagKind, message: impl Into<String>, pos: Pos) -> Self {
        Self {
            kind,
            message: message.into(),
            pos,
        }
    }

    /// Renders with the file path the position's `FileId` refers to.
    pub fn render(&self, path: &str) -> String {
        format!(
            "{}:{}:{}: {}: {}",
            path,
            self.pos.line,
            self.pos.col,
            self.kind.label(),
            self.message
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: {}",
            self.pos.line,
            self.pos.col,
            self.kind.label(),
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pos::FileId;

    #[test]
    fn renders_in_driver_format() {
        let d = Diagnostic::new(
            DiagKind::Semantic,
            "undefined identifier `x`",
            Pos::new(FileId(0), 3, 7),
        );
        assert_eq!(
            d.render("demo.cb"),
            "demo.cb:3:7: error: undefined identifier `x`"
        );
    }
}
