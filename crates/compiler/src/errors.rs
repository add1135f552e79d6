//! Diagnostics and fatal error types for the compiler pipeline.
//!
//! Recoverable problems (parse errors after resynchronization, name and type
//! errors with sentinel nodes) are collected as [`Diagnostic`] values so a
//! single compile surfaces as many issues as possible. Unrecoverable problems
//! abort the current pipeline entry point and unwind as [`CompileError`].

use std::fmt;

/// A source position: file id plus byte offset into that file.
///
/// Offsets are recovered from the token-index table, so a `SourceLoc` is
/// cheap to carry on every AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub file: u32,
    pub offset: u32,
}

impl SourceLoc {
    pub fn new(file: u32, offset: u32) -> Self {
        SourceLoc { file, offset }
    }
}

/// Broad classification of a diagnostic, mirroring the error families the
/// pipeline surfaces. Tests match on this rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    /// Unexpected token, unterminated literal, expected-X-got-Y
    Parse,
    /// Bad `#version` identifier, non-iterable `#foreach`, duplicate variadic
    StaticExpansion,
    /// Undefined identifier, duplicate declaration, module conflict
    Name,
    /// Circular dependency in property resolution
    Cycle,
    /// Incompatible types, bad cast, lvalue required, argument mismatch
    Type,
    /// `#assert` condition evaluated to zero
    StaticAssert,
    /// IR-builder contract violation; always fatal
    Internal,
}

/// One reported problem with a source position.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub loc: SourceLoc,
    pub message: String,
}

/// Collector for recoverable diagnostics, aggregated per compiler invocation.
#[derive(Debug, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics { list: Vec::new() }
    }

    pub fn report(&mut self, kind: DiagKind, loc: SourceLoc, message: String) {
        self.list.push(Diagnostic { kind, loc, message });
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    /// Number of diagnostics of one kind, for tests that count exact errors.
    pub fn count_of(&self, kind: DiagKind) -> usize {
        self.list.iter().filter(|d| d.kind == kind).count()
    }
}

/// Marker for an unrecoverable failure. The diagnostic describing it has
/// already been recorded; callers unwind to the pipeline entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fatal;

/// Result type used by every `require_*` pass entry.
pub type Fallible<T> = Result<T, Fatal>;

/// Error returned from the public compile entry points.
#[derive(Debug)]
pub enum CompileError {
    /// Source errors were reported; the rendered diagnostics are attached.
    Aborted(Vec<String>),
    /// An internal contract was violated (IR-builder assertions and friends).
    Internal(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Aborted(messages) => {
                for (i, m) in messages.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", m)?;
                }
                Ok(())
            }
            CompileError::Internal(m) => write!(f, "internal compiler error: {}", m),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_collect_in_order() {
        let mut diags = Diagnostics::new();
        diags.report(DiagKind::Parse, SourceLoc::new(0, 10), "first".to_string());
        diags.report(DiagKind::Type, SourceLoc::new(0, 20), "second".to_string());

        assert_eq!(diags.len(), 2);
        let messages: Vec<&str> = diags.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(diags.count_of(DiagKind::Parse), 1);
        assert_eq!(diags.count_of(DiagKind::Cycle), 0);
    }

    #[test]
    fn test_compile_error_display() {
        let err = CompileError::Aborted(vec!["a.mica:1: bad".to_string(), "b.mica:2: worse".to_string()]);
        let text = err.to_string();
        assert!(text.contains("a.mica:1: bad"));
        assert!(text.contains("b.mica:2: worse"));

        let internal = CompileError::Internal("finishing a finished block".to_string());
        assert!(internal.to_string().contains("internal compiler error"));
    }
}
