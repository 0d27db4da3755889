//! Error types surfaced through the embedding API.

use std::fmt;

/// Result of interpreting a source string.
#[derive(Debug)]
pub enum ObaError {
    /// The source failed to compile. One entry per diagnostic, in source
    /// order.
    Compile(Vec<CompileError>),
    /// Execution raised an error that no native handled.
    Runtime(RuntimeError),
}

impl fmt::Display for ObaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errors) => {
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{error}")?;
                }
                Ok(())
            }
            Self::Runtime(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ObaError {}

/// Which phase produced a compile diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Malformed input at the character level: bad escapes, unterminated
    /// strings, stray characters.
    Lex,
    /// Everything the parser and resolver reject.
    Parse,
}

/// A single compile diagnostic with its module and line.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub module: String,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            CompileErrorKind::Lex => "Parse error",
            CompileErrorKind::Parse => "Compile error",
        };
        write!(
            f,
            "{label}: module {} line {}: {}",
            self.module, self.line, self.message
        )
    }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub module: String,
    /// `(script)` for a module's top-level body.
    pub function: String,
    pub line: u32,
}

/// A runtime error: the rendered error value plus the call stack at the
/// point of the raise.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runtime error: {}", self.message)?;
        for frame in &self.trace {
            write!(
                f,
                "\n[line {}] in {}::{}()",
                frame.line, frame.module, frame.function
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let error = CompileError {
            kind: CompileErrorKind::Parse,
            module: "main".to_string(),
            line: 3,
            message: "Expected an identifier".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Compile error: module main line 3: Expected an identifier"
        );
    }

    #[test]
    fn test_runtime_error_display_includes_trace() {
        let error = RuntimeError {
            message: "expected a number value".to_string(),
            trace: vec![
                TraceFrame {
                    module: "main".to_string(),
                    function: "inner".to_string(),
                    line: 7,
                },
                TraceFrame {
                    module: "main".to_string(),
                    function: "(script)".to_string(),
                    line: 2,
                },
            ],
        };
        let rendered = error.to_string();
        assert!(rendered.starts_with("Runtime error: expected a number value"));
        assert!(rendered.contains("[line 7] in main::inner()"));
        assert!(rendered.contains("[line 2] in main::(script)()"));
    }
}
