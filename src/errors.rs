// Structured compile/runtime diagnostics. Generalized from the teacher's
// src/errors.rs (SourceLocation + colored::Display) down to the two kinds
// this VM actually raises: CompileError (one per diagnostic, the compiler
// keeps going after each via panic-mode recovery) and RuntimeError (one shot,
// carries a back-trace of call frames at the point of failure).

use colored::Colorize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: u32) -> Self {
        SourceLocation { line, file: None }
    }

    pub fn with_file(line: u32, file: String) -> Self {
        SourceLocation { line, file: Some(file) }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}", file, self.line),
            None => write!(f, "[line {}]", self.line),
        }
    }
}

/// One diagnostic produced while compiling a chunk. `compile()` collects
/// every `CompileError` it synchronizes past instead of stopping at the
/// first one.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub location: SourceLocation,
    pub message: String,
    pub lexeme: Option<String>,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        CompileError { location: SourceLocation::new(line), message: message.into(), lexeme: None }
    }

    pub fn at(line: u32, lexeme: &str, message: impl Into<String>) -> Self {
        CompileError {
            location: SourceLocation::new(line),
            message: message.into(),
            lexeme: Some(lexeme.to_string()),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", "[compile error]".red().bold(), self.location.to_string().bright_blue())?;
        if let Some(lexeme) = &self.lexeme {
            write!(f, " at '{}'", lexeme)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// A single call-frame line in a runtime back-trace: `[line L] in <name>`.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        RuntimeError { message: message.into(), trace }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{} {}", "[runtime error]".red().bold(), self.message.bold())?;
        for frame in self.trace.iter().rev() {
            writeln!(f, "{}", format!("[line {}] in {}", frame.line, frame.name).bright_blue())?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display_includes_line_and_message() {
        let err = CompileError::at(3, "foo", "Undefined variable.");
        let rendered = format!("{}", err);
        assert!(rendered.contains("foo"));
        assert!(rendered.contains("Undefined variable."));
    }

    #[test]
    fn runtime_error_renders_trace_innermost_first() {
        let err = RuntimeError::new(
            "Stack overflow.",
            vec![
                TraceFrame { line: 1, name: "script".to_string() },
                TraceFrame { line: 5, name: "recurse".to_string() },
            ],
        );
        let rendered = format!("{}", err);
        let recurse_pos = rendered.find("recurse").unwrap();
        let script_pos = rendered.find("script").unwrap();
        assert!(recurse_pos < script_pos);
    }
}
