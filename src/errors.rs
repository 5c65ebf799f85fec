// Error types reported to the host: CompileError and RuntimeError.
//
// Both are rendered to stderr by the CLI/REPL driver; the VM/compiler only
// ever hand back one of these two terminal kinds (spec §7 — there is no
// user-catchable error mechanism inside the scripted language itself).

use colored::Colorize;
use std::fmt;

/// One diagnostic produced while scanning or parsing a single token.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileDiagnostic {
    pub line: usize,
    /// The lexeme the error was reported at, or `None` for "at end".
    pub lexeme: Option<String>,
    pub message: String,
}

impl fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.lexeme {
            Some(lexeme) => write!(
                f,
                "[line {}] Error at '{}': {}",
                self.line, lexeme, self.message
            ),
            None => write!(f, "[line {}] Error at end: {}", self.line, self.message),
        }
    }
}

/// A failed compile. Panic-mode recovery means a single `compile()` call
/// can accumulate several diagnostics before the host sees one terminal
/// `CompileError` status (spec §7).
#[derive(Debug, Clone, Default)]
pub struct CompileError {
    pub diagnostics: Vec<CompileDiagnostic>,
}

impl CompileError {
    pub fn push(&mut self, diag: CompileDiagnostic) {
        self.diagnostics.push(diag);
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for diag in &self.diagnostics {
            writeln!(f, "{}", diag.to_string().red().bold())?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// One frame of the call-stack trace printed alongside a runtime error.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: Option<usize>,
    /// The enclosing function name, or `None` for the top-level script.
    pub name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "[line {}] in ", line)?,
            None => write!(f, "[unknown line] in ")?,
        }
        match &self.name {
            Some(name) => write!(f, "{}()", name),
            None => write!(f, "script"),
        }
    }
}

/// A runtime error: message plus the frame stack at the moment it was
/// raised, from innermost (top) to outermost (bottom), per spec §4.3.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.message.red().bold())?;
        for frame in &self.trace {
            writeln!(f, "{}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// The outcome of a single `interpret` call (spec §6).
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{}", e),
            InterpretError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl From<CompileError> for InterpretError {
    fn from(e: CompileError) -> Self {
        InterpretError::Compile(e)
    }
}

impl From<RuntimeError> for InterpretError {
    fn from(e: RuntimeError) -> Self {
        InterpretError::Runtime(e)
    }
}
