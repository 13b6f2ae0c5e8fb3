//! Error types for the Python executor.
//!
//! Errors come in two tiers. [`ExecutorError`] is returned to the caller as an
//! `Err`: construction failures and input-contract violations. [`GuestFailure`]
//! describes something that went wrong *inside* the sandbox; it is contained,
//! rendered into the execution logs and never returned as an `Err`.

use std::time::Duration;

use thiserror::Error;

/// Marker that prefixes every contained failure rendered into the logs.
pub const ERROR_MARKER: &str = "Code execution failed";

/// Errors surfaced to the host caller.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The guest runtime image (the interpreter wasm) was not found.
    #[error("guest runtime image not found at: {0}")]
    RuntimeImageNotFound(String),

    /// The virtual machine could not be constructed.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInitializationFailed(#[source] anyhow::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The code handed to the executor is not text.
    #[error("invalid code type: {0}")]
    InvalidCodeType(String),

    /// A variable cannot be represented inside the guest.
    #[error("unsupported variable type for '{key}': {reason}")]
    UnsupportedVariableType {
        /// Name of the offending variable.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A variable or tool name is not usable as a Python identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The executor has already been cleaned up.
    #[error("executor has been cleaned up")]
    Closed,

    /// I/O error while loading the runtime image.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Check if this error was raised while constructing the executor.
    pub fn is_initialization_error(&self) -> bool {
        matches!(
            self,
            ExecutorError::RuntimeImageNotFound(_)
                | ExecutorError::RuntimeInitializationFailed(_)
                | ExecutorError::Config(_)
                | ExecutorError::Io(_)
        )
    }

    /// Check if this error is a rejected input (code or variables).
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ExecutorError::InvalidCodeType(_)
                | ExecutorError::UnsupportedVariableType { .. }
                | ExecutorError::InvalidIdentifier(_)
        )
    }
}

/// Result type alias for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// A failure contained inside the sandbox during one execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuestFailure {
    /// A Python exception escaped the executed snippet (including syntax errors).
    #[error("{exception_type}: {message}")]
    Exception {
        /// The type of Python exception (e.g., "ValueError", "SyntaxError").
        exception_type: String,
        /// The exception message.
        message: String,
        /// The formatted Python traceback, if available.
        traceback: Option<String>,
    },

    /// The execution exceeded the wall-clock timeout.
    #[error("TimeoutError: execution timed out after {0:?}")]
    Timeout(Duration),

    /// The guest tried to grow memory past the configured limit.
    #[error("MemoryError: memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// The execution step budget was exhausted.
    #[error("ResourceLimitError: execution step budget exhausted after {consumed} instructions")]
    OutOfFuel {
        /// Fuel consumed before the trap.
        consumed: u64,
    },

    /// The guest trapped or exited without reporting a result.
    #[error("GuestTrap: {0}")]
    Trap(String),
}

impl GuestFailure {
    /// Create a failure from raw interpreter stderr output.
    ///
    /// Falls back to [`GuestFailure::Trap`] carrying the text when no Python
    /// exception can be recognized.
    pub fn from_python_stderr(stderr: &str) -> Self {
        parse_python_exception(stderr)
            .unwrap_or_else(|| GuestFailure::Trap(stderr.trim().to_string()))
    }

    /// Check if this failure is a Python syntax error.
    pub fn is_syntax_error(&self) -> bool {
        matches!(
            self,
            GuestFailure::Exception { exception_type, .. }
                if exception_type == "SyntaxError"
                    || exception_type == "IndentationError"
                    || exception_type == "TabError"
        )
    }

    /// Check if this failure represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GuestFailure::Timeout(_))
    }

    /// Check if this failure represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, GuestFailure::MemoryLimitExceeded(_))
    }

    /// Check if this failure represents a Python exception.
    pub fn is_python_exception(&self) -> bool {
        matches!(self, GuestFailure::Exception { .. })
    }

    /// Check if this failure represents an out-of-fuel condition.
    pub fn is_out_of_fuel(&self) -> bool {
        matches!(self, GuestFailure::OutOfFuel { .. })
    }

    /// Check if a resource limit (time, memory, fuel) stopped the guest.
    pub fn is_resource_limit(&self) -> bool {
        self.is_timeout() || self.is_memory_limit() || self.is_out_of_fuel()
    }

    /// Render the human-readable diagnostic appended to the logs.
    pub fn render(&self) -> String {
        match self {
            GuestFailure::Exception {
                traceback: Some(traceback),
                ..
            } if !traceback.trim().is_empty() => {
                format!("{}\n{}: {}\n", traceback.trim_end(), ERROR_MARKER, self)
            }
            _ => format!("{}: {}\n", ERROR_MARKER, self),
        }
    }
}

/// Parse a Python exception from stderr output.
///
/// This attempts to extract the exception type, message, and traceback
/// from Python's standard error output format.
pub fn parse_python_exception(stderr: &str) -> Option<GuestFailure> {
    if stderr.trim().is_empty() {
        return None;
    }

    let lines: Vec<&str> = stderr.lines().collect();

    // The exception line is the last unindented line that names an exception.
    let mut exception_line = None;
    let mut traceback_start = None;

    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("Traceback (most recent call last):") {
            traceback_start = Some(i);
        }
        if !line.starts_with(' ')
            && !line.is_empty()
            && !line.starts_with("Traceback")
            && looks_like_exception(line)
        {
            exception_line = Some((i, *line));
        }
    }

    let (line_idx, exception_str) = exception_line?;
    let (exception_type, message) = match exception_str.find(':') {
        Some(colon_pos) => (
            exception_str[..colon_pos].trim().to_string(),
            exception_str[colon_pos + 1..].trim().to_string(),
        ),
        None => (exception_str.trim().to_string(), String::new()),
    };

    let traceback = traceback_start
        .filter(|start| *start <= line_idx)
        .map(|start| lines[start..=line_idx].join("\n"));

    Some(GuestFailure::Exception {
        exception_type,
        message,
        traceback,
    })
}

/// Check if a line looks like a Python exception.
fn looks_like_exception(line: &str) -> bool {
    const SUFFIXES: [&str; 3] = ["Error", "Exception", "Warning"];
    const STANDALONE: [&str; 4] = [
        "KeyboardInterrupt",
        "SystemExit",
        "StopIteration",
        "GeneratorExit",
    ];

    if !line
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
    {
        return false;
    }

    // The name must be followed by a colon, a space, or the end of the line.
    let terminated_at = |after_idx: usize| {
        after_idx >= line.len() || matches!(line.as_bytes()[after_idx], b':' | b' ' | b'\n')
    };

    let name_end = line.find(':').unwrap_or(line.len());
    let name = &line[..name_end];
    if name.contains(' ') {
        return false;
    }

    for suffix in SUFFIXES {
        if let Some(idx) = name.rfind(suffix) {
            if terminated_at(idx + suffix.len()) {
                return true;
            }
        }
    }

    STANDALONE
        .iter()
        .any(|exc| line.starts_with(exc) && terminated_at(exc.len()))
}
