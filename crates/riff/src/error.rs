//! Runtime error taxonomy.
//!
//! All interpreter and builtin failures are represented as a [`RunError`]
//! carrying an [`ErrorKind`] and a message. Errors propagate with `?` to the
//! nearest `eval` invocation boundary and are observable by its caller.
//!
//! Trace aborts and guard failures are deliberately *not* errors: an abort
//! discards the in-progress IR and resumes normal interpretation, and a guard
//! failure is the normal side-exit path back into the interpreter.

use std::fmt;

use strum::{Display, IntoStaticStr};

/// Result type alias for operations that can raise a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Classification of runtime errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// Operating on a value of the wrong type (calling a non-function,
    /// indexing a non-vector, arithmetic on a list).
    Type,
    /// Builtin called with the wrong number of arguments.
    Arity,
    /// Subscript out of bounds; `[[` is stricter than `[`.
    Subscript,
    /// "object not found": a non-promise, non-default Nil was consumed.
    NotFound,
    /// Malformed input to an operation (bad `rm` argument, bad branch index).
    Invalid,
    /// Raised by `stop(message)` in user code.
    User,
    /// Invariant violation inside the runtime itself.
    Internal,
}

/// A runtime error raised by the interpreter or a builtin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    kind: ErrorKind,
    message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn arity(name: &str, expected: usize, got: usize) -> Self {
        Self::new(ErrorKind::Arity, format!("{name}: expected {expected} argument(s), got {got}"))
    }

    pub fn out_of_bounds(index: i64, len: usize) -> Self {
        Self::new(ErrorKind::Subscript, format!("subscript out of bounds: {index} (length {len})"))
    }

    pub fn not_found(name: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("object '{name}' not found"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RunError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = RunError::not_found("x");
        assert_eq!(err.to_string(), "NotFound: object 'x' not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn arity_message_shape() {
        let err = RunError::arity("sum", 1, 3);
        assert_eq!(err.kind(), ErrorKind::Arity);
        assert!(err.message().contains("expected 1"));
    }
}
