/// Opal host-side error types
///
/// Two tiers live here.  Fatal codes terminate a thread (or the whole
/// process, for the main thread) and are never caught; they carry the
/// dedicated exit codes reported by the CLI driver.  LoadError and RunError
/// are ordinary embedder-facing errors for module loading and entry-point
/// resolution.
///
/// Language-level exceptions are not Rust errors at all; they are heap
/// objects routed through the catch-frame machinery in `except.rs`.

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Fatal thread termination codes
// ---------------------------------------------------------------------------

/// Exit codes for fatal thread termination, starting at 0xe0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fatal {
    Aborted = 0xe0,
    AssertFailed,
    InvalidOpcode,
    StackOverflow,
    StackUnderflow,
    FrameStackOverflow,
    FrameStackUnderflow,
    NoFrame,
    StackRange,
    UncaughtException,
    DoubleException,
}

impl Fatal {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Fatal::Aborted             => "Aborted",
            Fatal::AssertFailed        => "Assertion failed",
            Fatal::InvalidOpcode       => "Invalid instruction",
            Fatal::StackOverflow       => "Stack overflow",
            Fatal::StackUnderflow      => "Stack underflow",
            Fatal::FrameStackOverflow  => "Frame stack overflow",
            Fatal::FrameStackUnderflow => "Frame stack underflow",
            Fatal::NoFrame             => "No frame",
            Fatal::StackRange          => "Stack access range",
            Fatal::UncaughtException   => "Uncaught exception",
            Fatal::DoubleException     => "Double exception",
        };
        f.write_str(msg)
    }
}

// ---------------------------------------------------------------------------
// Non-local control transfer
// ---------------------------------------------------------------------------

/// Carrier for the two non-local exits that cross method boundaries: a
/// raised exception travelling to its catch frame, and fatal thread
/// termination.  Propagated as the `Err` arm of every fallible VM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// A raised exception.  `frame` is the index of the catch frame that
    /// now holds the exception object; the activation that pushed it
    /// resumes there.
    Except { frame: usize },
    /// Thread termination with an exit code.
    Fatal(Fatal),
}

pub type VmResult<T = ()> = Result<T, Unwind>;

// ---------------------------------------------------------------------------
// Embedder-facing errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RunError {
    #[error("entry module {0} not found")]
    ModuleNotFound(String),
    #[error("entry module {0}: {1}")]
    ModuleInit(String, String),
    #[error("entry namespace {0} not found")]
    NamespaceNotFound(String),
    #[error("entry class {0} not found")]
    ClassNotFound(String),
    #[error("entry method {0} not found")]
    MethodNotFound(String),
    #[error("thread terminated: {0}")]
    Fatal(Fatal),
}

impl RunError {
    /// Error codes of the embedding contract: -2 module, -3 init,
    /// -4 namespace, -5 class, -6 method.
    pub fn code(&self) -> i32 {
        match self {
            RunError::ModuleNotFound(_)    => -2,
            RunError::ModuleInit(_, _)     => -3,
            RunError::NamespaceNotFound(_) => -4,
            RunError::ClassNotFound(_)     => -5,
            RunError::MethodNotFound(_)    => -6,
            RunError::Fatal(f)             => f.exit_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes_are_sequential_from_0xe0() {
        assert_eq!(Fatal::Aborted.exit_code(), 0xe0);
        assert_eq!(Fatal::DoubleException.exit_code(), 0xea);
        assert_eq!(Fatal::StackRange.exit_code(), 0xe8);
    }

    #[test]
    fn run_error_codes() {
        assert_eq!(RunError::ModuleNotFound("x".into()).code(), -2);
        assert_eq!(RunError::MethodNotFound("start".into()).code(), -6);
    }
}
