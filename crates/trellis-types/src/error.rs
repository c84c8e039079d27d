//! Portable error taxonomy for the trellis runtime.
//!
//! Every fallible operation in the workspace returns [`Error`]. The variants
//! are portable kinds, not platform errnos: the same set is produced by the
//! context, the channel base and the loop, so callers can branch on
//! [`ErrorCode::code`] without caring which layer failed.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`Error::Invalid`] | `INVALID` | No |
//! | [`Error::NotFound`] | `NOT_FOUND` | No |
//! | [`Error::AlreadyExists`] | `ALREADY_EXISTS` | No |
//! | [`Error::Again`] | `AGAIN` | Yes |
//! | [`Error::NoMemory`] | `NO_MEMORY` | No |
//! | [`Error::NoEntry`] | `NO_ENTRY` | No |
//! | [`Error::TimedOut`] | `TIMED_OUT` | Yes |
//!
//! `AGAIN` is a flow signal rather than a failure: "no work right now" from
//! `process`, "would block" from `post`, "reinit requested" from `init`.
//!
//! # Example
//!
//! ```
//! use trellis_types::{Error, ErrorCode};
//!
//! let err = Error::NotFound("channel 'input'".into());
//! assert_eq!(err.code(), "NOT_FOUND");
//! assert!(!err.is_recoverable());
//! assert!(Error::Again.is_recoverable());
//! ```

use thiserror::Error as ThisError;

/// Runtime error kind.
///
/// Carries a short human-readable context string where one helps; the
/// machine-readable part is [`ErrorCode::code`].
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Malformed input: bad URL, missing required field, null/dead channel,
    /// failed sub-init.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Unknown protocol, alias, master name, address or callback.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration or duplicate name in the context index.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// No work available right now / operation would block / reinit
    /// requested. Retry later.
    #[error("try again")]
    Again,

    /// Resource allocation failed.
    #[error("out of memory")]
    NoMemory,

    /// Module symbol or stat page missing.
    #[error("no entry: {0}")]
    NoEntry(String),

    /// Deadline expired while waiting.
    #[error("timed out")]
    TimedOut,
}

impl Error {
    /// Shorthand for [`Error::Invalid`] with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Returns `true` for the `AGAIN` flow signal.
    #[must_use]
    pub fn is_again(&self) -> bool {
        matches!(self, Self::Again)
    }
}

/// Unified error code interface.
///
/// Implemented by [`Error`] and available for embedder error types that wrap
/// it. Codes are UPPER_SNAKE_CASE and stable.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;

    /// Returns whether retrying the operation may succeed.
    fn is_recoverable(&self) -> bool;
}

impl ErrorCode for Error {
    fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "INVALID",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Again => "AGAIN",
            Self::NoMemory => "NO_MEMORY",
            Self::NoEntry(_) => "NO_ENTRY",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Again | Self::TimedOut)
    }
}

/// Workspace-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Validates that an error code is well-formed UPPER_SNAKE_CASE.
///
/// # Panics
///
/// Panics with a descriptive message if validation fails.
pub fn assert_error_code<E: ErrorCode>(err: &E) {
    let code = err.code();
    assert!(!code.is_empty(), "Error code must not be empty");
    assert!(
        is_upper_snake_case(code),
        "Error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Validates all variants of an error enum at once.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E]) {
    for err in errors {
        assert_error_code(err);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<Error> {
        vec![
            Error::Invalid("x".into()),
            Error::NotFound("x".into()),
            Error::AlreadyExists("x".into()),
            Error::Again,
            Error::NoMemory,
            Error::NoEntry("x".into()),
            Error::TimedOut,
        ]
    }

    #[test]
    fn all_error_codes_valid() {
        assert_error_codes(&all_variants());
    }

    #[test]
    fn codes_match_kinds() {
        assert_eq!(Error::Invalid("".into()).code(), "INVALID");
        assert_eq!(Error::NotFound("".into()).code(), "NOT_FOUND");
        assert_eq!(Error::AlreadyExists("".into()).code(), "ALREADY_EXISTS");
        assert_eq!(Error::Again.code(), "AGAIN");
        assert_eq!(Error::NoMemory.code(), "NO_MEMORY");
        assert_eq!(Error::NoEntry("".into()).code(), "NO_ENTRY");
        assert_eq!(Error::TimedOut.code(), "TIMED_OUT");
    }

    #[test]
    fn only_flow_signals_are_recoverable() {
        for err in all_variants() {
            let expected = matches!(err, Error::Again | Error::TimedOut);
            assert_eq!(err.is_recoverable(), expected, "{:?}", err);
        }
    }

    #[test]
    fn again_helper() {
        assert!(Error::Again.is_again());
        assert!(!Error::TimedOut.is_again());
    }
}
