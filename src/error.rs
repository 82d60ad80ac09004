//! Error type shared by every fallible operation in the crate.
//!
//! There is a single error kind: a human-readable message plus the source
//! location that produced it. Asynchronous failures travel through promise
//! rejection carrying this same type, so embedder code handles sync and
//! async errors identically.

use std::panic::Location;

/// Error with a message and the location where it was raised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({file}:{line})")]
pub struct Error {
    message: String,
    file: &'static str,
    line: u32,
}

impl Error {
    /// Creates an error, capturing the caller's source location.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            message: message.into(),
            file: location.file(),
            line: location.line(),
        }
    }

    /// The message without the location suffix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source file that raised the error.
    pub fn file(&self) -> &'static str {
        self.file
    }

    /// Line within [`Error::file`].
    pub fn line(&self) -> u32 {
        self.line
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_captures_location() {
        let err = Error::new("something failed");
        assert_eq!(err.message(), "something failed");
        assert!(err.file().ends_with("error.rs"));
        assert!(err.line() > 0);
    }

    #[test]
    fn test_error_display_includes_location() {
        let err = Error::new("bad input");
        let text = err.to_string();
        assert!(text.starts_with("bad input ("));
        assert!(text.contains("error.rs"));
    }
}
