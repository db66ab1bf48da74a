//! Error types for the SIP wire model
//!
//! Everything in this crate is parsing or serialization, so the error
//! surface is small: malformed input, a header that does not carry what
//! the caller asked for, or a required header that is absent.

use thiserror::Error;

/// Result type alias for wire-model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or interpreting SIP wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Input could not be parsed as the expected grammar
    #[error("parse error: {0}")]
    ParseError(String),

    /// A SIP or absolute URI was malformed
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// A header was present but its value was malformed
    #[error("invalid {name} header: {reason}")]
    InvalidHeader {
        /// Header name as it appeared on the wire
        name: String,
        /// What was wrong with the value
        reason: String,
    },

    /// A header required by the operation was absent
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// A message body did not match its advertised content type
    #[error("invalid body: {0}")]
    InvalidBody(String),
}

impl Error {
    /// Shorthand for a [`Error::ParseError`]
    pub fn parse(reason: impl Into<String>) -> Self {
        Error::ParseError(reason.into())
    }

    /// Shorthand for a [`Error::InvalidHeader`]
    pub fn header(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidHeader {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
