//! Error types and handling for the telephony core
//!
//! Errors are grouped by functional area so callers can pick a recovery
//! strategy without matching every variant:
//!
//! - **Configuration** - invalid settings; fail before any transport opens
//! - **Transport** - WebSocket connectivity; usually retried by the
//!   reconnect supervisor
//! - **Registration** - REGISTER outcomes, including the auth taxonomy
//! - **Session / Line** - call lifecycle and capacity violations
//! - **Subscription** - BLF SUBSCRIBE rejections
//! - **Media / Indicator** - injected-capability failures
//!
//! The `category()`, `is_recoverable()` and `is_auth_error()` helpers
//! exist for metrics and for retry decisions:
//!
//! ```rust
//! use triline_core::PhoneError;
//!
//! let err = PhoneError::AllLinesBusy;
//! assert_eq!(err.category(), "line");
//! assert!(!err.is_recoverable());
//!
//! let err = PhoneError::registration_failed(Some(503), "Service Unavailable");
//! assert!(err.is_recoverable());
//! ```

use thiserror::Error;

use crate::session::SessionId;

/// Result type alias for telephony-core operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Errors surfaced by the telephony core
#[derive(Error, Debug, Clone)]
pub enum PhoneError {
    /// A configuration field is present but unusable
    #[error("invalid configuration: {field} - {reason}")]
    InvalidConfiguration {
        /// Offending field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// A required configuration field is absent
    #[error("missing required configuration: {field}")]
    MissingConfiguration {
        /// The absent field
        field: &'static str,
    },

    /// The WebSocket channel failed or refused to open
    #[error("transport failed: {reason}")]
    TransportFailed {
        /// Failure detail
        reason: String,
    },

    /// An operation needed the transport but it is not connected
    #[error("transport is not connected")]
    TransportClosed,

    /// The reconnect supervisor ran out of attempts
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,

    /// An operation required an active registration
    #[error("not registered with server")]
    NotRegistered,

    /// REGISTER was rejected or timed out
    #[error("registration failed ({status_code:?}): {reason}")]
    RegistrationFailed {
        /// SIP status code when the server answered
        status_code: Option<u16>,
        /// Failure detail
        reason: String,
    },

    /// Credentials were rejected (401/403 after answering a challenge)
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Failure detail
        reason: String,
    },

    /// Call setup failed before the session reached Established
    #[error("call setup failed ({status_code:?}): {reason}")]
    CallSetupFailed {
        /// SIP status code when the far end answered
        status_code: Option<u16>,
        /// Failure detail
        reason: String,
    },

    /// A BLF SUBSCRIBE was rejected by the server
    #[error("subscription for {extension} rejected ({status_code:?})")]
    SubscriptionRejected {
        /// Monitored extension
        extension: String,
        /// SIP status code when the server answered
        status_code: Option<u16>,
    },

    /// No session exists under the given id
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The unknown id
        session_id: SessionId,
    },

    /// The session exists but is in the wrong state for the operation
    #[error("invalid session state for {session_id}: {current_state}")]
    InvalidSessionState {
        /// Target session
        session_id: SessionId,
        /// Its current state, for diagnostics
        current_state: String,
    },

    /// The session vanished while a multi-step operation was running
    /// (benign when a DTMF sequence had already completed)
    #[error("session gone: {session_id}")]
    SessionGone {
        /// The departed session
        session_id: SessionId,
    },

    /// A serialized per-session SIP operation is already outstanding
    #[error("operation already in progress on {session_id}: {operation}")]
    OperationInProgress {
        /// Target session
        session_id: SessionId,
        /// The outstanding operation
        operation: &'static str,
    },

    /// All three line slots are occupied
    #[error("all lines busy")]
    AllLinesBusy,

    /// Line number outside 1..=3, or the slot is not usable for the call
    #[error("invalid line: {line}")]
    InvalidLine {
        /// The offending line number
        line: u8,
    },

    /// A SIP transaction received no final response in time
    #[error("transaction timeout waiting for {method} response")]
    TransactionTimeout {
        /// The request method
        method: &'static str,
    },

    /// A REFER-based transfer could not complete
    #[error("transfer failed: {reason}")]
    TransferFailed {
        /// Failure detail
        reason: String,
    },

    /// The injected media engine reported a failure
    #[error("media error: {reason}")]
    MediaError {
        /// Failure detail
        reason: String,
    },

    /// A hold/unhold renegotiation was rejected; `on_hold` is unchanged
    #[error("hold renegotiation failed: {reason}")]
    HoldFailed {
        /// Failure detail
        reason: String,
    },

    /// A DTMF tone outside {0-9, *, #}
    #[error("invalid DTMF tone: {tone:?}")]
    InvalidDtmfTone {
        /// The rejected character
        tone: char,
    },

    /// The busy-light bridge is unreachable
    #[error("lamp driver unavailable: {reason}")]
    LampUnavailable {
        /// Failure detail
        reason: String,
    },

    /// A malformed SIP message or body
    #[error("SIP wire error: {0}")]
    Wire(#[from] triline_sip::Error),

    /// Internal invariant violation
    #[error("internal error: {message}")]
    InternalError {
        /// Diagnostic detail
        message: String,
    },
}

impl PhoneError {
    /// Shorthand for [`PhoneError::TransportFailed`]
    pub fn transport(reason: impl Into<String>) -> Self {
        PhoneError::TransportFailed { reason: reason.into() }
    }

    /// Shorthand for [`PhoneError::RegistrationFailed`]
    pub fn registration_failed(status_code: Option<u16>, reason: impl Into<String>) -> Self {
        PhoneError::RegistrationFailed { status_code, reason: reason.into() }
    }

    /// Shorthand for [`PhoneError::MediaError`]
    pub fn media(reason: impl Into<String>) -> Self {
        PhoneError::MediaError { reason: reason.into() }
    }

    /// Shorthand for [`PhoneError::CallSetupFailed`]
    pub fn call_setup_failed(status_code: Option<u16>, reason: impl Into<String>) -> Self {
        PhoneError::CallSetupFailed { status_code, reason: reason.into() }
    }

    /// Shorthand for [`PhoneError::InternalError`]
    pub fn internal(message: impl Into<String>) -> Self {
        PhoneError::InternalError { message: message.into() }
    }

    /// Whether retrying the same operation later can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            PhoneError::TransportFailed { .. } => true,
            PhoneError::TransportClosed => true,
            PhoneError::TransactionTimeout { .. } => true,
            PhoneError::LampUnavailable { .. } => true,
            PhoneError::RegistrationFailed { status_code, .. } => {
                matches!(status_code, Some(503) | None)
            }
            PhoneError::SubscriptionRejected { .. } => true,
            _ => false,
        }
    }

    /// Whether this is a credential problem the user must fix
    pub fn is_auth_error(&self) -> bool {
        match self {
            PhoneError::AuthenticationFailed { .. } => true,
            PhoneError::NotRegistered => true,
            PhoneError::RegistrationFailed { status_code, .. } => {
                matches!(status_code, Some(401) | Some(403))
            }
            _ => false,
        }
    }

    /// Coarse grouping for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            PhoneError::InvalidConfiguration { .. }
            | PhoneError::MissingConfiguration { .. } => "configuration",
            PhoneError::TransportFailed { .. }
            | PhoneError::TransportClosed
            | PhoneError::ReconnectExhausted => "transport",
            PhoneError::NotRegistered
            | PhoneError::RegistrationFailed { .. }
            | PhoneError::AuthenticationFailed { .. } => "registration",
            PhoneError::SubscriptionRejected { .. } => "subscription",
            PhoneError::SessionNotFound { .. }
            | PhoneError::InvalidSessionState { .. }
            | PhoneError::SessionGone { .. }
            | PhoneError::OperationInProgress { .. }
            | PhoneError::CallSetupFailed { .. }
            | PhoneError::TransferFailed { .. } => "session",
            PhoneError::AllLinesBusy | PhoneError::InvalidLine { .. } => "line",
            PhoneError::TransactionTimeout { .. } | PhoneError::Wire(_) => "protocol",
            PhoneError::MediaError { .. }
            | PhoneError::HoldFailed { .. }
            | PhoneError::InvalidDtmfTone { .. } => "media",
            PhoneError::LampUnavailable { .. } => "indicator",
            PhoneError::InternalError { .. } => "system",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_predicates() {
        assert!(PhoneError::registration_failed(Some(401), "Unauthorized").is_auth_error());
        assert!(PhoneError::registration_failed(Some(403), "Forbidden").is_auth_error());
        assert!(PhoneError::registration_failed(Some(503), "Unavailable").is_recoverable());
        assert!(!PhoneError::registration_failed(Some(404), "Not Found").is_recoverable());
        assert!(!PhoneError::AllLinesBusy.is_recoverable());
    }

    #[test]
    fn categories_cover_the_spec_table() {
        assert_eq!(
            PhoneError::MissingConfiguration { field: "server" }.category(),
            "configuration"
        );
        assert_eq!(PhoneError::TransportClosed.category(), "transport");
        assert_eq!(
            PhoneError::SubscriptionRejected { extension: "100".into(), status_code: Some(404) }
                .category(),
            "subscription"
        );
        assert_eq!(PhoneError::AllLinesBusy.category(), "line");
        assert_eq!(
            PhoneError::HoldFailed { reason: "488".into() }.category(),
            "media"
        );
        assert_eq!(
            PhoneError::LampUnavailable { reason: "timeout".into() }.category(),
            "indicator"
        );
    }
}
