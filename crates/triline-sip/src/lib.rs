//! # triline-sip
//!
//! The SIP wire model for the triline softphone core: messages, headers,
//! URIs and the event-package bodies a WebSocket UA exchanges. This crate
//! is pure data - no I/O, no async - so the telephony core above it can
//! be exercised with literal wire text in tests.
//!
//! ## What's here
//!
//! - [`Message`] / [`Request`] / [`Response`] - parse and render complete
//!   SIP messages, one per WebSocket text frame (RFC 3261 / RFC 7118)
//! - [`Method`] and [`StatusCode`] - the method and status vocabulary
//! - [`SipUri`] and [`NameAddr`] - addressing, including dial-string
//!   normalization
//! - [`Headers`] - ordered header storage with typed accessors, plus the
//!   RFC 6665 [`SubscriptionState`] model
//! - [`auth`] - RFC 2617 MD5 digest challenges and responses
//! - [`sdp`] - audio-only session descriptions with the RFC 3264
//!   direction attribute used for hold
//! - [`dialog_info`] - RFC 4235 `dialog-info+xml` busy-lamp-field bodies
//! - [`message_summary`] - RFC 3842 voicemail summaries
//! - [`sipfrag`] - RFC 3420 fragments carrying REFER progress

pub mod auth;
pub mod dialog_info;
pub mod error;
pub mod headers;
pub mod message;
pub mod message_summary;
pub mod method;
pub mod sdp;
pub mod sipfrag;
pub mod status;
pub mod uri;

pub use error::{Error, Result};
pub use headers::{Header, HeaderName, Headers, SubState, SubscriptionState};
pub use message::{Message, Request, Response};
pub use method::Method;
pub use status::StatusCode;
pub use uri::{NameAddr, SipUri};

/// Commonly used types in one import
pub mod prelude {
    pub use crate::auth::DigestChallenge;
    pub use crate::dialog_info::{DialogInfo, DialogState};
    pub use crate::message_summary::MessageSummary;
    pub use crate::sdp::{AudioDescription, SdpDirection};
    pub use crate::sipfrag::SipFrag;
    pub use crate::{
        Error, Header, HeaderName, Headers, Message, Method, NameAddr, Request, Response, Result,
        SipUri, StatusCode, SubState, SubscriptionState,
    };
}
