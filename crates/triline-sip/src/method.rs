//! # SIP Request Methods
//!
//! The method set used by a WebSocket softphone UA per
//! [RFC 3261](https://datatracker.ietf.org/doc/html/rfc3261) and the
//! event/transfer extensions it relies on:
//! [RFC 6665](https://datatracker.ietf.org/doc/html/rfc6665) (SUBSCRIBE /
//! NOTIFY) and [RFC 3515](https://datatracker.ietf.org/doc/html/rfc3515)
//! (REFER).
//!
//! ## Examples
//!
//! ```rust
//! use triline_sip::Method;
//! use std::str::FromStr;
//!
//! assert_eq!(Method::Invite.to_string(), "INVITE");
//! assert_eq!(Method::from_str("REFER").unwrap(), Method::Refer);
//! assert!(Method::from_str("PUBLISH").is_err());
//! ```

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A SIP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Bind a contact to an address-of-record (RFC 3261)
    Register,
    /// Initiate or renegotiate a session (RFC 3261)
    Invite,
    /// Acknowledge a final INVITE response (RFC 3261)
    Ack,
    /// Cancel a pending INVITE transaction (RFC 3261)
    Cancel,
    /// Terminate an established dialog (RFC 3261)
    Bye,
    /// Ask the peer to issue a request on our behalf (RFC 3515)
    Refer,
    /// Create or refresh an event subscription (RFC 6665)
    Subscribe,
    /// Deliver event state inside a subscription dialog (RFC 6665)
    Notify,
    /// Mid-dialog application data, used for DTMF fallback (RFC 6086)
    Info,
    /// Page-mode instant message (RFC 3428)
    Message,
    /// Capability query (RFC 3261)
    Options,
}

impl Method {
    /// Canonical wire form of the method token
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Options => "OPTIONS",
        }
    }

    /// Whether a request with this method creates a dialog of its own
    pub fn creates_dialog(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REGISTER" => Ok(Method::Register),
            "INVITE" => Ok(Method::Invite),
            "ACK" => Ok(Method::Ack),
            "CANCEL" => Ok(Method::Cancel),
            "BYE" => Ok(Method::Bye),
            "REFER" => Ok(Method::Refer),
            "SUBSCRIBE" => Ok(Method::Subscribe),
            "NOTIFY" => Ok(Method::Notify),
            "INFO" => Ok(Method::Info),
            "MESSAGE" => Ok(Method::Message),
            "OPTIONS" => Ok(Method::Options),
            other => Err(Error::parse(format!("unknown SIP method: {}", other))),
        }
    }
}
