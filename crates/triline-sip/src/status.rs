//! # SIP Status Codes
//!
//! Response status codes per
//! [RFC 3261 §21](https://datatracker.ietf.org/doc/html/rfc3261#section-21),
//! carried as a validated three-digit integer with class predicates and
//! canonical reason phrases for the codes this stack emits itself.
//!
//! ## Examples
//!
//! ```rust
//! use triline_sip::StatusCode;
//!
//! let busy = StatusCode::BUSY_HERE;
//! assert_eq!(busy.as_u16(), 486);
//! assert!(busy.is_client_error());
//! assert_eq!(busy.canonical_reason(), "Busy Here");
//!
//! let ringing = StatusCode::new(180).unwrap();
//! assert!(ringing.is_provisional());
//! assert!(!ringing.is_final());
//! ```

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A SIP response status code in the range 100..=699
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusCode(u16);

impl StatusCode {
    /// 100 Trying
    pub const TRYING: StatusCode = StatusCode(100);
    /// 180 Ringing
    pub const RINGING: StatusCode = StatusCode(180);
    /// 183 Session Progress
    pub const SESSION_PROGRESS: StatusCode = StatusCode(183);
    /// 200 OK
    pub const OK: StatusCode = StatusCode(200);
    /// 202 Accepted (REFER / SUBSCRIBE acceptance, RFC 3515)
    pub const ACCEPTED: StatusCode = StatusCode(202);
    /// 400 Bad Request
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    /// 401 Unauthorized
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    /// 403 Forbidden
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    /// 404 Not Found
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    /// 407 Proxy Authentication Required
    pub const PROXY_AUTHENTICATION_REQUIRED: StatusCode = StatusCode(407);
    /// 408 Request Timeout
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    /// 480 Temporarily Unavailable
    pub const TEMPORARILY_UNAVAILABLE: StatusCode = StatusCode(480);
    /// 481 Call/Transaction Does Not Exist
    pub const CALL_OR_TRANSACTION_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    /// 486 Busy Here
    pub const BUSY_HERE: StatusCode = StatusCode(486);
    /// 487 Request Terminated
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);
    /// 488 Not Acceptable Here
    pub const NOT_ACCEPTABLE_HERE: StatusCode = StatusCode(488);
    /// 500 Server Internal Error
    pub const SERVER_INTERNAL_ERROR: StatusCode = StatusCode(500);
    /// 503 Service Unavailable
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    /// 603 Decline
    pub const DECLINE: StatusCode = StatusCode(603);

    /// Construct a status code, rejecting anything outside 100..=699
    pub fn new(code: u16) -> Result<Self> {
        if (100..=699).contains(&code) {
            Ok(StatusCode(code))
        } else {
            Err(Error::parse(format!("status code out of range: {}", code)))
        }
    }

    /// The numeric code
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// 1xx - provisional, transaction still in progress
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.0)
    }

    /// 2xx - success
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// 3xx - redirection
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.0)
    }

    /// 4xx - client error
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    /// 5xx - server error
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.0)
    }

    /// 6xx - global failure
    pub fn is_global_failure(&self) -> bool {
        (600..700).contains(&self.0)
    }

    /// Any non-provisional code; ends the transaction
    pub fn is_final(&self) -> bool {
        self.0 >= 200
    }

    /// Canonical reason phrase for well-known codes, empty otherwise
    pub fn canonical_reason(&self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            480 => "Temporarily Unavailable",
            481 => "Call/Transaction Does Not Exist",
            486 => "Busy Here",
            487 => "Request Terminated",
            488 => "Not Acceptable Here",
            500 => "Server Internal Error",
            503 => "Service Unavailable",
            603 => "Decline",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
