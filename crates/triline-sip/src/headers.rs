//! # SIP Headers
//!
//! Header storage and the typed accessors the softphone core needs.
//! Headers are kept as ordered (name, raw value) pairs - wire order is
//! preserved and multiple values of the same header coexist - with typed
//! parsing applied lazily through accessor methods, so unknown headers
//! pass through untouched.
//!
//! The [`SubscriptionState`] type models the RFC 6665 Subscription-State
//! header used by the dialog event package.
//!
//! ## Examples
//!
//! ```rust
//! use triline_sip::{Headers, HeaderName, Method};
//!
//! let mut headers = Headers::new();
//! headers.push(HeaderName::CallId, "f81d4fae@ws.example.net");
//! headers.push(HeaderName::CSeq, "2 INVITE");
//!
//! assert_eq!(headers.call_id().unwrap(), "f81d4fae@ws.example.net");
//! let (seq, method) = headers.cseq().unwrap();
//! assert_eq!((seq, method), (2, Method::Invite));
//! ```

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::{Error, Method, NameAddr, Result};

/// A SIP header field name
///
/// Known names carry their canonical spelling; anything else is preserved
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderName {
    Via,
    From,
    To,
    Contact,
    CallId,
    CSeq,
    MaxForwards,
    Expires,
    ContentType,
    ContentLength,
    Event,
    SubscriptionState,
    ReferTo,
    ReferredBy,
    Authorization,
    ProxyAuthorization,
    WwwAuthenticate,
    ProxyAuthenticate,
    Allow,
    AllowEvents,
    Supported,
    UserAgent,
    Accept,
    Reason,
    /// Any header this stack does not interpret
    Other(String),
}

impl HeaderName {
    /// Canonical wire spelling
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::Contact => "Contact",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Expires => "Expires",
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::Event => "Event",
            HeaderName::SubscriptionState => "Subscription-State",
            HeaderName::ReferTo => "Refer-To",
            HeaderName::ReferredBy => "Referred-By",
            HeaderName::Authorization => "Authorization",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::Allow => "Allow",
            HeaderName::AllowEvents => "Allow-Events",
            HeaderName::Supported => "Supported",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Accept => "Accept",
            HeaderName::Reason => "Reason",
            HeaderName::Other(name) => name.as_str(),
        }
    }

    /// Parse a wire name, folding RFC 3261 compact forms into their long
    /// equivalents
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        match name.to_ascii_lowercase().as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "contact" | "m" => HeaderName::Contact,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "max-forwards" => HeaderName::MaxForwards,
            "expires" => HeaderName::Expires,
            "content-type" | "c" => HeaderName::ContentType,
            "content-length" | "l" => HeaderName::ContentLength,
            "event" | "o" => HeaderName::Event,
            "subscription-state" => HeaderName::SubscriptionState,
            "refer-to" | "r" => HeaderName::ReferTo,
            "referred-by" | "b" => HeaderName::ReferredBy,
            "authorization" => HeaderName::Authorization,
            "proxy-authorization" => HeaderName::ProxyAuthorization,
            "www-authenticate" => HeaderName::WwwAuthenticate,
            "proxy-authenticate" => HeaderName::ProxyAuthenticate,
            "allow" => HeaderName::Allow,
            "allow-events" | "u" => HeaderName::AllowEvents,
            "supported" | "k" => HeaderName::Supported,
            "user-agent" => HeaderName::UserAgent,
            "accept" => HeaderName::Accept,
            "reason" => HeaderName::Reason,
            _ => HeaderName::Other(name.to_string()),
        }
    }

    fn matches(&self, other: &HeaderName) -> bool {
        match (self, other) {
            (HeaderName::Other(a), HeaderName::Other(b)) => a.eq_ignore_ascii_case(b),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One header field: canonical name plus raw value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: HeaderName,
    pub value: String,
}

/// An ordered header collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// An empty collection
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Append a header, keeping any existing values of the same name
    pub fn push(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.push(Header { name, value: value.into() });
    }

    /// Replace all values of `name` with a single value
    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.retain(|h| !h.name.matches(&name));
        self.push(name, value);
    }

    /// Remove all values of `name`
    pub fn remove(&mut self, name: &HeaderName) {
        self.0.retain(|h| !h.name.matches(name));
    }

    /// First value of `name`, if present
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.matches(name))
            .map(|h| h.value.as_str())
    }

    /// All values of `name`, in wire order
    pub fn get_all<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.matches(name))
            .map(|h| h.value.as_str())
    }

    /// Iterate every header in wire order
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// Number of header fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    // ---- typed accessors -------------------------------------------------

    /// Call-ID value
    pub fn call_id(&self) -> Result<&str> {
        self.get(&HeaderName::CallId)
            .ok_or(Error::MissingHeader("Call-ID"))
    }

    /// CSeq sequence number and method
    pub fn cseq(&self) -> Result<(u32, Method)> {
        let raw = self.get(&HeaderName::CSeq).ok_or(Error::MissingHeader("CSeq"))?;
        let (seq, method) = raw
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::header("CSeq", raw))?;
        let seq = seq
            .parse::<u32>()
            .map_err(|_| Error::header("CSeq", format!("bad sequence number: {}", seq)))?;
        Ok((seq, method.trim().parse()?))
    }

    /// Parsed From header
    pub fn from_addr(&self) -> Result<NameAddr> {
        self.get(&HeaderName::From)
            .ok_or(Error::MissingHeader("From"))?
            .parse()
    }

    /// Parsed To header
    pub fn to_addr(&self) -> Result<NameAddr> {
        self.get(&HeaderName::To)
            .ok_or(Error::MissingHeader("To"))?
            .parse()
    }

    /// Parsed Contact header, if present
    pub fn contact(&self) -> Option<NameAddr> {
        self.get(&HeaderName::Contact).and_then(|v| v.parse().ok())
    }

    /// Parsed Refer-To header
    pub fn refer_to(&self) -> Result<NameAddr> {
        self.get(&HeaderName::ReferTo)
            .ok_or(Error::MissingHeader("Refer-To"))?
            .parse()
    }

    /// Expires header value in seconds, if present and numeric
    pub fn expires(&self) -> Option<u32> {
        self.get(&HeaderName::Expires)?.trim().parse().ok()
    }

    /// Content-Type value, if present
    pub fn content_type(&self) -> Option<&str> {
        self.get(&HeaderName::ContentType)
    }

    /// Event package token (parameters stripped), if present
    pub fn event_package(&self) -> Option<&str> {
        let raw = self.get(&HeaderName::Event)?;
        Some(raw.split(';').next().unwrap_or(raw).trim())
    }

    /// Parsed Subscription-State header
    pub fn subscription_state(&self) -> Result<SubscriptionState> {
        self.get(&HeaderName::SubscriptionState)
            .ok_or(Error::MissingHeader("Subscription-State"))?
            .parse()
    }

    /// The branch parameter of the topmost Via, if present
    pub fn via_branch(&self) -> Option<&str> {
        let via = self.get(&HeaderName::Via)?;
        via.split(';')
            .skip(1)
            .filter_map(|p| p.trim().split_once('='))
            .find(|(n, _)| n.eq_ignore_ascii_case("branch"))
            .map(|(_, v)| v.trim())
    }
}

/// Subscription lifecycle as carried in NOTIFY requests (RFC 6665)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubState {
    /// Notifications will flow
    Active,
    /// Awaiting authorization
    Pending,
    /// Subscription has ended
    Terminated,
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubState::Active => write!(f, "active"),
            SubState::Pending => write!(f, "pending"),
            SubState::Terminated => write!(f, "terminated"),
        }
    }
}

impl FromStr for SubState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SubState::Active),
            "pending" => Ok(SubState::Pending),
            "terminated" => Ok(SubState::Terminated),
            other => Err(Error::header(
                "Subscription-State",
                format!("unknown state: {}", other),
            )),
        }
    }
}

/// Parsed Subscription-State header value
///
/// ```text
/// Subscription-State: active;expires=3600
/// Subscription-State: terminated;reason=noresource
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    /// The subscription state token
    pub state: SubState,
    /// Remaining lifetime in seconds, when advertised
    pub expires: Option<u32>,
    /// Termination reason, when advertised
    pub reason: Option<String>,
    /// Suggested re-subscribe delay in seconds, when advertised
    pub retry_after: Option<u32>,
}

impl FromStr for SubscriptionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let state: SubState = parts
            .next()
            .ok_or_else(|| Error::header("Subscription-State", "empty value"))?
            .parse()?;

        let mut out = SubscriptionState { state, expires: None, reason: None, retry_after: None };
        for part in parts {
            if let Some((name, value)) = part.split_once('=') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "expires" => out.expires = value.trim().parse().ok(),
                    "reason" => out.reason = Some(value.trim().to_string()),
                    "retry-after" => out.retry_after = value.trim().parse().ok(),
                    _ => {}
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ";reason={}", reason)?;
        }
        if let Some(retry) = self.retry_after {
            write!(f, ";retry-after={}", retry)?;
        }
        Ok(())
    }
}
