//! # SIP URIs and name-addr forms
//!
//! A deliberately small URI model per
//! [RFC 3261 §19.1](https://datatracker.ietf.org/doc/html/rfc3261#section-19.1):
//! scheme, optional user, host, optional port and flat parameters. That is
//! the entire vocabulary a WebSocket softphone needs - no `headers`
//! component, no telephone-subscriber syntax.
//!
//! [`NameAddr`] wraps a URI with an optional display name and header
//! parameters, covering the From / To / Contact / Refer-To header shapes.
//!
//! ## Examples
//!
//! ```rust
//! use triline_sip::{SipUri, NameAddr};
//! use std::str::FromStr;
//!
//! let uri = SipUri::from_str("sip:2001@pbx.example.net:5060;transport=ws").unwrap();
//! assert_eq!(uri.user.as_deref(), Some("2001"));
//! assert_eq!(uri.host, "pbx.example.net");
//! assert_eq!(uri.port, Some(5060));
//! assert_eq!(uri.param("transport"), Some("ws"));
//!
//! let addr = NameAddr::from_str("\"Front Desk\" <sip:100@example.net>;tag=a1b2").unwrap();
//! assert_eq!(addr.display_name.as_deref(), Some("Front Desk"));
//! assert_eq!(addr.tag(), Some("a1b2"));
//! ```

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// URI parameters as ordered (name, optional value) pairs
pub type UriParams = Vec<(String, Option<String>)>;

/// A SIP or SIPS URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipUri {
    /// True for `sips:`, false for `sip:`
    pub secure: bool,
    /// Userinfo component, absent for domain-only URIs
    pub user: Option<String>,
    /// Host (domain name or address literal)
    pub host: String,
    /// Explicit port, if any
    pub port: Option<u16>,
    /// URI parameters in wire order
    pub params: UriParams,
}

impl SipUri {
    /// Build a `sip:user@host` URI with no port or parameters
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        SipUri {
            secure: false,
            user: Some(user.into()),
            host: host.into(),
            port: None,
            params: Vec::new(),
        }
    }

    /// Build a domain-only `sip:host` URI
    pub fn domain(host: impl Into<String>) -> Self {
        SipUri {
            secure: false,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
        }
    }

    /// Append a URI parameter
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push((name.into(), value.map(str::to_string)));
        self
    }

    /// Value of a named parameter; `Some("")` for valueless flags
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// Normalize a dial string into a URI within `domain`.
    ///
    /// Full `sip:`/`sips:` targets are parsed as-is; anything else is
    /// treated as a user part (extension or number) in the given domain.
    pub fn from_dial_target(target: &str, domain: &str) -> Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            return Err(Error::InvalidUri("empty dial target".into()));
        }
        if target.starts_with("sip:") || target.starts_with("sips:") {
            return target.parse();
        }
        if target.contains('@') {
            return format!("sip:{}", target).parse();
        }
        Ok(SipUri::new(target, domain))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", if self.secure { "sips" } else { "sip" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (secure, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (false, rest)
        } else {
            return Err(Error::InvalidUri(format!("missing sip/sips scheme: {}", s)));
        };

        let (addr, param_str) = match rest.find(';') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        let (user, hostport) = match addr.rfind('@') {
            Some(idx) => (Some(addr[..idx].to_string()), &addr[idx + 1..]),
            None => (None, addr),
        };

        let (host, port) = match hostport.rfind(':') {
            Some(idx) => {
                let port = hostport[idx + 1..]
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidUri(format!("bad port in: {}", s)))?;
                (hostport[..idx].to_string(), Some(port))
            }
            None => (hostport.to_string(), None),
        };
        if host.is_empty() {
            return Err(Error::InvalidUri(format!("empty host in: {}", s)));
        }

        let params = match param_str {
            Some(p) => parse_params(p),
            None => Vec::new(),
        };

        Ok(SipUri { secure, user, host, port, params })
    }
}

/// A display name + URI + header parameters, the name-addr production
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAddr {
    /// Optional quoted or token display name
    pub display_name: Option<String>,
    /// The wrapped URI
    pub uri: SipUri,
    /// Header parameters following the closing angle bracket (e.g. `tag`)
    pub params: UriParams,
}

impl NameAddr {
    /// Wrap a URI with no display name or parameters
    pub fn new(uri: SipUri) -> Self {
        NameAddr { display_name: None, uri, params: Vec::new() }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Append a header parameter
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push((name.into(), value.map(str::to_string)));
        self
    }

    /// Set the dialog `tag` parameter
    pub fn with_tag(self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.with_param("tag", Some(&tag))
    }

    /// The dialog `tag` parameter, if present
    pub fn tag(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("tag"))
            .and_then(|(_, v)| v.as_deref())
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(open) = s.find('<') {
            let close = s[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| Error::InvalidUri(format!("unclosed angle bracket: {}", s)))?;

            let display = s[..open].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(display.trim_matches('"').to_string())
            };

            let uri: SipUri = s[open + 1..close].parse()?;
            let params = match s[close + 1..].trim_start().strip_prefix(';') {
                Some(rest) => parse_params(rest),
                None => Vec::new(),
            };
            return Ok(NameAddr { display_name, uri, params });
        }

        // addr-spec form: everything after the first ';' is a header param
        let (uri_str, param_str) = match s.find(';') {
            Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
            None => (s, None),
        };
        Ok(NameAddr {
            display_name: None,
            uri: uri_str.parse()?,
            params: param_str.map(parse_params).unwrap_or_default(),
        })
    }
}

fn parse_params(input: &str) -> UriParams {
    input
        .split(';')
        .filter(|p| !p.trim().is_empty())
        .map(|p| match p.split_once('=') {
            Some((n, v)) => (n.trim().to_string(), Some(v.trim().trim_matches('"').to_string())),
            None => (p.trim().to_string(), None),
        })
        .collect()
}
