//! message/sipfrag fragments (RFC 3420)
//!
//! REFER progress arrives in NOTIFY bodies as a bare SIP status line,
//! optionally followed by a handful of headers. Only the status line
//! matters for transfer disposition tracking.

use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, StatusCode};

/// A parsed sipfrag status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipFrag {
    /// The fragment's status code
    pub status: StatusCode,
    /// The reason phrase as sent
    pub reason: String,
}

impl FromStr for SipFrag {
    type Err = Error;

    fn from_str(body: &str) -> Result<Self> {
        let line = body
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::InvalidBody("empty sipfrag".into()))?;

        let rest = line
            .strip_prefix("SIP/2.0")
            .ok_or_else(|| Error::InvalidBody(format!("not a status line: {}", line)))?
            .trim_start();

        let (code, reason) = match rest.split_once(char::is_whitespace) {
            Some((code, reason)) => (code, reason.trim()),
            None => (rest, ""),
        };
        let code = code
            .parse::<u16>()
            .map_err(|_| Error::InvalidBody(format!("bad status code: {}", rest)))?;

        Ok(SipFrag {
            status: StatusCode::new(code)?,
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_fragment() {
        let frag: SipFrag = "SIP/2.0 200 OK".parse().unwrap();
        assert_eq!(frag.status, StatusCode::OK);
        assert_eq!(frag.reason, "OK");
    }

    #[test]
    fn parses_fragment_with_trailing_headers() {
        let frag: SipFrag = "SIP/2.0 180 Ringing\r\nContact: <sip:x@y>\r\n".parse().unwrap();
        assert!(frag.status.is_provisional());
    }

    #[test]
    fn parses_reasonless_fragment() {
        let frag: SipFrag = "SIP/2.0 486".parse().unwrap();
        assert_eq!(frag.status, StatusCode::BUSY_HERE);
        assert_eq!(frag.reason, "");
    }

    #[test]
    fn rejects_requests_and_garbage() {
        assert!("INVITE sip:x SIP/2.0".parse::<SipFrag>().is_err());
        assert!("".parse::<SipFrag>().is_err());
    }
}
