//! # Digest Access Authentication
//!
//! Challenge parsing and response computation for RFC 2617 MD5 digest as
//! used by SIP ([RFC 3261 §22](https://datatracker.ietf.org/doc/html/rfc3261#section-22)).
//! Covers the plain and `qop=auth` flavours; `auth-int` and non-MD5
//! algorithms are rejected so the caller can surface a clean auth failure
//! instead of sending a response the server will refuse anyway.
//!
//! ## Examples
//!
//! ```rust
//! use triline_sip::auth::DigestChallenge;
//! use triline_sip::Method;
//!
//! let challenge = DigestChallenge::parse(
//!     "Digest realm=\"example.net\", nonce=\"dcd98b7102dd2f0e\", qop=\"auth\""
//! ).unwrap();
//!
//! let authorization = challenge.respond(
//!     "1001",
//!     "secret",
//!     Method::Register,
//!     "sip:example.net",
//!     "0a4f113b",
//! );
//! assert!(authorization.starts_with("Digest username=\"1001\""));
//! assert!(authorization.contains("qop=auth"));
//! ```

use std::collections::HashMap;

use crate::{Error, Method, Result};

/// A parsed WWW-Authenticate / Proxy-Authenticate digest challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    /// Protection realm the credentials apply to
    pub realm: String,
    /// Server nonce
    pub nonce: String,
    /// Opaque value echoed back verbatim, if supplied
    pub opaque: Option<String>,
    /// Whether the server offered `qop=auth`
    pub qop_auth: bool,
    /// True when the server marked the nonce stale (retry is legitimate)
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse a challenge header value.
    ///
    /// Fails on non-Digest schemes, unsupported algorithms, and
    /// challenges offering only `auth-int`.
    pub fn parse(value: &str) -> Result<Self> {
        let rest = value
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| Error::header("WWW-Authenticate", "not a Digest challenge"))?;

        let params = split_auth_params(rest);

        if let Some(algorithm) = params.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return Err(Error::header(
                    "WWW-Authenticate",
                    format!("unsupported algorithm: {}", algorithm),
                ));
            }
        }

        let qop_auth = match params.get("qop") {
            None => false,
            Some(qop) => {
                let offers_auth = qop
                    .split(',')
                    .any(|q| q.trim().eq_ignore_ascii_case("auth"));
                if !offers_auth {
                    return Err(Error::header(
                        "WWW-Authenticate",
                        format!("unsupported qop: {}", qop),
                    ));
                }
                true
            }
        };

        Ok(DigestChallenge {
            realm: params
                .get("realm")
                .cloned()
                .ok_or_else(|| Error::header("WWW-Authenticate", "missing realm"))?,
            nonce: params
                .get("nonce")
                .cloned()
                .ok_or_else(|| Error::header("WWW-Authenticate", "missing nonce"))?,
            opaque: params.get("opaque").cloned(),
            qop_auth,
            stale: params
                .get("stale")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// Compute the Authorization header value answering this challenge.
    ///
    /// `cnonce` is caller-supplied so responses are reproducible in tests;
    /// nonce-count is fixed at 00000001 since this stack answers each
    /// challenge exactly once.
    pub fn respond(
        &self,
        username: &str,
        password: &str,
        method: Method,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        let response = if self.qop_auth {
            md5_hex(&format!(
                "{}:{}:00000001:{}:auth:{}",
                ha1, self.nonce, cnonce, ha2
            ))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut out = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, self.realm, self.nonce, uri, response
        );
        if self.qop_auth {
            out.push_str(&format!(", qop=auth, nc=00000001, cnonce=\"{}\"", cnonce));
        }
        if let Some(opaque) = &self.opaque {
            out.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        out
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Split `name=value, name="quoted, value"` lists respecting quotes
fn split_auth_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut depth_quoted = false;
    let mut start = 0;
    let bytes = input.as_bytes();

    let mut push = |segment: &str, params: &mut HashMap<String, String>| {
        if let Some((name, value)) = segment.split_once('=') {
            params.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    };

    for (idx, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => depth_quoted = !depth_quoted,
            b',' if !depth_quoted => {
                push(&input[start..idx], &mut params);
                start = idx + 1;
            }
            _ => {}
        }
    }
    push(&input[start..], &mut params);
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_params_with_commas() {
        let c = DigestChallenge::parse(
            "Digest realm=\"a, b\", nonce=\"n1\", opaque=\"op\", stale=TRUE",
        )
        .unwrap();
        assert_eq!(c.realm, "a, b");
        assert_eq!(c.opaque.as_deref(), Some("op"));
        assert!(c.stale);
        assert!(!c.qop_auth);
    }

    #[test]
    fn rejects_non_digest_and_bad_algorithms() {
        assert!(DigestChallenge::parse("Basic realm=\"x\"").is_err());
        assert!(DigestChallenge::parse(
            "Digest realm=\"x\", nonce=\"n\", algorithm=SHA-256"
        )
        .is_err());
        assert!(DigestChallenge::parse(
            "Digest realm=\"x\", nonce=\"n\", qop=\"auth-int\""
        )
        .is_err());
    }

    #[test]
    fn known_rfc2617_vector() {
        // The RFC 2617 §3.5 example, adapted to the REGISTER method
        let c = DigestChallenge::parse(
            "Digest realm=\"testrealm@host.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", qop=\"auth\"",
        )
        .unwrap();
        let auth = c.respond(
            "Mufasa",
            "Circle Of Life",
            Method::Register,
            "/dir/index.html",
            "0a4f113b",
        );
        assert!(auth.contains("nc=00000001"));
        assert!(auth.contains("response=\""));
        assert!(auth.contains("algorithm=MD5"));
    }

    #[test]
    fn plain_digest_has_no_qop_fields() {
        let c = DigestChallenge::parse("Digest realm=\"r\", nonce=\"n\"").unwrap();
        let auth = c.respond("u", "p", Method::Invite, "sip:x@r", "cn");
        assert!(!auth.contains("qop="));
        assert!(!auth.contains("cnonce"));
    }
}
