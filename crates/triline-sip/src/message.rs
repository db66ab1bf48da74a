//! # SIP Messages
//!
//! Request and response types with parsing and wire rendering, scoped to
//! what travels over an RFC 7118 WebSocket subprotocol: one SIP message
//! per text frame, so framing is the transport's problem and this module
//! only deals with complete messages.
//!
//! Start-lines are parsed with `nom`; header fields are line-oriented
//! with RFC 3261 continuation folding. Bodies are carried as UTF-8 text
//! (SDP, dialog-info XML, sipfrag and message-summary are all textual).
//!
//! ## Examples
//!
//! ```rust
//! use triline_sip::{Message, Method, Request, SipUri, HeaderName};
//!
//! let mut req = Request::new(Method::Register, SipUri::domain("example.net"));
//! req.headers.push(HeaderName::CallId, "reg-1@client.invalid");
//! req.headers.push(HeaderName::CSeq, "1 REGISTER");
//! let wire = req.to_wire();
//! assert!(wire.starts_with("REGISTER sip:example.net SIP/2.0\r\n"));
//!
//! match Message::parse(&wire).unwrap() {
//!     Message::Request(parsed) => assert_eq!(parsed.method, Method::Register),
//!     Message::Response(_) => unreachable!(),
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space1},
    combinator::{map_res, rest},
    sequence::tuple,
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::{Error, HeaderName, Headers, Method, Result, SipUri, StatusCode};

/// Either a SIP request or a SIP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Parse one complete SIP message from a WebSocket text frame
    pub fn parse(input: &str) -> Result<Message> {
        let (start_line, remainder) = input
            .split_once("\r\n")
            .or_else(|| input.split_once('\n'))
            .ok_or_else(|| Error::parse("message has no start line terminator"))?;

        let (headers, body) = split_head_body(remainder);
        let headers = parse_headers(headers)?;

        if start_line.starts_with("SIP/2.0") {
            let (_, (code, reason)) = status_line(start_line)
                .map_err(|e| Error::parse(format!("bad status line: {}", e)))?;
            Ok(Message::Response(Response {
                status: StatusCode::new(code)?,
                reason: reason.trim().to_string(),
                headers,
                body: body.to_string(),
            }))
        } else {
            let (_, (method, uri)) = request_line(start_line)
                .map_err(|e| Error::parse(format!("bad request line: {}", e)))?;
            Ok(Message::Request(Request {
                method: Method::from_str(method)?,
                uri: uri.parse()?,
                headers,
                body: body.to_string(),
            }))
        }
    }

    /// The shared header collection
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: String,
}

impl Request {
    /// A request with empty headers and body
    pub fn new(method: Method, uri: SipUri) -> Self {
        Request { method, uri, headers: Headers::new(), body: String::new() }
    }

    /// Attach a body and set Content-Type / Content-Length accordingly
    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.body = body.into();
        self.headers.set(HeaderName::ContentType, content_type);
        self.headers
            .set(HeaderName::ContentLength, self.body.len().to_string());
    }

    /// Render to wire form
    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} SIP/2.0\r\n", self.method, self.uri);
        render_headers(&mut out, &self.headers, self.body.len());
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

impl Response {
    /// Build a response to `request`, copying the headers a UAS must echo
    /// (Via, From, To, Call-ID, CSeq) per RFC 3261 §8.2.6
    pub fn for_request(status: StatusCode, request: &Request) -> Self {
        let mut headers = Headers::new();
        for via in request.headers.get_all(&HeaderName::Via) {
            headers.push(HeaderName::Via, via);
        }
        for name in [HeaderName::From, HeaderName::To, HeaderName::CallId, HeaderName::CSeq] {
            if let Some(value) = request.headers.get(&name) {
                headers.push(name, value);
            }
        }
        Response {
            status,
            reason: status.canonical_reason().to_string(),
            headers,
            body: String::new(),
        }
    }

    /// Append `tag` to the To header if it does not already carry one
    pub fn with_to_tag(mut self, tag: &str) -> Self {
        if let Some(to) = self.headers.get(&HeaderName::To) {
            if !to.contains("tag=") {
                let tagged = format!("{};tag={}", to, tag);
                self.headers.set(HeaderName::To, tagged);
            }
        }
        self
    }

    /// Attach a body and set Content-Type / Content-Length accordingly
    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.body = body.into();
        self.headers.set(HeaderName::ContentType, content_type);
        self.headers
            .set(HeaderName::ContentLength, self.body.len().to_string());
    }

    /// Render to wire form
    pub fn to_wire(&self) -> String {
        let reason = if self.reason.is_empty() {
            self.status.canonical_reason()
        } else {
            self.reason.as_str()
        };
        let mut out = format!("SIP/2.0 {} {}\r\n", self.status, reason);
        render_headers(&mut out, &self.headers, self.body.len());
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

fn request_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (method, _, uri, _, _)) = tuple((
        take_while1(|c: char| c.is_ascii_alphabetic()),
        space1,
        take_while1(|c: char| !c.is_ascii_whitespace()),
        space1,
        tag("SIP/2.0"),
    ))(input)?;
    Ok((input, (method, uri)))
}

fn status_line(input: &str) -> IResult<&str, (u16, &str)> {
    let (input, (_, _, code, _, reason)) = tuple((
        tag("SIP/2.0"),
        space1,
        map_res(digit1, str::parse::<u16>),
        space1,
        rest,
    ))(input)?;
    Ok((input, (code, reason)))
}

fn split_head_body(input: &str) -> (&str, &str) {
    if let Some(idx) = input.find("\r\n\r\n") {
        (&input[..idx], &input[idx + 4..])
    } else if let Some(idx) = input.find("\n\n") {
        (&input[..idx], &input[idx + 2..])
    } else {
        (input, "")
    }
}

fn parse_headers(input: &str) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut current: Option<(HeaderName, String)> = None;

    for line in input.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        // continuation lines fold into the previous field
        if line.starts_with(' ') || line.starts_with('\t') {
            match current.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(Error::parse("continuation line before any header")),
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.push(name, value);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse(format!("header line without colon: {}", line)))?;
        current = Some((HeaderName::parse(name), value.trim().to_string()));
    }
    if let Some((name, value)) = current {
        headers.push(name, value);
    }
    Ok(headers)
}

fn render_headers(out: &mut String, headers: &Headers, body_len: usize) {
    let mut wrote_length = false;
    for header in headers.iter() {
        if header.name == HeaderName::ContentLength {
            wrote_length = true;
        }
        out.push_str(header.name.as_str());
        out.push_str(": ");
        out.push_str(&header.value);
        out.push_str("\r\n");
    }
    if !wrote_length {
        out.push_str(&format!("Content-Length: {}\r\n", body_len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY: &str = "NOTIFY sip:1001@client.invalid SIP/2.0\r\n\
        Via: SIP/2.0/WSS pbx.example.net;branch=z9hG4bK776\r\n\
        From: <sip:2001@example.net>;tag=srv\r\n\
        To: <sip:1001@example.net>;tag=cli\r\n\
        Call-ID: sub-1@client.invalid\r\n\
        CSeq: 2 NOTIFY\r\n\
        Event: dialog\r\n\
        Subscription-State: active;expires=3600\r\n\
        Content-Type: application/dialog-info+xml\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn parses_request() {
        let msg = Message::parse(NOTIFY).unwrap();
        let req = match msg {
            Message::Request(r) => r,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, Method::Notify);
        assert_eq!(req.headers.event_package(), Some("dialog"));
        assert_eq!(req.headers.cseq().unwrap(), (2, Method::Notify));
        assert_eq!(req.headers.via_branch(), Some("z9hG4bK776"));
    }

    #[test]
    fn parses_response_with_body() {
        let wire = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/WSS c.invalid;branch=z9hG4bK1\r\n\
            Call-ID: abc\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Type: application/sdp\r\n\
            Content-Length: 4\r\n\
            \r\nv=0\r";
        let msg = Message::parse(wire).unwrap();
        let resp = match msg {
            Message::Response(r) => r,
            _ => panic!("expected response"),
        };
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, "v=0\r");
    }

    #[test]
    fn response_for_request_echoes_mandatory_headers() {
        let msg = Message::parse(NOTIFY).unwrap();
        let req = match msg {
            Message::Request(r) => r,
            _ => unreachable!(),
        };
        let resp = Response::for_request(StatusCode::OK, &req);
        assert_eq!(resp.headers.call_id().unwrap(), "sub-1@client.invalid");
        assert_eq!(resp.headers.cseq().unwrap(), (2, Method::Notify));
        assert_eq!(
            resp.headers.get(&HeaderName::Via),
            Some("SIP/2.0/WSS pbx.example.net;branch=z9hG4bK776")
        );
    }

    #[test]
    fn to_tag_is_added_once() {
        let msg = Message::parse(NOTIFY).unwrap();
        let req = match msg {
            Message::Request(r) => r,
            _ => unreachable!(),
        };
        let resp = Response::for_request(StatusCode::OK, &req).with_to_tag("zz");
        // the request To already carries tag=cli, so nothing is appended
        assert_eq!(resp.headers.to_addr().unwrap().tag(), Some("cli"));
    }

    #[test]
    fn folds_continuation_lines() {
        let wire = "SIP/2.0 180 Ringing\r\n\
            Subject: one\r\n two\r\n\
            Call-ID: x\r\nCSeq: 9 INVITE\r\n\r\n";
        let msg = Message::parse(wire).unwrap();
        assert_eq!(
            msg.headers().get(&HeaderName::Other("Subject".into())),
            Some("one two")
        );
    }

    #[test]
    fn render_appends_content_length_when_missing() {
        let mut req = Request::new(Method::Options, SipUri::domain("example.net"));
        req.headers.push(HeaderName::CallId, "x");
        let wire = req.to_wire();
        assert!(wire.contains("Content-Length: 0\r\n"));
    }
}
