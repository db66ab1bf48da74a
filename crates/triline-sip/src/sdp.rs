//! # Session Descriptions
//!
//! A single-audio-stream SDP model per
//! [RFC 4566](https://datatracker.ietf.org/doc/html/rfc4566), carrying
//! exactly what an audio-only softphone negotiates: one `m=audio` line,
//! a connection address, the offered payload types, and the RFC 3264
//! direction attribute that hold/unhold renegotiation flips.
//!
//! The direction attribute is the load-bearing part: putting a call on
//! hold re-INVITEs with `sendonly`, resuming re-INVITEs with `sendrecv`.
//!
//! ## Examples
//!
//! ```rust
//! use triline_sip::sdp::{AudioDescription, SdpDirection};
//!
//! let offer = AudioDescription::new("client.invalid", 9).with_direction(SdpDirection::SendOnly);
//! let text = offer.to_sdp();
//! assert!(text.contains("a=sendonly"));
//!
//! let parsed = AudioDescription::parse(&text).unwrap();
//! assert_eq!(parsed.direction, SdpDirection::SendOnly);
//! ```

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Media flow direction per RFC 3264 / RFC 4566 §6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SdpDirection {
    /// Send and receive (the default when no attribute is present)
    SendRecv,
    /// We send, peer is on hold from our side
    SendOnly,
    /// We only receive
    RecvOnly,
    /// No media flows
    Inactive,
}

impl SdpDirection {
    /// The attribute token, without the `a=` prefix
    pub fn as_attr(&self) -> &'static str {
        match self {
            SdpDirection::SendRecv => "sendrecv",
            SdpDirection::SendOnly => "sendonly",
            SdpDirection::RecvOnly => "recvonly",
            SdpDirection::Inactive => "inactive",
        }
    }

    /// The direction the peer sees, used when answering a hold offer
    pub fn reversed(&self) -> SdpDirection {
        match self {
            SdpDirection::SendOnly => SdpDirection::RecvOnly,
            SdpDirection::RecvOnly => SdpDirection::SendOnly,
            other => *other,
        }
    }
}

impl fmt::Display for SdpDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_attr())
    }
}

impl FromStr for SdpDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "sendrecv" => Ok(SdpDirection::SendRecv),
            "sendonly" => Ok(SdpDirection::SendOnly),
            "recvonly" => Ok(SdpDirection::RecvOnly),
            "inactive" => Ok(SdpDirection::Inactive),
            other => Err(Error::parse(format!("unknown SDP direction: {}", other))),
        }
    }
}

/// One payload type on the audio m-line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCodec {
    /// RTP payload type number
    pub payload_type: u8,
    /// Encoding name as it appears in `a=rtpmap`
    pub encoding: String,
    /// Clock rate in Hz
    pub clock_rate: u32,
}

/// An audio-only session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDescription {
    /// Origin/connection address
    pub address: String,
    /// Audio m-line port (0 rejects the stream)
    pub port: u16,
    /// Offered payload types, in preference order
    pub codecs: Vec<AudioCodec>,
    /// Media flow direction
    pub direction: SdpDirection,
    /// Session id reused across renegotiations of the same session
    pub session_id: u64,
    /// Version, incremented on each renegotiation
    pub session_version: u64,
}

impl AudioDescription {
    /// A sendrecv description offering PCMU, PCMA and telephone-event
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        AudioDescription {
            address: address.into(),
            port,
            codecs: vec![
                AudioCodec { payload_type: 0, encoding: "PCMU".into(), clock_rate: 8000 },
                AudioCodec { payload_type: 8, encoding: "PCMA".into(), clock_rate: 8000 },
                AudioCodec { payload_type: 101, encoding: "telephone-event".into(), clock_rate: 8000 },
            ],
            direction: SdpDirection::SendRecv,
            session_id: 1,
            session_version: 1,
        }
    }

    /// Set the direction attribute
    pub fn with_direction(mut self, direction: SdpDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Bump the o-line version for a renegotiation of the same session
    pub fn renegotiated(mut self, direction: SdpDirection) -> Self {
        self.session_version += 1;
        self.direction = direction;
        self
    }

    /// Render to SDP text
    pub fn to_sdp(&self) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        out.push_str(&format!(
            "o=- {} {} IN IP4 {}\r\n",
            self.session_id, self.session_version, self.address
        ));
        out.push_str("s=-\r\n");
        out.push_str(&format!("c=IN IP4 {}\r\n", self.address));
        out.push_str("t=0 0\r\n");
        let payloads: Vec<String> = self.codecs.iter().map(|c| c.payload_type.to_string()).collect();
        out.push_str(&format!("m=audio {} UDP/TLS/RTP/SAVPF {}\r\n", self.port, payloads.join(" ")));
        for codec in &self.codecs {
            out.push_str(&format!(
                "a=rtpmap:{} {}/{}\r\n",
                codec.payload_type, codec.encoding, codec.clock_rate
            ));
        }
        out.push_str(&format!("a={}\r\n", self.direction.as_attr()));
        out
    }

    /// Parse the fields this stack cares about from SDP text.
    ///
    /// Unknown lines are skipped; absence of a direction attribute means
    /// `sendrecv` per RFC 3264.
    pub fn parse(input: &str) -> Result<Self> {
        let mut address = None;
        let mut port = None;
        let mut codecs = Vec::new();
        let mut direction = SdpDirection::SendRecv;
        let mut session_id = 1;
        let mut session_version = 1;

        for line in input.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("o=") {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() >= 3 {
                    session_id = fields[1].parse().unwrap_or(1);
                    session_version = fields[2].parse().unwrap_or(1);
                }
            } else if let Some(rest) = line.strip_prefix("c=") {
                address = rest.split_whitespace().last().map(str::to_string);
            } else if let Some(rest) = line.strip_prefix("m=audio ") {
                let mut fields = rest.split_whitespace();
                port = fields
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                if let Some((pt, enc)) = rest.split_once(' ') {
                    if let (Ok(payload_type), Some((encoding, rate))) =
                        (pt.parse::<u8>(), enc.split_once('/'))
                    {
                        codecs.push(AudioCodec {
                            payload_type,
                            encoding: encoding.to_string(),
                            clock_rate: rate.split('/').next().unwrap_or("8000").parse().unwrap_or(8000),
                        });
                    }
                }
            } else if let Some(rest) = line.strip_prefix("a=") {
                if let Ok(dir) = rest.parse::<SdpDirection>() {
                    direction = dir;
                }
            }
        }

        Ok(AudioDescription {
            address: address.ok_or_else(|| Error::parse("SDP has no connection line"))?,
            port: port.ok_or_else(|| Error::parse("SDP has no audio m-line"))?,
            codecs,
            direction,
            session_id,
            session_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_offer_is_sendrecv() {
        let sdp = AudioDescription::new("10.0.0.1", 40000).to_sdp();
        let parsed = AudioDescription::parse(&sdp).unwrap();
        assert_eq!(parsed.direction, SdpDirection::SendRecv);
        assert_eq!(parsed.port, 40000);
        assert_eq!(parsed.codecs.len(), 3);
    }

    #[test]
    fn renegotiation_bumps_version_and_flips_direction() {
        let offer = AudioDescription::new("10.0.0.1", 40000);
        let hold = offer.clone().renegotiated(SdpDirection::SendOnly);
        assert_eq!(hold.session_id, offer.session_id);
        assert_eq!(hold.session_version, offer.session_version + 1);
        assert_eq!(hold.direction, SdpDirection::SendOnly);
    }

    #[test]
    fn missing_direction_defaults_to_sendrecv() {
        let sdp = "v=0\r\nc=IN IP4 1.2.3.4\r\nm=audio 5004 RTP/AVP 0\r\n";
        assert_eq!(
            AudioDescription::parse(sdp).unwrap().direction,
            SdpDirection::SendRecv
        );
    }

    #[test]
    fn hold_answer_direction_is_reversed() {
        assert_eq!(SdpDirection::SendOnly.reversed(), SdpDirection::RecvOnly);
        assert_eq!(SdpDirection::SendRecv.reversed(), SdpDirection::SendRecv);
    }
}
