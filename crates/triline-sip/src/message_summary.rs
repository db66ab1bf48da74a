//! Message-waiting summaries (RFC 3842)
//!
//! Parses `application/simple-message-summary` NOTIFY bodies from the
//! `message-summary` event package into a voicemail counter snapshot.
//!
//! ```text
//! Messages-Waiting: yes
//! Message-Account: sip:1001@example.net
//! Voice-Message: 2/8 (0/2)
//! ```

use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Parsed voicemail summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    /// The Messages-Waiting flag
    pub messages_waiting: bool,
    /// New voice messages
    pub voice_new: u32,
    /// Old voice messages
    pub voice_old: u32,
}

impl FromStr for MessageSummary {
    type Err = Error;

    fn from_str(body: &str) -> Result<Self> {
        let mut summary = MessageSummary::default();
        let mut saw_waiting = false;

        for line in body.lines() {
            let line = line.trim();
            if let Some(value) = strip_field(line, "Messages-Waiting") {
                summary.messages_waiting = value.eq_ignore_ascii_case("yes");
                saw_waiting = true;
            } else if let Some(value) = strip_field(line, "Voice-Message") {
                // counts are "new/old" optionally followed by urgent "(n/o)"
                let counts = value.split_whitespace().next().unwrap_or(value);
                let (new, old) = counts
                    .split_once('/')
                    .ok_or_else(|| Error::InvalidBody(format!("bad Voice-Message: {}", value)))?;
                summary.voice_new = new
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidBody(format!("bad new count: {}", new)))?;
                summary.voice_old = old
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidBody(format!("bad old count: {}", old)))?;
            }
        }

        if !saw_waiting {
            return Err(Error::InvalidBody("missing Messages-Waiting line".into()));
        }
        Ok(summary)
    }
}

fn strip_field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (field, value) = line.split_once(':')?;
    if field.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}
