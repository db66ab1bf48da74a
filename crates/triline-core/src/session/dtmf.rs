//! DTMF delivery
//!
//! Tones go out via the media transport's RFC 4733 sender when the
//! session has one, with SIP INFO (`application/dtmf-relay`) as the
//! fallback. A sequence walks its tones with the configured pre-delay,
//! press and gap timings and emits one `dtmfSent` event per tone, in
//! order. Sequences are not cancellable; if the session dies mid-walk
//! the walk aborts with `SessionGone`, which callers treat as benign
//! when the code they were punching in had already gone through.

use std::sync::Arc;
use std::time::Duration;

use triline_sip::Method;

use crate::error::{PhoneError, PhoneResult};
use crate::events::PhoneEvent;

use super::store::SessionStore;
use super::types::{SessionId, SessionState};

/// Timing profile for a DTMF sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfTimings {
    /// Delay before the first tone
    pub pre_delay: Duration,
    /// How long each tone is pressed
    pub press: Duration,
    /// Pause between tones
    pub gap: Duration,
}

impl Default for DtmfTimings {
    fn default() -> Self {
        DtmfTimings {
            pre_delay: Duration::from_millis(500),
            press: Duration::from_millis(150),
            gap: Duration::from_millis(200),
        }
    }
}

/// Whether `tone` is a sendable DTMF character
pub fn is_valid_tone(tone: char) -> bool {
    tone.is_ascii_digit() || tone == '*' || tone == '#'
}

impl SessionStore {
    /// Send one DTMF tone on an established session
    pub async fn send_dtmf(self: &Arc<Self>, id: &SessionId, tone: char) -> PhoneResult<()> {
        if !is_valid_tone(tone) {
            return Err(PhoneError::InvalidDtmfTone { tone });
        }
        let timings = DtmfTimings::default();
        self.send_tone_inner(id, tone, timings.press).await
    }

    /// Send a tone sequence with the given (or default) timings.
    /// Emits exactly one `dtmfSent` per delivered tone, in order.
    pub async fn send_dtmf_sequence(
        self: &Arc<Self>,
        id: &SessionId,
        tones: &str,
        timings: Option<DtmfTimings>,
    ) -> PhoneResult<usize> {
        // the whole sequence is validated before anything is sent
        if let Some(bad) = tones.chars().find(|c| !is_valid_tone(*c)) {
            return Err(PhoneError::InvalidDtmfTone { tone: bad });
        }
        if tones.is_empty() {
            return Ok(0);
        }
        let timings = timings.unwrap_or_default();

        tokio::time::sleep(timings.pre_delay).await;

        let mut sent = 0;
        let total = tones.chars().count();
        for tone in tones.chars() {
            if self.snapshot_of(id).is_none() {
                return Err(PhoneError::SessionGone { session_id: *id });
            }
            self.send_tone_inner(id, tone, timings.press).await?;
            sent += 1;
            if sent < total {
                tokio::time::sleep(timings.gap).await;
            }
        }
        Ok(sent)
    }

    async fn send_tone_inner(
        self: &Arc<Self>,
        id: &SessionId,
        tone: char,
        press: Duration,
    ) -> PhoneResult<()> {
        let media = self.with_session(id, |session| {
            if session.state != SessionState::Established {
                return Err(PhoneError::InvalidSessionState {
                    session_id: *id,
                    current_state: session.state.to_string(),
                });
            }
            Ok(session.media.clone())
        })??;

        let injected = match media {
            Some(media) if media.supports_tone_injection() => {
                media.inject_tone(tone, press).await?;
                true
            }
            _ => false,
        };

        if !injected {
            // INFO fallback when the media path has no tone sender
            let mut info = self.with_session(id, |session| {
                self.link.in_dialog_request(&mut session.dialog, Method::Info)
            })?;
            info.set_body(
                "application/dtmf-relay",
                format!("Signal={}\r\nDuration={}\r\n", tone, press.as_millis()),
            );
            let mut handle = self.link.send_request(info)?;
            tokio::spawn(async move {
                let _ = handle.final_response(Duration::from_secs(5)).await;
            });
        }

        self.bus.publish(PhoneEvent::DtmfSent { id: *id, tone });
        Ok(())
    }
}
