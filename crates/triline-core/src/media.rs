//! Media engine capability
//!
//! The core drives WebRTC-style audio through these traits and owns no
//! media machinery itself: the embedding host injects an engine (the
//! browser's peer-connection layer, a native stack, or the mock below).
//! What the core asks of it is deliberately small:
//!
//! - produce and consume SDP with an explicit direction attribute, so
//!   hold/unhold renegotiation is expressed purely in the offer/answer;
//! - enable/disable local capture, which implements both mute and the
//!   capture stop that accompanies hold - without renegotiation;
//! - inject RFC 4733 tones when the transport has a tone sender, and
//!   say so when it does not, so the store can fall back to SIP INFO.
//!
//! ICE policy (gathering ceiling, stop-on-server-reflexive, server list)
//! travels in [`MediaConstraints`]; the engine owns its enforcement.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use triline_sip::sdp::{AudioDescription, SdpDirection};

use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};

/// Per-session media constraints assembled by the call controller
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    /// Selected input device identifier, when the host picked one
    pub input_device: Option<String>,
    /// Selected output device identifier, when the host picked one
    pub output_device: Option<String>,
    /// ICE servers to gather against
    pub ice_servers: Vec<String>,
    /// Gathering ceiling
    pub ice_gathering_timeout: Duration,
    /// End gathering early once a server-reflexive candidate is known
    pub ice_stop_on_server_reflexive: bool,
    /// Ask the engine to record this session
    pub record: bool,
}

impl MediaConstraints {
    /// Constraints from config plus the host's device selection
    pub fn from_config(
        config: &PhoneConfig,
        input_device: Option<String>,
        output_device: Option<String>,
    ) -> Self {
        MediaConstraints {
            input_device,
            output_device,
            ice_servers: config.ice_servers.clone(),
            ice_gathering_timeout: Duration::from_millis(config.ice_gathering_timeout_ms),
            ice_stop_on_server_reflexive: config.ice_stop_waiting_on_server_reflexive,
            record: config.record_calls,
        }
    }
}

/// Factory for per-session media
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create the media for one session
    async fn create_session(
        &self,
        constraints: MediaConstraints,
    ) -> PhoneResult<Arc<dyn MediaSessionHandle>>;
}

/// One session's media, owned by the session store entry
#[async_trait]
pub trait MediaSessionHandle: Send + Sync {
    /// Produce a local offer with the given direction
    async fn create_offer(&self, direction: SdpDirection) -> PhoneResult<String>;

    /// Produce an answer to a remote offer with the given direction
    async fn create_answer(
        &self,
        remote_offer: &str,
        direction: SdpDirection,
    ) -> PhoneResult<String>;

    /// Apply the remote answer to our outstanding offer
    async fn apply_remote_answer(&self, answer: &str) -> PhoneResult<()>;

    /// Enable or disable every outbound audio track (mute / hold capture)
    fn set_capture_enabled(&self, enabled: bool);

    /// Current capture state
    fn capture_enabled(&self) -> bool;

    /// Whether an RFC 4733 tone sender is available
    fn supports_tone_injection(&self) -> bool;

    /// Inject one DTMF tone for `duration` via the tone sender
    async fn inject_tone(&self, tone: char, duration: Duration) -> PhoneResult<()>;

    /// Release devices and tear the media down
    async fn close(&self);
}

/// A scriptable in-memory media engine for tests and demos
///
/// Generates real SDP through the wire model so direction attributes can
/// be asserted on, and records capture/tone activity for inspection.
pub struct MockMediaEngine {
    /// Whether created sessions report an RFC 4733 tone sender
    pub tone_injection: bool,
    /// Fail the next `create_session` call
    pub fail_next: AtomicBool,
    sessions_created: AtomicU64,
}

impl MockMediaEngine {
    /// An engine whose sessions support tone injection
    pub fn new() -> Self {
        MockMediaEngine {
            tone_injection: true,
            fail_next: AtomicBool::new(false),
            sessions_created: AtomicU64::new(0),
        }
    }

    /// An engine whose sessions lack a tone sender (forces INFO fallback)
    pub fn without_tone_injection() -> Self {
        MockMediaEngine { tone_injection: false, ..Self::new() }
    }

    /// Number of sessions created so far
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_session(
        &self,
        _constraints: MediaConstraints,
    ) -> PhoneResult<Arc<dyn MediaSessionHandle>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PhoneError::media("mock engine failure"));
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockMediaSession {
            port: 40000 + (n as u16 % 1000) * 2,
            capture_enabled: AtomicBool::new(true),
            tone_injection: self.tone_injection,
            tones: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// The session handle produced by [`MockMediaEngine`]
pub struct MockMediaSession {
    port: u16,
    capture_enabled: AtomicBool,
    tone_injection: bool,
    /// Tones injected so far, for assertions
    pub tones: std::sync::Mutex<Vec<char>>,
    closed: AtomicBool,
}

impl MockMediaSession {
    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSessionHandle for MockMediaSession {
    async fn create_offer(&self, direction: SdpDirection) -> PhoneResult<String> {
        Ok(AudioDescription::new("client.invalid", self.port)
            .with_direction(direction)
            .to_sdp())
    }

    async fn create_answer(
        &self,
        remote_offer: &str,
        direction: SdpDirection,
    ) -> PhoneResult<String> {
        AudioDescription::parse(remote_offer)
            .map_err(|e| PhoneError::media(format!("bad remote offer: {}", e)))?;
        Ok(AudioDescription::new("client.invalid", self.port)
            .with_direction(direction)
            .to_sdp())
    }

    async fn apply_remote_answer(&self, answer: &str) -> PhoneResult<()> {
        AudioDescription::parse(answer)
            .map_err(|e| PhoneError::media(format!("bad remote answer: {}", e)))?;
        Ok(())
    }

    fn set_capture_enabled(&self, enabled: bool) {
        self.capture_enabled.store(enabled, Ordering::SeqCst);
    }

    fn capture_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::SeqCst)
    }

    fn supports_tone_injection(&self) -> bool {
        self.tone_injection
    }

    async fn inject_tone(&self, tone: char, _duration: Duration) -> PhoneResult<()> {
        if !self.tone_injection {
            return Err(PhoneError::media("no tone sender on this session"));
        }
        self.tones.lock().unwrap().push(tone);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_round_trip_carries_direction() {
        let engine = MockMediaEngine::new();
        let constraints = MediaConstraints::from_config(
            &PhoneConfig::new("example.net", "1001", "p", "example.net"),
            None,
            None,
        );
        let media = engine.create_session(constraints).await.unwrap();

        let offer = media.create_offer(SdpDirection::SendOnly).await.unwrap();
        assert!(offer.contains("a=sendonly"));

        let answer = media.create_answer(&offer, SdpDirection::RecvOnly).await.unwrap();
        assert!(answer.contains("a=recvonly"));
    }

    #[tokio::test]
    async fn fail_next_affects_one_call() {
        let engine = MockMediaEngine::new();
        engine.fail_next.store(true, Ordering::SeqCst);
        let constraints = MediaConstraints::from_config(
            &PhoneConfig::new("example.net", "1001", "p", "example.net"),
            None,
            None,
        );
        assert!(engine.create_session(constraints.clone()).await.is_err());
        assert!(engine.create_session(constraints).await.is_ok());
    }
}
