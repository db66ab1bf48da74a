//! Configuration surface for the telephony core
//!
//! A closed set of options with defaults, validated synchronously before
//! any transport is opened. The struct is immutable once the phone is
//! bootstrapped; the `with_*` builder methods exist for construction
//! only.
//!
//! # Server URL derivation
//!
//! The `server` option accepts either a full WebSocket URL, used
//! verbatim, or a bare host, rewritten to the conventional
//! `wss://<host>:8089/ws` PBX endpoint:
//!
//! ```rust
//! use triline_core::PhoneConfig;
//!
//! let config = PhoneConfig::new("pbx.example.net", "1001", "secret", "example.net");
//! assert_eq!(config.websocket_url().unwrap().as_str(), "wss://pbx.example.net:8089/ws");
//!
//! let config = PhoneConfig::new("wss://edge.example.net/sip", "1001", "secret", "example.net");
//! assert_eq!(config.websocket_url().unwrap().as_str(), "wss://edge.example.net/sip");
//! ```

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PhoneError, PhoneResult};

/// Default registration lifetime in seconds
pub const DEFAULT_REGISTER_EXPIRES: u32 = 300;
/// Default number of reconnect attempts before giving up
pub const DEFAULT_RECONNECTION_ATTEMPTS: u32 = 5;
/// Default delay between reconnect attempts in seconds
pub const DEFAULT_RECONNECTION_TIMEOUT_SECS: u64 = 10;
/// Default unanswered-call window in seconds
pub const DEFAULT_NO_ANSWER_TIMEOUT_SECS: u64 = 60;
/// Default ICE gathering ceiling in milliseconds
pub const DEFAULT_ICE_GATHERING_TIMEOUT_MS: u64 = 500;

/// The volume steps the busy-light bridge accepts
pub const RING_VOLUME_STEPS: [u8; 5] = [0, 25, 50, 75, 100];

/// Static configuration consumed by every core component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneConfig {
    /// SIP server: bare hostname or full `ws://`/`wss://` URL (required)
    pub server: String,
    /// SIP username / extension (required)
    pub username: String,
    /// SIP password used to answer digest challenges
    pub password: String,
    /// SIP domain for the address-of-record and dial normalization
    pub domain: String,
    /// Display name; derived as `<username>-365Connect` when absent
    pub display_name: Option<String>,
    /// Registration lifetime requested in REGISTER
    pub register_expires: u32,
    /// Reconnect attempts before the transport gives up
    pub reconnection_attempts: u32,
    /// Delay between reconnect attempts, seconds
    pub reconnection_timeout_secs: u64,
    /// Window before an unanswered call is cancelled/rejected, seconds
    pub no_answer_timeout_secs: u64,
    /// ICE gathering ceiling, milliseconds
    pub ice_gathering_timeout_ms: u64,
    /// Stop ICE gathering early once a server-reflexive candidate is known
    pub ice_stop_waiting_on_server_reflexive: bool,
    /// ICE servers handed to the media engine
    pub ice_servers: Vec<String>,
    /// Answer incoming calls automatically when no other call is active
    pub auto_answer: bool,
    /// Ask the media engine to record calls
    pub record_calls: bool,
    /// Drive the busy-light indicator
    pub busylight_enabled: bool,
    /// Alert sound for the Ringing indicator state, 1..=7
    pub ring_sound: u8,
    /// Alert volume for the Ringing indicator state, one of 0/25/50/75/100
    pub ring_volume: u8,
}

impl PhoneConfig {
    /// Configuration with the documented defaults
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        PhoneConfig {
            server: server.into(),
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            display_name: None,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            reconnection_attempts: DEFAULT_RECONNECTION_ATTEMPTS,
            reconnection_timeout_secs: DEFAULT_RECONNECTION_TIMEOUT_SECS,
            no_answer_timeout_secs: DEFAULT_NO_ANSWER_TIMEOUT_SECS,
            ice_gathering_timeout_ms: DEFAULT_ICE_GATHERING_TIMEOUT_MS,
            ice_stop_waiting_on_server_reflexive: true,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            auto_answer: false,
            record_calls: false,
            busylight_enabled: false,
            ring_sound: 1,
            ring_volume: 50,
        }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the registration lifetime
    pub fn with_register_expires(mut self, expires: u32) -> Self {
        self.register_expires = expires;
        self
    }

    /// Set the reconnect budget
    pub fn with_reconnection(mut self, attempts: u32, timeout_secs: u64) -> Self {
        self.reconnection_attempts = attempts;
        self.reconnection_timeout_secs = timeout_secs;
        self
    }

    /// Enable auto-answer
    pub fn with_auto_answer(mut self, enabled: bool) -> Self {
        self.auto_answer = enabled;
        self
    }

    /// Enable the busy-light indicator with the given alert parameters
    pub fn with_busylight(mut self, sound: u8, volume: u8) -> Self {
        self.busylight_enabled = true;
        self.ring_sound = sound;
        self.ring_volume = volume;
        self
    }

    /// Override the ICE server list
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// The effective display name
    pub fn effective_display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("{}-365Connect", self.username))
    }

    /// Derive the WebSocket registration URL from the `server` option.
    ///
    /// Full `ws://`/`wss://` URLs are used verbatim; a bare host becomes
    /// `wss://<host>:8089/ws`; any other scheme is rejected.
    pub fn websocket_url(&self) -> PhoneResult<Url> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(PhoneError::MissingConfiguration { field: "server" });
        }

        let candidate = if server.starts_with("ws://") || server.starts_with("wss://") {
            server.to_string()
        } else if server.contains("://") {
            return Err(PhoneError::InvalidConfiguration {
                field: "server",
                reason: format!("unsupported scheme in: {}", server),
            });
        } else {
            format!("wss://{}:8089/ws", server)
        };

        Url::parse(&candidate).map_err(|e| PhoneError::InvalidConfiguration {
            field: "server",
            reason: format!("{}: {}", candidate, e),
        })
    }

    /// Validate every option; called once before the transport opens
    pub fn validate(&self) -> PhoneResult<()> {
        self.websocket_url()?;
        if self.username.trim().is_empty() {
            return Err(PhoneError::MissingConfiguration { field: "username" });
        }
        if self.domain.trim().is_empty() {
            return Err(PhoneError::MissingConfiguration { field: "domain" });
        }
        if self.register_expires == 0 {
            return Err(PhoneError::InvalidConfiguration {
                field: "register_expires",
                reason: "must be greater than zero".into(),
            });
        }
        if !(1..=7).contains(&self.ring_sound) {
            return Err(PhoneError::InvalidConfiguration {
                field: "ring_sound",
                reason: format!("{} is outside 1..=7", self.ring_sound),
            });
        }
        if !RING_VOLUME_STEPS.contains(&self.ring_volume) {
            return Err(PhoneError::InvalidConfiguration {
                field: "ring_volume",
                reason: format!("{} is not one of 0/25/50/75/100", self.ring_volume),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PhoneConfig {
        PhoneConfig::new("example.net", "1001", "p", "example.net")
    }

    #[test]
    fn bare_host_is_rewritten() {
        assert_eq!(
            base().websocket_url().unwrap().as_str(),
            "wss://example.net:8089/ws"
        );
    }

    #[test]
    fn explicit_ws_urls_pass_verbatim() {
        let mut cfg = base();
        cfg.server = "ws://10.0.0.5:8088/ws".into();
        assert_eq!(cfg.websocket_url().unwrap().as_str(), "ws://10.0.0.5:8088/ws");
    }

    #[test]
    fn foreign_schemes_are_rejected() {
        let mut cfg = base();
        cfg.server = "https://example.net/ws".into();
        assert!(matches!(
            cfg.websocket_url(),
            Err(PhoneError::InvalidConfiguration { field: "server", .. })
        ));
    }

    #[test]
    fn empty_server_is_missing_configuration() {
        let mut cfg = base();
        cfg.server = "  ".into();
        assert!(matches!(
            cfg.validate(),
            Err(PhoneError::MissingConfiguration { field: "server" })
        ));
    }

    #[test]
    fn ring_parameters_are_validated() {
        let mut cfg = base();
        cfg.ring_sound = 9;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.ring_volume = 60;
        assert!(cfg.validate().is_err());

        let cfg = base().with_busylight(7, 75);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn display_name_is_derived_from_username() {
        assert_eq!(base().effective_display_name(), "1001-365Connect");
        assert_eq!(
            base().with_display_name("Front Desk").effective_display_name(),
            "Front Desk"
        );
    }
}
