//! Lamp driver interface and the HTTP bridge implementation
//!
//! The physical busy-light hangs off a local bridge process reached over
//! HTTP. The core only ever talks to the [`LampDriver`] trait; the
//! bridge client here is one implementation, the in-memory mock another.
//!
//! Bridge conventions: colour channels are 0–100 integers, blink cadence
//! is in tenths of a second, alert sounds are 1..=7 at one of five
//! volume steps, and every request is routed by the softphone username,
//! passed redundantly as a `bridgeId` query parameter and an
//! `x-connect365-username` header. Commands get a 2 s deadline, the
//! liveness probe 3 s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RING_VOLUME_STEPS;
use crate::error::{PhoneError, PhoneResult};

/// Command deadline
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(2000);
/// Liveness probe deadline
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(3000);

/// A lamp colour on the bridge's 0–100 channel scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Full red
    pub const RED: Rgb = Rgb { r: 100, g: 0, b: 0 };
    /// Full green
    pub const GREEN: Rgb = Rgb { r: 0, g: 100, b: 0 };
    /// Yellow
    pub const YELLOW: Rgb = Rgb { r: 100, g: 100, b: 0 };
    /// White
    pub const WHITE: Rgb = Rgb { r: 100, g: 100, b: 100 };

    /// Clamp all channels onto the bridge scale
    pub fn clamped(self) -> Rgb {
        Rgb { r: self.r.min(100), g: self.g.min(100), b: self.b.min(100) }
    }
}

/// One enumerated lamp device as reported by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LampDevice {
    /// Friendly device name
    pub name: String,
    /// Product family string
    pub product: String,
}

impl LampDevice {
    /// Alpha-family devices have no hardware blink; the indicator
    /// emulates blinking with an interval timer for them.
    pub fn supports_hardware_blink(&self) -> bool {
        !self.product.starts_with("Alpha")
    }
}

/// The lamp command surface consumed by the indicator machine
#[async_trait]
pub trait LampDriver: Send + Sync {
    /// Solid colour
    async fn light(&self, color: Rgb) -> PhoneResult<()>;
    /// Hardware blink with on/off cadence in tenths of a second
    async fn blink(&self, color: Rgb, on_tenths: u8, off_tenths: u8) -> PhoneResult<()>;
    /// Colour plus ringtone; must be supported natively by every device
    async fn alert(&self, color: Rgb, sound: u8, volume: u8) -> PhoneResult<()>;
    /// Lamp dark
    async fn off(&self) -> PhoneResult<()>;
    /// Enumerate attached devices
    async fn devices(&self) -> PhoneResult<Vec<LampDevice>>;
    /// Liveness probe
    async fn current_presence(&self) -> PhoneResult<bool>;
}

/// Validate alert parameters against what the bridge accepts
pub fn validate_alert(sound: u8, volume: u8) -> PhoneResult<()> {
    if !(1..=7).contains(&sound) {
        return Err(PhoneError::InvalidConfiguration {
            field: "ring_sound",
            reason: format!("{} is outside 1..=7", sound),
        });
    }
    if !RING_VOLUME_STEPS.contains(&volume) {
        return Err(PhoneError::InvalidConfiguration {
            field: "ring_volume",
            reason: format!("{} is not one of 0/25/50/75/100", volume),
        });
    }
    Ok(())
}

/// The HTTP bridge client
pub struct HttpLampDriver {
    client: reqwest::Client,
    base_url: String,
    username: String,
}

impl HttpLampDriver {
    /// A driver talking to `base_url` on behalf of `username`
    pub fn new(base_url: impl Into<String>, username: impl Into<String>) -> PhoneResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(COMMAND_TIMEOUT)
            .build()
            .map_err(|e| PhoneError::LampUnavailable { reason: e.to_string() })?;
        Ok(HttpLampDriver {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
        })
    }

    async fn call(
        &self,
        action: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> PhoneResult<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, action);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .query(&[("bridgeId", self.username.as_str())])
            .query(query)
            .header("x-connect365-username", &self.username)
            .send()
            .await
            .map_err(|e| PhoneError::LampUnavailable { reason: e.to_string() })?;
        if !response.status().is_success() {
            return Err(PhoneError::LampUnavailable {
                reason: format!("{} answered {}", action, response.status()),
            });
        }
        Ok(response)
    }

    fn color_query(color: Rgb) -> Vec<(&'static str, String)> {
        let color = color.clamped();
        vec![
            ("red", color.r.to_string()),
            ("green", color.g.to_string()),
            ("blue", color.b.to_string()),
        ]
    }
}

#[async_trait]
impl LampDriver for HttpLampDriver {
    async fn light(&self, color: Rgb) -> PhoneResult<()> {
        self.call("light", &Self::color_query(color), COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn blink(&self, color: Rgb, on_tenths: u8, off_tenths: u8) -> PhoneResult<()> {
        let mut query = Self::color_query(color);
        query.push(("ontime", on_tenths.to_string()));
        query.push(("offtime", off_tenths.to_string()));
        self.call("blink", &query, COMMAND_TIMEOUT).await.map(|_| ())
    }

    async fn alert(&self, color: Rgb, sound: u8, volume: u8) -> PhoneResult<()> {
        validate_alert(sound, volume)?;
        let mut query = Self::color_query(color);
        query.push(("sound", sound.to_string()));
        query.push(("volume", volume.to_string()));
        self.call("alert", &query, COMMAND_TIMEOUT).await.map(|_| ())
    }

    async fn off(&self) -> PhoneResult<()> {
        self.call("off", &[], COMMAND_TIMEOUT).await.map(|_| ())
    }

    async fn devices(&self) -> PhoneResult<Vec<LampDevice>> {
        let response = self.call("devices", &[], COMMAND_TIMEOUT).await?;
        response
            .json()
            .await
            .map_err(|e| PhoneError::LampUnavailable { reason: e.to_string() })
    }

    async fn current_presence(&self) -> PhoneResult<bool> {
        self.call("currentpresence", &[], PROBE_TIMEOUT)
            .await
            .map(|_| true)
    }
}

/// A recorded lamp command, for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LampCommand {
    Light(Rgb),
    Blink(Rgb, u8, u8),
    Alert(Rgb, u8, u8),
    Off,
}

/// In-memory lamp driver for tests and demos
pub struct MockLampDriver {
    /// Every command received, in order
    pub commands: Mutex<Vec<LampCommand>>,
    /// Whether the single mock device advertises hardware blink
    pub hardware_blink: bool,
    /// Flip to false to fail the liveness probe
    pub presence_ok: AtomicBool,
    /// Flip to true to fail every command
    pub fail_commands: AtomicBool,
}

impl MockLampDriver {
    /// A healthy device with hardware blink support
    pub fn new() -> Self {
        MockLampDriver {
            commands: Mutex::new(Vec::new()),
            hardware_blink: true,
            presence_ok: AtomicBool::new(true),
            fail_commands: AtomicBool::new(false),
        }
    }

    /// An Alpha-family device (software blink emulation required)
    pub fn alpha() -> Self {
        MockLampDriver { hardware_blink: false, ..Self::new() }
    }

    /// The commands received so far
    pub fn recorded(&self) -> Vec<LampCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn record(&self, command: LampCommand) -> PhoneResult<()> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(PhoneError::LampUnavailable { reason: "mock failure".into() });
        }
        self.commands.lock().unwrap().push(command);
        Ok(())
    }
}

impl Default for MockLampDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LampDriver for MockLampDriver {
    async fn light(&self, color: Rgb) -> PhoneResult<()> {
        self.record(LampCommand::Light(color))
    }

    async fn blink(&self, color: Rgb, on_tenths: u8, off_tenths: u8) -> PhoneResult<()> {
        self.record(LampCommand::Blink(color, on_tenths, off_tenths))
    }

    async fn alert(&self, color: Rgb, sound: u8, volume: u8) -> PhoneResult<()> {
        validate_alert(sound, volume)?;
        self.record(LampCommand::Alert(color, sound, volume))
    }

    async fn off(&self) -> PhoneResult<()> {
        self.record(LampCommand::Off)
    }

    async fn devices(&self) -> PhoneResult<Vec<LampDevice>> {
        Ok(vec![LampDevice {
            name: "Busylight".into(),
            product: if self.hardware_blink { "Omega" } else { "Alpha" }.into(),
        }])
    }

    async fn current_presence(&self) -> PhoneResult<bool> {
        if self.presence_ok.load(Ordering::SeqCst) {
            Ok(true)
        } else {
            Err(PhoneError::LampUnavailable { reason: "probe failed".into() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_devices_lack_hardware_blink() {
        let alpha = LampDevice { name: "x".into(), product: "Alpha 2".into() };
        let omega = LampDevice { name: "x".into(), product: "Omega".into() };
        assert!(!alpha.supports_hardware_blink());
        assert!(omega.supports_hardware_blink());
    }

    #[test]
    fn alert_parameters_are_validated() {
        assert!(validate_alert(1, 0).is_ok());
        assert!(validate_alert(7, 100).is_ok());
        assert!(validate_alert(0, 50).is_err());
        assert!(validate_alert(8, 50).is_err());
        assert!(validate_alert(3, 33).is_err());
    }

    #[tokio::test]
    async fn mock_records_in_order() {
        let driver = MockLampDriver::new();
        driver.light(Rgb::RED).await.unwrap();
        driver.off().await.unwrap();
        assert_eq!(
            driver.recorded(),
            vec![LampCommand::Light(Rgb::RED), LampCommand::Off]
        );
    }
}
