//! Presence indicator state machine
//!
//! The lamp state is a pure function of observed inputs - registration,
//! the live session set, agent login, voicemail counters - recomputed
//! wholesale on every input change. No derived flags are stored, so the
//! published state can never drift from the inputs that produced it.
//!
//! Priority, highest first: Ringing, Hold, Active, IdleWithVoicemail,
//! Idle, Registered, Offline. The render table maps each state to a
//! solid colour, a blink cadence, an alert, or dark.
//!
//! Device adaptation: Alpha-family lamps have no hardware blink, so the
//! machine emulates Blink with an interval timer toggling solid and off
//! at the same cadence. Alert is native on every device. Command
//! dispatch is last-writer-wins: a new state aborts whatever command or
//! emulation loop the previous state still had running.
//!
//! A 15 s liveness probe supervises the bridge. While it is down the
//! machine keeps resolving and publishing states silently; the first
//! successful probe re-applies the current state to the lamp.

mod driver;

pub use driver::{
    HttpLampDriver, LampCommand, LampDevice, LampDriver, MockLampDriver, Rgb, COMMAND_TIMEOUT,
    PROBE_TIMEOUT,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::PhoneConfig;
use crate::events::{EventBus, PhoneEvent};

/// Probe cadence for bridge supervision
pub const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// The blink cadence used by Hold and IdleWithVoicemail (1.5 s / 1.5 s)
const BLINK_TENTHS: u8 = 15;

/// The resolved indicator state, highest-priority input winning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorState {
    /// Not registered (or nothing at all)
    Offline,
    /// Registered but no agent logged in
    Registered,
    /// Agent logged in, no calls
    Idle,
    /// Agent logged in, voicemail waiting
    IdleWithVoicemail,
    /// An incoming call is ringing
    Ringing,
    /// A call is established and live
    Active,
    /// A call is established and held
    Hold,
}

impl std::fmt::Display for IndicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicatorState::Offline => write!(f, "Offline"),
            IndicatorState::Registered => write!(f, "Registered"),
            IndicatorState::Idle => write!(f, "Idle"),
            IndicatorState::IdleWithVoicemail => write!(f, "IdleWithVoicemail"),
            IndicatorState::Ringing => write!(f, "Ringing"),
            IndicatorState::Active => write!(f, "Active"),
            IndicatorState::Hold => write!(f, "Hold"),
        }
    }
}

/// What a state renders as on the lamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Lamp dark
    Off,
    /// Solid colour
    Solid(Rgb),
    /// Blink cadence in tenths of a second
    Blink { color: Rgb, on_tenths: u8, off_tenths: u8 },
    /// Colour plus ringtone
    Alert { color: Rgb, sound: u8, volume: u8 },
}

/// Everything the resolution function looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndicatorInputs {
    /// SIP registration is active
    pub registered: bool,
    /// Agent is logged in at the back office
    pub agent_logged_in: bool,
    /// New voicemail count
    pub voicemail_new: u32,
    /// At least one incoming session is ringing
    pub any_ringing_incoming: bool,
    /// At least one established session is held
    pub any_established_on_hold: bool,
    /// At least one established session is live
    pub any_established_active: bool,
}

/// Resolve inputs to a state by the fixed priority table
pub fn resolve(inputs: &IndicatorInputs) -> IndicatorState {
    if inputs.any_ringing_incoming {
        IndicatorState::Ringing
    } else if inputs.any_established_on_hold {
        IndicatorState::Hold
    } else if inputs.any_established_active {
        IndicatorState::Active
    } else if inputs.agent_logged_in && inputs.voicemail_new > 0 {
        IndicatorState::IdleWithVoicemail
    } else if inputs.agent_logged_in {
        IndicatorState::Idle
    } else if inputs.registered {
        IndicatorState::Registered
    } else {
        IndicatorState::Offline
    }
}

/// The render table
pub fn render_for(state: IndicatorState, ring_sound: u8, ring_volume: u8) -> RenderMode {
    match state {
        IndicatorState::Ringing => RenderMode::Alert {
            color: Rgb::RED,
            sound: ring_sound,
            volume: ring_volume,
        },
        IndicatorState::Hold => RenderMode::Blink {
            color: Rgb::YELLOW,
            on_tenths: BLINK_TENTHS,
            off_tenths: BLINK_TENTHS,
        },
        IndicatorState::Active => RenderMode::Solid(Rgb::RED),
        IndicatorState::IdleWithVoicemail => RenderMode::Blink {
            color: Rgb::GREEN,
            on_tenths: BLINK_TENTHS,
            off_tenths: BLINK_TENTHS,
        },
        IndicatorState::Idle => RenderMode::Solid(Rgb::GREEN),
        IndicatorState::Registered => RenderMode::Solid(Rgb::WHITE),
        IndicatorState::Offline => RenderMode::Off,
    }
}

/// The indicator machine: input tracking, lamp dispatch, supervision
pub struct IndicatorMachine {
    driver: Arc<dyn LampDriver>,
    bus: Arc<EventBus>,
    config: Arc<PhoneConfig>,
    inputs: Mutex<IndicatorInputs>,
    current: Mutex<IndicatorState>,
    driver_available: AtomicBool,
    hardware_blink: AtomicBool,
    command_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    probe_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IndicatorMachine {
    /// A machine starting at Offline with an unprobed device
    pub fn new(driver: Arc<dyn LampDriver>, bus: Arc<EventBus>, config: Arc<PhoneConfig>) -> Self {
        IndicatorMachine {
            driver,
            bus,
            config,
            inputs: Mutex::new(IndicatorInputs::default()),
            current: Mutex::new(IndicatorState::Offline),
            driver_available: AtomicBool::new(true),
            hardware_blink: AtomicBool::new(true),
            command_task: tokio::sync::Mutex::new(None),
            probe_task: tokio::sync::Mutex::new(None),
        }
    }

    /// The last resolved state
    pub fn current_state(&self) -> IndicatorState {
        *self.current.lock().unwrap()
    }

    /// Whether the bridge answered its last probe
    pub fn driver_available(&self) -> bool {
        self.driver_available.load(Ordering::SeqCst)
    }

    /// Probe device capabilities and start supervision
    pub async fn start(self: &Arc<Self>) {
        match self.driver.devices().await {
            Ok(devices) => {
                let hardware = devices
                    .first()
                    .map(LampDevice::supports_hardware_blink)
                    .unwrap_or(true);
                self.hardware_blink.store(hardware, Ordering::SeqCst);
                self.driver_available.store(true, Ordering::SeqCst);
                tracing::info!(hardware_blink = hardware, "lamp device probed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "lamp bridge unavailable at startup");
                self.driver_available.store(false, Ordering::SeqCst);
            }
        }
        self.apply(self.current_state()).await;

        let machine = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROBE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                machine.probe_once().await;
            }
        });
        if let Some(previous) = self.probe_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn probe_once(self: &Arc<Self>) {
        match self.driver.current_presence().await {
            Ok(_) => {
                let was_down = !self.driver_available.swap(true, Ordering::SeqCst);
                if was_down {
                    tracing::info!("lamp bridge back, re-applying state");
                    self.apply(self.current_state()).await;
                }
            }
            Err(e) => {
                if self.driver_available.swap(false, Ordering::SeqCst) {
                    tracing::warn!(error = %e, "lamp bridge lost");
                }
            }
        }
    }

    /// Stop supervision and darken the lamp
    pub async fn stop(&self) {
        if let Some(handle) = self.probe_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.command_task.lock().await.take() {
            handle.abort();
        }
        let _ = self.driver.off().await;
    }

    /// Replace the inputs; resolves, publishes and drives the lamp when
    /// the resolved state changed.
    pub async fn set_inputs(self: &Arc<Self>, next: IndicatorInputs) {
        let state = resolve(&next);
        *self.inputs.lock().unwrap() = next;
        let changed = {
            let mut current = self.current.lock().unwrap();
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        };
        if changed {
            tracing::debug!(state = %state, "indicator state change");
            self.bus.publish(PhoneEvent::IndicatorStateChanged { state });
            self.apply(state).await;
        }
    }

    /// Dispatch the lamp command for `state`, aborting whatever the
    /// previous state still had running (last-writer-wins).
    async fn apply(self: &Arc<Self>, state: IndicatorState) {
        let machine = self.clone();
        let handle = tokio::spawn(async move {
            if !machine.driver_available.load(Ordering::SeqCst) {
                // keep state silently; the probe re-applies on recovery
                return;
            }
            let render = render_for(
                state,
                machine.config.ring_sound,
                machine.config.ring_volume,
            );
            let result = match render {
                RenderMode::Off => machine.driver.off().await,
                RenderMode::Solid(color) => machine.driver.light(color).await,
                RenderMode::Alert { color, sound, volume } => {
                    machine.driver.alert(color, sound, volume).await
                }
                RenderMode::Blink { color, on_tenths, off_tenths } => {
                    if machine.hardware_blink.load(Ordering::SeqCst) {
                        machine.driver.blink(color, on_tenths, off_tenths).await
                    } else {
                        machine.software_blink(color, on_tenths, off_tenths).await
                    }
                }
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "lamp command failed");
                machine.driver_available.store(false, Ordering::SeqCst);
            }
        });
        if let Some(previous) = self.command_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Interval emulation of Blink for devices without hardware support.
    /// Runs until this command is replaced by the next state.
    async fn software_blink(
        &self,
        color: Rgb,
        on_tenths: u8,
        off_tenths: u8,
    ) -> crate::error::PhoneResult<()> {
        let on = Duration::from_millis(u64::from(on_tenths) * 100);
        let off = Duration::from_millis(u64::from(off_tenths) * 100);
        loop {
            self.driver.light(color).await?;
            tokio::time::sleep(on).await;
            self.driver.off().await?;
            tokio::time::sleep(off).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with(driver: MockLampDriver) -> (Arc<IndicatorMachine>, Arc<MockLampDriver>) {
        let driver = Arc::new(driver);
        let bus = Arc::new(EventBus::new());
        let config = Arc::new(
            crate::config::PhoneConfig::new("example.net", "1001", "p", "example.net")
                .with_busylight(3, 75),
        );
        (
            Arc::new(IndicatorMachine::new(driver.clone(), bus, config)),
            driver,
        )
    }

    #[test]
    fn priority_table() {
        let mut inputs = IndicatorInputs::default();
        assert_eq!(resolve(&inputs), IndicatorState::Offline);

        inputs.registered = true;
        assert_eq!(resolve(&inputs), IndicatorState::Registered);

        inputs.agent_logged_in = true;
        assert_eq!(resolve(&inputs), IndicatorState::Idle);

        inputs.voicemail_new = 2;
        assert_eq!(resolve(&inputs), IndicatorState::IdleWithVoicemail);

        // an established held call outranks voicemail
        inputs.any_established_on_hold = true;
        assert_eq!(resolve(&inputs), IndicatorState::Hold);

        // a live call outranks everything below ringing
        inputs.any_established_on_hold = false;
        inputs.any_established_active = true;
        assert_eq!(resolve(&inputs), IndicatorState::Active);

        inputs.any_ringing_incoming = true;
        assert_eq!(resolve(&inputs), IndicatorState::Ringing);
    }

    #[test]
    fn render_table_matches_the_lamp_contract() {
        assert_eq!(render_for(IndicatorState::Active, 1, 50), RenderMode::Solid(Rgb::RED));
        assert_eq!(render_for(IndicatorState::Idle, 1, 50), RenderMode::Solid(Rgb::GREEN));
        assert_eq!(render_for(IndicatorState::Registered, 1, 50), RenderMode::Solid(Rgb::WHITE));
        assert_eq!(render_for(IndicatorState::Offline, 1, 50), RenderMode::Off);
        assert_eq!(
            render_for(IndicatorState::Hold, 1, 50),
            RenderMode::Blink { color: Rgb::YELLOW, on_tenths: 15, off_tenths: 15 }
        );
        assert_eq!(
            render_for(IndicatorState::Ringing, 4, 25),
            RenderMode::Alert { color: Rgb::RED, sound: 4, volume: 25 }
        );
    }

    #[tokio::test]
    async fn state_change_publishes_and_drives_the_lamp() {
        let (machine, driver) = machine_with(MockLampDriver::new());
        let mut rx = machine.bus.subscribe();
        machine.start().await;

        machine
            .set_inputs(IndicatorInputs { registered: true, ..Default::default() })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(machine.current_state(), IndicatorState::Registered);
        assert_eq!(
            rx.recv().await.unwrap(),
            PhoneEvent::IndicatorStateChanged { state: IndicatorState::Registered }
        );
        assert!(driver
            .recorded()
            .contains(&LampCommand::Light(Rgb::WHITE)));
    }

    #[tokio::test]
    async fn same_state_publishes_nothing() {
        let (machine, _driver) = machine_with(MockLampDriver::new());
        let mut rx = machine.bus.subscribe();
        let inputs = IndicatorInputs { registered: true, ..Default::default() };
        machine.set_inputs(inputs).await;
        machine.set_inputs(inputs).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn alpha_device_blinks_in_software() {
        let (machine, driver) = machine_with(MockLampDriver::alpha());
        machine.start().await;
        machine
            .set_inputs(IndicatorInputs {
                registered: true,
                agent_logged_in: true,
                voicemail_new: 1,
                ..Default::default()
            })
            .await;
        // let the emulation loop run a toggle or two
        tokio::time::sleep(Duration::from_millis(50)).await;

        let recorded = driver.recorded();
        assert!(recorded.contains(&LampCommand::Light(Rgb::GREEN)));
        assert!(!recorded
            .iter()
            .any(|c| matches!(c, LampCommand::Blink(_, _, _))));
    }

    #[tokio::test]
    async fn unavailable_driver_buffers_silently_and_recovers() {
        let (machine, driver) = machine_with(MockLampDriver::new());
        machine.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // bridge goes away
        driver.presence_ok.store(false, Ordering::SeqCst);
        machine.probe_once().await;
        assert!(!machine.driver_available());

        // state keeps advancing but no command reaches the lamp
        driver.commands.lock().unwrap().clear();
        machine
            .set_inputs(IndicatorInputs { registered: true, ..Default::default() })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(machine.current_state(), IndicatorState::Registered);
        assert!(driver.recorded().is_empty());

        // bridge comes back: the probe re-applies the current state
        driver.presence_ok.store(true, Ordering::SeqCst);
        machine.probe_once().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(driver
            .recorded()
            .contains(&LampCommand::Light(Rgb::WHITE)));
    }
}
