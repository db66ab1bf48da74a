//! # triline-core
//!
//! The telephony core of a three-line WebSocket softphone: SIP-over-
//! WebSocket signaling, WebRTC-style audio behind an injected media
//! engine, busy-lamp-field presence subscriptions, and a priority-driven
//! busy-light indicator.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────── Phone ─────────────────────────┐
//! │  dial / answer / hang up / transfer / DTMF / select     │
//! └──┬──────────┬──────────┬──────────┬──────────┬──────────┘
//!    │          │          │          │          │
//!  WsTransport  Registrar  BlfEngine  SessionStore  IndicatorMachine
//!    │          │          │          │   └ LineKeyManager
//!    └──────────┴────── EventBus ─────┴──────────┘
//! ```
//!
//! Everything observable flows over the [`events::EventBus`]; the host
//! supplies media, storage and the lamp through the capability traits in
//! [`media`], [`storage`] and [`indicator`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use triline_core::{Phone, PhoneConfig};
//! use triline_core::media::MockMediaEngine;
//! use triline_core::storage::MemoryStorage;
//!
//! # #[tokio::main] async fn main() -> Result<(), triline_core::PhoneError> {
//! let config = PhoneConfig::new("pbx.example.net", "1001", "secret", "example.net");
//! let phone = Phone::new(
//!     config,
//!     Arc::new(MockMediaEngine::new()),
//!     Arc::new(MemoryStorage::new()),
//!     None,
//! )?;
//! phone.start().await?;
//!
//! let mut events = phone.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.topic());
//! }
//! # Ok(()) }
//! ```

pub mod blf;
pub mod config;
pub mod error;
pub mod events;
pub mod indicator;
pub mod line;
pub mod link;
pub mod logging;
pub mod media;
pub mod mwi;
pub mod phone;
pub mod registration;
pub mod session;
pub mod storage;
pub mod transport;

pub use blf::{BlfEngine, BlfEntrySnapshot, BlfState};
pub use config::PhoneConfig;
pub use error::{PhoneError, PhoneResult};
pub use events::{EventBus, HostHooks, PhoneEvent, PhoneEventHandler};
pub use indicator::{IndicatorMachine, IndicatorState, LampDriver};
pub use line::{LineKeyManager, LineNumber, LineSlot, LineState};
pub use phone::Phone;
pub use registration::{Registrar, RegistrationState};
pub use session::{
    CallStats, Direction, DtmfTimings, SessionId, SessionSnapshot, SessionState, SessionStore,
    TransferMode,
};
pub use transport::{TransportState, WsTransport};

/// Commonly used types in one import
pub mod prelude {
    pub use crate::blf::{BlfEntrySnapshot, BlfState};
    pub use crate::config::PhoneConfig;
    pub use crate::error::{PhoneError, PhoneResult};
    pub use crate::events::{PhoneEvent, PhoneEventHandler};
    pub use crate::indicator::{IndicatorState, LampDriver, Rgb};
    pub use crate::line::{LineNumber, LineState};
    pub use crate::media::{MediaConstraints, MediaEngine, MediaSessionHandle};
    pub use crate::phone::Phone;
    pub use crate::registration::RegistrationState;
    pub use crate::session::{
        Direction, DtmfTimings, SessionId, SessionSnapshot, SessionState, TransferMode,
    };
    pub use crate::storage::{BlfButton, HostStorage, HostStorageExt};
    pub use crate::transport::TransportState;
}
