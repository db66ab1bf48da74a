//! Event system for the telephony core
//!
//! Every component publishes onto one in-process bus and observes the
//! others only through it. Two consumption styles are supported, both
//! grounded in the same broadcast channel:
//!
//! - [`EventBus::subscribe`] hands out a raw broadcast receiver for
//!   components that run their own loop (the indicator feed, tests);
//! - [`EventBus::attach_handler`] runs a [`PhoneEventHandler`] on its own
//!   task, with every callback spawned separately so a panicking
//!   subscriber can never abort delivery to its siblings.
//!
//! A small fixed set of topics is additionally forwarded to the host
//! through [`HostHooks`] - the only permitted bus egress.
//!
//! # Examples
//!
//! ```rust
//! use triline_core::events::{EventBus, PhoneEvent};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//! bus.publish(PhoneEvent::TransportConnected);
//! assert_eq!(rx.recv().await.unwrap(), PhoneEvent::TransportConnected);
//! # }
//! ```

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::blf::BlfState;
use crate::indicator::IndicatorState;
use crate::line::LineNumber;
use crate::session::{SessionId, SessionSnapshot, SessionState, TransferMode};

/// Broadcast channel depth; slow subscribers lose oldest events first
const BUS_CAPACITY: usize = 256;

/// Everything the core announces, one variant per named topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhoneEvent {
    /// Registration succeeded; `re_register` is false only on the first
    /// success after connecting, so downstream reacts once
    Registered {
        re_register: bool,
    },
    /// Registration was dropped on purpose
    Unregistered,
    /// REGISTER failed; carries the taxonomy inputs
    RegistrationFailed {
        status_code: Option<u16>,
        reason: String,
    },
    /// WebSocket is up
    TransportConnected,
    /// WebSocket is down
    TransportDisconnected {
        cause: Option<String>,
    },
    /// The reconnect supervisor gave up
    TransportReconnectFailed {
        attempts: u32,
    },
    /// A session entered the store
    SessionCreated {
        session: SessionSnapshot,
    },
    /// A session moved through its lifecycle
    SessionStateChanged {
        id: SessionId,
        state: SessionState,
    },
    /// A session reached Established
    SessionAnswered {
        session: SessionSnapshot,
    },
    /// A session left the store
    SessionTerminated {
        id: SessionId,
        reason: String,
    },
    /// Hold state flipped (only on re-INVITE acceptance)
    SessionHeld {
        id: SessionId,
        on_hold: bool,
    },
    /// Local capture mute flipped
    SessionMuted {
        id: SessionId,
        muted: bool,
    },
    /// A non-fatal per-session failure (hold rejection and friends)
    SessionError {
        id: SessionId,
        reason: String,
    },
    /// One DTMF tone went out
    DtmfSent {
        id: SessionId,
        tone: char,
    },
    /// A REFER was issued
    TransferInitiated {
        id: SessionId,
        target: String,
        mode: TransferMode,
    },
    /// The transfer reached a final disposition
    TransferCompleted {
        id: SessionId,
        target: String,
        mode: TransferMode,
        success: bool,
        reason: Option<String>,
    },
    /// The selected line changed
    LineChanged {
        previous: Option<LineNumber>,
        current: Option<LineNumber>,
    },
    /// An incoming call arrived while another call exists
    CallWaitingTone {
        line: LineNumber,
        session: SessionId,
    },
    /// A monitored extension changed dialog state
    BlfStateChanged {
        extension: String,
        state: BlfState,
        remote_target: Option<String>,
    },
    /// A dialog subscription was accepted
    BlfSubscribed {
        extension: String,
    },
    /// A dialog subscription was torn down locally
    BlfUnsubscribed {
        extension: String,
    },
    /// Voicemail counters changed (message-summary NOTIFY)
    VoicemailChanged {
        waiting: bool,
        new_messages: u32,
        old_messages: u32,
    },
    /// Agent login/pause state reported by the host
    AgentStateChanged {
        logged_in: bool,
        paused: bool,
    },
    /// The indicator resolved to a new state
    IndicatorStateChanged {
        state: IndicatorState,
    },
}

impl PhoneEvent {
    /// The topic name of this event
    pub fn topic(&self) -> &'static str {
        match self {
            PhoneEvent::Registered { .. } => "registered",
            PhoneEvent::Unregistered => "unregistered",
            PhoneEvent::RegistrationFailed { .. } => "registrationFailed",
            PhoneEvent::TransportConnected => "transportConnected",
            PhoneEvent::TransportDisconnected { .. } => "transportDisconnected",
            PhoneEvent::TransportReconnectFailed { .. } => "transportReconnectFailed",
            PhoneEvent::SessionCreated { .. } => "sessionCreated",
            PhoneEvent::SessionStateChanged { .. } => "sessionStateChanged",
            PhoneEvent::SessionAnswered { .. } => "sessionAnswered",
            PhoneEvent::SessionTerminated { .. } => "sessionTerminated",
            PhoneEvent::SessionHeld { .. } => "sessionHeld",
            PhoneEvent::SessionMuted { .. } => "sessionMuted",
            PhoneEvent::SessionError { .. } => "sessionError",
            PhoneEvent::DtmfSent { .. } => "dtmfSent",
            PhoneEvent::TransferInitiated { .. } => "transferInitiated",
            PhoneEvent::TransferCompleted { .. } => "transferCompleted",
            PhoneEvent::LineChanged { .. } => "lineChanged",
            PhoneEvent::CallWaitingTone { .. } => "callWaitingTone",
            PhoneEvent::BlfStateChanged { .. } => "blfStateChanged",
            PhoneEvent::BlfSubscribed { .. } => "blfSubscribed",
            PhoneEvent::BlfUnsubscribed { .. } => "blfUnsubscribed",
            PhoneEvent::VoicemailChanged { .. } => "voicemailChanged",
            PhoneEvent::AgentStateChanged { .. } => "agentStateChanged",
            PhoneEvent::IndicatorStateChanged { .. } => "indicatorStateChanged",
        }
    }

    /// Whether this topic is forwarded to the host hooks
    pub fn is_egress(&self) -> bool {
        matches!(
            self,
            PhoneEvent::Registered { .. }
                | PhoneEvent::Unregistered
                | PhoneEvent::TransportDisconnected { .. }
                | PhoneEvent::SessionCreated { .. }
                | PhoneEvent::SessionTerminated { .. }
                | PhoneEvent::IndicatorStateChanged { .. }
        )
    }
}

/// Application-level observer, attached via [`EventBus::attach_handler`]
#[async_trait]
pub trait PhoneEventHandler: Send + Sync {
    /// Called for every published event, in publish order
    async fn on_event(&self, event: PhoneEvent);
}

/// Host integration sink for the fixed egress topic set
#[async_trait]
pub trait HostHooks: Send + Sync {
    /// Called with the topic name and the event, off the publisher's path
    async fn deliver(&self, topic: &'static str, event: PhoneEvent);
}

/// The in-process publish/subscribe bus
pub struct EventBus {
    tx: broadcast::Sender<PhoneEvent>,
    hooks: RwLock<Option<Arc<dyn HostHooks>>>,
}

impl EventBus {
    /// A bus with no subscribers and no host hooks
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        EventBus { tx, hooks: RwLock::new(None) }
    }

    /// Install the host egress sink
    pub fn set_host_hooks(&self, hooks: Arc<dyn HostHooks>) {
        *self.hooks.write().unwrap() = Some(hooks);
    }

    /// A raw receiver over every subsequent event
    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers and, for egress topics, the
    /// host hooks.
    ///
    /// Never blocks and never fails: with no subscribers the event is
    /// simply dropped, and hook delivery runs on a spawned task.
    pub fn publish(&self, event: PhoneEvent) {
        tracing::trace!(topic = event.topic(), "bus publish");
        if event.is_egress() {
            if let Some(hooks) = self.hooks.read().unwrap().clone() {
                let forwarded = event.clone();
                tokio::spawn(async move {
                    hooks.deliver(forwarded.topic(), forwarded).await;
                });
            }
        }
        let _ = self.tx.send(event);
    }

    /// Run `handler` for every event on its own dispatch task.
    ///
    /// Each callback is spawned separately, so a handler that panics
    /// poisons only its own invocation - sibling handlers and later
    /// events keep flowing.
    pub fn attach_handler(&self, handler: Arc<dyn PhoneEventHandler>) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.on_event(event).await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "event handler lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl PhoneEventHandler for Counter {
        async fn on_event(&self, _event: PhoneEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    #[async_trait]
    impl PhoneEventHandler for Panicker {
        async fn on_event(&self, _event: PhoneEvent) {
            panic!("subscriber blew up");
        }
    }

    #[tokio::test]
    async fn all_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(PhoneEvent::TransportConnected);
        bus.publish(PhoneEvent::Unregistered);

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap(), PhoneEvent::TransportConnected);
            assert_eq!(rx.recv().await.unwrap(), PhoneEvent::Unregistered);
        }
    }

    #[tokio::test]
    async fn panicking_handler_does_not_starve_siblings() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.attach_handler(Arc::new(Panicker));
        bus.attach_handler(counter.clone());

        bus.publish(PhoneEvent::TransportConnected);
        bus.publish(PhoneEvent::Unregistered);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn egress_forwards_only_the_fixed_set() {
        struct Recorder(tokio::sync::mpsc::UnboundedSender<&'static str>);

        #[async_trait]
        impl HostHooks for Recorder {
            async fn deliver(&self, topic: &'static str, _event: PhoneEvent) {
                let _ = self.0.send(topic);
            }
        }

        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.set_host_hooks(Arc::new(Recorder(tx)));

        bus.publish(PhoneEvent::TransportConnected); // not egress
        bus.publish(PhoneEvent::Unregistered); // egress

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv().unwrap(), "unregistered");
        assert!(rx.try_recv().is_err());
    }
}
