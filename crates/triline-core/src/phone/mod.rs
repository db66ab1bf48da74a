//! The phone manager
//!
//! [`Phone`] wires the components together: transport, registrar, BLF
//! engine, session store, line table, voicemail subscriber, indicator.
//! It owns the two long-running loops - the inbound SIP dispatcher and
//! the bus reaction loop - and nothing else; every operation the UI
//! calls lives in the controller impl next door.
//!
//! Inbound routing is mechanical: responses go to the transaction table,
//! dialog-creating INVITEs to the session store, NOTIFYs to whichever of
//! BLF / voicemail / session owns the Call-ID, everything else in-dialog
//! to the store. Unclaimed in-dialog requests answer 481.

mod controller;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use triline_sip::{HeaderName, Message, Method, Response, StatusCode};

use crate::blf::{BlfEngine, BlfEntrySnapshot};
use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent, PhoneEventHandler};
use crate::indicator::{IndicatorInputs, IndicatorMachine, IndicatorState, LampDriver};
use crate::line::{LineKeyManager, LineNumber, LineSlot};
use crate::link::SipLink;
use crate::media::MediaEngine;
use crate::mwi::MwiSubscriber;
use crate::registration::{Registrar, RegistrationState};
use crate::session::{CallStats, SessionSnapshot, SessionStore};
use crate::storage::{keys, HostStorage, HostStorageExt};
use crate::transport::{TransportState, WsTransport};

/// Settle before an auto-answered call is picked up
const AUTO_ANSWER_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
struct AgentView {
    logged_in: bool,
    paused: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct VoicemailView {
    waiting: bool,
    new_messages: u32,
}

/// The assembled softphone core
pub struct Phone {
    pub(crate) config: Arc<PhoneConfig>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) transport: Arc<WsTransport>,
    pub(crate) link: Arc<SipLink>,
    pub(crate) registrar: Arc<Registrar>,
    pub(crate) blf: Arc<BlfEngine>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) lines: Arc<LineKeyManager>,
    pub(crate) indicator: Option<Arc<IndicatorMachine>>,
    pub(crate) storage: Arc<dyn HostStorage>,
    pub(crate) mwi: Arc<MwiSubscriber>,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    agent: Mutex<AgentView>,
    voicemail: Mutex<VoicemailView>,
    running: AtomicBool,
}

impl Phone {
    /// Assemble a phone from validated configuration and the injected
    /// host capabilities. Fails synchronously on bad configuration;
    /// nothing touches the network until [`Phone::start`].
    pub fn new(
        config: PhoneConfig,
        media: Arc<dyn MediaEngine>,
        storage: Arc<dyn HostStorage>,
        lamp: Option<Arc<dyn LampDriver>>,
    ) -> PhoneResult<Arc<Self>> {
        config.validate()?;
        let url = config.websocket_url()?;
        let config = Arc::new(config);

        let bus = Arc::new(EventBus::new());
        let (transport, inbound) = WsTransport::new(
            url,
            config.reconnection_attempts,
            Duration::from_secs(config.reconnection_timeout_secs),
            bus.clone(),
        );
        let link = Arc::new(SipLink::new(transport.clone(), &config));
        let registrar = Arc::new(Registrar::new(
            link.clone(),
            transport.clone(),
            bus.clone(),
            config.clone(),
        ));
        let lines = Arc::new(LineKeyManager::new(bus.clone()));
        let store = Arc::new(SessionStore::new(
            link.clone(),
            bus.clone(),
            config.clone(),
            media,
            lines.clone(),
        ));
        let blf = Arc::new(BlfEngine::new(link.clone(), bus.clone(), config.clone()));
        blf.configure(&storage.blf_buttons());
        let mwi = Arc::new(MwiSubscriber::new(link.clone(), bus.clone(), config.clone()));

        let indicator = if config.busylight_enabled {
            lamp.map(|driver| {
                Arc::new(IndicatorMachine::new(driver, bus.clone(), config.clone()))
            })
        } else {
            None
        };

        storage.set(keys::SIP_USERNAME, &config.username);

        Ok(Arc::new(Phone {
            config,
            bus,
            transport,
            link,
            registrar,
            blf,
            store,
            lines,
            indicator,
            storage,
            mwi,
            inbound: tokio::sync::Mutex::new(Some(inbound)),
            agent: Mutex::new(AgentView::default()),
            voicemail: Mutex::new(VoicemailView::default()),
            running: AtomicBool::new(false),
        }))
    }

    /// Open the transport and start the dispatch and reaction loops
    pub async fn start(self: &Arc<Self>) -> PhoneResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(indicator) = &self.indicator {
            indicator.start().await;
        }

        let mut inbound = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| PhoneError::internal("phone already started once"))?;
        let phone = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                phone.dispatch(message);
            }
        });

        let phone = self.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                phone.react(event).await;
            }
        });

        self.transport.start();
        Ok(())
    }

    /// Shut the phone down: teardown, unregister, close the socket
    pub async fn stop(self: &Arc<Self>) {
        self.unregister(true).await;
        if let Some(indicator) = &self.indicator {
            indicator.stop().await;
        }
        self.transport.stop();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drop the registration. With `teardown` (the default behaviour for
    /// callers that do not say otherwise) every session is terminated
    /// and every subscription unsubscribed first.
    pub async fn unregister(self: &Arc<Self>, teardown: bool) {
        if teardown {
            self.store.terminate_all("unregistered").await;
            self.blf.unsubscribe_all().await;
            self.mwi.unsubscribe().await;
        }
        self.blf.stop_retry_job().await;
        let _ = self.registrar.unregister().await;
    }

    // ---- inbound dispatch ------------------------------------------------

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response(response) => self.link.dispatch_response(response),
            Message::Request(request) => {
                let response = self.route_request(&request);
                if let Some(response) = response {
                    if let Err(e) = self.link.send_response(&response) {
                        tracing::warn!(error = %e, "failed to answer inbound request");
                    }
                }
            }
        }
    }

    fn route_request(self: &Arc<Self>, request: &triline_sip::Request) -> Option<Response> {
        match request.method {
            Method::Invite => {
                let in_dialog = request
                    .headers
                    .call_id()
                    .ok()
                    .and_then(|call_id| self.store.session_for_call_id(call_id))
                    .is_some();
                if in_dialog {
                    self.store.handle_in_dialog(request)
                } else {
                    Some(self.store.handle_incoming_invite(request))
                }
            }
            Method::Notify => self
                .blf
                .handle_notify(request)
                .or_else(|| self.mwi.handle_notify(request))
                .or_else(|| self.store.handle_in_dialog(request))
                .or_else(|| {
                    Some(Response::for_request(
                        StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                        request,
                    ))
                }),
            Method::Bye | Method::Cancel | Method::Info | Method::Ack => self
                .store
                .handle_in_dialog(request)
                .or_else(|| match request.method {
                    // a stray ACK draws no response
                    Method::Ack => None,
                    _ => Some(Response::for_request(
                        StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                        request,
                    )),
                }),
            Method::Message => {
                // offline messaging is out of scope; acknowledge politely
                Some(Response::for_request(StatusCode::OK, request))
            }
            Method::Options => {
                let mut response = Response::for_request(StatusCode::OK, request);
                response.headers.push(
                    HeaderName::Allow,
                    "INVITE, ACK, CANCEL, BYE, REFER, SUBSCRIBE, NOTIFY, INFO, MESSAGE, OPTIONS",
                );
                Some(response)
            }
            _ => Some(Response::for_request(StatusCode::OK, request)),
        }
    }

    // ---- bus reactions ---------------------------------------------------

    async fn react(self: &Arc<Self>, event: PhoneEvent) {
        match &event {
            PhoneEvent::TransportConnected => {
                let registrar = self.registrar.clone();
                tokio::spawn(async move {
                    registrar.on_transport_connected().await;
                });
            }
            PhoneEvent::TransportDisconnected { .. } => {
                self.registrar.on_transport_lost().await;
                self.blf.stop_retry_job().await;
                self.blf.clear_handles();
                self.mwi.clear();
            }
            PhoneEvent::Registered { re_register } => {
                if !re_register {
                    let blf = self.blf.clone();
                    tokio::spawn(async move {
                        blf.subscribe_all().await;
                    });
                    self.blf.start_retry_job().await;
                    let mwi = self.mwi.clone();
                    tokio::spawn(async move {
                        let _ = mwi.subscribe().await;
                    });
                }
            }
            PhoneEvent::VoicemailChanged { waiting, new_messages, .. } => {
                let mut voicemail = self.voicemail.lock().unwrap();
                voicemail.waiting = *waiting;
                voicemail.new_messages = *new_messages;
            }
            PhoneEvent::SessionCreated { session } => {
                self.maybe_auto_answer(session);
            }
            _ => {}
        }

        if matters_to_indicator(&event) {
            self.refresh_indicator().await;
        }
    }

    fn maybe_auto_answer(self: &Arc<Self>, session: &SessionSnapshot) {
        if !self.config.auto_answer
            || session.direction != crate::session::Direction::Incoming
        {
            return;
        }
        if self.store.non_terminal_count() > 1 {
            // never auto-answer on top of an existing call
            return;
        }
        let phone = self.clone();
        let id = session.id;
        tokio::spawn(async move {
            tokio::time::sleep(AUTO_ANSWER_DELAY).await;
            if phone.store.snapshot_of(&id).is_some() {
                tracing::info!(session = %id, "auto-answering");
                if let Err(e) = phone.answer(&id).await {
                    tracing::warn!(session = %id, error = %e, "auto-answer failed");
                }
            }
        });
    }

    async fn refresh_indicator(self: &Arc<Self>) {
        let Some(indicator) = &self.indicator else {
            return;
        };
        let (any_ringing_incoming, any_established_on_hold, any_established_active) =
            self.store.indicator_flags();
        let agent = *self.agent.lock().unwrap();
        let voicemail = *self.voicemail.lock().unwrap();
        indicator
            .set_inputs(IndicatorInputs {
                registered: self.registrar.is_registered(),
                agent_logged_in: agent.logged_in,
                voicemail_new: if voicemail.waiting { voicemail.new_messages.max(1) } else { 0 },
                any_ringing_incoming,
                any_established_on_hold,
                any_established_active,
            })
            .await;
    }

    // ---- host-facing surface ---------------------------------------------

    /// Report agent login/pause state (fed by the back-office layer)
    pub fn set_agent_state(self: &Arc<Self>, logged_in: bool, paused: bool) {
        {
            let mut agent = self.agent.lock().unwrap();
            agent.logged_in = logged_in;
            agent.paused = paused;
        }
        self.storage.set(
            keys::AGENT_STATE,
            &serde_json::json!({ "loggedIn": logged_in, "paused": paused }).to_string(),
        );
        self.bus
            .publish(PhoneEvent::AgentStateChanged { logged_in, paused });
    }

    /// Attach an application event handler
    pub fn attach_handler(&self, handler: Arc<dyn PhoneEventHandler>) {
        self.bus.attach_handler(handler);
    }

    /// Raw event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PhoneEvent> {
        self.bus.subscribe()
    }

    /// Current registration state
    pub fn registration_state(&self) -> RegistrationState {
        self.registrar.state()
    }

    /// Current transport state
    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Line table snapshot
    pub fn line_snapshot(&self) -> Vec<LineSlot> {
        self.lines.snapshot()
    }

    /// The selected line, if any
    pub fn selected_line(&self) -> Option<LineNumber> {
        self.lines.selected_line()
    }

    /// Live session snapshots
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.store.snapshots()
    }

    /// One session snapshot
    pub fn session(&self, id: &crate::session::SessionId) -> Option<SessionSnapshot> {
        self.store.snapshot_of(id)
    }

    /// Aggregate call statistics
    pub fn call_stats(&self) -> CallStats {
        self.store.stats()
    }

    /// BLF entries in button order
    pub fn blf_snapshot(&self) -> Vec<BlfEntrySnapshot> {
        self.blf.snapshot()
    }

    /// The BLF engine, for hosts that reconfigure buttons at runtime or
    /// drive the maintenance pass themselves
    pub fn blf_engine(&self) -> Arc<BlfEngine> {
        self.blf.clone()
    }

    /// Current indicator state, when the busy-light is enabled
    pub fn indicator_state(&self) -> Option<IndicatorState> {
        self.indicator.as_ref().map(|i| i.current_state())
    }

    /// The active configuration
    pub fn config(&self) -> &PhoneConfig {
        &self.config
    }
}

fn matters_to_indicator(event: &PhoneEvent) -> bool {
    matches!(
        event,
        PhoneEvent::Registered { .. }
            | PhoneEvent::Unregistered
            | PhoneEvent::RegistrationFailed { .. }
            | PhoneEvent::TransportDisconnected { .. }
            | PhoneEvent::SessionCreated { .. }
            | PhoneEvent::SessionStateChanged { .. }
            | PhoneEvent::SessionAnswered { .. }
            | PhoneEvent::SessionTerminated { .. }
            | PhoneEvent::SessionHeld { .. }
            | PhoneEvent::AgentStateChanged { .. }
            | PhoneEvent::VoicemailChanged { .. }
    )
}
