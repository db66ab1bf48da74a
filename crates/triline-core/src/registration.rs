//! Registration lifecycle
//!
//! Drives the four-state machine `Unregistered → Registering →
//! {Registered | Failed} → Unregistered` and owns nothing else: session
//! and subscription teardown on unregister is orchestrated by the phone
//! manager so this module never reaches into sibling stores.
//!
//! # Discipline
//!
//! - Auto-registration after `transportConnected` waits a 500 ms settle
//!   and is gated on `!registering && !attempting_reconnection`, so a
//!   connect that races an in-flight REGISTER never duplicates it.
//! - Refresh re-registers at 75% of the *negotiated* expiry.
//! - One 401/407 challenge is answered with the configured credentials;
//!   a second consecutive challenge is surfaced as an auth failure and
//!   is not retried automatically.
//! - Failures return the machine to `Unregistered`; retry happens on the
//!   next transport connect or explicit request, never from here.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use triline_sip::{HeaderName, Method, Request};

use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};
use crate::link::{SipLink, TRANSACTION_TIMEOUT};
use crate::transport::WsTransport;

/// Delay between `transportConnected` and the automatic REGISTER
pub const REGISTER_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Registration machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// No binding at the registrar
    Unregistered,
    /// REGISTER in flight
    Registering,
    /// Binding active
    Registered,
    /// Last attempt failed (transient; settles back to Unregistered)
    Failed,
}

const REG_UNREGISTERED: u8 = 0;
const REG_REGISTERING: u8 = 1;
const REG_REGISTERED: u8 = 2;
const REG_FAILED: u8 = 3;

/// The registrar client
pub struct Registrar {
    link: Arc<SipLink>,
    transport: Arc<WsTransport>,
    bus: Arc<EventBus>,
    config: Arc<PhoneConfig>,
    state: AtomicU8,
    registering: AtomicBool,
    had_first_success: AtomicBool,
    call_id: String,
    from_tag: String,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl Registrar {
    /// Build the registrar for one configured identity
    pub fn new(
        link: Arc<SipLink>,
        transport: Arc<WsTransport>,
        bus: Arc<EventBus>,
        config: Arc<PhoneConfig>,
    ) -> Self {
        let call_id = link.new_call_id();
        let from_tag = link.new_tag();
        Registrar {
            link,
            transport,
            bus,
            config,
            state: AtomicU8::new(REG_UNREGISTERED),
            registering: AtomicBool::new(false),
            had_first_success: AtomicBool::new(false),
            call_id,
            from_tag,
            refresh: Mutex::new(None),
        }
    }

    /// Current machine state
    pub fn state(&self) -> RegistrationState {
        match self.state.load(Ordering::SeqCst) {
            REG_REGISTERING => RegistrationState::Registering,
            REG_REGISTERED => RegistrationState::Registered,
            REG_FAILED => RegistrationState::Failed,
            _ => RegistrationState::Unregistered,
        }
    }

    /// Whether the binding is currently active
    pub fn is_registered(&self) -> bool {
        self.state.load(Ordering::SeqCst) == REG_REGISTERED
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    /// React to `transportConnected`: settle, check the gates, register
    pub async fn on_transport_connected(self: &Arc<Self>) {
        tokio::time::sleep(REGISTER_SETTLE_DELAY).await;
        if self.registering.load(Ordering::SeqCst) {
            tracing::debug!("transport connected while registering, skipping auto-register");
            return;
        }
        if self.transport.attempting_reconnection() {
            tracing::debug!("transport mid-reconnect, skipping auto-register");
            return;
        }
        if let Err(e) = self.register().await {
            tracing::warn!(error = %e, "auto-register failed");
        }
    }

    /// React to a transport drop: the binding is void
    pub async fn on_transport_lost(&self) {
        self.cancel_refresh().await;
        self.had_first_success.store(false, Ordering::SeqCst);
        if self.state.swap(REG_UNREGISTERED, Ordering::SeqCst) == REG_REGISTERED {
            self.bus.publish(PhoneEvent::Unregistered);
        }
    }

    /// Run one registration attempt.
    ///
    /// A call while another attempt is in flight is a no-op, which is
    /// what makes a transport connect during `Registering` harmless.
    pub fn register(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PhoneResult<()>> + Send + '_>> {
        Box::pin(async move {
            if self.registering.swap(true, Ordering::SeqCst) {
                tracing::debug!("register already in progress");
                return Ok(());
            }
            let result = self.attempt().await;
            self.registering.store(false, Ordering::SeqCst);

            match result {
                Ok(negotiated) => {
                    self.set_state(REG_REGISTERED);
                    let re_register = self.had_first_success.swap(true, Ordering::SeqCst);
                    tracing::info!(expires = negotiated, re_register, "registered");
                    self.bus.publish(PhoneEvent::Registered { re_register });
                    self.schedule_refresh(negotiated).await;
                    Ok(())
                }
                Err(error) => {
                    self.set_state(REG_FAILED);
                    let status_code = match &error {
                        PhoneError::RegistrationFailed { status_code, .. } => *status_code,
                        PhoneError::AuthenticationFailed { .. } => Some(401),
                        _ => None,
                    };
                    tracing::warn!(error = %error, "registration failed");
                    self.bus.publish(PhoneEvent::RegistrationFailed {
                        status_code,
                        reason: error.to_string(),
                    });
                    // failures settle back to Unregistered so a later connect
                    // or explicit request can try again
                    self.set_state(REG_UNREGISTERED);
                    Err(error)
                }
            }
        })
    }

    async fn attempt(&self) -> PhoneResult<u32> {
        self.set_state(REG_REGISTERING);

        let request = self.build_register(self.config.register_expires);
        let mut handle = self.link.send_request(request.clone())?;
        let mut response = handle.final_response(TRANSACTION_TIMEOUT).await?;

        if matches!(response.status.as_u16(), 401 | 407) {
            let retry = self.link.authorize_retry(
                &request,
                &response,
                &self.config.password,
                self.link.next_cseq(),
            )?;
            handle = self.link.send_request(retry)?;
            response = handle.final_response(TRANSACTION_TIMEOUT).await?;
        }

        let code = response.status.as_u16();
        if response.status.is_success() {
            return Ok(response
                .headers
                .expires()
                .unwrap_or(self.config.register_expires));
        }
        Err(match code {
            401 | 403 => PhoneError::AuthenticationFailed {
                reason: format!("{} {}", code, response.reason),
            },
            404 => PhoneError::registration_failed(Some(404), "address-of-record not found"),
            503 => PhoneError::registration_failed(Some(503), "registrar unavailable"),
            other => PhoneError::registration_failed(Some(other), response.reason),
        })
    }

    fn build_register(&self, expires: u32) -> Request {
        let mut request = Request::new(Method::Register, triline_sip::SipUri::domain(self.config.domain.clone()));
        request.headers.push(
            HeaderName::From,
            self.link.local_addr().with_tag(self.from_tag.clone()).to_string(),
        );
        request
            .headers
            .push(HeaderName::To, self.link.local_addr().to_string());
        request.headers.push(HeaderName::CallId, self.call_id.clone());
        request.headers.push(
            HeaderName::CSeq,
            format!("{} REGISTER", self.link.next_cseq()),
        );
        request
            .headers
            .push(HeaderName::Contact, self.link.contact_addr().to_string());
        request.headers.push(HeaderName::Expires, expires.to_string());
        request.headers.push(
            HeaderName::Allow,
            "INVITE, ACK, CANCEL, BYE, REFER, SUBSCRIBE, NOTIFY, INFO, MESSAGE, OPTIONS",
        );
        request
    }

    async fn schedule_refresh(self: &Arc<Self>, negotiated: u32) {
        let delay = Duration::from_secs((u64::from(negotiated) * 3) / 4);
        let registrar = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if registrar.is_registered() {
                tracing::debug!("refreshing registration");
                let _ = registrar.register().await;
            }
        });
        if let Some(previous) = self.refresh.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn cancel_refresh(&self) {
        if let Some(handle) = self.refresh.lock().await.take() {
            handle.abort();
        }
    }

    /// Drop the binding with a zero-expiry REGISTER.
    ///
    /// Best-effort on the wire: local state goes to `Unregistered` and
    /// `unregistered` is published regardless of the server's answer.
    /// Callers wanting session/subscription teardown first go through
    /// the phone manager, which sequences those before calling this.
    pub async fn unregister(&self) -> PhoneResult<()> {
        self.cancel_refresh().await;
        self.had_first_success.store(false, Ordering::SeqCst);

        if self.state.swap(REG_UNREGISTERED, Ordering::SeqCst) == REG_REGISTERED {
            let request = self.build_register(0);
            match self.link.send_request(request) {
                Ok(mut handle) => {
                    if let Err(e) = handle.final_response(Duration::from_secs(5)).await {
                        tracing::debug!(error = %e, "unregister response not received");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "unregister could not be sent"),
            }
            self.bus.publish(PhoneEvent::Unregistered);
        }
        Ok(())
    }
}
