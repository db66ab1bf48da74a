//! Busy-lamp-field subscription engine
//!
//! Maintains one long-lived RFC 6665 `dialog` subscription per monitored
//! extension and translates NOTIFY bodies into [`BlfState`] transitions
//! published as `blfStateChanged`. Acceptance, rejection and termination
//! are handled uniformly:
//!
//! - SUBSCRIBEs are dispatched with a 100 ms stagger so a phone with a
//!   wall of buttons does not stampede the server at registration time;
//! - any 4xx/5xx/6xx answer, a timeout, or a termination before the
//!   first acceptance produces the synthetic `Offline` state and parks
//!   the extension in the failed set;
//! - a single periodic job (default 180 s, running only while
//!   registered) re-issues SUBSCRIBE for the failed set - staggered the
//!   same way - and refreshes subscriptions nearing expiry;
//! - teardown sends a zero-expiry SUBSCRIBE and forgets the entry
//!   whatever the server says; a transport drop just clears every
//!   in-memory handle and lets the retry path rebuild after the next
//!   registration.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use triline_sip::dialog_info::{DialogInfo, DialogState};
use triline_sip::{HeaderName, Method, Request, Response, StatusCode, SubState};

use crate::config::PhoneConfig;
use crate::error::PhoneResult;
use crate::events::{EventBus, PhoneEvent};
use crate::link::{Dialog, SipLink, TRANSACTION_TIMEOUT};
use crate::storage::BlfButton;

/// Gap between staggered SUBSCRIBE dispatches
pub const SUBSCRIBE_STAGGER: Duration = Duration::from_millis(100);
/// Default retry / maintenance tick
pub const RETRY_INTERVAL: Duration = Duration::from_secs(180);
/// Requested subscription lifetime in seconds
pub const SUBSCRIPTION_EXPIRES: u32 = 3600;

/// Observable state of a monitored extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlfState {
    /// Nothing heard yet
    Unknown,
    /// Extension is setting up a call
    Trying,
    /// Proceeding without a confirmed dialog
    Proceeding,
    /// Ringing
    Early,
    /// On a call
    Confirmed,
    /// On a call, held
    Hold,
    /// Idle (no dialog)
    Terminated,
    /// Synthetic: subscription rejected or dead
    Offline,
}

impl From<DialogState> for BlfState {
    fn from(state: DialogState) -> Self {
        match state {
            DialogState::Trying => BlfState::Trying,
            DialogState::Proceeding => BlfState::Proceeding,
            DialogState::Early => BlfState::Early,
            DialogState::Confirmed => BlfState::Confirmed,
            DialogState::Hold => BlfState::Hold,
            DialogState::Terminated => BlfState::Terminated,
        }
    }
}

/// Serializable view of one BLF entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlfEntrySnapshot {
    /// Monitored extension
    pub extension: String,
    /// Button label
    pub display_name: String,
    /// Last observed state
    pub state: BlfState,
    /// Remote target URI from the last NOTIFY, if any
    pub remote_target: Option<String>,
    /// Whether the current subscription lifecycle ever got a 2xx
    pub accepted_at_least_once: bool,
    /// Whether a SUBSCRIBE was ever rejected
    pub rejected_once: bool,
    /// Status code of the last rejection
    pub rejection_status: Option<u16>,
}

struct Subscription {
    dialog: Dialog,
    expires_at: Instant,
}

struct BlfEntry {
    display_name: String,
    state: BlfState,
    remote_target: Option<String>,
    accepted_at_least_once: bool,
    rejected_once: bool,
    rejection_status: Option<u16>,
    sub: Option<Subscription>,
}

impl BlfEntry {
    fn new(display_name: String) -> Self {
        BlfEntry {
            display_name,
            state: BlfState::Unknown,
            remote_target: None,
            accepted_at_least_once: false,
            rejected_once: false,
            rejection_status: None,
            sub: None,
        }
    }
}

/// The subscription engine
pub struct BlfEngine {
    link: Arc<SipLink>,
    bus: Arc<EventBus>,
    config: Arc<PhoneConfig>,
    entries: DashMap<String, BlfEntry>,
    order: Mutex<Vec<String>>,
    call_map: DashMap<String, String>,
    failed: Mutex<BTreeSet<String>>,
    retry_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    retry_interval: Duration,
}

impl BlfEngine {
    /// An engine with no buttons configured
    pub fn new(link: Arc<SipLink>, bus: Arc<EventBus>, config: Arc<PhoneConfig>) -> Self {
        BlfEngine {
            link,
            bus,
            config,
            entries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            call_map: DashMap::new(),
            failed: Mutex::new(BTreeSet::new()),
            retry_task: tokio::sync::Mutex::new(None),
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Install the ordered button list (before registration)
    pub fn configure(&self, buttons: &[BlfButton]) {
        let mut order = self.order.lock().unwrap();
        order.clear();
        for button in buttons {
            order.push(button.extension.clone());
            self.entries
                .entry(button.extension.clone())
                .or_insert_with(|| BlfEntry::new(button.display_name.clone()));
        }
    }

    /// Extensions in button order
    pub fn extensions(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    /// Snapshot of one entry
    pub fn entry(&self, extension: &str) -> Option<BlfEntrySnapshot> {
        self.entries.get(extension).map(|e| BlfEntrySnapshot {
            extension: extension.to_string(),
            display_name: e.display_name.clone(),
            state: e.state,
            remote_target: e.remote_target.clone(),
            accepted_at_least_once: e.accepted_at_least_once,
            rejected_once: e.rejected_once,
            rejection_status: e.rejection_status,
        })
    }

    /// Snapshot of every entry in button order
    pub fn snapshot(&self) -> Vec<BlfEntrySnapshot> {
        self.extensions()
            .iter()
            .filter_map(|ext| self.entry(ext))
            .collect()
    }

    /// Whether an extension currently sits in the retry set
    pub fn is_in_retry_set(&self, extension: &str) -> bool {
        self.failed.lock().unwrap().contains(extension)
    }

    /// Subscribe every configured button, one dispatch per stagger gap
    pub async fn subscribe_all(self: &Arc<Self>) {
        for extension in self.extensions() {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.subscribe_extension(extension).await;
            });
            tokio::time::sleep(SUBSCRIBE_STAGGER).await;
        }
    }

    /// Establish (or re-establish) the subscription for one extension
    pub async fn subscribe_extension(self: &Arc<Self>, extension: String) {
        if !self.entries.contains_key(&extension) {
            return;
        }

        let call_id = self.link.new_call_id();
        let mut dialog = Dialog::uac(
            call_id.clone(),
            self.link.local_addr().with_tag(self.link.new_tag()),
            triline_sip::NameAddr::new(triline_sip::SipUri::new(
                extension.clone(),
                self.config.domain.clone(),
            )),
        );
        // NOTIFY may beat our 2xx; route by Call-ID from the moment we send
        self.replace_call_mapping(&extension, call_id.clone());

        let request = self.build_subscribe(&mut dialog, SUBSCRIPTION_EXPIRES);
        let outcome = self.exchange_subscribe(request, &mut dialog).await;

        match outcome {
            Ok(response) if response.status.is_success() => {
                dialog.absorb_response(&response);
                let granted = response.headers.expires().unwrap_or(SUBSCRIPTION_EXPIRES);
                let expires_at = Instant::now() + Duration::from_secs(u64::from(granted));
                if let Some(mut entry) = self.entries.get_mut(&extension) {
                    entry.accepted_at_least_once = true;
                    entry.sub = Some(Subscription { dialog, expires_at });
                }
                self.failed.lock().unwrap().remove(&extension);
                tracing::debug!(%extension, granted, "blf subscription accepted");
                self.bus.publish(PhoneEvent::BlfSubscribed { extension });
            }
            Ok(response) => {
                let code = response.status.as_u16();
                tracing::info!(%extension, code, "blf subscription rejected");
                self.mark_offline(&extension, Some(code));
            }
            Err(error) => {
                tracing::info!(%extension, error = %error, "blf subscription failed");
                self.mark_offline(&extension, None);
            }
        }
    }

    async fn exchange_subscribe(
        &self,
        request: Request,
        dialog: &mut Dialog,
    ) -> PhoneResult<Response> {
        let mut handle = self.link.send_request(request.clone())?;
        let response = handle.final_response(TRANSACTION_TIMEOUT).await?;
        if !matches!(response.status.as_u16(), 401 | 407) {
            return Ok(response);
        }
        dialog.cseq += 1;
        let retry =
            self.link
                .authorize_retry(&request, &response, &self.config.password, dialog.cseq)?;
        let mut handle = self.link.send_request(retry)?;
        handle.final_response(TRANSACTION_TIMEOUT).await
    }

    fn build_subscribe(&self, dialog: &mut Dialog, expires: u32) -> Request {
        dialog.cseq += 1;
        let mut request = Request::new(Method::Subscribe, dialog.remote.uri.clone());
        request.headers.push(HeaderName::From, dialog.local.to_string());
        request.headers.push(HeaderName::To, dialog.remote.to_string());
        request.headers.push(HeaderName::CallId, dialog.call_id.clone());
        request
            .headers
            .push(HeaderName::CSeq, format!("{} SUBSCRIBE", dialog.cseq));
        request
            .headers
            .push(HeaderName::Contact, self.link.contact_addr().to_string());
        request.headers.push(HeaderName::Event, "dialog");
        request
            .headers
            .push(HeaderName::Accept, "application/dialog-info+xml");
        request.headers.push(HeaderName::Expires, expires.to_string());
        request
    }

    fn replace_call_mapping(&self, extension: &str, call_id: String) {
        if let Some(entry) = self.entries.get(extension) {
            if let Some(sub) = &entry.sub {
                self.call_map.remove(&sub.dialog.call_id);
            }
        }
        self.call_map.retain(|_, ext| ext != extension);
        self.call_map.insert(call_id, extension.to_string());
    }

    fn mark_offline(&self, extension: &str, status_code: Option<u16>) {
        let known = {
            match self.entries.get_mut(extension) {
                Some(mut entry) => {
                    entry.state = BlfState::Offline;
                    entry.remote_target = None;
                    entry.rejected_once = true;
                    entry.rejection_status = status_code;
                    entry.sub = None;
                    true
                }
                None => false,
            }
        };
        if !known {
            return;
        }
        self.failed.lock().unwrap().insert(extension.to_string());
        self.bus.publish(PhoneEvent::BlfStateChanged {
            extension: extension.to_string(),
            state: BlfState::Offline,
            remote_target: None,
        });
    }

    /// Handle a `dialog`-package NOTIFY routed here by Call-ID.
    ///
    /// Returns the response to send, or `None` when the Call-ID belongs
    /// to no subscription.
    pub fn handle_notify(&self, request: &Request) -> Option<Response> {
        let call_id = request.headers.call_id().ok()?;
        let extension = self.call_map.get(call_id).map(|e| e.clone())?;
        let response = Response::for_request(StatusCode::OK, request);

        if let Ok(sub_state) = request.headers.subscription_state() {
            if sub_state.state == SubState::Terminated {
                let accepted = self
                    .entries
                    .get(&extension)
                    .map(|e| e.accepted_at_least_once)
                    .unwrap_or(false);
                if !accepted {
                    // died before the first acceptance: the button is dark
                    self.mark_offline(&extension, None);
                    return Some(response);
                }
                // the server ended an accepted subscription; remember the
                // last state and let the maintenance tick rebuild it
                if let Some(mut entry) = self.entries.get_mut(&extension) {
                    entry.sub = None;
                    entry.accepted_at_least_once = false;
                }
                self.failed.lock().unwrap().insert(extension.clone());
            }
        }

        let is_dialog_info = request
            .headers
            .content_type()
            .map(|ct| ct.starts_with("application/dialog-info+xml"))
            .unwrap_or(false);
        if is_dialog_info && !request.body.is_empty() {
            match DialogInfo::from_xml(&request.body) {
                Ok(doc) => {
                    let state = BlfState::from(doc.first_dialog_state());
                    let remote_target = doc.first_remote_target().map(str::to_string);
                    if let Some(mut entry) = self.entries.get_mut(&extension) {
                        entry.state = state;
                        entry.remote_target = remote_target.clone();
                    }
                    self.bus.publish(PhoneEvent::BlfStateChanged {
                        extension,
                        state,
                        remote_target,
                    });
                }
                Err(e) => {
                    tracing::warn!(%extension, error = %e, "unparseable dialog-info body");
                }
            }
        }
        Some(response)
    }

    /// Tear down one subscription and forget it locally regardless of
    /// what the server answers
    pub async fn unsubscribe(&self, extension: &str) {
        let removed = self.entries.remove(extension);
        self.order.lock().unwrap().retain(|e| e != extension);
        self.failed.lock().unwrap().remove(extension);
        self.call_map.retain(|_, ext| ext != extension);

        if let Some((_, entry)) = removed {
            if let Some(sub) = entry.sub {
                let mut dialog = sub.dialog;
                let mut request = self.build_subscribe(&mut dialog, 0);
                request.headers.set(HeaderName::Expires, "0");
                match self.link.send_request(request) {
                    Ok(mut handle) => {
                        // let the server answer but ignore whatever it says
                        let _ = handle.final_response(Duration::from_secs(5)).await;
                    }
                    Err(e) => tracing::debug!(%extension, error = %e, "unsubscribe not sent"),
                }
            }
            self.bus.publish(PhoneEvent::BlfUnsubscribed {
                extension: extension.to_string(),
            });
        }
    }

    /// Tear down everything (unregister path)
    pub async fn unsubscribe_all(&self) {
        for extension in self.extensions() {
            self.unsubscribe(&extension).await;
        }
    }

    /// Transport dropped: every handle is void. States are kept for the
    /// UI; the whole set is parked for rebuild after re-registration.
    pub fn clear_handles(&self) {
        self.call_map.clear();
        let mut failed = self.failed.lock().unwrap();
        for mut entry in self.entries.iter_mut() {
            entry.sub = None;
            entry.accepted_at_least_once = false;
        }
        for extension in self.extensions() {
            failed.insert(extension);
        }
    }

    /// Start the periodic retry/refresh job (runs only while registered)
    pub async fn start_retry_job(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.retry_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first interval tick fires immediately; skip it
            tick.tick().await;
            loop {
                tick.tick().await;
                engine.run_maintenance().await;
            }
        });
        if let Some(previous) = self.retry_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the periodic job (unregister / transport loss)
    pub async fn stop_retry_job(&self) {
        if let Some(handle) = self.retry_task.lock().await.take() {
            handle.abort();
        }
    }

    /// One maintenance pass: retry the failed set, refresh near-expiry
    pub async fn run_maintenance(self: &Arc<Self>) {
        let failed: Vec<String> = self.failed.lock().unwrap().iter().cloned().collect();
        let near_expiry: Vec<String> = {
            let threshold = Instant::now() + self.retry_interval;
            self.entries
                .iter()
                .filter(|e| {
                    e.value()
                        .sub
                        .as_ref()
                        .map(|s| s.expires_at <= threshold)
                        .unwrap_or(false)
                })
                .map(|e| e.key().clone())
                .collect()
        };

        let mut targets: Vec<String> = Vec::new();
        for extension in failed.into_iter().chain(near_expiry) {
            if !targets.contains(&extension) && self.entries.contains_key(&extension) {
                targets.push(extension);
            }
        }
        if targets.is_empty() {
            return;
        }
        tracing::debug!(count = targets.len(), "blf maintenance pass");
        for extension in targets {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.subscribe_extension(extension).await;
            });
            tokio::time::sleep(SUBSCRIBE_STAGGER).await;
        }
    }
}
