//! Voicemail message-waiting subscription
//!
//! One `message-summary` subscription (RFC 3842) against our own
//! address-of-record. NOTIFY bodies become `voicemailChanged` events;
//! the indicator machine folds the counters into its priority table.
//! Voicemail is best-effort: a registrar without the package just
//! rejects the SUBSCRIBE and the phone carries on without counters.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use triline_sip::message_summary::MessageSummary;
use triline_sip::{HeaderName, Method, NameAddr, Request, Response, StatusCode};

use crate::config::PhoneConfig;
use crate::error::PhoneResult;
use crate::events::{EventBus, PhoneEvent};
use crate::link::{Dialog, SipLink, TRANSACTION_TIMEOUT};

const MWI_EXPIRES: u32 = 3600;

/// The message-summary subscriber
pub struct MwiSubscriber {
    link: Arc<SipLink>,
    bus: Arc<EventBus>,
    config: Arc<PhoneConfig>,
    dialog: Mutex<Option<Dialog>>,
}

impl MwiSubscriber {
    /// An unsubscribed instance
    pub fn new(link: Arc<SipLink>, bus: Arc<EventBus>, config: Arc<PhoneConfig>) -> Self {
        MwiSubscriber { link, bus, config, dialog: Mutex::new(None) }
    }

    /// Whether a NOTIFY belongs to this subscription
    fn owns_call_id(&self, call_id: &str) -> bool {
        self.dialog
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.call_id == call_id)
            .unwrap_or(false)
    }

    /// Subscribe to our own mailbox summary
    pub async fn subscribe(self: &Arc<Self>) -> PhoneResult<()> {
        let mut dialog = Dialog::uac(
            self.link.new_call_id(),
            self.link.local_addr().with_tag(self.link.new_tag()),
            NameAddr::new(self.link.aor()),
        );
        *self.dialog.lock().unwrap() = Some(dialog.clone());

        dialog.cseq += 1;
        let mut request = Request::new(Method::Subscribe, self.link.aor());
        request.headers.push(HeaderName::From, dialog.local.to_string());
        request.headers.push(HeaderName::To, dialog.remote.to_string());
        request.headers.push(HeaderName::CallId, dialog.call_id.clone());
        request
            .headers
            .push(HeaderName::CSeq, format!("{} SUBSCRIBE", dialog.cseq));
        request
            .headers
            .push(HeaderName::Contact, self.link.contact_addr().to_string());
        request.headers.push(HeaderName::Event, "message-summary");
        request
            .headers
            .push(HeaderName::Accept, "application/simple-message-summary");
        request
            .headers
            .push(HeaderName::Expires, MWI_EXPIRES.to_string());

        let mut handle = self.link.send_request(request.clone())?;
        let mut response = handle.final_response(TRANSACTION_TIMEOUT).await?;
        if matches!(response.status.as_u16(), 401 | 407) {
            dialog.cseq += 1;
            let retry = self.link.authorize_retry(
                &request,
                &response,
                &self.config.password,
                dialog.cseq,
            )?;
            handle = self.link.send_request(retry)?;
            response = handle.final_response(TRANSACTION_TIMEOUT).await?;
        }

        if response.status.is_success() {
            dialog.absorb_response(&response);
            *self.dialog.lock().unwrap() = Some(dialog);
            tracing::debug!("message-summary subscription accepted");
        } else {
            *self.dialog.lock().unwrap() = None;
            tracing::info!(status = %response.status, "voicemail subscription rejected");
        }
        Ok(())
    }

    /// Handle a message-summary NOTIFY. Returns the response to send, or
    /// `None` when the Call-ID is not ours.
    pub fn handle_notify(&self, request: &Request) -> Option<Response> {
        let call_id = request.headers.call_id().ok()?;
        if !self.owns_call_id(call_id) {
            return None;
        }
        if let Ok(summary) = request.body.parse::<MessageSummary>() {
            self.bus.publish(PhoneEvent::VoicemailChanged {
                waiting: summary.messages_waiting,
                new_messages: summary.voice_new,
                old_messages: summary.voice_old,
            });
        }
        Some(Response::for_request(StatusCode::OK, request))
    }

    /// Drop the subscription, best-effort on the wire
    pub async fn unsubscribe(&self) {
        let dialog = self.dialog.lock().unwrap().take();
        if let Some(mut dialog) = dialog {
            let mut request = self.link.in_dialog_request(&mut dialog, Method::Subscribe);
            request.headers.push(HeaderName::Event, "message-summary");
            request.headers.push(HeaderName::Expires, "0");
            if let Ok(mut handle) = self.link.send_request(request) {
                let _ = handle.final_response(Duration::from_secs(5)).await;
            }
        }
    }

    /// Forget the handle (transport drop)
    pub fn clear(&self) {
        *self.dialog.lock().unwrap() = None;
    }
}
