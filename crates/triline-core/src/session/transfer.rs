//! Blind and attended transfer flows
//!
//! Both flows ride REFER (RFC 3515). Progress comes back as NOTIFY
//! requests carrying `message/sipfrag` status lines, handled here with
//! one uniform rule: a 2xx fragment completes the transfer and BYEs the
//! transferred leg exactly once, a 4xx–6xx fragment fails it and leaves
//! the session up, and provisionals only update the disposition record.
//!
//! The attended flow is a small choreography on top:
//!
//! 1. hold the original session;
//! 2. place a consultation call to the target;
//! 3. when the consultation reaches Established, REFER the original
//!    with a `Replaces` reference to the consultation dialog;
//! 4. on acceptance the original is taken down by the sipfrag path and
//!    the consultation continues between the transferee and the target.
//!
//! Cancellation or consultation failure at any point before completion
//! restores the original to Established (hold removed) and terminates
//! the consultation leg.

use std::sync::Arc;

use chrono::Utc;

use triline_sip::sipfrag::SipFrag;
use triline_sip::{HeaderName, Method, Request, Response, SipUri, StatusCode};

use crate::error::{PhoneError, PhoneResult};
use crate::events::PhoneEvent;
use crate::link::TRANSACTION_TIMEOUT;
use crate::media::MediaConstraints;

use super::store::SessionStore;
use super::types::{SessionId, SessionState, TransferCompletion, TransferMode, TransferRecord};

impl SessionStore {
    /// Blind-transfer an established session to `target`
    pub async fn blind_transfer(self: &Arc<Self>, id: &SessionId, target: &str) -> PhoneResult<()> {
        let uri = SipUri::from_dial_target(target, &self.config.domain)?;

        let refer = self.with_session(id, |session| {
            if session.state != SessionState::Established {
                return Err(PhoneError::InvalidSessionState {
                    session_id: *id,
                    current_state: session.state.to_string(),
                });
            }
            if session.sip_in_flight {
                return Err(PhoneError::OperationInProgress {
                    session_id: *id,
                    operation: "transfer",
                });
            }
            session.sip_in_flight = true;
            session.transfers.push(TransferRecord::new(TransferMode::Blind, target));
            session.active_transfer = Some(TransferMode::Blind);
            let mut request = self.link.in_dialog_request(&mut session.dialog, Method::Refer);
            request
                .headers
                .push(HeaderName::ReferTo, format!("<{}>", uri));
            request
                .headers
                .push(HeaderName::ReferredBy, session.dialog.local.to_string());
            Ok(request)
        })??;

        self.bus.publish(PhoneEvent::TransferInitiated {
            id: *id,
            target: target.to_string(),
            mode: TransferMode::Blind,
        });

        let outcome = async {
            let mut handle = self.link.send_request(refer)?;
            handle.final_response(TRANSACTION_TIMEOUT).await
        }
        .await;

        let _ = self.with_session(id, |session| session.sip_in_flight = false);

        match outcome {
            Ok(response) if response.status.is_success() => Ok(()),
            Ok(response) => {
                let reason = format!("{} {}", response.status, response.reason);
                self.fail_transfer(id, target, TransferMode::Blind, &reason);
                Err(PhoneError::TransferFailed { reason })
            }
            Err(error) => {
                self.fail_transfer(id, target, TransferMode::Blind, &error.to_string());
                Err(error)
            }
        }
    }

    /// Start an attended transfer: hold the original, dial the target.
    /// Returns the consultation session id.
    pub async fn attended_transfer(
        self: &Arc<Self>,
        id: &SessionId,
        target: &str,
        constraints: MediaConstraints,
    ) -> PhoneResult<SessionId> {
        self.with_session(id, |session| {
            if session.state != SessionState::Established {
                return Err(PhoneError::InvalidSessionState {
                    session_id: *id,
                    current_state: session.state.to_string(),
                });
            }
            Ok(())
        })??;

        self.hold(id, true).await?;

        let consultation = match self.create_outgoing(target, constraints) {
            Ok(consultation) => consultation,
            Err(error) => {
                // the transfer never started; give the user their call back
                let _ = self.hold(id, false).await;
                return Err(error);
            }
        };

        self.intents.insert(*id, consultation);
        self.consultation_of.insert(consultation, *id);
        let _ = self.with_session(id, |session| {
            session
                .transfers
                .push(TransferRecord::new(TransferMode::Attended, target));
        });
        self.bus.publish(PhoneEvent::TransferInitiated {
            id: *id,
            target: target.to_string(),
            mode: TransferMode::Attended,
        });
        Ok(consultation)
    }

    /// Abandon a pending attended transfer: kill the consultation leg
    /// and return the original to Established, unheld.
    pub async fn cancel_attended(self: &Arc<Self>, id: &SessionId) -> PhoneResult<()> {
        if !self.intents.contains_key(id) {
            return Err(PhoneError::TransferFailed {
                reason: "no attended transfer in progress".into(),
            });
        }
        self.abort_attended(*id, "cancelled").await;
        Ok(())
    }

    /// Step (3): the consultation leg reached Established, so REFER the
    /// original with a Replaces reference to the consultation dialog.
    pub(crate) async fn complete_attended(
        self: &Arc<Self>,
        original: SessionId,
        consultation: SessionId,
    ) {
        let Ok(refer_to) = self.with_session(&consultation, |session| {
            let dialog = &session.dialog;
            let mut reference = format!("{}", dialog.request_uri());
            let replaces = format!(
                "{}%3Bto-tag%3D{}%3Bfrom-tag%3D{}",
                dialog.call_id,
                dialog.remote.tag().unwrap_or_default(),
                dialog.local.tag().unwrap_or_default(),
            );
            reference.push_str("?Replaces=");
            reference.push_str(&replaces);
            format!("<{}>", reference)
        }) else {
            return;
        };

        let refer = self.with_session(&original, |session| {
            session.active_transfer = Some(TransferMode::Attended);
            let mut request = self.link.in_dialog_request(&mut session.dialog, Method::Refer);
            request.headers.push(HeaderName::ReferTo, refer_to);
            request
                .headers
                .push(HeaderName::ReferredBy, session.dialog.local.to_string());
            request
        });
        let Ok(refer) = refer else {
            // the original vanished while we consulted
            self.abort_attended(original, "original session gone").await;
            return;
        };

        let outcome = async {
            let mut handle = self.link.send_request(refer)?;
            handle.final_response(TRANSACTION_TIMEOUT).await
        }
        .await;

        match outcome {
            Ok(response) if response.status.is_success() => {
                // sipfrag NOTIFYs on the original finish the job
                tracing::debug!(%original, %consultation, "attended REFER accepted");
            }
            Ok(response) => {
                let reason = format!("{} {}", response.status, response.reason);
                tracing::info!(%original, %reason, "attended REFER rejected");
                self.abort_attended(original, &reason).await;
            }
            Err(error) => {
                self.abort_attended(original, &error.to_string()).await;
            }
        }
    }

    /// Handle a sipfrag NOTIFY on a session with a transfer outstanding
    pub(crate) fn handle_refer_notify(
        self: &Arc<Self>,
        id: &SessionId,
        request: &Request,
    ) -> Response {
        let response = Response::for_request(StatusCode::OK, request);
        let Ok(frag) = request.body.parse::<SipFrag>() else {
            tracing::debug!(session = %id, "NOTIFY without sipfrag body acknowledged");
            return response;
        };
        let disposition = format!("{} {}", frag.status, frag.reason).trim().to_string();

        let context = self.with_session(id, |session| {
            if let Some(record) = session.transfers.last_mut() {
                record.last_disposition = Some(disposition.clone());
            }
            session
                .active_transfer
                .map(|mode| {
                    (
                        mode,
                        session
                            .transfers
                            .last()
                            .map(|r| r.target.clone())
                            .unwrap_or_default(),
                    )
                })
        });
        let Ok(Some((mode, target))) = context else {
            return response;
        };

        if frag.status.is_provisional() {
            // intermediate progress only
            return response;
        }

        if frag.status.is_success() {
            let _ = self.with_session(id, |session| {
                session.active_transfer = None;
                if let Some(record) = session.transfers.last_mut() {
                    record.completion = Some(TransferCompletion {
                        success: true,
                        disposition: disposition.clone(),
                        at: Utc::now(),
                    });
                }
            });
            if mode == TransferMode::Attended {
                self.clear_intent(id);
            }
            self.bus.publish(PhoneEvent::TransferCompleted {
                id: *id,
                target,
                mode,
                success: true,
                reason: None,
            });
            // the transferee is talking to the target now; drop our leg
            let bye = self.with_session(id, |session| {
                self.link.in_dialog_request(&mut session.dialog, Method::Bye)
            });
            if let Ok(bye) = bye {
                if let Ok(mut handle) = self.link.send_request(bye) {
                    tokio::spawn(async move {
                        let _ = handle.final_response(std::time::Duration::from_secs(5)).await;
                    });
                }
            }
            self.finish(id, SessionState::Terminated, "Transfer Completed");
        } else {
            let _ = self.with_session(id, |session| {
                session.active_transfer = None;
                if let Some(record) = session.transfers.last_mut() {
                    record.completion = Some(TransferCompletion {
                        success: false,
                        disposition: disposition.clone(),
                        at: Utc::now(),
                    });
                }
            });
            if mode == TransferMode::Attended {
                // restore the held original; the consultation is useless now
                let store = self.clone();
                let original = *id;
                let reason = disposition.clone();
                tokio::spawn(async move {
                    store.abort_attended(original, &reason).await;
                });
            } else {
                self.bus.publish(PhoneEvent::TransferCompleted {
                    id: *id,
                    target,
                    mode,
                    success: false,
                    reason: Some(disposition),
                });
            }
        }
        response
    }

    /// A party of a pending attended transfer terminated; called from
    /// session bookkeeping.
    pub(crate) fn on_transfer_party_ended(self: &Arc<Self>, ended: &SessionId) {
        if let Some((_, original)) = self.consultation_of.remove(ended) {
            // the consultation died before completion
            self.intents.remove(&original);
            let store = self.clone();
            tokio::spawn(async move {
                let _ = store.hold(&original, false).await;
                store.publish_attended_failure(&original, "consultation ended");
            });
        }
        if let Some((_, consultation)) = self.intents.remove(ended) {
            // the original died; the consultation carries on as a plain call
            self.consultation_of.remove(&consultation);
        }
    }

    fn clear_intent(&self, original: &SessionId) {
        if let Some((_, consultation)) = self.intents.remove(original) {
            self.consultation_of.remove(&consultation);
        }
    }

    async fn abort_attended(self: &Arc<Self>, original: SessionId, reason: &str) {
        let Some((_, consultation)) = self.intents.remove(&original) else {
            return;
        };
        self.consultation_of.remove(&consultation);
        if self.hang_up(&consultation).await.is_err() {
            // no INVITE in flight yet (or already gone): drop it directly
            self.finish(&consultation, SessionState::Terminated, "cancelled");
        }
        let _ = self.hold(&original, false).await;
        self.publish_attended_failure(&original, reason);
    }

    fn publish_attended_failure(self: &Arc<Self>, original: &SessionId, reason: &str) {
        let target = self
            .with_session(original, |session| {
                session.active_transfer = None;
                if let Some(record) = session.transfers.last_mut() {
                    if record.completion.is_none() {
                        record.completion = Some(TransferCompletion {
                            success: false,
                            disposition: reason.to_string(),
                            at: Utc::now(),
                        });
                    }
                    record.target.clone()
                } else {
                    String::new()
                }
            })
            .unwrap_or_default();
        self.bus.publish(PhoneEvent::TransferCompleted {
            id: *original,
            target,
            mode: TransferMode::Attended,
            success: false,
            reason: Some(reason.to_string()),
        });
    }

    fn fail_transfer(self: &Arc<Self>, id: &SessionId, target: &str, mode: TransferMode, reason: &str) {
        let _ = self.with_session(id, |session| {
            session.active_transfer = None;
            if let Some(record) = session.transfers.last_mut() {
                record.completion = Some(TransferCompletion {
                    success: false,
                    disposition: reason.to_string(),
                    at: Utc::now(),
                });
            }
        });
        self.bus.publish(PhoneEvent::TransferCompleted {
            id: *id,
            target: target.to_string(),
            mode,
            success: false,
            reason: Some(reason.to_string()),
        });
    }
}
