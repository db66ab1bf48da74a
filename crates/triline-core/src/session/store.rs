//! The owning session store
//!
//! All session mutation happens here, keyed by session id, with the line
//! table kept strictly consistent: a line is bound before any SIP goes
//! out and released during termination bookkeeping, so the
//! `|non-terminal sessions| == |occupied slots|` invariant holds after
//! every event.
//!
//! Locking discipline: sessions live in a `DashMap` and no entry guard
//! is ever held across an await. Async flows copy what they need out of
//! the entry, do their I/O, then re-lock to commit - with every commit
//! gated on a positive acknowledgement, per the error-handling design.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use triline_sip::sdp::SdpDirection;
use triline_sip::{HeaderName, Method, NameAddr, Request, Response, SipUri, StatusCode};

use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};
use crate::line::{LineKeyManager, LineNumber, LineState};
use crate::link::{Dialog, SipLink, TRANSACTION_TIMEOUT};
use crate::media::{MediaConstraints, MediaEngine, MediaSessionHandle};

use super::types::{
    CallStats, Direction, PeerInfo, SessionId, SessionSnapshot, SessionState, TransferMode,
    TransferRecord,
};

/// One owned session record (store-private)
pub(crate) struct Session {
    pub id: SessionId,
    pub direction: Direction,
    pub line: LineNumber,
    pub peer: PeerInfo,
    pub state: SessionState,
    pub on_hold: bool,
    pub muted: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub answered_at: Option<chrono::DateTime<Utc>>,
    pub transfers: Vec<TransferRecord>,
    pub dialog: Dialog,
    pub media: Option<Arc<dyn MediaSessionHandle>>,
    /// Serializes hold/unhold/refer on this session
    pub sip_in_flight: bool,
    /// The CSeq the (re-)INVITE went out with, for ACK and CANCEL
    pub invite_cseq: u32,
    /// The Via branch of the pending INVITE, for CANCEL
    pub invite_branch: Option<String>,
    /// The unanswered inbound INVITE, kept until answered or rejected
    pub pending_invite: Option<Request>,
    /// Remote SDP offer from an inbound INVITE
    pub remote_offer: Option<String>,
    /// Set while a REFER awaits its sipfrag dispositions
    pub active_transfer: Option<TransferMode>,
    /// A local CANCEL has been issued
    pub cancel_requested: bool,
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            direction: self.direction,
            line: self.line,
            peer: self.peer.clone(),
            state: self.state,
            on_hold: self.on_hold,
            muted: self.muted,
            created_at: self.created_at,
            answered_at: self.answered_at,
            transfers: self.transfers.clone(),
        }
    }
}

/// The store
pub struct SessionStore {
    pub(crate) link: Arc<SipLink>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) config: Arc<PhoneConfig>,
    pub(crate) media_engine: Arc<dyn MediaEngine>,
    pub(crate) lines: Arc<LineKeyManager>,
    pub(crate) sessions: DashMap<SessionId, Session>,
    pub(crate) call_map: DashMap<String, SessionId>,
    /// original session -> consultation session, while an attended
    /// transfer is pending
    pub(crate) intents: DashMap<SessionId, SessionId>,
    /// consultation session -> original session (reverse of `intents`)
    pub(crate) consultation_of: DashMap<SessionId, SessionId>,
    stats: Mutex<CallStats>,
}

impl SessionStore {
    /// Build the store
    pub fn new(
        link: Arc<SipLink>,
        bus: Arc<EventBus>,
        config: Arc<PhoneConfig>,
        media_engine: Arc<dyn MediaEngine>,
        lines: Arc<LineKeyManager>,
    ) -> Self {
        SessionStore {
            link,
            bus,
            config,
            media_engine,
            lines,
            sessions: DashMap::new(),
            call_map: DashMap::new(),
            intents: DashMap::new(),
            consultation_of: DashMap::new(),
            stats: Mutex::new(CallStats::default()),
        }
    }

    // ---- accessors -------------------------------------------------------

    /// Snapshot of one session
    pub fn snapshot_of(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|s| s.snapshot())
    }

    /// Snapshots of all live sessions
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|s| s.snapshot()).collect()
    }

    /// Number of non-terminal sessions
    pub fn non_terminal_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state.is_in_progress())
            .count()
    }

    /// Aggregate call statistics
    pub fn stats(&self) -> CallStats {
        *self.stats.lock().unwrap()
    }

    /// The session owning a Call-ID
    pub fn session_for_call_id(&self, call_id: &str) -> Option<SessionId> {
        self.call_map.get(call_id).map(|e| *e)
    }

    /// Indicator inputs derived from the live session set:
    /// `(any_ringing_incoming, any_established_on_hold, any_established_active)`
    pub fn indicator_flags(&self) -> (bool, bool, bool) {
        let mut ringing = false;
        let mut held = false;
        let mut active = false;
        for session in self.sessions.iter() {
            match (session.direction, session.state, session.on_hold) {
                (Direction::Incoming, SessionState::Establishing, _)
                | (Direction::Incoming, SessionState::Initial, _) => ringing = true,
                (_, SessionState::Established, true) => held = true,
                (_, SessionState::Established, false) => active = true,
                _ => {}
            }
        }
        (ringing, held, active)
    }

    pub(crate) fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> PhoneResult<R> {
        match self.sessions.get_mut(id) {
            Some(mut session) => Ok(f(&mut session)),
            None => Err(PhoneError::SessionNotFound { session_id: *id }),
        }
    }

    fn other_non_terminal(&self, id: &SessionId) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.id != *id && s.state.is_in_progress())
            .count()
    }

    // ---- outgoing calls --------------------------------------------------

    /// Allocate a line and start an outgoing session toward `target`.
    ///
    /// Line assignment happens before any SIP is generated; when every
    /// slot is taken the typed `AllLinesBusy` error comes back with the
    /// slot table untouched.
    pub fn create_outgoing(
        self: &Arc<Self>,
        target: &str,
        constraints: MediaConstraints,
    ) -> PhoneResult<SessionId> {
        let line = self.lines.available_line().ok_or(PhoneError::AllLinesBusy)?;
        let uri = SipUri::from_dial_target(target, &self.config.domain)?;

        let id = SessionId::new_v4();
        let peer = PeerInfo::new(uri.user.clone().unwrap_or_else(|| uri.to_string()));
        let dialog = Dialog::uac(
            self.link.new_call_id(),
            self.link.local_addr().with_tag(self.link.new_tag()),
            NameAddr::new(uri),
        );
        self.call_map.insert(dialog.call_id.clone(), id);

        let session = Session {
            id,
            direction: Direction::Outgoing,
            line,
            peer: peer.clone(),
            state: SessionState::Initial,
            on_hold: false,
            muted: false,
            created_at: Utc::now(),
            answered_at: None,
            transfers: Vec::new(),
            dialog,
            media: None,
            sip_in_flight: false,
            invite_cseq: 0,
            invite_branch: None,
            pending_invite: None,
            remote_offer: None,
            active_transfer: None,
            cancel_requested: false,
        };
        let call_id = session.dialog.call_id.clone();
        self.sessions.insert(id, session);
        if let Err(e) = self.lines.assign(line, id, peer, LineState::Dialing) {
            self.sessions.remove(&id);
            self.call_map.remove(&call_id);
            return Err(e);
        }
        self.lines.apply_auto_focus(line, self.other_non_terminal(&id));
        if self.lines.selected_line().is_none() {
            self.lines.finish_select(line);
        }
        self.stats.lock().unwrap().placed += 1;

        let snapshot = self.snapshot_of(&id).expect("just inserted");
        self.bus.publish(PhoneEvent::SessionCreated { session: snapshot });

        let store = self.clone();
        tokio::spawn(async move {
            store.run_outgoing(id, constraints).await;
        });
        Ok(id)
    }

    async fn run_outgoing(self: Arc<Self>, id: SessionId, constraints: MediaConstraints) {
        if let Err(error) = self.drive_outgoing(&id, constraints).await {
            tracing::warn!(session = %id, error = %error, "outgoing call failed");
            self.finish(&id, SessionState::Failed, &error.to_string());
        }
    }

    async fn drive_outgoing(
        self: &Arc<Self>,
        id: &SessionId,
        constraints: MediaConstraints,
    ) -> PhoneResult<()> {
        let media = self.media_engine.create_session(constraints).await?;
        let offer = media.create_offer(SdpDirection::SendRecv).await?;

        let mut invite = self.with_session(id, |session| {
            session.media = Some(media.clone());
            session.state = SessionState::Establishing;
            let request = self.link.in_dialog_request(&mut session.dialog, Method::Invite);
            session.invite_cseq = session.dialog.cseq;
            request
        })?;
        invite.set_body("application/sdp", offer);
        self.bus.publish(PhoneEvent::SessionStateChanged {
            id: *id,
            state: SessionState::Establishing,
        });

        let mut handle = self.link.send_request(invite.clone())?;
        self.with_session(id, |session| {
            session.invite_branch = Some(handle.branch().to_string());
        })?;

        let no_answer = Duration::from_secs(self.config.no_answer_timeout_secs);
        let deadline = tokio::time::Instant::now() + no_answer;
        let mut authorized = false;

        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            let response = match handle.next_response(remaining.min(TRANSACTION_TIMEOUT)).await {
                Ok(response) => response,
                Err(PhoneError::TransactionTimeout { .. }) => {
                    // nobody answered: CANCEL and report
                    let _ = self.cancel_invite(id);
                    return Err(PhoneError::call_setup_failed(None, "no answer"));
                }
                Err(other) => return Err(other),
            };

            if response.status.is_provisional() {
                tracing::debug!(session = %id, status = %response.status, "call progress");
                continue;
            }

            let code = response.status.as_u16();
            if matches!(code, 401 | 407) && !authorized {
                authorized = true;
                self.ack_failure(id, &response)?;
                let next_cseq = self.with_session(id, |session| {
                    session.dialog.cseq += 1;
                    session.dialog.cseq
                })?;
                let retry = self.link.authorize_retry(
                    &invite,
                    &response,
                    &self.config.password,
                    next_cseq,
                )?;
                invite = retry.clone();
                handle = self.link.send_request(retry)?;
                self.with_session(id, |session| {
                    session.invite_cseq = next_cseq;
                    session.invite_branch = Some(handle.branch().to_string());
                })?;
                continue;
            }

            if response.status.is_success() {
                let ack = self.with_session(id, |session| {
                    session.dialog.absorb_response(&response);
                    session.invite_branch = None;
                    self.link.ack_for(&session.dialog, session.invite_cseq)
                })?;
                self.link.send_unacknowledged(ack)?;
                media.apply_remote_answer(&response.body).await?;
                self.establish(id);
                return Ok(());
            }

            // final failure: ACK it and classify
            self.ack_failure(id, &response)?;
            let cancelled =
                self.with_session(id, |session| session.cancel_requested).unwrap_or(false);
            if code == 487 && cancelled {
                self.finish(id, SessionState::Terminated, "cancelled");
                return Ok(());
            }
            return Err(PhoneError::call_setup_failed(Some(code), response.reason));
        }
    }

    /// ACK a non-2xx final INVITE response. The failure's To tag is used
    /// for the ACK only - it must not stick to the session dialog, or a
    /// credential retry would reuse a dead dialog's tag.
    fn ack_failure(&self, id: &SessionId, response: &Response) -> PhoneResult<()> {
        let ack = self.with_session(id, |session| {
            let mut scratch = session.dialog.clone();
            scratch.absorb_response(response);
            self.link.ack_for(&scratch, session.invite_cseq)
        })?;
        self.link.send_unacknowledged(ack)
    }

    /// CANCEL the pending outgoing INVITE (before any final response)
    pub fn cancel_invite(&self, id: &SessionId) -> PhoneResult<()> {
        let (cancel, branch) = self.with_session(id, |session| {
            session.cancel_requested = true;
            let branch = session.invite_branch.clone();
            let mut request = Request::new(Method::Cancel, session.dialog.request_uri());
            request
                .headers
                .push(HeaderName::From, session.dialog.local.to_string());
            request.headers.push(
                HeaderName::To,
                NameAddr::new(session.dialog.remote.uri.clone()).to_string(),
            );
            request
                .headers
                .push(HeaderName::CallId, session.dialog.call_id.clone());
            request
                .headers
                .push(HeaderName::CSeq, format!("{} CANCEL", session.invite_cseq));
            (request, branch)
        })?;
        let branch = branch.ok_or(PhoneError::InvalidSessionState {
            session_id: *id,
            current_state: "no INVITE in flight".into(),
        })?;
        self.link.send_request_with_branch(cancel, branch).map(|_| ())
    }

    // ---- incoming calls --------------------------------------------------

    /// Handle a dialog-creating INVITE. Returns the response to send.
    ///
    /// With every slot occupied this answers 486 without touching the
    /// slot table or creating a session.
    pub fn handle_incoming_invite(self: &Arc<Self>, request: &Request) -> Response {
        let Some(line) = self.lines.available_line() else {
            self.stats.lock().unwrap().received += 1;
            return Response::for_request(StatusCode::BUSY_HERE, request);
        };

        let local_tag = self.link.new_tag();
        let dialog = match Dialog::uas(request, &local_tag) {
            Ok(dialog) => dialog,
            Err(e) => {
                tracing::warn!(error = %e, "malformed INVITE");
                return Response::for_request(StatusCode::BAD_REQUEST, request);
            }
        };

        let peer = request
            .headers
            .from_addr()
            .map(|from| PeerInfo {
                display_name: from.display_name.clone(),
                dial_string: from.uri.user.clone().unwrap_or_else(|| from.uri.to_string()),
            })
            .unwrap_or_else(|_| PeerInfo::new("unknown"));

        let id = SessionId::new_v4();
        let session = Session {
            id,
            direction: Direction::Incoming,
            line,
            peer: peer.clone(),
            state: SessionState::Establishing,
            on_hold: false,
            muted: false,
            created_at: Utc::now(),
            answered_at: None,
            transfers: Vec::new(),
            dialog,
            media: None,
            sip_in_flight: false,
            invite_cseq: 0,
            invite_branch: None,
            pending_invite: Some(request.clone()),
            remote_offer: (!request.body.is_empty()).then(|| request.body.clone()),
            active_transfer: None,
            cancel_requested: false,
        };
        let call_id = session.dialog.call_id.clone();
        self.sessions.insert(id, session);
        self.call_map.insert(call_id.clone(), id);
        let others = self.other_non_terminal(&id);
        if self.lines.assign(line, id, peer, LineState::Ringing).is_err() {
            // slot raced away between the check and the bind
            self.sessions.remove(&id);
            self.call_map.remove(&call_id);
            return Response::for_request(StatusCode::BUSY_HERE, request);
        }
        self.lines.apply_auto_focus(line, others);
        self.stats.lock().unwrap().received += 1;

        let snapshot = self.snapshot_of(&id).expect("just inserted");
        self.bus.publish(PhoneEvent::SessionCreated { session: snapshot });
        if others > 0 {
            // call waiting: tone only, selection stays where it is
            self.bus
                .publish(PhoneEvent::CallWaitingTone { line, session: id });
        }

        self.spawn_no_answer_watchdog(id);

        Response::for_request(StatusCode::RINGING, request)
            .with_to_tag(&self.ringing_tag(&id))
    }

    fn ringing_tag(&self, id: &SessionId) -> String {
        self.with_session(id, |session| {
            session.dialog.local.tag().unwrap_or_default().to_string()
        })
        .unwrap_or_default()
    }

    fn spawn_no_answer_watchdog(self: &Arc<Self>, id: SessionId) {
        let store = self.clone();
        let window = Duration::from_secs(self.config.no_answer_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let still_ringing = store
                .with_session(&id, |session| {
                    session.direction == Direction::Incoming
                        && session.state == SessionState::Establishing
                })
                .unwrap_or(false);
            if still_ringing {
                tracing::info!(session = %id, "incoming call unanswered, rejecting");
                let _ = store.reject(&id, StatusCode::TEMPORARILY_UNAVAILABLE, "no answer");
            }
        });
    }

    /// Answer an incoming session with the given media constraints
    pub async fn answer(
        self: &Arc<Self>,
        id: &SessionId,
        constraints: MediaConstraints,
    ) -> PhoneResult<()> {
        let (invite, offer) = self.with_session(id, |session| {
            if session.direction != Direction::Incoming
                || session.state != SessionState::Establishing
            {
                return Err(PhoneError::InvalidSessionState {
                    session_id: *id,
                    current_state: session.state.to_string(),
                });
            }
            let invite = session.pending_invite.clone().ok_or_else(|| {
                PhoneError::internal("incoming session without stored INVITE")
            })?;
            Ok((invite, session.remote_offer.clone()))
        })??;

        let offer = offer.ok_or_else(|| PhoneError::media("INVITE carried no SDP offer"))?;
        let media = self.media_engine.create_session(constraints).await?;
        let answer = media.create_answer(&offer, SdpDirection::SendRecv).await?;

        let mut response = Response::for_request(StatusCode::OK, &invite)
            .with_to_tag(&self.ringing_tag(id));
        response
            .headers
            .push(HeaderName::Contact, self.link.contact_addr().to_string());
        response.set_body("application/sdp", answer);
        self.link.send_response(&response)?;

        self.with_session(id, |session| {
            session.media = Some(media);
            session.pending_invite = None;
        })?;
        self.establish(id);
        Ok(())
    }

    /// Reject an unanswered incoming session
    pub fn reject(
        self: &Arc<Self>,
        id: &SessionId,
        status: StatusCode,
        reason: &str,
    ) -> PhoneResult<()> {
        let response = self.with_session(id, |session| {
            session
                .pending_invite
                .as_ref()
                .map(|invite| Response::for_request(status, invite))
        })?;
        let tag = self.ringing_tag(id);
        if let Some(response) = response {
            let _ = self.link.send_response(&response.with_to_tag(&tag));
        }
        self.finish(id, SessionState::Terminated, reason);
        Ok(())
    }

    // ---- lifecycle -------------------------------------------------------

    pub(crate) fn establish(self: &Arc<Self>, id: &SessionId) {
        let snapshot = self.with_session(id, |session| {
            session.state = SessionState::Established;
            session.answered_at = Some(Utc::now());
            session.snapshot()
        });
        let Ok(snapshot) = snapshot else { return };
        let _ = self.lines.update_state(snapshot.line, LineState::Active);
        self.stats.lock().unwrap().answered += 1;
        self.bus.publish(PhoneEvent::SessionStateChanged {
            id: *id,
            state: SessionState::Established,
        });
        self.bus
            .publish(PhoneEvent::SessionAnswered { session: snapshot });

        // an established consultation leg triggers the attended REFER
        if let Some(original) = self.consultation_of.get(id).map(|e| *e) {
            let store = self.clone();
            let consultation = *id;
            tokio::spawn(async move {
                store.complete_attended(original, consultation).await;
            });
        }
    }

    /// Hang up: BYE an established session, CANCEL a pending outgoing
    /// one, reject an unanswered incoming one.
    pub async fn hang_up(self: &Arc<Self>, id: &SessionId) -> PhoneResult<()> {
        let (direction, state) = self
            .with_session(id, |session| (session.direction, session.state))?;

        match (direction, state) {
            (_, SessionState::Established) => {
                let bye = self.with_session(id, |session| {
                    self.link.in_dialog_request(&mut session.dialog, Method::Bye)
                })?;
                if let Ok(mut handle) = self.link.send_request(bye) {
                    tokio::spawn(async move {
                        let _ = handle.final_response(Duration::from_secs(5)).await;
                    });
                }
                self.finish(id, SessionState::Terminated, "hangup");
                Ok(())
            }
            (Direction::Outgoing, SessionState::Initial | SessionState::Establishing) => {
                // the INVITE task observes the 487 and finishes the session
                self.cancel_invite(id)
            }
            (Direction::Incoming, SessionState::Establishing | SessionState::Initial) => {
                self.reject(id, StatusCode::BUSY_HERE, "rejected")
            }
            _ => Err(PhoneError::InvalidSessionState {
                session_id: *id,
                current_state: state.to_string(),
            }),
        }
    }

    /// Terminate every live session (unregister / shutdown path)
    pub async fn terminate_all(self: &Arc<Self>, reason: &str) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.id).collect();
        for id in ids {
            if self.hang_up(&id).await.is_err() {
                self.finish(&id, SessionState::Terminated, reason);
            }
        }
    }

    /// Final bookkeeping: stats, media release, line release, removal.
    pub(crate) fn finish(self: &Arc<Self>, id: &SessionId, final_state: SessionState, reason: &str) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        self.call_map.remove(&session.dialog.call_id);

        {
            let mut stats = self.stats.lock().unwrap();
            if let Some(answered_at) = session.answered_at {
                stats.talk_seconds += (Utc::now() - answered_at).num_seconds().max(0) as u64;
            }
            if final_state == SessionState::Failed {
                stats.failed += 1;
            }
            // an unanswered inbound call counts as missed unless the user
            // actively declined it
            if session.direction == Direction::Incoming
                && session.answered_at.is_none()
                && reason != "rejected"
            {
                stats.missed += 1;
            }
        }

        if let Some(media) = session.media {
            tokio::spawn(async move {
                media.close().await;
            });
        }

        self.bus.publish(PhoneEvent::SessionStateChanged {
            id: *id,
            state: final_state,
        });
        self.bus.publish(PhoneEvent::SessionTerminated {
            id: *id,
            reason: reason.to_string(),
        });
        // slot release last, so a lineChanged-to-none follows the
        // terminated event it was caused by
        let _ = self.lines.clear(session.line);
        tracing::info!(session = %id, %reason, state = %final_state, "session ended");

        self.on_transfer_party_ended(id);
    }

    // ---- hold / mute -----------------------------------------------------

    /// Renegotiate hold state via re-INVITE. `on_hold` flips only when
    /// the peer accepts; a rejection leaves the flag untouched and emits
    /// `sessionError`.
    pub async fn hold(self: &Arc<Self>, id: &SessionId, on_hold: bool) -> PhoneResult<()> {
        let prepared = self.with_session(id, |session| {
            if session.state != SessionState::Established {
                return Err(PhoneError::InvalidSessionState {
                    session_id: *id,
                    current_state: session.state.to_string(),
                });
            }
            if session.on_hold == on_hold {
                return Ok(None);
            }
            if session.sip_in_flight {
                return Err(PhoneError::OperationInProgress {
                    session_id: *id,
                    operation: "hold",
                });
            }
            let media = session.media.clone().ok_or_else(|| {
                PhoneError::media("established session without media")
            })?;
            session.sip_in_flight = true;
            let request = self.link.in_dialog_request(&mut session.dialog, Method::Invite);
            Ok(Some((media, request)))
        })??;

        let Some((media, mut reinvite)) = prepared else {
            // already in the requested hold state
            return Ok(());
        };

        let direction = if on_hold { SdpDirection::SendOnly } else { SdpDirection::SendRecv };
        let result = self.renegotiate(id, &media, &mut reinvite, direction).await;

        match result {
            Ok(()) => {
                let (line, muted) = self.with_session(id, |session| {
                    session.on_hold = on_hold;
                    session.sip_in_flight = false;
                    (session.line, session.muted)
                })?;
                media.set_capture_enabled(!on_hold && !muted);
                let _ = self.lines.update_state(
                    line,
                    if on_hold { LineState::Hold } else { LineState::Active },
                );
                self.bus
                    .publish(PhoneEvent::SessionHeld { id: *id, on_hold });
                Ok(())
            }
            Err(error) => {
                let _ = self.with_session(id, |session| {
                    session.sip_in_flight = false;
                });
                self.bus.publish(PhoneEvent::SessionError {
                    id: *id,
                    reason: error.to_string(),
                });
                Err(PhoneError::HoldFailed { reason: error.to_string() })
            }
        }
    }

    async fn renegotiate(
        self: &Arc<Self>,
        id: &SessionId,
        media: &Arc<dyn MediaSessionHandle>,
        reinvite: &mut Request,
        direction: SdpDirection,
    ) -> PhoneResult<()> {
        let offer = media.create_offer(direction).await?;
        reinvite.set_body("application/sdp", offer);
        let mut handle = self.link.send_request(reinvite.clone())?;
        let response = handle.final_response(TRANSACTION_TIMEOUT).await?;

        let invite_cseq = reinvite.headers.cseq()?.0;
        let ack = self.with_session(id, |session| {
            session.dialog.absorb_response(&response);
            self.link.ack_for(&session.dialog, invite_cseq)
        })?;
        self.link.send_unacknowledged(ack)?;

        if !response.status.is_success() {
            return Err(PhoneError::media(format!(
                "re-INVITE rejected: {} {}",
                response.status, response.reason
            )));
        }
        media.apply_remote_answer(&response.body).await
    }

    /// Toggle local capture without renegotiating
    pub fn mute(&self, id: &SessionId, muted: bool) -> PhoneResult<()> {
        let (media, on_hold) = self.with_session(id, |session| {
            let media = session.media.clone().ok_or_else(|| {
                PhoneError::media("session has no local media stream")
            })?;
            session.muted = muted;
            Ok::<_, PhoneError>((media, session.on_hold))
        })??;
        media.set_capture_enabled(!muted && !on_hold);
        self.bus.publish(PhoneEvent::SessionMuted { id: *id, muted });
        Ok(())
    }

    // ---- in-dialog inbound -----------------------------------------------

    /// Dispatch an in-dialog request to the owning session. Returns the
    /// response to send, `None` when the Call-ID is not ours.
    pub fn handle_in_dialog(self: &Arc<Self>, request: &Request) -> Option<Response> {
        let call_id = request.headers.call_id().ok()?;
        let id = self.session_for_call_id(call_id)?;

        match request.method {
            Method::Bye => {
                let response = Response::for_request(StatusCode::OK, request);
                self.finish(&id, SessionState::Terminated, "remote hangup");
                Some(response)
            }
            Method::Cancel => {
                // cancel of the pending inbound INVITE
                let response = Response::for_request(StatusCode::OK, request);
                let _ = self.with_session(&id, |session| {
                    if let Some(invite) = session.pending_invite.take() {
                        let terminated =
                            Response::for_request(StatusCode::REQUEST_TERMINATED, &invite);
                        let _ = self.link.send_response(&terminated);
                    }
                });
                self.finish(&id, SessionState::Terminated, "cancelled by caller");
                Some(response)
            }
            Method::Info => {
                // peer DTMF and application INFO is acknowledged and dropped
                Some(Response::for_request(StatusCode::OK, request))
            }
            Method::Notify => Some(self.handle_refer_notify(&id, request)),
            Method::Ack => None,
            Method::Invite => Some(self.handle_reinvite(&id, request)),
            _ => Some(Response::for_request(StatusCode::OK, request)),
        }
    }

    fn handle_reinvite(self: &Arc<Self>, id: &SessionId, request: &Request) -> Response {
        let media = self
            .with_session(id, |session| session.media.clone())
            .ok()
            .flatten();
        let Some(media) = media else {
            return Response::for_request(StatusCode::NOT_ACCEPTABLE_HERE, request);
        };
        // answer the renegotiation mirroring the peer's direction
        let remote_direction = triline_sip::sdp::AudioDescription::parse(&request.body)
            .map(|sdp| sdp.direction)
            .unwrap_or(SdpDirection::SendRecv);
        let trying = Response::for_request(StatusCode::TRYING, request);
        let store = self.clone();
        let id = *id;
        let reinvite = request.clone();
        tokio::spawn(async move {
            match media
                .create_answer(&reinvite.body, remote_direction.reversed())
                .await
            {
                Ok(answer) => {
                    let mut response = Response::for_request(StatusCode::OK, &reinvite);
                    response
                        .headers
                        .push(HeaderName::Contact, store.link.contact_addr().to_string());
                    response.set_body("application/sdp", answer);
                    let _ = store.link.send_response(&response);
                }
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "re-INVITE answer failed");
                    let response =
                        Response::for_request(StatusCode::NOT_ACCEPTABLE_HERE, &reinvite);
                    let _ = store.link.send_response(&response);
                }
            }
        });
        // the spawned task sends the final answer
        trying
    }
}
