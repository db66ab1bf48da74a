//! Request sending, transaction matching and dialog bookkeeping
//!
//! [`SipLink`] is the one place outbound requests pass through: it stamps
//! the Via branch, registers a client transaction keyed on that branch,
//! and hands back a [`TransactionHandle`] the caller awaits responses on.
//! Inbound responses are routed by the branch the server echoes in the
//! topmost Via; everything per-session/per-subscription above that is
//! dialog state, kept in the small [`Dialog`] record.
//!
//! There is deliberately no retransmission layer here: RFC 7118 runs SIP
//! over a reliable stream, so a transaction either completes, times out,
//! or dies with the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use triline_sip::auth::DigestChallenge;
use triline_sip::{HeaderName, Method, NameAddr, Request, Response, SipUri};

use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::transport::WsTransport;

/// Default wait for a final response (Timer B equivalent)
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

type PendingMap = Arc<DashMap<String, mpsc::UnboundedSender<Response>>>;

/// Dialog state for one established SIP relationship
#[derive(Debug, Clone)]
pub struct Dialog {
    /// Call-ID shared by everything in the dialog
    pub call_id: String,
    /// Our side of From/To, tag included
    pub local: NameAddr,
    /// The peer's side, tag filled in once learned
    pub remote: NameAddr,
    /// The peer's Contact, preferred request target once known
    pub remote_target: Option<SipUri>,
    /// Our CSeq counter
    pub cseq: u32,
}

impl Dialog {
    /// A UAC-side dialog seeded before the initial request
    pub fn uac(call_id: String, local: NameAddr, remote: NameAddr) -> Self {
        Dialog { call_id, local, remote, remote_target: None, cseq: 0 }
    }

    /// A UAS-side dialog derived from an incoming dialog-creating request
    pub fn uas(request: &Request, local_tag: &str) -> PhoneResult<Self> {
        let remote = request.headers.from_addr()?;
        let local = request.headers.to_addr()?.with_tag(local_tag);
        let remote_target = request.headers.contact().map(|c| c.uri);
        Ok(Dialog {
            call_id: request.headers.call_id()?.to_string(),
            local,
            remote,
            remote_target,
            // our CSeq space is independent of the peer's
            cseq: 0,
        })
    }

    /// Learn the peer tag and Contact from a response to our request
    pub fn absorb_response(&mut self, response: &Response) {
        if self.remote.tag().is_none() {
            if let Ok(to) = response.headers.to_addr() {
                if let Some(tag) = to.tag() {
                    self.remote = self.remote.clone().with_tag(tag);
                }
            }
        }
        if let Some(contact) = response.headers.contact() {
            self.remote_target = Some(contact.uri);
        }
    }

    /// The request target for in-dialog requests
    pub fn request_uri(&self) -> SipUri {
        self.remote_target
            .clone()
            .unwrap_or_else(|| self.remote.uri.clone())
    }
}

/// Outbound request path plus the client transaction table
pub struct SipLink {
    transport: Arc<WsTransport>,
    pending: PendingMap,
    instance_host: String,
    username: String,
    domain: String,
    display_name: String,
    non_dialog_cseq: AtomicU32,
}

impl SipLink {
    /// Build the link for one configured identity
    pub fn new(transport: Arc<WsTransport>, config: &PhoneConfig) -> Self {
        SipLink {
            transport,
            pending: Arc::new(DashMap::new()),
            // RFC 7118: a WS client names itself with an .invalid host
            instance_host: format!("{:012x}.invalid", rand::random::<u64>() & 0xffff_ffff_ffff),
            username: config.username.clone(),
            domain: config.domain.clone(),
            display_name: config.effective_display_name(),
            non_dialog_cseq: AtomicU32::new(0),
        }
    }

    /// The `.invalid` host this UA names itself with
    pub fn instance_host(&self) -> &str {
        &self.instance_host
    }

    /// The configured SIP username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Fresh Via branch
    pub fn new_branch(&self) -> String {
        format!("z9hG4bK{:016x}", rand::random::<u64>())
    }

    /// Fresh dialog tag
    pub fn new_tag(&self) -> String {
        format!("{:08x}", rand::random::<u32>())
    }

    /// Fresh Call-ID scoped to this instance
    pub fn new_call_id(&self) -> String {
        format!("{}@{}", uuid::Uuid::new_v4().simple(), self.instance_host)
    }

    /// Next CSeq for requests outside any dialog
    pub fn next_cseq(&self) -> u32 {
        self.non_dialog_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Our address-of-record
    pub fn aor(&self) -> SipUri {
        SipUri::new(self.username.clone(), self.domain.clone())
    }

    /// Our From/To identity with display name
    pub fn local_addr(&self) -> NameAddr {
        NameAddr::new(self.aor()).with_display_name(self.display_name.clone())
    }

    /// Our Contact, routed over the WebSocket flow
    pub fn contact_addr(&self) -> NameAddr {
        NameAddr::new(
            SipUri::new(self.username.clone(), self.instance_host.clone())
                .with_param("transport", Some("ws")),
        )
    }

    /// Build an in-dialog request and advance the dialog CSeq
    pub fn in_dialog_request(&self, dialog: &mut Dialog, method: Method) -> Request {
        dialog.cseq += 1;
        let mut request = Request::new(method, dialog.request_uri());
        request.headers.push(HeaderName::From, dialog.local.to_string());
        request.headers.push(HeaderName::To, dialog.remote.to_string());
        request.headers.push(HeaderName::CallId, dialog.call_id.clone());
        request
            .headers
            .push(HeaderName::CSeq, format!("{} {}", dialog.cseq, method));
        request
            .headers
            .push(HeaderName::Contact, self.contact_addr().to_string());
        request
    }

    /// The ACK for a final INVITE response (same CSeq number, method ACK)
    pub fn ack_for(&self, dialog: &Dialog, invite_cseq: u32) -> Request {
        let mut request = Request::new(Method::Ack, dialog.request_uri());
        request.headers.push(HeaderName::From, dialog.local.to_string());
        request.headers.push(HeaderName::To, dialog.remote.to_string());
        request.headers.push(HeaderName::CallId, dialog.call_id.clone());
        request
            .headers
            .push(HeaderName::CSeq, format!("{} ACK", invite_cseq));
        request
    }

    fn stamp(&self, request: &mut Request, branch: &str) {
        request.headers.set(
            HeaderName::Via,
            format!("SIP/2.0/WSS {};branch={}", self.instance_host, branch),
        );
        if request.headers.get(&HeaderName::MaxForwards).is_none() {
            request.headers.push(HeaderName::MaxForwards, "70");
        }
        if request.headers.get(&HeaderName::UserAgent).is_none() {
            request.headers.push(HeaderName::UserAgent, "triline/0.1");
        }
    }

    /// Send a request and open a client transaction for its responses
    pub fn send_request(&self, request: Request) -> PhoneResult<TransactionHandle> {
        let branch = self.new_branch();
        self.send_request_with_branch(request, branch)
    }

    /// Send a request on an explicit branch. CANCEL must reuse the
    /// branch of the INVITE it cancels; transactions are keyed on
    /// (branch, method) so the two response streams stay apart.
    pub fn send_request_with_branch(
        &self,
        mut request: Request,
        branch: String,
    ) -> PhoneResult<TransactionHandle> {
        self.stamp(&mut request, &branch);
        let key = transaction_key(&branch, request.method);

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(key.clone(), tx);

        if let Err(e) = self.transport.send(request.to_wire()) {
            self.pending.remove(&key);
            return Err(e);
        }
        tracing::debug!(method = %request.method, uri = %request.uri, %branch, "request sent");
        Ok(TransactionHandle { key, rx, pending: self.pending.clone() })
    }

    /// Send a request that expects no response (ACK)
    pub fn send_unacknowledged(&self, mut request: Request) -> PhoneResult<()> {
        let branch = self.new_branch();
        self.stamp(&mut request, &branch);
        self.transport.send(request.to_wire())
    }

    /// Send a response to a server transaction
    pub fn send_response(&self, response: &Response) -> PhoneResult<()> {
        self.transport.send(response.to_wire())
    }

    /// Route an inbound response to its client transaction by the Via
    /// branch the server echoes plus the CSeq method
    pub fn dispatch_response(&self, response: Response) {
        let Some(branch) = response.headers.via_branch().map(str::to_string) else {
            tracing::warn!(status = %response.status, "response without Via branch dropped");
            return;
        };
        let Ok((_, method)) = response.headers.cseq() else {
            tracing::warn!(status = %response.status, "response without CSeq dropped");
            return;
        };
        let key = transaction_key(&branch, method);
        match self.pending.get(&key) {
            Some(entry) => {
                let _ = entry.send(response);
            }
            None => {
                tracing::trace!(%branch, status = %response.status, "response for unknown transaction");
            }
        }
    }

    /// Answer a 401/407 challenge: clone `original` with a fresh CSeq and
    /// the computed Authorization header.
    pub fn authorize_retry(
        &self,
        original: &Request,
        challenge: &Response,
        password: &str,
        cseq: u32,
    ) -> PhoneResult<Request> {
        let proxy = challenge.status.as_u16() == 407;
        let header = if proxy {
            HeaderName::ProxyAuthenticate
        } else {
            HeaderName::WwwAuthenticate
        };
        let raw = challenge
            .headers
            .get(&header)
            .ok_or(triline_sip::Error::MissingHeader("WWW-Authenticate"))?;
        let parsed = DigestChallenge::parse(raw)?;

        let uri = original.uri.to_string();
        let authorization = parsed.respond(
            &self.username,
            password,
            original.method,
            &uri,
            &self.new_tag(),
        );

        let mut retry = original.clone();
        retry.headers.set(
            HeaderName::CSeq,
            format!("{} {}", cseq, original.method),
        );
        retry.headers.set(
            if proxy { HeaderName::ProxyAuthorization } else { HeaderName::Authorization },
            authorization,
        );
        Ok(retry)
    }
}

fn transaction_key(branch: &str, method: Method) -> String {
    format!("{}|{}", branch, method)
}

/// One client transaction's response stream
pub struct TransactionHandle {
    key: String,
    rx: mpsc::UnboundedReceiver<Response>,
    pending: PendingMap,
}

impl TransactionHandle {
    /// The Via branch this transaction is keyed on
    pub fn branch(&self) -> &str {
        self.key.split('|').next().unwrap_or(&self.key)
    }

    /// Next response of any class within `timeout`
    pub async fn next_response(&mut self, timeout: Duration) -> PhoneResult<Response> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(PhoneError::TransportClosed),
            Err(_) => Err(PhoneError::TransactionTimeout { method: "request" }),
        }
    }

    /// Skip provisionals and return the final response within `timeout`
    pub async fn final_response(&mut self, timeout: Duration) -> PhoneResult<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(PhoneError::TransactionTimeout { method: "request" })?;
            let response = self.next_response(remaining).await?;
            if response.status.is_final() {
                return Ok(response);
            }
        }
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}
