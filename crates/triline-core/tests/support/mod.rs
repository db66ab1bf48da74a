//! Test support: a scripted PBX on a real WebSocket
//!
//! Each test spawns a `FakePbx` on a loopback listener and points the
//! phone's `server` option at it. The PBX parses every inbound request
//! through the wire model, hands it to the test's script, and writes
//! whatever messages the script returns back onto the socket - so the
//! whole stack from transport to store is exercised against literal SIP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;

use triline_core::events::PhoneEvent;
use triline_core::media::MockMediaEngine;
use triline_core::storage::MemoryStorage;
use triline_core::{Phone, PhoneConfig};
use triline_sip::sdp::AudioDescription;
use triline_sip::{HeaderName, Message, NameAddr, Request, Response, StatusCode};

/// Per-connection scratch the script can use (e.g. to answer a CANCEL
/// with a 487 on the right INVITE)
#[derive(Default)]
pub struct PbxState {
    /// Last dialog-creating INVITE per Call-ID
    pub invites: HashMap<String, Request>,
    /// Requests seen, by method name
    pub counts: HashMap<String, usize>,
}

pub type Script = Arc<dyn Fn(&Request, &mut PbxState) -> Vec<Message> + Send + Sync>;

pub struct FakePbx {
    /// The `server` config value pointing at this PBX
    pub url: String,
    /// Every inbound request, in arrival order
    pub received: mpsc::UnboundedReceiver<Request>,
    /// Every response the client sends (180s, 200s, 486s, ...)
    pub client_responses: mpsc::UnboundedReceiver<Response>,
    /// Inject a PBX-originated message (INVITE, NOTIFY) to the client
    pub inject: mpsc::UnboundedSender<Message>,
}

/// Spawn the PBX; it serves connections until the test drops it
pub async fn spawn_pbx(script: Script) -> FakePbx {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    let (inject_tx, inject_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let mut inject_rx = inject_rx;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            let (mut sink, mut frames) = socket.split();
            let mut state = PbxState::default();
            loop {
                tokio::select! {
                    frame = frames.next() => {
                        let Some(Ok(frame)) = frame else { break };
                        let WsFrame::Text(text) = frame else { continue };
                        match Message::parse(&text) {
                            Ok(Message::Response(response)) => {
                                let _ = resp_tx.send(response);
                            }
                            Ok(Message::Request(request)) => {
                                if request.method == triline_sip::Method::Invite
                                    && request
                                        .headers
                                        .to_addr()
                                        .map(|t| t.tag().is_none())
                                        .unwrap_or(false)
                                {
                                    if let Ok(call_id) = request.headers.call_id() {
                                        state.invites.insert(call_id.to_string(), request.clone());
                                    }
                                }
                                *state.counts.entry(request.method.to_string()).or_insert(0) += 1;
                                let _ = seen_tx.send(request.clone());
                                for out in script(&request, &mut state) {
                                    let wire = match &out {
                                        Message::Request(r) => r.to_wire(),
                                        Message::Response(r) => r.to_wire(),
                                    };
                                    if sink.send(WsFrame::Text(wire)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(_) => {}
                        }
                    }
                    injected = inject_rx.recv() => {
                        let Some(message) = injected else { break };
                        let wire = match &message {
                            Message::Request(r) => r.to_wire(),
                            Message::Response(r) => r.to_wire(),
                        };
                        if sink.send(WsFrame::Text(wire)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    FakePbx {
        url: format!("ws://{}", addr),
        received: seen_rx,
        client_responses: resp_rx,
        inject: inject_tx,
    }
}

/// A phone wired to the PBX with mock media and memory storage
pub fn phone_for(pbx: &FakePbx, configure: impl FnOnce(PhoneConfig) -> PhoneConfig) -> Arc<Phone> {
    phone_with(
        pbx,
        Arc::new(MockMediaEngine::new()),
        Arc::new(MemoryStorage::new()),
        None,
        configure,
    )
}

/// A phone wired to the PBX with explicit capabilities
pub fn phone_with(
    pbx: &FakePbx,
    media: Arc<MockMediaEngine>,
    storage: Arc<MemoryStorage>,
    lamp: Option<Arc<dyn triline_core::LampDriver>>,
    configure: impl FnOnce(PhoneConfig) -> PhoneConfig,
) -> Arc<Phone> {
    let config = configure(PhoneConfig::new(
        pbx.url.clone(),
        "1001",
        "secret",
        "example.net",
    ));
    Phone::new(config, media, storage, lamp).unwrap()
}

/// Await the first event matching `pred`
pub async fn wait_for(
    rx: &mut broadcast::Receiver<PhoneEvent>,
    timeout: Duration,
    pred: impl Fn(&PhoneEvent) -> bool,
) -> PhoneEvent {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for event");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) => continue,
            other => panic!("event stream ended while waiting: {:?}", other),
        }
    }
}

/// Await the next request of `method` arriving at the PBX
pub async fn next_request(pbx: &mut FakePbx, method: triline_sip::Method) -> Request {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for request");
        match tokio::time::timeout(remaining, pbx.received.recv()).await {
            Ok(Some(request)) if request.method == method => return request,
            Ok(Some(_)) => continue,
            other => panic!("pbx request stream ended: {:?}", other),
        }
    }
}

// ---- wire builders -------------------------------------------------------

/// 200 OK with an SDP answer, completing a dialog as the PBX side.
/// The Contact echoes the called user so dialogs stay distinguishable.
pub fn ok_with_sdp(request: &Request) -> Response {
    let user = request
        .headers
        .to_addr()
        .ok()
        .and_then(|to| to.uri.user)
        .unwrap_or_else(|| "pbx".to_string());
    let mut response = Response::for_request(StatusCode::OK, request).with_to_tag("pbx");
    response.headers.push(
        HeaderName::Contact,
        format!("<sip:{}@10.0.0.20:8089;transport=ws>", user),
    );
    response.set_body(
        "application/sdp",
        AudioDescription::new("10.0.0.20", 42000).to_sdp(),
    );
    response
}

/// Plain status answer to a request
pub fn answer(request: &Request, status: StatusCode) -> Response {
    Response::for_request(status, request).with_to_tag("pbx")
}

/// A NOTIFY inside the dialog established by `dialog_request` (a
/// SUBSCRIBE the PBX accepted, or any in-dialog request from the client)
pub fn notify_in_dialog(
    dialog_request: &Request,
    event: &str,
    content_type: &str,
    body: &str,
    cseq: u32,
) -> Request {
    let from = dialog_request.headers.get(&HeaderName::To).unwrap();
    let from = if from.contains("tag=") {
        from.to_string()
    } else {
        format!("{};tag=pbx", from)
    };
    let to = dialog_request.headers.get(&HeaderName::From).unwrap().to_string();
    let target = dialog_request
        .headers
        .contact()
        .map(|c| c.uri)
        .unwrap_or_else(|| "sip:1001@client.invalid".parse().unwrap());

    let mut notify = Request::new(triline_sip::Method::Notify, target);
    notify.headers.push(
        HeaderName::Via,
        "SIP/2.0/WSS pbx.example.net;branch=z9hG4bKpbx".to_string(),
    );
    notify.headers.push(HeaderName::From, from);
    notify.headers.push(HeaderName::To, to);
    notify.headers.push(
        HeaderName::CallId,
        dialog_request.headers.call_id().unwrap().to_string(),
    );
    notify
        .headers
        .push(HeaderName::CSeq, format!("{} NOTIFY", cseq));
    notify.headers.push(HeaderName::Event, event.to_string());
    notify
        .headers
        .push(HeaderName::SubscriptionState, "active;expires=3600".to_string());
    if !body.is_empty() {
        notify.set_body(content_type, body);
    }
    notify
}

/// A dialog-creating INVITE from the PBX toward the registered client
pub fn incoming_invite(caller: &str, call_id: &str) -> Request {
    let mut invite = Request::new(
        triline_sip::Method::Invite,
        "sip:1001@example.net".parse().unwrap(),
    );
    invite.headers.push(
        HeaderName::Via,
        format!("SIP/2.0/WSS pbx.example.net;branch=z9hG4bK{}", call_id),
    );
    invite.headers.push(
        HeaderName::From,
        NameAddr::new(triline_sip::SipUri::new(caller, "example.net"))
            .with_display_name("Caller")
            .with_tag("caller1")
            .to_string(),
    );
    invite.headers.push(
        HeaderName::To,
        "<sip:1001@example.net>".to_string(),
    );
    invite.headers.push(HeaderName::CallId, call_id.to_string());
    invite.headers.push(HeaderName::CSeq, "1 INVITE".to_string());
    invite.headers.push(
        HeaderName::Contact,
        format!("<sip:{}@10.0.0.20:8089;transport=ws>", caller),
    );
    invite.set_body(
        "application/sdp",
        AudioDescription::new("10.0.0.20", 42002).to_sdp(),
    );
    invite
}

/// The standard registrar behaviour: accept REGISTER and SUBSCRIBE to
/// anything, deliver nothing
pub fn accept_all() -> Script {
    Arc::new(|request, _state| match request.method {
        triline_sip::Method::Register => {
            vec![Message::Response(answer(request, StatusCode::OK))]
        }
        triline_sip::Method::Subscribe => {
            vec![Message::Response(answer(request, StatusCode::ACCEPTED))]
        }
        triline_sip::Method::Invite => {
            vec![Message::Response(ok_with_sdp(request))]
        }
        triline_sip::Method::Refer => {
            vec![Message::Response(answer(request, StatusCode::ACCEPTED))]
        }
        triline_sip::Method::Bye | triline_sip::Method::Info => {
            vec![Message::Response(answer(request, StatusCode::OK))]
        }
        _ => Vec::new(),
    })
}
