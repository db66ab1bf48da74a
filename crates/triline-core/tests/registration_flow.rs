//! Registration lifecycle against the scripted PBX

mod support;

use std::sync::Arc;
use std::time::Duration;

use triline_core::events::PhoneEvent;
use triline_core::RegistrationState;
use triline_sip::{HeaderName, Message, Method, StatusCode};

use support::{answer, next_request, phone_for, spawn_pbx, wait_for};

#[tokio::test]
async fn fresh_registration_settles_and_publishes_once() {
    let mut pbx = spawn_pbx(support::accept_all()).await;
    let phone = phone_for(&pbx, |c| c);
    let mut events = phone.subscribe();

    let started = tokio::time::Instant::now();
    phone.start().await.unwrap();

    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::TransportConnected)
    })
    .await;

    let register = next_request(&mut pbx, Method::Register).await;
    // the auto-register waits out its settle delay after the connect
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(register.headers.expires(), Some(300));
    assert_eq!(register.headers.cseq().unwrap().1, Method::Register);
    assert!(register
        .headers
        .contact()
        .unwrap()
        .uri
        .param("transport")
        .is_some());

    let event = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::Registered { .. })
    })
    .await;
    assert_eq!(event, PhoneEvent::Registered { re_register: false });
    assert_eq!(phone.registration_state(), RegistrationState::Registered);
}

#[tokio::test]
async fn digest_challenge_is_answered_once() {
    let script: support::Script = Arc::new(|request, state| {
        if request.method != Method::Register {
            return vec![Message::Response(answer(request, StatusCode::ACCEPTED))];
        }
        if request.headers.get(&HeaderName::Authorization).is_none() {
            let mut challenge = answer(request, StatusCode::UNAUTHORIZED);
            challenge.headers.push(
                HeaderName::WwwAuthenticate,
                "Digest realm=\"example.net\", nonce=\"n1\", qop=\"auth\"".to_string(),
            );
            vec![Message::Response(challenge)]
        } else {
            let _ = state;
            vec![Message::Response(answer(request, StatusCode::OK))]
        }
    });

    let mut pbx = spawn_pbx(script).await;
    let phone = phone_for(&pbx, |c| c);
    let mut events = phone.subscribe();
    phone.start().await.unwrap();

    let first = next_request(&mut pbx, Method::Register).await;
    assert!(first.headers.get(&HeaderName::Authorization).is_none());

    let second = next_request(&mut pbx, Method::Register).await;
    let authorization = second.headers.get(&HeaderName::Authorization).unwrap();
    assert!(authorization.starts_with("Digest username=\"1001\""));
    assert!(authorization.contains("realm=\"example.net\""));

    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::Registered { .. })
    })
    .await;
}

#[tokio::test]
async fn not_found_fails_without_retry() {
    let script: support::Script = Arc::new(|request, _| {
        vec![Message::Response(answer(request, StatusCode::NOT_FOUND))]
    });
    let mut pbx = spawn_pbx(script).await;
    let phone = phone_for(&pbx, |c| c);
    let mut events = phone.subscribe();
    phone.start().await.unwrap();

    let event = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::RegistrationFailed { .. })
    })
    .await;
    match event {
        PhoneEvent::RegistrationFailed { status_code, .. } => {
            assert_eq!(status_code, Some(404));
        }
        _ => unreachable!(),
    }
    assert_eq!(phone.registration_state(), RegistrationState::Unregistered);

    // no second REGISTER shows up on its own
    next_request(&mut pbx, Method::Register).await;
    let extra = tokio::time::timeout(Duration::from_millis(500), pbx.received.recv()).await;
    assert!(extra.is_err(), "unexpected retry: {:?}", extra);
}

#[tokio::test]
async fn unregister_sends_zero_expiry_and_publishes() {
    let mut pbx = spawn_pbx(support::accept_all()).await;
    let phone = phone_for(&pbx, |c| c);
    let mut events = phone.subscribe();
    phone.start().await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::Registered { .. })
    })
    .await;
    let _initial = next_request(&mut pbx, Method::Register).await;

    phone.unregister(true).await;

    let unregister = next_request(&mut pbx, Method::Register).await;
    assert_eq!(unregister.headers.expires(), Some(0));
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::Unregistered)
    })
    .await;
    assert_eq!(phone.registration_state(), RegistrationState::Unregistered);
}
