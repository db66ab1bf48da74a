//! Indicator priority end-to-end: agent + voicemail + call state

mod support;

use std::sync::Arc;
use std::time::Duration;

use triline_core::events::PhoneEvent;
use triline_core::indicator::MockLampDriver;
use triline_core::media::MockMediaEngine;
use triline_core::storage::MemoryStorage;
use triline_core::{IndicatorState, LampDriver};
use triline_sip::{Message, Method};

use support::{next_request, notify_in_dialog, phone_with, spawn_pbx, wait_for};

const SUMMARY_BODY: &str = "Messages-Waiting: yes\r\nMessage-Account: sip:1001@example.net\r\nVoice-Message: 2/8 (0/2)\r\n";

async fn next_indicator(
    events: &mut tokio::sync::broadcast::Receiver<PhoneEvent>,
) -> IndicatorState {
    match wait_for(events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::IndicatorStateChanged { .. })
    })
    .await
    {
        PhoneEvent::IndicatorStateChanged { state } => state,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn hold_outranks_voicemail_and_falls_back_after_hangup() {
    let mut pbx = spawn_pbx(support::accept_all()).await;
    let lamp = Arc::new(MockLampDriver::new());
    let phone = phone_with(
        &pbx,
        Arc::new(MockMediaEngine::new()),
        Arc::new(MemoryStorage::new()),
        Some(lamp.clone() as Arc<dyn LampDriver>),
        |c| c.with_busylight(2, 50),
    );
    let mut events = phone.subscribe();
    phone.start().await.unwrap();

    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::Registered { .. })
    })
    .await;
    assert_eq!(next_indicator(&mut events).await, IndicatorState::Registered);

    phone.set_agent_state(true, false);
    assert_eq!(next_indicator(&mut events).await, IndicatorState::Idle);

    // voicemail arrives over the message-summary subscription
    let mwi_subscribe = loop {
        let request = next_request(&mut pbx, Method::Subscribe).await;
        if request.headers.event_package() == Some("message-summary") {
            break request;
        }
    };
    pbx.inject
        .send(Message::Request(notify_in_dialog(
            &mwi_subscribe,
            "message-summary",
            "application/simple-message-summary",
            SUMMARY_BODY,
            1,
        )))
        .unwrap();

    let voicemail = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::VoicemailChanged { .. })
    })
    .await;
    assert_eq!(
        voicemail,
        PhoneEvent::VoicemailChanged { waiting: true, new_messages: 2, old_messages: 8 }
    );
    assert_eq!(
        next_indicator(&mut events).await,
        IndicatorState::IdleWithVoicemail
    );

    // an established call shows Active, held shows Hold - both outrank
    // the waiting voicemail
    let id = phone.dial("4001").await.unwrap();
    assert_eq!(next_indicator(&mut events).await, IndicatorState::Active);

    phone.hold(&id, true).await.unwrap();
    assert_eq!(next_indicator(&mut events).await, IndicatorState::Hold);

    phone.hold(&id, false).await.unwrap();
    assert_eq!(next_indicator(&mut events).await, IndicatorState::Active);

    phone.hang_up(Some(id)).await.unwrap();
    assert_eq!(
        next_indicator(&mut events).await,
        IndicatorState::IdleWithVoicemail
    );
    assert_eq!(
        phone.indicator_state(),
        Some(IndicatorState::IdleWithVoicemail)
    );

    // the lamp actually saw commands
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!lamp.recorded().is_empty());
}
