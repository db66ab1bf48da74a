//! Call lifecycle, line rules and DTMF against the scripted PBX

mod support;

use std::sync::Arc;
use std::time::Duration;

use triline_core::events::PhoneEvent;
use triline_core::media::MockMediaEngine;
use triline_core::storage::MemoryStorage;
use triline_core::{Direction, LineState, PhoneError, SessionState};
use triline_sip::{Message, Method, StatusCode};

use support::{incoming_invite, next_request, phone_for, phone_with, spawn_pbx, wait_for};

async fn registered_phone(
    pbx: &support::FakePbx,
) -> (
    Arc<triline_core::Phone>,
    tokio::sync::broadcast::Receiver<PhoneEvent>,
) {
    let phone = phone_for(pbx, |c| c);
    let mut events = phone.subscribe();
    phone.start().await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::Registered { .. })
    })
    .await;
    (phone, events)
}

#[tokio::test]
async fn outgoing_call_establishes_on_line_one() {
    let pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    let id = phone.dial("4001").await.unwrap();
    let answered = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { .. })
    })
    .await;
    match answered {
        PhoneEvent::SessionAnswered { session } => {
            assert_eq!(session.id, id);
            assert_eq!(session.line, 1);
            assert_eq!(session.direction, Direction::Outgoing);
            assert!(session.answered_at.is_some());
        }
        _ => unreachable!(),
    }
    assert_eq!(phone.selected_line(), Some(1));
    assert_eq!(phone.line_snapshot()[0].state, LineState::Active);
    assert_eq!(phone.call_stats().placed, 1);
    assert_eq!(phone.call_stats().answered, 1);
}

#[tokio::test]
async fn fourth_dial_is_all_lines_busy_with_no_sip() {
    let mut pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    for target in ["4001", "4002", "4003"] {
        let id = phone.dial(target).await.unwrap();
        wait_for(&mut events, Duration::from_secs(10), |e| {
            matches!(e, PhoneEvent::SessionAnswered { session } if session.id == id)
        })
        .await;
    }
    assert_eq!(phone.sessions().len(), 3);
    let slots_before = phone.line_snapshot();

    let result = phone.dial("2000").await;
    assert!(matches!(result, Err(PhoneError::AllLinesBusy)));
    assert_eq!(phone.line_snapshot(), slots_before);

    // drain everything the PBX saw; exactly three INVITEs, none for 2000
    let mut invites = 0;
    while let Ok(Some(request)) =
        tokio::time::timeout(Duration::from_millis(300), pbx.received.recv()).await
    {
        if request.method == Method::Invite {
            invites += 1;
            assert_ne!(request.uri.user.as_deref(), Some("2000"));
        }
    }
    assert_eq!(invites, 3);
}

#[tokio::test]
async fn incoming_call_rings_and_answers() {
    let pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    pbx.inject
        .send(Message::Request(incoming_invite("2000", "in-call-1")))
        .unwrap();

    let created = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionCreated { .. })
    })
    .await;
    let id = match created {
        PhoneEvent::SessionCreated { session } => {
            assert_eq!(session.direction, Direction::Incoming);
            assert_eq!(session.peer.display_name.as_deref(), Some("Caller"));
            assert_eq!(session.peer.dial_string, "2000");
            session.id
        }
        _ => unreachable!(),
    };
    assert_eq!(phone.line_snapshot()[0].state, LineState::Ringing);

    phone.answer(&id).await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { session } if session.id == id)
    })
    .await;
    assert_eq!(phone.line_snapshot()[0].state, LineState::Active);
    assert_eq!(phone.call_stats().received, 1);
}

#[tokio::test]
async fn incoming_with_all_slots_occupied_draws_one_486() {
    let mut pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    for target in ["4001", "4002", "4003"] {
        let id = phone.dial(target).await.unwrap();
        wait_for(&mut events, Duration::from_secs(10), |e| {
            matches!(e, PhoneEvent::SessionAnswered { session } if session.id == id)
        })
        .await;
    }

    pbx.inject
        .send(Message::Request(incoming_invite("2000", "overflow-1")))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let busy = loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("no 486 arrived");
        match tokio::time::timeout(remaining, pbx.client_responses.recv()).await {
            Ok(Some(response)) if response.status == StatusCode::BUSY_HERE => break response,
            Ok(Some(_)) => continue,
            other => panic!("response stream ended: {:?}", other),
        }
    };
    assert_eq!(busy.headers.call_id().unwrap(), "overflow-1");

    // no fourth session, no slot mutation
    assert_eq!(phone.sessions().len(), 3);
    assert!(phone
        .line_snapshot()
        .iter()
        .all(|slot| slot.state == LineState::Active));
}

#[tokio::test]
async fn call_waiting_keeps_selection() {
    let pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    let first = phone.dial("4001").await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { session } if session.id == first)
    })
    .await;
    assert_eq!(phone.selected_line(), Some(1));

    pbx.inject
        .send(Message::Request(incoming_invite("2000", "waiting-1")))
        .unwrap();

    let tone = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::CallWaitingTone { .. })
    })
    .await;
    match tone {
        PhoneEvent::CallWaitingTone { line, .. } => assert_eq!(line, 2),
        _ => unreachable!(),
    }
    assert_eq!(phone.selected_line(), Some(1));
}

#[tokio::test]
async fn switching_lines_holds_the_previous_call_first() {
    let pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    let first = phone.dial("4001").await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { session } if session.id == first)
    })
    .await;
    let second = phone.dial("4002").await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { session } if session.id == second)
    })
    .await;
    assert_eq!(phone.selected_line(), Some(1));

    let mut ordered = phone.subscribe();
    phone.select_line(2).await.unwrap();

    // sessionHeld on line 1's call comes before the lineChanged
    let first_event = wait_for(&mut ordered, Duration::from_secs(10), |e| {
        matches!(
            e,
            PhoneEvent::SessionHeld { .. } | PhoneEvent::LineChanged { .. }
        )
    })
    .await;
    assert_eq!(
        first_event,
        PhoneEvent::SessionHeld { id: first, on_hold: true }
    );
    let second_event = wait_for(&mut ordered, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::LineChanged { .. })
    })
    .await;
    assert_eq!(
        second_event,
        PhoneEvent::LineChanged { previous: Some(1), current: Some(2) }
    );

    let held = phone.session(&first).unwrap();
    assert!(held.on_hold);
    assert_eq!(held.state, SessionState::Established);
    let untouched = phone.session(&second).unwrap();
    assert!(!untouched.on_hold);
    assert_eq!(phone.line_snapshot()[0].state, LineState::Hold);
}

#[tokio::test]
async fn hold_then_unhold_is_observably_a_no_op() {
    let pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    let id = phone.dial("4001").await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { session } if session.id == id)
    })
    .await;
    let before = phone.session(&id).unwrap();

    phone.hold(&id, true).await.unwrap();
    assert!(phone.session(&id).unwrap().on_hold);
    phone.hold(&id, false).await.unwrap();

    let after = phone.session(&id).unwrap();
    assert!(!after.on_hold);
    assert_eq!(after.state, before.state);
    assert_eq!(after.muted, before.muted);
    assert_eq!(after.line, before.line);

    // re-holding an already-unheld call is idempotent
    phone.hold(&id, false).await.unwrap();
}

#[tokio::test]
async fn dtmf_sequence_emits_one_event_per_tone_in_order() {
    let pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    let id = phone.dial("4001").await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { session } if session.id == id)
    })
    .await;

    phone.send_dtmf_sequence(&id, "19#", None).await.unwrap();

    let mut tones = Vec::new();
    while tones.len() < 3 {
        if let PhoneEvent::DtmfSent { tone, .. } =
            wait_for(&mut events, Duration::from_secs(10), |e| {
                matches!(e, PhoneEvent::DtmfSent { .. })
            })
            .await
        {
            tones.push(tone);
        }
    }
    assert_eq!(tones, vec!['1', '9', '#']);

    assert!(matches!(
        phone.send_dtmf(&id, 'x').await,
        Err(PhoneError::InvalidDtmfTone { tone: 'x' })
    ));
}

#[tokio::test]
async fn dtmf_falls_back_to_info_without_a_tone_sender() {
    let mut pbx = spawn_pbx(support::accept_all()).await;
    let phone = phone_with(
        &pbx,
        Arc::new(MockMediaEngine::without_tone_injection()),
        Arc::new(MemoryStorage::new()),
        None,
        |c| c,
    );
    let mut events = phone.subscribe();
    phone.start().await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::Registered { .. })
    })
    .await;

    let id = phone.dial("4001").await.unwrap();
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionAnswered { session } if session.id == id)
    })
    .await;

    phone.send_dtmf(&id, '5').await.unwrap();
    let info = next_request(&mut pbx, Method::Info).await;
    assert_eq!(info.headers.content_type(), Some("application/dtmf-relay"));
    assert!(info.body.contains("Signal=5"));
}

#[tokio::test]
async fn rejecting_an_unanswered_call_sends_486() {
    let mut pbx = spawn_pbx(support::accept_all()).await;
    let (phone, mut events) = registered_phone(&pbx).await;

    pbx.inject
        .send(Message::Request(incoming_invite("2000", "reject-1")))
        .unwrap();
    let created = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionCreated { .. })
    })
    .await;
    let id = match created {
        PhoneEvent::SessionCreated { session } => session.id,
        _ => unreachable!(),
    };

    phone.hang_up(Some(id)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("no 486 arrived");
        match tokio::time::timeout(remaining, pbx.client_responses.recv()).await {
            Ok(Some(response)) if response.status == StatusCode::BUSY_HERE => break,
            Ok(Some(_)) => continue,
            other => panic!("response stream ended: {:?}", other),
        }
    }
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::SessionTerminated { .. })
    })
    .await;
    assert!(phone.sessions().is_empty());
    // a decline is not a missed call
    assert_eq!(phone.call_stats().missed, 0);
}
