//! BLF subscription engine against the scripted PBX: rejection,
//! synthetic Offline, retry recovery

mod support;

use std::sync::Arc;
use std::time::Duration;

use triline_core::events::PhoneEvent;
use triline_core::media::MockMediaEngine;
use triline_core::storage::{BlfButton, HostStorageExt, MemoryStorage};
use triline_core::BlfState;
use triline_sip::{Message, Method, StatusCode};

use support::{answer, notify_in_dialog, phone_with, spawn_pbx, wait_for};

const IDLE_DOC: &str =
    r#"<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="1" state="full" entity="sip:4002@example.net"></dialog-info>"#;

const CONFIRMED_DOC: &str = r#"<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="2" state="full" entity="sip:4001@example.net">
  <dialog id="d1"><state>confirmed</state>
    <remote><target uri="sip:2000@example.net"/></remote>
  </dialog>
</dialog-info>"#;

/// 404 the first SUBSCRIBE for 4001, accept everything afterwards;
/// accepted dialog subscriptions get an immediate NOTIFY.
fn blf_script() -> support::Script {
    Arc::new(|request, state| match request.method {
        Method::Register => vec![Message::Response(answer(request, StatusCode::OK))],
        Method::Subscribe => {
            let target = request
                .headers
                .to_addr()
                .ok()
                .and_then(|t| t.uri.user)
                .unwrap_or_default();
            match (request.headers.event_package(), target.as_str()) {
                (Some("dialog"), "4001") => {
                    let attempts = state.counts.entry("dialog-4001".to_string()).or_insert(0);
                    *attempts += 1;
                    if *attempts == 1 {
                        vec![Message::Response(answer(request, StatusCode::NOT_FOUND))]
                    } else {
                        vec![
                            Message::Response(answer(request, StatusCode::ACCEPTED)),
                            Message::Request(notify_in_dialog(
                                request,
                                "dialog",
                                "application/dialog-info+xml",
                                CONFIRMED_DOC,
                                1,
                            )),
                        ]
                    }
                }
                (Some("dialog"), _) => vec![
                    Message::Response(answer(request, StatusCode::ACCEPTED)),
                    Message::Request(notify_in_dialog(
                        request,
                        "dialog",
                        "application/dialog-info+xml",
                        IDLE_DOC,
                        1,
                    )),
                ],
                _ => vec![Message::Response(answer(request, StatusCode::ACCEPTED))],
            }
        }
        _ => Vec::new(),
    })
}

#[tokio::test]
async fn rejection_goes_offline_then_retry_recovers() {
    let pbx = spawn_pbx(blf_script()).await;

    let storage = Arc::new(MemoryStorage::new());
    storage.set_blf_buttons(&[
        BlfButton { extension: "4001".into(), display_name: "Support".into() },
        BlfButton { extension: "4002".into(), display_name: "Sales".into() },
    ]);

    let phone = phone_with(
        &pbx,
        Arc::new(MockMediaEngine::new()),
        storage,
        None,
        |c| c,
    );
    let mut events = phone.subscribe();
    phone.start().await.unwrap();

    // rejected extension renders inactive and lands in the retry set
    let offline = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::BlfStateChanged { extension, .. } if extension == "4001")
    })
    .await;
    assert_eq!(
        offline,
        PhoneEvent::BlfStateChanged {
            extension: "4001".into(),
            state: BlfState::Offline,
            remote_target: None,
        }
    );
    assert!(phone.blf_engine().is_in_retry_set("4001"));

    // the accepted extension reports idle from its empty dialog list
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::BlfSubscribed { extension } if extension == "4002")
    })
    .await;
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(
            e,
            PhoneEvent::BlfStateChanged {
                extension,
                state: BlfState::Terminated,
                ..
            } if extension == "4002"
        )
    })
    .await;
    assert!(!phone.blf_engine().is_in_retry_set("4002"));

    let snapshot = phone
        .blf_snapshot()
        .into_iter()
        .find(|e| e.extension == "4001")
        .unwrap();
    assert!(snapshot.rejected_once);
    assert_eq!(snapshot.rejection_status, Some(404));
    assert!(!snapshot.accepted_at_least_once);

    // a maintenance pass re-issues the SUBSCRIBE and the entry recovers
    phone.blf_engine().run_maintenance().await;

    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::BlfSubscribed { extension } if extension == "4001")
    })
    .await;
    let recovered = wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::BlfStateChanged { extension, .. } if extension == "4001")
    })
    .await;
    assert_eq!(
        recovered,
        PhoneEvent::BlfStateChanged {
            extension: "4001".into(),
            state: BlfState::Confirmed,
            remote_target: Some("sip:2000@example.net".into()),
        }
    );
    assert!(!phone.blf_engine().is_in_retry_set("4001"));

    // retry-set membership and acceptance stay mutually exclusive
    for entry in phone.blf_snapshot() {
        if entry.accepted_at_least_once {
            assert!(!phone.blf_engine().is_in_retry_set(&entry.extension));
        }
    }
}

#[tokio::test]
async fn unsubscribe_tears_down_and_notifies() {
    let pbx = spawn_pbx(blf_script()).await;
    let storage = Arc::new(MemoryStorage::new());
    storage.set_blf_buttons(&[BlfButton {
        extension: "4002".into(),
        display_name: "Sales".into(),
    }]);
    let phone = phone_with(
        &pbx,
        Arc::new(MockMediaEngine::new()),
        storage,
        None,
        |c| c,
    );
    let mut events = phone.subscribe();
    phone.start().await.unwrap();

    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::BlfSubscribed { .. })
    })
    .await;

    phone.blf_engine().unsubscribe("4002").await;
    wait_for(&mut events, Duration::from_secs(10), |e| {
        matches!(e, PhoneEvent::BlfUnsubscribed { extension } if extension == "4002")
    })
    .await;
    assert!(phone.blf_snapshot().is_empty());
}
