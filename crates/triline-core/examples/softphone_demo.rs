//! Minimal softphone host: register, watch events, place one call.
//!
//! ```bash
//! cargo run --example softphone_demo -- pbx.example.net 1001 secret example.net 2000
//! ```

use std::sync::Arc;

use triline_core::logging::{init_logging, LoggingConfig};
use triline_core::media::MockMediaEngine;
use triline_core::storage::MemoryStorage;
use triline_core::{Phone, PhoneConfig, PhoneEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&LoggingConfig::default())?;

    let mut args = std::env::args().skip(1);
    let server = args.next().unwrap_or_else(|| "pbx.example.net".into());
    let username = args.next().unwrap_or_else(|| "1001".into());
    let password = args.next().unwrap_or_default();
    let domain = args.next().unwrap_or_else(|| server.clone());
    let target = args.next().unwrap_or_else(|| "2000".into());

    let config = PhoneConfig::new(server, username, password, domain);
    let phone = Phone::new(
        config,
        Arc::new(MockMediaEngine::new()),
        Arc::new(MemoryStorage::new()),
        None,
    )?;

    let mut events = phone.subscribe();
    phone.start().await?;

    loop {
        let event = events.recv().await?;
        println!("[{}] {:?}", event.topic(), event);
        match event {
            PhoneEvent::Registered { re_register: false } => {
                let id = phone.dial(&target).await?;
                println!("dialing {} as session {}", target, id);
            }
            PhoneEvent::SessionAnswered { session } => {
                phone.send_dtmf_sequence(&session.id, "1#", None).await?;
                phone.hang_up(Some(session.id)).await?;
            }
            PhoneEvent::SessionTerminated { .. } => {
                phone.stop().await;
                return Ok(());
            }
            _ => {}
        }
    }
}
