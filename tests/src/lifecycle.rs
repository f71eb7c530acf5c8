// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Session lifecycle under failure: idle timeout and mid-session reset

use std::time::Duration;

use scp81_ota_core::events::SessionEvent;
use scp81_ota_core::session::{CloseReason, ExchangeRecord};
use scp81_ota_codec::StatusWord;
use scp81_ota_sim::{CardClient, CardOptions};

use crate::helpers::{self, TEST_IDENTITY, TEST_KEY_HEX};

/// Card authenticates and takes the first command but never answers;
/// the sweep closes the session with reason Timeout
pub async fn idle_timeout() -> anyhow::Result<()> {
    let server = helpers::start_server(helpers::select_isd_script(), |config| {
        config.session_timeout_secs = 2;
        config.cleanup_interval_secs = 1;
    })
    .await?;
    let mut session_events = server.bus.subscribe_sessions();

    let options = CardOptions::new(TEST_IDENTITY, hex::decode(TEST_KEY_HEX)?);
    let mut card = CardClient::connect(&server.addr, options).await?;

    // Initial POST fetches the first command, then silence
    let response = card.post(&[]).await?;
    assert_eq!(response.status, 200);

    let session = server
        .wait_for_closed_session(Duration::from_secs(5))
        .await;
    assert_eq!(session.close_reason, Some(CloseReason::Timeout));

    // The Ended event carries a duration around the idle budget
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match tokio::time::timeout_at(deadline, session_events.recv()).await {
            Ok(Ok(SessionEvent::Ended {
                reason, duration, ..
            })) => {
                assert_eq!(reason, CloseReason::Timeout);
                assert!(
                    duration >= Duration::from_secs(2) && duration < Duration::from_secs(5),
                    "unexpected duration {duration:?}"
                );
                break;
            }
            Ok(Ok(_)) => continue,
            _ => panic!("missing Ended event"),
        }
    }

    drop(card);
    server.stop().await;
    Ok(())
}

/// Card resets the connection after the second POST; the session closes
/// interrupted and refuses further exchanges
pub async fn mid_session_reset() -> anyhow::Result<()> {
    use scp81_ota_core::script::{ApduCommand, Script};

    let script = Script::new(
        "two-step",
        "Two step",
        vec![
            ApduCommand::new("00A4040007A000000151000000"),
            ApduCommand::new("80CA9F7F00"),
        ],
    );

    let server = helpers::start_server(script, |_| {}).await?;

    let options = CardOptions::new(TEST_IDENTITY, hex::decode(TEST_KEY_HEX)?);
    let mut card = CardClient::connect(&server.addr, options).await?;

    // First round trip succeeds
    let response = card.post(&[]).await?;
    assert_eq!(response.status, 200);
    let response = card.post(&[0x90, 0x00]).await?;
    assert_eq!(response.status, 200);

    // Reset instead of answering the second command
    card.abort();

    let session = server
        .wait_for_closed_session(Duration::from_secs(3))
        .await;
    assert_eq!(
        session.close_reason,
        Some(CloseReason::ConnectionInterrupted)
    );
    assert_eq!(session.command_count(), 1);

    // The closed session refuses further recording
    let result = server.store.record_exchange(
        session.id,
        ExchangeRecord {
            command_hex: "80CA9F7F00".to_string(),
            command_label: None,
            response_hex: "9000".to_string(),
            sw: StatusWord(0x9000),
            latency_ms: 0,
        },
    );
    assert!(result.is_err());

    server.stop().await;
    Ok(())
}

/// Server shutdown drains active sessions with reason ServerShutdown
pub async fn shutdown_drain() -> anyhow::Result<()> {
    let server = helpers::start_server(helpers::select_isd_script(), |_| {}).await?;

    let options = CardOptions::new(TEST_IDENTITY, hex::decode(TEST_KEY_HEX)?);
    let mut card = CardClient::connect(&server.addr, options).await?;

    let response = card.post(&[]).await?;
    assert_eq!(response.status, 200);

    // Shut down while the session is mid-dialog
    let store = server.store.clone();
    server.stop().await;

    let session = store
        .all_sessions()
        .into_iter()
        .find(|s| s.command_count() == 0)
        .expect("session should survive in memory");
    assert_eq!(session.close_reason, Some(CloseReason::ServerShutdown));

    drop(card);
    Ok(())
}
