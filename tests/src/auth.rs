// Copyright (c) 2022-2023 The MobileCoin Foundation

//! PSK authentication failures: unknown identity, repeated mismatch

use std::time::Duration;

use scp81_ota_core::events::SecurityEvent;
use scp81_ota_core::session::{CloseReason, SessionState};
use scp81_ota_sim::{CardClient, CardOptions};

use crate::helpers::{self, TEST_KEY_HEX};

/// Unknown identity: handshake refused, mismatch event, no dialog
pub async fn unknown_identity() -> anyhow::Result<()> {
    let server = helpers::start_server(helpers::select_isd_script(), |_| {}).await?;
    let mut security = server.bus.subscribe_security();

    let options = CardOptions::new("ghost", hex::decode(TEST_KEY_HEX)?);
    let result = CardClient::connect(&server.addr, options).await;
    assert!(result.is_err(), "handshake should fail for unknown identity");

    // The session never reached Connected and carries no exchanges
    let session = server
        .wait_for_closed_session(Duration::from_secs(2))
        .await;
    assert_eq!(session.close_reason, Some(CloseReason::HandshakeFailed));
    assert!(session.exchanges.is_empty());
    assert!(session.tls_info.is_none());
    assert!(server
        .store
        .all_sessions()
        .iter()
        .all(|s| s.state != SessionState::Connected && s.state != SessionState::Active));

    // Exactly one mismatch event for the ghost identity
    let event = tokio::time::timeout(Duration::from_secs(2), security.recv()).await??;
    match event {
        SecurityEvent::PskMismatch {
            identity, repeated, ..
        } => {
            assert_eq!(identity, "ghost");
            assert!(!repeated);
        }
        other => panic!("unexpected security event: {other:?}"),
    }

    server.stop().await;
    Ok(())
}

/// Three mismatches from one source inside the window trip the
/// repeated-mismatch warning
pub async fn repeated_mismatch() -> anyhow::Result<()> {
    let server = helpers::start_server(helpers::select_isd_script(), |config| {
        config.mismatch_window_secs = 60;
        config.mismatch_threshold = 3;
    })
    .await?;
    let mut security = server.bus.subscribe_security();

    for _ in 0..3 {
        let options = CardOptions::new("ghost", hex::decode(TEST_KEY_HEX)?);
        let result = CardClient::connect(&server.addr, options).await;
        assert!(result.is_err());
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut mismatches = 0;
    let mut saw_repeated = false;

    while mismatches < 3 || !saw_repeated {
        match tokio::time::timeout_at(deadline, security.recv()).await {
            Ok(Ok(SecurityEvent::PskMismatch { .. })) => mismatches += 1,
            Ok(Ok(SecurityEvent::PskRepeatedMismatch { count, .. })) => {
                assert!(count >= 3);
                saw_repeated = true;
            }
            Ok(Ok(_)) => (),
            _ => break,
        }
    }

    assert_eq!(mismatches, 3);
    assert!(saw_repeated, "missing PskRepeatedMismatch event");

    server.stop().await;
    Ok(())
}
