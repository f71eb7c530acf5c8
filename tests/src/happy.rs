// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Happy-path session: authenticate, run one script, clean close

use std::time::Duration;

use scp81_ota_codec::StatusWord;
use scp81_ota_core::events::ScriptEvent;
use scp81_ota_core::session::CloseReason;
use scp81_ota_sim::{always_ok, CardClient, CardOptions};

use crate::helpers::{self, TestServer, TEST_IDENTITY, TEST_KEY_HEX};

/// Full single-command dialog against a running server
pub async fn test(server: &TestServer) -> anyhow::Result<()> {
    let mut script_events = server.bus.subscribe_scripts();

    // Connect as a known card and play the whole dialog
    let options = CardOptions::new(TEST_IDENTITY, hex::decode(TEST_KEY_HEX)?);
    let mut card = CardClient::connect(&server.addr, options).await?;

    let stats = card.run_dialog(always_ok).await?;
    assert_eq!(stats.commands, 1);
    assert_eq!(stats.responses, 1);

    // Session ends closed, reason normal, exactly one exchange
    let session = server
        .wait_for_closed_session(Duration::from_secs(2))
        .await;

    assert_eq!(session.close_reason, Some(CloseReason::Normal));
    assert_eq!(session.command_count(), 1);
    assert_eq!(session.exchanges[0].sequence_no, 1);
    assert_eq!(session.exchanges[0].sw, StatusWord(0x9000));
    assert_eq!(
        session.exchanges[0].command_hex,
        "00A4040007A000000151000000"
    );
    assert_eq!(session.psk_identity.as_deref(), Some(TEST_IDENTITY));
    assert_eq!(
        session.tls_info.as_ref().map(|t| t.protocol_version.as_str()),
        Some("TLSv1.2")
    );

    // The run completed and said so
    let mut saw_completed = false;
    while let Ok(event) = script_events.try_recv() {
        // Key material never appears in any emitted event
        let rendered = format!("{event:?}");
        assert!(!rendered.contains(TEST_KEY_HEX));

        if let ScriptEvent::RunCompleted { summary, .. } = event {
            assert_eq!(summary.total_commands, 1);
            assert_eq!(summary.successes, 1);
            assert_eq!(summary.first_failure, None);
            saw_completed = true;
        }
    }
    assert!(saw_completed, "missing RunCompleted event");

    Ok(())
}

/// Convenience wrapper starting its own server
pub async fn run() -> anyhow::Result<()> {
    let server = helpers::start_server(helpers::select_isd_script(), |_| {}).await?;
    let result = test(&server).await;
    server.stop().await;
    result
}
