// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Shared server fixtures for end-to-end scenarios

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use scp81_ota_core::config::{KeyStoreConfig, ServerConfig};
use scp81_ota_core::events::EventBus;
use scp81_ota_core::keys::{MemoryKeyStore, PskKey};
use scp81_ota_core::script::Script;
use scp81_ota_core::session::{Session, SessionState, SessionStore};
use scp81_ota_server::{AdminServer, FixedScriptSource, RunnerPolicy};

/// Marker key used by every scenario; asserted never to leak
pub const TEST_KEY_HEX: &str = "0123456789ABCDEF0123456789ABCDEF";

/// Default test identity
pub const TEST_IDENTITY: &str = "card_001";

/// A running admin server bound to an ephemeral port
pub struct TestServer {
    pub addr: String,
    pub store: SessionStore,
    pub bus: EventBus,
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

impl TestServer {
    /// Stop the server and wait for the drain
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// Poll until the only session reaches `Closed`, returning it
    pub async fn wait_for_closed_session(&self, within: Duration) -> Session {
        let deadline = tokio::time::Instant::now() + within;

        loop {
            if let Some(session) = self
                .store
                .all_sessions()
                .into_iter()
                .find(|s| s.state == SessionState::Closed)
            {
                return session;
            }

            assert!(
                tokio::time::Instant::now() < deadline,
                "no session closed within {within:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Start a server for one script with config adjustments applied on top
/// of test defaults
pub async fn start_server(
    script: Script,
    adjust: impl FnOnce(&mut ServerConfig),
) -> anyhow::Result<TestServer> {
    let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, Default::default());

    let mut config = ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        // Ephemeral port; resolved after bind
        port: 0,
        key_store: KeyStoreConfig::Memory,
        // Keep scenario runtimes short
        request_timeout_secs: 5,
        drain_timeout_secs: 1,
        ..Default::default()
    };
    adjust(&mut config);

    let keys = MemoryKeyStore::new();
    keys.add_key(TEST_IDENTITY, PskKey::from_hex(TEST_KEY_HEX).unwrap());

    let bus = EventBus::default();
    let server = AdminServer::bind(
        config,
        Arc::new(keys),
        Arc::new(FixedScriptSource(script)),
        RunnerPolicy::default(),
        bus.clone(),
    )
    .await?;

    let addr = server.local_addr()?.to_string();
    let store = server.store();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(shutdown_rx, None));

    Ok(TestServer {
        addr,
        store,
        bus,
        shutdown,
        handle,
    })
}

/// The canonical single-command test script
pub fn select_isd_script() -> Script {
    use scp81_ota_core::script::ApduCommand;

    Script::new(
        "select-isd",
        "Select ISD",
        vec![ApduCommand::new("00A4040007A000000151000000").named("SELECT ISD")],
    )
}
