// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Accept loop and composition root for the admin server
//!
//! Each accepted connection becomes an independent task: session
//! creation, TLS handshake, protocol loop, close. Shutdown drains:
//! accepting stops, open sessions are closed with `ServerShutdown`, and
//! connection tasks get a bounded join.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use scp81_ota_core::config::ServerConfig;
use scp81_ota_core::correlate::{self, CorrelatedEvent, CorrelatorConfig};
use scp81_ota_core::errors::ErrorEngine;
use scp81_ota_core::events::{EventBus, SecurityEvent};
use scp81_ota_core::keys::KeyStore;
use scp81_ota_core::script::Script;
use scp81_ota_core::session::{CloseReason, Session, SessionState, SessionStore};

use crate::driver::{AdminDriver, DriverConfig};
use crate::runner::{RunnerPolicy, ScriptRunner};
use crate::tls::{TlsAcceptor, TlsError};

/// Server-level errors (all fatal at startup)
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("no script available for sessions")]
    NoScript,
}

/// Selects the script a freshly connected session will run
pub trait ScriptSource: Send + Sync {
    /// Script for the given session, or None to end the session
    /// immediately after the initial POST
    fn script_for_session(&self, session: &Session) -> Option<Script>;
}

/// Serves the same script to every session
pub struct FixedScriptSource(pub Script);

impl ScriptSource for FixedScriptSource {
    fn script_for_session(&self, _session: &Session) -> Option<Script> {
        Some(self.0.clone())
    }
}

/// Serves scripts selected by PSK identity, with an optional fallback
pub struct MapScriptSource {
    by_identity: HashMap<String, Script>,
    fallback: Option<Script>,
}

impl MapScriptSource {
    pub fn new(by_identity: HashMap<String, Script>, fallback: Option<Script>) -> Self {
        Self {
            by_identity,
            fallback,
        }
    }
}

impl ScriptSource for MapScriptSource {
    fn script_for_session(&self, session: &Session) -> Option<Script> {
        session
            .psk_identity
            .as_ref()
            .and_then(|id| self.by_identity.get(id))
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// The PSK-TLS admin server
pub struct AdminServer {
    config: ServerConfig,
    listener: TcpListener,
    bus: EventBus,
    store: SessionStore,
    errors: Arc<ErrorEngine>,
    acceptor: Arc<TlsAcceptor>,
    scripts: Arc<dyn ScriptSource>,
    policy: RunnerPolicy,
}

impl AdminServer {
    /// Bind the listen socket and assemble the engine.
    ///
    /// Fails fast on bind errors and invalid cipher configuration.
    pub async fn bind(
        config: ServerConfig,
        key_store: Arc<dyn KeyStore>,
        scripts: Arc<dyn ScriptSource>,
        policy: RunnerPolicy,
        bus: EventBus,
    ) -> Result<Self, ServerError> {
        let endpoint = config.bind_endpoint();

        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|source| ServerError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;

        let acceptor = Arc::new(TlsAcceptor::new(
            key_store,
            config.ciphers,
            config.handshake_timeout(),
        )?);

        let store = SessionStore::new(bus.clone(), config.session_store_config());
        let errors = Arc::new(ErrorEngine::new(bus.clone(), config.error_engine_config()));

        info!("admin server listening on {endpoint}");

        Ok(Self {
            config,
            listener,
            bus,
            store,
            errors,
            acceptor,
            scripts,
            policy,
        })
    }

    /// Bound local address (useful when binding port 0)
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared session store handle
    pub fn store(&self) -> SessionStore {
        self.store.clone()
    }

    /// Shared event bus handle
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Run until `shutdown` flips, then drain.
    ///
    /// Also spawns the session sweeper and the BIP correlator; the
    /// correlated output stream is handed back through `correlated_out`.
    pub async fn run(
        self,
        shutdown: watch::Receiver<bool>,
        correlated_out: Option<tokio::sync::mpsc::Sender<CorrelatedEvent>>,
    ) {
        let sweeper = self.store.spawn_sweeper(shutdown.clone());

        let correlator = {
            let config = CorrelatorConfig {
                retention: std::time::Duration::from_secs(self.config.correlator_retention_secs),
                ..Default::default()
            };
            let (handle, mut rx) =
                correlate::spawn(&self.bus, self.store.clone(), config, shutdown.clone());

            // Forward correlated events to the consumer, if any
            let forward = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match &correlated_out {
                        Some(out) => {
                            let _ = out.send(event).await;
                        }
                        None => debug!(
                            "correlated BIP {:?} -> session {}",
                            event.bip_event.kind, event.session_id
                        ),
                    }
                }
            });

            (handle, forward)
        };

        let mut tasks = JoinSet::new();
        let mut shutdown_accept = shutdown.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = ConnectionContext {
                                store: self.store.clone(),
                                bus: self.bus.clone(),
                                errors: self.errors.clone(),
                                acceptor: self.acceptor.clone(),
                                scripts: self.scripts.clone(),
                                policy: self.policy,
                                driver_config: DriverConfig {
                                    admin_path: self.config.admin_path.clone(),
                                    request_timeout: self.config.request_timeout(),
                                },
                            };

                            tasks.spawn(async move {
                                handle_connection(ctx, stream, peer.to_string()).await;
                            });
                        }
                        Err(e) => {
                            // Transient accept failures are not fatal
                            warn!("accept failed: {e}");
                        }
                    }
                }
                _ = shutdown_accept.changed() => {
                    info!("shutdown requested, draining sessions");
                    break;
                }
            }
        }

        // Drain: close everything, then give connection tasks a
        // bounded window to unwind
        let closed = self.store.close_all(CloseReason::ServerShutdown);
        if closed > 0 {
            info!("closed {closed} sessions on shutdown");
        }

        let drain = self.config.drain_timeout();
        if tokio::time::timeout(drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("drain timeout after {drain:?}, aborting remaining connection tasks");
            tasks.abort_all();
        }

        let (correlator_handle, forward_handle) = correlator;
        correlator_handle.abort();
        forward_handle.abort();
        sweeper.abort();

        info!("admin server stopped");
    }
}

struct ConnectionContext {
    store: SessionStore,
    bus: EventBus,
    errors: Arc<ErrorEngine>,
    acceptor: Arc<TlsAcceptor>,
    scripts: Arc<dyn ScriptSource>,
    policy: RunnerPolicy,
    driver_config: DriverConfig,
}

/// One connection start to finish: session, handshake, dialog, close
async fn handle_connection(ctx: ConnectionContext, stream: TcpStream, peer: String) {
    debug!("connection from {peer}");

    let session = ctx.store.create_session(peer.clone(), HashMap::new());

    let (mut tls_stream, tls_info) = match ctx.acceptor.accept(stream, &peer).await {
        Ok(v) => v,
        Err(e) => {
            handle_handshake_failure(&ctx, &session, &peer, e);
            return;
        }
    };

    if ctx.store.set_tls_info(session.id, tls_info).is_err()
        || ctx
            .store
            .set_state(session.id, SessionState::Connected)
            .is_err()
    {
        // Session vanished under us (purge race); nothing to drive
        return;
    }

    // Re-fetch so the script source sees the PSK identity
    let script = ctx
        .store
        .get(session.id)
        .and_then(|s| ctx.scripts.script_for_session(&s));

    let script = match script {
        Some(s) => s,
        None => {
            warn!("no script for session {}, closing", session.id);
            let _ = ctx.store.close(session.id, CloseReason::Normal);
            return;
        }
    };

    let runner = ScriptRunner::new(
        script,
        session.id,
        ctx.store.clone(),
        ctx.bus.clone(),
        ctx.policy,
    );

    let driver = AdminDriver::new(ctx.store.clone(), ctx.errors.clone(), ctx.driver_config);
    let reason = driver.run_session(&mut tls_stream, session.id, runner).await;

    debug!("connection from {peer} finished: {reason}");
}

/// Classify a handshake failure, emit the matching events and close the
/// session
fn handle_handshake_failure(
    ctx: &ConnectionContext,
    session: &Session,
    peer: &str,
    error: TlsError,
) {
    let alert = error.alert();

    match &error {
        TlsError::UnknownIdentity { identity } => {
            // Unknown identity and wrong key both surface as mismatch
            ctx.errors.handle_psk_mismatch(identity, peer);
        }
        TlsError::Handshake { message, identity }
            if message.to_lowercase().contains("decrypt")
                || message.to_lowercase().contains("mac") =>
        {
            ctx.errors
                .handle_psk_mismatch(identity.as_deref().unwrap_or_default(), peer);
        }
        _ => {
            ctx.errors.handle_handshake_failed(peer, &error.to_string());
            ctx.bus.publish_security(SecurityEvent::HandshakeFailed {
                client_endpoint: peer.to_string(),
                alert: alert.code(),
                reason: error.to_string(),
            });
        }
    }

    warn!(
        "handshake failed for {peer}: {error} (alert {} {})",
        alert.code(),
        alert.description()
    );

    let _ = ctx.store.close(session.id, CloseReason::HandshakeFailed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp81_ota_core::script::ApduCommand;

    fn session_with_identity(store: &SessionStore, identity: Option<&str>) -> Session {
        let s = store.create_session("127.0.0.1:1", HashMap::new());
        if let Some(id) = identity {
            store
                .set_tls_info(
                    s.id,
                    scp81_ota_core::session::TlsSessionInfo::new(
                        "PSK-AES128-CBC-SHA256",
                        id,
                        1,
                        "127.0.0.1:1",
                    ),
                )
                .unwrap();
        }
        store.get(s.id).unwrap()
    }

    #[test]
    fn script_sources() {
        let bus = EventBus::default();
        let store = SessionStore::new(bus, Default::default());

        let select = Script::new("select", "Select", vec![ApduCommand::new("00A4040000")]);
        let status = Script::new("status", "Status", vec![ApduCommand::new("80F2200200")]);

        let fixed = FixedScriptSource(select.clone());
        let s = session_with_identity(&store, None);
        assert_eq!(fixed.script_for_session(&s).unwrap().id, "select");

        let map = MapScriptSource::new(
            HashMap::from([("card_001".to_string(), status.clone())]),
            Some(select.clone()),
        );

        let s = session_with_identity(&store, Some("card_001"));
        assert_eq!(map.script_for_session(&s).unwrap().id, "status");

        let s = session_with_identity(&store, Some("card_002"));
        assert_eq!(map.script_for_session(&s).unwrap().id, "select");

        let map = MapScriptSource::new(HashMap::new(), None);
        assert!(map.script_for_session(&s).is_none());
    }
}
