// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Session lifecycle and exchange log
//!
//! Sessions are owned exclusively by the [`SessionStore`]; callers get
//! cloned snapshots and route every mutation back through the store,
//! which validates state transitions and assigns exchange sequence
//! numbers. Events are dispatched after the store lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use scp81_ota_codec::StatusWord;

use crate::events::{EventBus, SessionEvent};

/// Session identifier (fresh 128-bit random per session)
pub type SessionId = Uuid;

/// Session lifecycle states.
///
/// Transitions follow `Handshaking -> Connected -> Active -> Closed`,
/// with `Closed` reachable from every pre-terminal state and terminal.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Handshaking,
    Connected,
    Active,
    Closed,
}

impl SessionState {
    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, next),
            (Handshaking, Connected) | (Connected, Active) | (Handshaking | Connected | Active, Closed)
        )
    }
}

/// Why a session ended
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Clean protocol completion (204 sent)
    Normal,
    /// Idle timeout enforced by the background sweep
    Timeout,
    /// Peer vanished mid-session
    ConnectionInterrupted,
    /// Explicit close requested through the API
    ClientRequested,
    /// Server drain on shutdown
    ServerShutdown,
    /// TLS handshake never completed
    HandshakeFailed,
    /// Malformed request from the client
    ProtocolError,
}

/// One command/response round trip, append-only within a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduExchange {
    /// 1-based position in the session's exchange log
    pub sequence_no: u32,
    pub command_hex: String,
    pub command_label: Option<String>,
    pub response_hex: String,
    pub sw: StatusWord,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Exchange data as recorded by the driver; the store assigns the
/// sequence number and timestamp
#[derive(Clone, Debug)]
pub struct ExchangeRecord {
    pub command_hex: String,
    pub command_label: Option<String>,
    pub response_hex: String,
    pub sw: StatusWord,
    pub latency_ms: u64,
}

/// Negotiated TLS parameters for a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSessionInfo {
    pub cipher_suite: String,
    pub psk_identity: String,
    pub protocol_version: String,
    pub handshake_ms: u64,
    pub client_endpoint: String,
}

impl TlsSessionInfo {
    pub fn new(
        cipher_suite: impl Into<String>,
        psk_identity: impl Into<String>,
        handshake_ms: u64,
        client_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            cipher_suite: cipher_suite.into(),
            psk_identity: psk_identity.into(),
            protocol_version: "TLSv1.2".to_string(),
            handshake_ms,
            client_endpoint: client_endpoint.into(),
        }
    }
}

/// One OTA admin conversation from handshake to close
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub client_endpoint: String,
    pub created_at: DateTime<Utc>,
    pub tls_info: Option<TlsSessionInfo>,
    pub psk_identity: Option<String>,
    pub exchanges: Vec<ApduExchange>,
    pub close_reason: Option<CloseReason>,
    pub metadata: HashMap<String, String>,

    started: Instant,
    last_activity: Instant,
}

impl Session {
    fn new(client_endpoint: String, metadata: HashMap<String, String>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Handshaking,
            client_endpoint,
            created_at: Utc::now(),
            tls_info: None,
            psk_identity: None,
            exchanges: Vec::new(),
            close_reason: None,
            metadata,
            started: now,
            last_activity: now,
        }
    }

    /// Number of exchanges recorded so far
    pub fn command_count(&self) -> usize {
        self.exchanges.len()
    }

    /// Time since session creation
    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since the last mutation
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Whether the card identity attached to this session matches
    /// `identity` (PSK identity or metadata identity fields), returning
    /// the matching attribute name
    pub fn matches_identity(&self, identity: &str) -> Option<&'static str> {
        if self.psk_identity.as_deref() == Some(identity) {
            return Some("psk_identity");
        }
        for key in ["iccid", "imsi", "card_identity"] {
            if self.metadata.get(key).map(String::as_str) == Some(identity) {
                return Some(match key {
                    "iccid" => "iccid",
                    "imsi" => "imsi",
                    _ => "card_identity",
                });
            }
        }
        None
    }

    fn touch(&mut self) {
        // Instant is monotone, so last_activity never moves backwards
        self.last_activity = Instant::now();
    }
}

/// Session store errors
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("session {0} is closed")]
    SessionClosed(SessionId),
}

/// Session store tuning
#[derive(Copy, Clone, Debug)]
pub struct SessionStoreConfig {
    /// Idle time after which a session is force-closed
    pub session_timeout: Duration,
    /// Background sweep interval
    pub cleanup_interval: Duration,
    /// Retention of closed sessions before purge
    pub closed_max_age: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
            closed_max_age: Duration::from_secs(3600),
        }
    }
}

/// Owner of all sessions.
///
/// Cheap to clone; clones share the same session map.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
    bus: EventBus,
    config: SessionStoreConfig,
}

impl SessionStore {
    pub fn new(bus: EventBus, config: SessionStoreConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            bus,
            config,
        }
    }

    /// Create a session in `Handshaking` state, returning a snapshot
    pub fn create_session(
        &self,
        client_endpoint: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Session {
        let session = Session::new(client_endpoint.into(), metadata);
        let snapshot = session.clone();

        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session);

        info!(
            "session created: id={}, client={}",
            snapshot.id, snapshot.client_endpoint
        );

        self.bus.publish_session(SessionEvent::Started {
            id: snapshot.id,
            client_endpoint: snapshot.client_endpoint.clone(),
        });

        snapshot
    }

    /// Fetch a snapshot of a session
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Advance a session's state.
    ///
    /// Transitions must advance: moving to the current state is an
    /// error, as is anything outside the state DAG.
    pub fn set_state(&self, id: SessionId, new_state: SessionState) -> Result<(), SessionError> {
        let event = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;

            let old_state = session.state;
            if !old_state.can_transition_to(new_state) {
                return Err(SessionError::InvalidStateTransition {
                    from: old_state,
                    to: new_state,
                });
            }

            session.state = new_state;
            session.touch();

            debug!("session state changed: id={id}, {old_state} -> {new_state}");

            SessionEvent::StateChanged {
                id,
                from: old_state,
                to: new_state,
            }
        };

        self.bus.publish_session(event);
        Ok(())
    }

    /// Attach negotiated TLS parameters (also records the PSK identity)
    pub fn set_tls_info(&self, id: SessionId, info: TlsSessionInfo) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;

        session.psk_identity = Some(info.psk_identity.clone());
        session.tls_info = Some(info);
        session.touch();
        Ok(())
    }

    /// Set one metadata entry
    pub fn set_metadata(
        &self,
        id: SessionId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;

        session.metadata.insert(key.into(), value.into());
        session.touch();
        Ok(())
    }

    /// Append an exchange, assigning the next sequence number.
    ///
    /// Fails on closed sessions; there is no rollback, a failed APDU
    /// write is still recorded with whatever status was observed.
    pub fn record_exchange(
        &self,
        id: SessionId,
        record: ExchangeRecord,
    ) -> Result<u32, SessionError> {
        let (event, sequence_no) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;

            if session.state == SessionState::Closed {
                return Err(SessionError::SessionClosed(id));
            }

            let sequence_no = session.exchanges.len() as u32 + 1;
            let sw = record.sw;

            session.exchanges.push(ApduExchange {
                sequence_no,
                command_hex: record.command_hex,
                command_label: record.command_label,
                response_hex: record.response_hex,
                sw: record.sw,
                latency_ms: record.latency_ms,
                timestamp: Utc::now(),
            });
            session.touch();

            debug!(
                "exchange recorded: session={id}, seq={sequence_no}, sw={sw}",
            );

            (
                SessionEvent::ExchangeRecorded {
                    id,
                    sequence_no,
                    sw,
                },
                sequence_no,
            )
        };

        self.bus.publish_session(event);
        Ok(sequence_no)
    }

    /// Close a session.
    ///
    /// Closing an already-closed session is a no-op returning the
    /// existing record.
    pub fn close(&self, id: SessionId, reason: CloseReason) -> Result<Session, SessionError> {
        let (snapshot, event) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;

            match close_in_place(session, reason) {
                Some(event) => (session.clone(), Some(event)),
                None => (session.clone(), None),
            }
        };

        if let Some(event) = event {
            self.bus.publish_session(event);
        }
        Ok(snapshot)
    }

    /// Snapshots of all non-closed sessions
    pub fn active_sessions(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state != SessionState::Closed)
            .cloned()
            .collect()
    }

    /// Snapshots of every session still in memory
    pub fn all_sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Number of non-closed sessions
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state != SessionState::Closed)
            .count()
    }

    /// Force-close sessions idle beyond the configured timeout
    pub fn cleanup_expired(&self) -> usize {
        let events = {
            let mut sessions = self.sessions.lock().unwrap();
            let mut events = Vec::new();

            for session in sessions.values_mut() {
                if session.state == SessionState::Closed {
                    continue;
                }
                if session.idle_for() > self.config.session_timeout {
                    warn!(
                        "session expired: id={}, idle={:.1}s",
                        session.id,
                        session.idle_for().as_secs_f64()
                    );
                    events.extend(close_in_place(session, CloseReason::Timeout));
                }
            }
            events
        };

        let count = events.len();
        for event in events {
            self.bus.publish_session(event);
        }

        if count > 0 {
            info!("cleaned up {count} expired sessions");
        }
        count
    }

    /// Drop closed sessions older than `max_age` from memory
    pub fn purge_closed(&self, max_age: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();

        sessions.retain(|_, s| s.state != SessionState::Closed || s.idle_for() <= max_age);

        let purged = before - sessions.len();
        if purged > 0 {
            debug!("purged {purged} closed sessions");
        }
        purged
    }

    /// Close every non-closed session (server drain)
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let events = {
            let mut sessions = self.sessions.lock().unwrap();
            let mut events = Vec::new();
            for session in sessions.values_mut() {
                events.extend(close_in_place(session, reason));
            }
            events
        };

        let count = events.len();
        for event in events {
            self.bus.publish_session(event);
        }
        count
    }

    /// Spawn the background sweep closing idle sessions and purging old
    /// closed ones until `shutdown` flips
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.clone();

        info!(
            "session sweeper started (timeout={:?}, interval={:?})",
            store.config.session_timeout, store.config.cleanup_interval
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.cleanup_interval);
            // The first tick fires immediately; skip it
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        store.cleanup_expired();
                        store.purge_closed(store.config.closed_max_age);
                    }
                    _ = shutdown.changed() => {
                        debug!("session sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}

/// Close a session under the store lock, returning the event to emit
/// afterwards (None when the session was already closed)
fn close_in_place(session: &mut Session, reason: CloseReason) -> Option<SessionEvent> {
    if session.state == SessionState::Closed {
        return None;
    }

    let previous_state = session.state;
    session.state = SessionState::Closed;
    session.close_reason = Some(reason);
    session.touch();

    info!(
        "session closed: id={}, reason={}, duration={:.1}s, commands={}",
        session.id,
        reason,
        session.duration().as_secs_f64(),
        session.command_count()
    );

    Some(SessionEvent::Ended {
        id: session.id,
        reason,
        previous_state,
        duration: session.duration(),
        command_count: session.command_count(),
    })
}
