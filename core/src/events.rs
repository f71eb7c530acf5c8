// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Typed in-process event bus
//!
//! One broadcast channel per event family. Delivery is best-effort: a
//! slow subscriber lags and eventually drops messages without stalling
//! publishers or other subscribers. Order within a channel follows
//! emission order.
//!
//! Subscriber callbacks must not publish back into the bus from within
//! a synchronous receive loop holding other engine locks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tokio::sync::broadcast;

use scp81_ota_codec::StatusWord;

use crate::session::{CloseReason, SessionId, SessionState};

/// Default per-channel buffer depth
const DEFAULT_CAPACITY: usize = 256;

/// Session lifecycle events
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Started {
        id: SessionId,
        client_endpoint: String,
    },
    StateChanged {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
    ExchangeRecorded {
        id: SessionId,
        sequence_no: u32,
        sw: StatusWord,
    },
    Ended {
        id: SessionId,
        reason: CloseReason,
        previous_state: SessionState,
        duration: Duration,
        command_count: usize,
    },
}

/// Security-relevant events
#[derive(Clone, Debug)]
pub enum SecurityEvent {
    /// A client presented an unknown identity or wrong key
    PskMismatch {
        identity: String,
        client_endpoint: String,
        repeated: bool,
    },
    /// Mismatch threshold exceeded for one client IP
    PskRepeatedMismatch {
        client_ip: String,
        count: usize,
        window: Duration,
    },
    /// An error kind exceeded its rate window
    HighErrorRate {
        kind: ErrorKind,
        count: usize,
        window: Duration,
        threshold: usize,
    },
    /// TLS handshake failed for a reason other than PSK lookup
    HandshakeFailed {
        client_endpoint: String,
        alert: u8,
        reason: String,
    },
}

/// Tracked error kinds for rate windows
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PskMismatch,
    ConnectionInterrupted,
    HandshakeFailed,
}

/// Script lifecycle events
#[derive(Clone, Debug)]
pub enum ScriptEvent {
    Loaded {
        id: String,
    },
    Rendered {
        template_id: String,
        script_id: String,
    },
    RunStarted {
        script_id: String,
        session_id: SessionId,
    },
    RunCompleted {
        script_id: String,
        session_id: SessionId,
        summary: RunSummary,
    },
}

/// Outcome of one script run against a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total_commands: usize,
    pub successes: usize,
    pub retries: usize,
    /// Index and status word of the first non-success response
    pub first_failure: Option<(usize, StatusWord)>,
    pub duration: Duration,
}

/// Kinds of BIP activity observed on the device side
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum BipEventKind {
    OpenChannel,
    CloseChannel,
    SendData,
    ReceiveData,
    GetChannelStatus,
    DataAvailable,
    ChannelStatus,
    Other,
}

/// A BIP event produced by an external device-side monitor.
///
/// Parsing is the producer's concern; the correlator accepts whatever
/// it receives and joins on `session_identity`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BipEvent {
    pub kind: BipEventKind,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_length: Option<usize>,

    /// Raw proactive-command hex as captured
    pub raw_hex: String,

    /// Identity the producer attributes this activity to (PSK identity
    /// or ICCID), used for the session join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_identity: Option<String>,
}

impl BipEvent {
    /// Create a minimal event from kind and raw capture
    pub fn new(kind: BipEventKind, raw_hex: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            channel_id: None,
            address: None,
            port: None,
            bearer_type: None,
            data_length: None,
            raw_hex: raw_hex.into(),
            session_identity: None,
        }
    }

    /// Attribute the event to a card identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.session_identity = Some(identity.into());
        self
    }
}

/// The shared event bus.
///
/// Cheap to clone; all clones publish into the same channels.
#[derive(Clone)]
pub struct EventBus {
    sessions: broadcast::Sender<SessionEvent>,
    security: broadcast::Sender<SecurityEvent>,
    scripts: broadcast::Sender<ScriptEvent>,
    bip: broadcast::Sender<BipEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given per-channel buffer depth
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: broadcast::channel(capacity).0,
            security: broadcast::channel(capacity).0,
            scripts: broadcast::channel(capacity).0,
            bip: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }

    pub fn subscribe_security(&self) -> broadcast::Receiver<SecurityEvent> {
        self.security.subscribe()
    }

    pub fn subscribe_scripts(&self) -> broadcast::Receiver<ScriptEvent> {
        self.scripts.subscribe()
    }

    pub fn subscribe_bip(&self) -> broadcast::Receiver<BipEvent> {
        self.bip.subscribe()
    }

    // A publish with no subscribers is not an error

    pub fn publish_session(&self, event: SessionEvent) {
        let _ = self.sessions.send(event);
    }

    pub fn publish_security(&self, event: SecurityEvent) {
        let _ = self.security.send(event);
    }

    pub fn publish_script(&self, event: ScriptEvent) {
        let _ = self.scripts.send(event);
    }

    pub fn publish_bip(&self, event: BipEvent) {
        let _ = self.bip.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_order_preserved() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_bip();

        for i in 0..10u8 {
            bus.publish_bip(BipEvent::new(BipEventKind::SendData, format!("{i:02X}")));
        }

        for i in 0..10u8 {
            let evt = rx.recv().await.unwrap();
            assert_eq!(evt.raw_hex, format!("{i:02X}"));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_bip();
        let mut live = bus.subscribe_bip();

        // Overrun the slow subscriber's buffer
        for i in 0..16u8 {
            bus.publish_bip(BipEvent::new(BipEventKind::SendData, format!("{i:02X}")));
        }

        // Both subscribers observe the overrun rather than blocking the
        // publisher, then catch up with the retained tail
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        let mut last = None;
        loop {
            match tokio::time::timeout(Duration::from_millis(10), live.recv()).await {
                Ok(Ok(evt)) => last = Some(evt.raw_hex),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                _ => break,
            }
        }
        assert_eq!(last.as_deref(), Some("0F"));
    }

    #[tokio::test]
    async fn publish_without_subscribers() {
        let bus = EventBus::default();
        // Must not error or panic
        bus.publish_security(SecurityEvent::PskMismatch {
            identity: "ghost".to_string(),
            client_endpoint: "127.0.0.1:1".to_string(),
            repeated: false,
        });
    }
}
