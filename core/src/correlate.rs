// Copyright (c) 2022-2023 The MobileCoin Foundation

//! BIP / session correlation
//!
//! External monitors publish [`BipEvent`]s onto the bus; the correlator
//! buffers them for a retention window and joins them to live sessions
//! by declared card identity. The task owns its buffer outright and
//! communicates only through channels.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::events::{BipEvent, EventBus};
use crate::session::{SessionId, SessionStore};

/// Correlator tuning
#[derive(Copy, Clone, Debug)]
pub struct CorrelatorConfig {
    /// How long unmatched BIP events are retained before being dropped
    pub retention: Duration,
    /// Re-join attempt interval for buffered events
    pub sweep_interval: Duration,
    /// Output channel depth
    pub output_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            output_capacity: 256,
        }
    }
}

/// A BIP event joined to the session it belongs to
#[derive(Clone, Debug)]
pub struct CorrelatedEvent {
    pub session_id: SessionId,
    pub bip_event: BipEvent,
    /// Session attribute the join matched on
    pub matched_by: &'static str,
}

/// Spawn the correlator task.
///
/// Returns the task handle and the stream of correlated output. The
/// task runs until `shutdown` flips or the bus is dropped.
pub fn spawn(
    bus: &EventBus,
    store: SessionStore,
    config: CorrelatorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> (JoinHandle<()>, mpsc::Receiver<CorrelatedEvent>) {
    let mut bip_rx = bus.subscribe_bip();
    let (out_tx, out_rx) = mpsc::channel(config.output_capacity);

    let handle = tokio::spawn(async move {
        let mut buffer: VecDeque<(Instant, BipEvent)> = VecDeque::new();
        let mut sweep = tokio::time::interval(config.sweep_interval);

        loop {
            tokio::select! {
                received = bip_rx.recv() => {
                    match received {
                        Ok(event) => {
                            buffer.push_back((Instant::now(), event));
                            drain(&mut buffer, &store, &out_tx, config.retention).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("correlator lagged, dropped {n} BIP events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = sweep.tick() => {
                    drain(&mut buffer, &store, &out_tx, config.retention).await;
                }
                _ = shutdown.changed() => {
                    debug!("correlator stopping with {} buffered events", buffer.len());
                    break;
                }
            }
        }
    });

    (handle, out_rx)
}

/// Try to join every buffered event; drop the ones past retention
async fn drain(
    buffer: &mut VecDeque<(Instant, BipEvent)>,
    store: &SessionStore,
    out: &mpsc::Sender<CorrelatedEvent>,
    retention: Duration,
) {
    let sessions = store.all_sessions();
    let mut remaining = VecDeque::with_capacity(buffer.len());

    while let Some((at, event)) = buffer.pop_front() {
        if at.elapsed() > retention {
            trace!("dropping unmatched BIP event: {:?}", event.kind);
            continue;
        }

        let matched = event.session_identity.as_deref().and_then(|identity| {
            sessions
                .iter()
                .find_map(|s| s.matches_identity(identity).map(|by| (s.id, by)))
        });

        match matched {
            Some((session_id, matched_by)) => {
                debug!(
                    "correlated BIP {:?} to session {session_id} via {matched_by}",
                    event.kind
                );

                // Best effort: a full or closed consumer drops output
                let _ = out
                    .try_send(CorrelatedEvent {
                        session_id,
                        bip_event: event,
                        matched_by,
                    });
            }
            None => remaining.push_back((at, event)),
        }
    }

    *buffer = remaining;
}
