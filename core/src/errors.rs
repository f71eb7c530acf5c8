// Copyright (c) 2022-2023 The MobileCoin Foundation

//! PSK mismatch tracking and error-rate windows
//!
//! Both trackers are sliding windows over `Instant`s, pruned on every
//! touch. They exist to spot brute-force attempts and systemic failure
//! bursts; nothing here ever sees key material.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::events::{ErrorKind, EventBus, SecurityEvent};

/// One recorded PSK mismatch
#[derive(Clone, Debug)]
pub struct MismatchRecord {
    pub identity: String,
    pub client_endpoint: String,
    pub at: Instant,
}

/// Sliding-window tracker of PSK mismatches per client IP
pub struct MismatchTracker {
    window: Duration,
    threshold: usize,
    records: Mutex<HashMap<String, Vec<MismatchRecord>>>,
}

impl MismatchTracker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record a mismatch, returning true when the per-IP count within
    /// the window has reached the threshold
    pub fn record_mismatch(&self, identity: &str, client_endpoint: &str) -> bool {
        let client_ip = strip_port(client_endpoint).to_string();

        let mut records = self.records.lock().unwrap();
        let list = records.entry(client_ip).or_default();

        list.push(MismatchRecord {
            identity: identity.to_string(),
            client_endpoint: client_endpoint.to_string(),
            at: Instant::now(),
        });
        list.retain(|r| r.at.elapsed() <= self.window);

        list.len() >= self.threshold
    }

    /// Mismatches currently inside the window for one client IP
    pub fn mismatch_count(&self, client_ip: &str) -> usize {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(client_ip) {
            Some(list) => {
                list.retain(|r| r.at.elapsed() <= self.window);
                list.len()
            }
            None => 0,
        }
    }

    /// Drop all tracked mismatches
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Strip a trailing `:port` from an endpoint string
fn strip_port(endpoint: &str) -> &str {
    endpoint.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(endpoint)
}

/// Self-pruning error window for one error kind
#[derive(Clone, Debug)]
pub struct ErrorWindow {
    pub window: Duration,
    pub threshold: usize,
    timestamps: Vec<Instant>,
}

impl ErrorWindow {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            timestamps: Vec::new(),
        }
    }

    /// Record an occurrence
    pub fn record(&mut self) {
        self.timestamps.push(Instant::now());
        self.prune();
    }

    /// Occurrences currently inside the window
    pub fn count(&mut self) -> usize {
        self.prune();
        self.timestamps.len()
    }

    /// Whether the rate threshold is currently met
    pub fn threshold_exceeded(&mut self) -> bool {
        self.count() >= self.threshold
    }

    fn prune(&mut self) {
        let window = self.window;
        self.timestamps.retain(|t| t.elapsed() <= window);
    }
}

/// Error engine configuration
#[derive(Copy, Clone, Debug)]
pub struct ErrorEngineConfig {
    pub mismatch_window: Duration,
    pub mismatch_threshold: usize,
    pub error_rate_window: Duration,
    pub error_rate_threshold: usize,
}

impl Default for ErrorEngineConfig {
    fn default() -> Self {
        Self {
            mismatch_window: Duration::from_secs(60),
            mismatch_threshold: 3,
            error_rate_window: Duration::from_secs(300),
            error_rate_threshold: 10,
        }
    }
}

/// Central error tracker for the admin server.
///
/// Correlates PSK mismatches per source and watches per-kind error
/// rates, emitting [`SecurityEvent`]s when thresholds trip.
pub struct ErrorEngine {
    bus: EventBus,
    tracker: MismatchTracker,
    windows: Mutex<HashMap<ErrorKind, ErrorWindow>>,
    config: ErrorEngineConfig,
}

impl ErrorEngine {
    pub fn new(bus: EventBus, config: ErrorEngineConfig) -> Self {
        let windows = [
            ErrorKind::PskMismatch,
            ErrorKind::ConnectionInterrupted,
            ErrorKind::HandshakeFailed,
        ]
        .into_iter()
        .map(|k| {
            (
                k,
                ErrorWindow::new(config.error_rate_window, config.error_rate_threshold),
            )
        })
        .collect();

        Self {
            bus,
            tracker: MismatchTracker::new(config.mismatch_window, config.mismatch_threshold),
            windows: Mutex::new(windows),
            config,
        }
    }

    /// Handle a PSK mismatch: log (identity only, never the key), track
    /// per-IP repeats, emit events, and report whether the caller
    /// should escalate
    pub fn handle_psk_mismatch(&self, identity: &str, client_endpoint: &str) -> bool {
        warn!("PSK mismatch: identity='{identity}', client={client_endpoint}");

        let repeated = self.tracker.record_mismatch(identity, client_endpoint);

        if repeated {
            let client_ip = strip_port(client_endpoint).to_string();
            let count = self.tracker.mismatch_count(&client_ip);

            warn!(
                "multiple PSK mismatches from {client_ip}: {count} within {:?}, \
                 possible brute-force attempt or misconfiguration",
                self.config.mismatch_window
            );

            self.bus
                .publish_security(SecurityEvent::PskRepeatedMismatch {
                    client_ip,
                    count,
                    window: self.config.mismatch_window,
                });
        }

        self.bus.publish_security(SecurityEvent::PskMismatch {
            identity: identity.to_string(),
            client_endpoint: client_endpoint.to_string(),
            repeated,
        });

        self.record_error(ErrorKind::PskMismatch);
        repeated
    }

    /// Record a handshake failure for rate tracking
    pub fn handle_handshake_failed(&self, client_endpoint: &str, reason: &str) {
        warn!("handshake failed: client={client_endpoint}, reason={reason}");
        self.record_error(ErrorKind::HandshakeFailed);
    }

    /// Record a mid-session interruption, keeping the last command for
    /// diagnostics
    pub fn handle_connection_interrupted(
        &self,
        session_id: crate::session::SessionId,
        last_command: Option<&str>,
        error: &str,
    ) {
        warn!(
            "connection interrupted: session={session_id}, last_command={}, error={error}",
            truncate(last_command.unwrap_or("-"), 16),
        );
        self.record_error(ErrorKind::ConnectionInterrupted);
    }

    /// Count for one error kind inside its window
    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.windows
            .lock()
            .unwrap()
            .get_mut(&kind)
            .map(|w| w.count())
            .unwrap_or(0)
    }

    /// Reset all tracking state
    pub fn clear(&self) {
        self.tracker.clear();
        for w in self.windows.lock().unwrap().values_mut() {
            w.timestamps.clear();
        }
    }

    fn record_error(&self, kind: ErrorKind) {
        let exceeded = {
            let mut windows = self.windows.lock().unwrap();
            let window = match windows.get_mut(&kind) {
                Some(w) => w,
                None => return,
            };
            window.record();

            window.threshold_exceeded().then(|| SecurityEvent::HighErrorRate {
                kind,
                count: window.timestamps.len(),
                window: window.window,
                threshold: window.threshold,
            })
        };

        if let Some(event) = exceeded {
            if let SecurityEvent::HighErrorRate { count, .. } = &event {
                error!(
                    "high error rate: kind={kind}, count={count}, window={:?}, threshold={}",
                    self.config.error_rate_window, self.config.error_rate_threshold
                );
            }
            self.bus.publish_security(event);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max])
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_threshold() {
        let tracker = MismatchTracker::new(Duration::from_secs(60), 3);

        assert!(!tracker.record_mismatch("ghost", "10.0.0.1:1111"));
        assert!(!tracker.record_mismatch("ghost", "10.0.0.1:2222"));
        // Same IP, different ports: third strike trips
        assert!(tracker.record_mismatch("other", "10.0.0.1:3333"));

        // A different IP is tracked independently
        assert!(!tracker.record_mismatch("ghost", "10.0.0.2:1111"));

        assert_eq!(tracker.mismatch_count("10.0.0.1"), 3);
        assert_eq!(tracker.mismatch_count("10.0.0.2"), 1);
    }

    #[test]
    fn mismatch_window_expiry() {
        let tracker = MismatchTracker::new(Duration::from_millis(30), 2);

        assert!(!tracker.record_mismatch("ghost", "10.0.0.1:1111"));
        std::thread::sleep(Duration::from_millis(50));

        // The first record fell out of the window
        assert!(!tracker.record_mismatch("ghost", "10.0.0.1:2222"));
        assert_eq!(tracker.mismatch_count("10.0.0.1"), 1);
    }

    #[test]
    fn error_window_prunes() {
        let mut w = ErrorWindow::new(Duration::from_millis(30), 3);

        w.record();
        w.record();
        assert_eq!(w.count(), 2);
        assert!(!w.threshold_exceeded());

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(w.count(), 0);
    }

    #[tokio::test]
    async fn repeated_mismatch_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_security();

        let engine = ErrorEngine::new(
            bus.clone(),
            ErrorEngineConfig {
                mismatch_window: Duration::from_secs(60),
                mismatch_threshold: 3,
                ..Default::default()
            },
        );

        assert!(!engine.handle_psk_mismatch("ghost", "10.0.0.1:1111"));
        assert!(!engine.handle_psk_mismatch("ghost", "10.0.0.1:1111"));
        assert!(engine.handle_psk_mismatch("ghost", "10.0.0.1:1111"));

        let mut saw_repeated = false;
        while let Ok(evt) = rx.try_recv() {
            if let SecurityEvent::PskRepeatedMismatch { client_ip, count, .. } = evt {
                assert_eq!(client_ip, "10.0.0.1");
                assert_eq!(count, 3);
                saw_repeated = true;
            }
        }
        assert!(saw_repeated);
    }

    #[tokio::test]
    async fn high_error_rate_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_security();

        let engine = ErrorEngine::new(
            bus.clone(),
            ErrorEngineConfig {
                error_rate_window: Duration::from_secs(300),
                error_rate_threshold: 3,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            engine.handle_handshake_failed("10.0.0.1:1111", "timeout");
        }

        let mut saw_rate = false;
        while let Ok(evt) = rx.try_recv() {
            if let SecurityEvent::HighErrorRate { kind, count, .. } = evt {
                assert_eq!(kind, ErrorKind::HandshakeFailed);
                assert_eq!(count, 3);
                saw_rate = true;
            }
        }
        assert!(saw_rate);
    }
}
