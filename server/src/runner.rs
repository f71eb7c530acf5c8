// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Script runner
//!
//! Walks a loaded [`Script`] command by command against a live session,
//! recording each exchange and applying the configured stop policy.
//! The [driver][crate::driver] owns the wire; the runner owns which
//! command goes next and when the run is over.

use std::time::Instant;

use log::{debug, warn};

use scp81_ota_codec::{StatusWord, SwClass};
use scp81_ota_core::events::{EventBus, RunSummary, ScriptEvent};
use scp81_ota_core::script::{ApduCommand, Script};
use scp81_ota_core::session::{ExchangeRecord, SessionError, SessionId, SessionStore};

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Card response too short to carry a status word
    #[error("response of {0} bytes is too short for a status word")]
    ResponseTooShort(usize),

    /// A response arrived with no command outstanding
    #[error("no command outstanding")]
    NoPendingCommand,

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// When a run stops early
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunnerPolicy {
    /// Stop on the first response that is not `9000`
    pub stop_on_non_success: bool,
    /// Stop on the first `6Fxx` card error
    pub stop_on_card_error: bool,
    /// Stop after this many consecutive retryable (`62xx`) responses
    pub max_consecutive_retryable: Option<usize>,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        Self {
            stop_on_non_success: false,
            stop_on_card_error: true,
            max_consecutive_retryable: Some(3),
        }
    }
}

/// Drives one script through one session
pub struct ScriptRunner {
    script: Script,
    session_id: SessionId,
    store: SessionStore,
    bus: EventBus,
    policy: RunnerPolicy,

    index: usize,
    pending: Option<(usize, Instant)>,
    stopped: bool,
    started: Option<Instant>,

    successes: usize,
    retries: usize,
    consecutive_retryable: usize,
    first_failure: Option<(usize, StatusWord)>,
}

impl ScriptRunner {
    pub fn new(
        script: Script,
        session_id: SessionId,
        store: SessionStore,
        bus: EventBus,
        policy: RunnerPolicy,
    ) -> Self {
        Self {
            script,
            session_id,
            store,
            bus,
            policy,
            index: 0,
            pending: None,
            stopped: false,
            started: None,
            successes: 0,
            retries: 0,
            consecutive_retryable: 0,
            first_failure: None,
        }
    }

    /// Script under execution
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Whether any command has been dispensed yet
    pub fn started(&self) -> bool {
        self.started.is_some()
    }

    /// Hex of the most recently dispensed command, for diagnostics
    pub fn last_command_hex(&self) -> Option<&str> {
        self.pending
            .map(|(i, _)| self.script.commands[i].hex.as_str())
            .or_else(|| {
                self.index
                    .checked_sub(1)
                    .map(|i| self.script.commands[i].hex.as_str())
            })
    }

    /// Next command to transmit, or None when the run is over.
    ///
    /// The first call marks the run as started and emits
    /// [`ScriptEvent::RunStarted`].
    pub fn next_command(&mut self) -> Option<&ApduCommand> {
        if self.stopped || self.pending.is_some() {
            return None;
        }

        let cmd = self.script.commands.get(self.index)?;

        if self.started.is_none() {
            self.started = Some(Instant::now());
            debug!(
                "script run started: script={}, session={}",
                self.script.id, self.session_id
            );
            self.bus.publish_script(ScriptEvent::RunStarted {
                script_id: self.script.id.clone(),
                session_id: self.session_id,
            });
        }

        self.pending = Some((self.index, Instant::now()));
        Some(cmd)
    }

    /// Record the card's response to the outstanding command and decide
    /// whether the run continues
    pub fn handle_response(&mut self, response: &[u8]) -> Result<StatusWord, RunnerError> {
        let (index, sent_at) = self.pending.take().ok_or(RunnerError::NoPendingCommand)?;

        let (_data, sw) = StatusWord::split_response(response)
            .ok_or(RunnerError::ResponseTooShort(response.len()))?;

        let cmd = &self.script.commands[index];

        self.store.record_exchange(
            self.session_id,
            ExchangeRecord {
                command_hex: cmd.hex.clone(),
                command_label: cmd.name.clone(),
                response_hex: hex::encode_upper(response),
                sw,
                latency_ms: sent_at.elapsed().as_millis() as u64,
            },
        )?;

        self.index = index + 1;

        // Update counters and stop conditions
        match sw.class() {
            SwClass::Success => {
                self.successes += 1;
                self.consecutive_retryable = 0;
            }
            SwClass::Retryable => {
                self.retries += 1;
                self.consecutive_retryable += 1;
                self.note_failure(index, sw);

                if let Some(max) = self.policy.max_consecutive_retryable {
                    if self.consecutive_retryable >= max {
                        warn!(
                            "stopping script {}: {max} consecutive retryable responses",
                            self.script.id
                        );
                        self.stopped = true;
                    }
                }
            }
            class => {
                self.consecutive_retryable = 0;
                self.note_failure(index, sw);

                if class == SwClass::CardError && self.policy.stop_on_card_error {
                    warn!(
                        "stopping script {}: card error {sw} ({})",
                        self.script.id,
                        sw.description()
                    );
                    self.stopped = true;
                }
            }
        }

        if self.policy.stop_on_non_success && !sw.is_success() {
            self.stopped = true;
        }

        Ok(sw)
    }

    fn note_failure(&mut self, index: usize, sw: StatusWord) {
        if self.first_failure.is_none() {
            self.first_failure = Some((index, sw));
        }
    }

    /// Whether the runner has more to send
    pub fn is_complete(&self) -> bool {
        self.stopped || (self.pending.is_none() && self.index >= self.script.commands.len())
    }

    /// Finalize the run, emitting [`ScriptEvent::RunCompleted`]
    pub fn finish(&mut self) -> RunSummary {
        let summary = RunSummary {
            total_commands: self.index,
            successes: self.successes,
            retries: self.retries,
            first_failure: self.first_failure,
            duration: self
                .started
                .map(|s| s.elapsed())
                .unwrap_or_default(),
        };

        debug!(
            "script run completed: script={}, session={}, commands={}, successes={}",
            self.script.id, self.session_id, summary.total_commands, summary.successes
        );

        self.bus.publish_script(ScriptEvent::RunCompleted {
            script_id: self.script.id.clone(),
            session_id: self.session_id,
            summary: summary.clone(),
        });

        summary
    }
}
