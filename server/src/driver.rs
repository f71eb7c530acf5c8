// Copyright (c) 2022-2023 The MobileCoin Foundation

//! SCP81 admin protocol driver
//!
//! Runs the server side of the HTTP-POST-over-TLS loop: accept a POST,
//! answer with the next command APDU, read the card's response in the
//! following POST, repeat until the script is exhausted, then signal
//! completion with `204 No Content`.
//!
//! Card-side error status words are recorded, not fatal; whether a run
//! stops early is the [`ScriptRunner`]'s policy. IO failures close the
//! affected session and never propagate beyond it.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use scp81_ota_core::errors::ErrorEngine;
use scp81_ota_core::session::{CloseReason, SessionError, SessionId, SessionState, SessionStore};

use crate::http::{self, HttpError, Request};
use crate::runner::{RunnerError, ScriptRunner};

/// Driver configuration
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Path the card is expected to POST to
    pub admin_path: String,
    /// Per-request read timeout
    pub request_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            admin_path: "/admin".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-connection protocol driver
pub struct AdminDriver {
    store: SessionStore,
    errors: Arc<ErrorEngine>,
    config: DriverConfig,
}

impl AdminDriver {
    pub fn new(store: SessionStore, errors: Arc<ErrorEngine>, config: DriverConfig) -> Self {
        Self {
            store,
            errors,
            config,
        }
    }

    /// Drive one OTA session over an established TLS stream.
    ///
    /// Returns the reason the session closed; the session is always
    /// closed when this returns.
    pub async fn run_session<S>(
        &self,
        stream: &mut S,
        session_id: SessionId,
        mut runner: ScriptRunner,
    ) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let reason = self.session_loop(stream, session_id, &mut runner).await;

        if runner.started() {
            runner.finish();
        }

        // close() is a no-op if the loop already closed the session
        let _ = self.store.close(session_id, reason);
        reason
    }

    async fn session_loop<S>(
        &self,
        stream: &mut S,
        session_id: SessionId,
        runner: &mut ScriptRunner,
    ) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut first_request = true;

        loop {
            // An external close (API or idle sweep) stops the loop at
            // the next safe boundary, before another send
            match self.store.get(session_id) {
                Some(s) if s.state == SessionState::Closed => {
                    debug!("session {session_id} closed externally, stopping driver");
                    return s.close_reason.unwrap_or(CloseReason::ClientRequested);
                }
                Some(_) => (),
                None => return CloseReason::ClientRequested,
            }

            let request = match http::read_request(stream, self.config.request_timeout).await {
                Ok(r) => r,
                Err(HttpError::ConnectionClosed) if !runner.started() => {
                    // Client went away before the dialog began
                    debug!("session {session_id}: client closed before first request");
                    return CloseReason::ConnectionInterrupted;
                }
                Err(e @ (HttpError::ConnectionClosed | HttpError::Interrupted | HttpError::Io(_) | HttpError::Timeout)) => {
                    self.interrupted(session_id, runner, &e);
                    return CloseReason::ConnectionInterrupted;
                }
                Err(e) => {
                    // Unparseable request: tell the client and close
                    warn!("session {session_id}: bad request: {e}");
                    let _ = http::write_bad_request(stream, &e.to_string()).await;
                    return CloseReason::ProtocolError;
                }
            };

            if let Err(explanation) = self.check_request(&request) {
                warn!("session {session_id}: rejected request: {explanation}");
                let _ = http::write_bad_request(stream, explanation).await;
                return CloseReason::ProtocolError;
            }

            if first_request {
                first_request = false;

                // The initial POST may be empty or carry an envelope;
                // either way the dialog is now active
                if let Err(e) = self.store.set_state(session_id, SessionState::Active) {
                    warn!("session {session_id}: cannot activate: {e}");
                    return CloseReason::ProtocolError;
                }
                if !request.body.is_empty() {
                    debug!(
                        "session {session_id}: initial envelope of {} bytes",
                        request.body.len()
                    );
                }
            } else {
                // Every follow-up POST carries the card's response to
                // the outstanding command
                match runner.handle_response(&request.body) {
                    Ok(sw) => {
                        debug!("session {session_id}: card returned {sw}");
                    }
                    Err(e @ RunnerError::ResponseTooShort(_)) => {
                        warn!("session {session_id}: {e}");
                        let _ = http::write_bad_request(stream, &e.to_string()).await;
                        return CloseReason::ProtocolError;
                    }
                    Err(RunnerError::Session(SessionError::SessionClosed(_))) => {
                        // Closed externally while the response was in
                        // flight; surface the recorded reason
                        debug!("session {session_id} closed during response handling");
                        return self
                            .store
                            .get(session_id)
                            .and_then(|s| s.close_reason)
                            .unwrap_or(CloseReason::ClientRequested);
                    }
                    Err(e) => {
                        warn!("session {session_id}: {e}");
                        return CloseReason::ProtocolError;
                    }
                }
            }

            // Dispense the next chunk or finish the session
            match runner.next_command() {
                Some(cmd) => {
                    let body = match hex::decode(&cmd.hex) {
                        Ok(b) => b,
                        Err(e) => {
                            // Validated scripts cannot hit this; a
                            // rendered-in-memory script might
                            warn!("session {session_id}: undecodable command hex: {e}");
                            return CloseReason::ProtocolError;
                        }
                    };

                    debug!(
                        "session {session_id}: sending command {} ({} bytes)",
                        cmd.name.as_deref().unwrap_or(&cmd.hex),
                        body.len()
                    );

                    if let Err(e) = http::write_commands(stream, &body).await {
                        self.interrupted(session_id, runner, &e);
                        return CloseReason::ConnectionInterrupted;
                    }
                }
                None => {
                    info!("session {session_id}: script complete, ending session");
                    let _ = http::write_session_complete(stream).await;
                    return CloseReason::Normal;
                }
            }
        }
    }

    /// Basic request validation shared by every round trip
    fn check_request(&self, request: &Request) -> Result<(), &'static str> {
        if request.method != "POST" {
            return Err("only POST is accepted");
        }
        if request.path != self.config.admin_path {
            return Err("unknown admin path");
        }
        if !request.has_admin_content_type() {
            return Err("unsupported content type");
        }
        Ok(())
    }

    fn interrupted(&self, session_id: SessionId, runner: &ScriptRunner, error: &HttpError) {
        self.errors.handle_connection_interrupted(
            session_id,
            runner.last_command_hex(),
            &error.to_string(),
        );
    }
}
