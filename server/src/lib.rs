// Copyright (c) 2022-2023 The MobileCoin Foundation

//! PSK-TLS admin server for SCP81 OTA card administration
//!
//! Plays the Remote Administration Server role: terminates PSK-TLS 1.2
//! connections from cards, drives the SCP81 HTTP-POST admin dialog, and
//! records every APDU exchanged. The session, script and event
//! machinery lives in [`scp81_ota_core`]; this crate owns the network
//! surface and the per-connection protocol loop.

pub mod driver;
pub mod http;
pub mod runner;
pub mod server;
pub mod tls;

pub use driver::AdminDriver;
pub use runner::{RunnerPolicy, ScriptRunner};
pub use server::{AdminServer, FixedScriptSource, MapScriptSource, ScriptSource, ServerError};
pub use tls::{TlsAcceptor, TlsAlert, TlsError};
