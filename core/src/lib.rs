// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Core engine for the SCP81 OTA test platform.
//!
//! This crate holds everything between the wire codecs and the TLS
//! server surface: the declarative APDU script model with its loader and
//! renderer, PSK key stores, the session state machine and exchange log,
//! error-rate tracking, the typed event bus, and the correlator that
//! joins server-side sessions with card-side BIP activity.
//!
//! Storage, device adapters and network simulators are external
//! collaborators; they plug in through the [`keys::KeyRepository`]
//! contract and the [`events::EventBus`] BIP channel.

pub mod config;
pub mod correlate;
pub mod errors;
pub mod events;
pub mod keys;
pub mod script;
pub mod session;
pub mod trigger;
