// Copyright (c) 2022-2023 The MobileCoin Foundation

//! End-to-end scenarios for the SCP81 admin server
//!
//! Each module exposes `pub async fn` scenarios run from the server
//! crate's integration tests, driving a real PSK-TLS listener with the
//! card simulator.

pub mod helpers;

pub mod auth;

pub mod happy;

pub mod lifecycle;

pub mod rendering;
