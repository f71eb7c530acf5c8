// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Wire codecs for SCP81 OTA administration.
//!
//! This crate provides the two encodings everything else is built on:
//! BER-TLV structures as used by SCP81 envelopes and card profile fields,
//! and ISO 7816-4 APDUs with status word classification.
//!
//! Both codecs are strict on parse and minimal on emit, so that
//! `encode(parse(b)) == b` holds for any input they accept.

pub mod apdu;
pub mod status;
pub mod tlv;

pub use apdu::{Apdu, ApduCase, ApduError};
pub use status::{StatusWord, SwClass};
pub use tlv::{Tlv, TlvError};
