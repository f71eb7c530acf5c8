// Copyright (c) 2022-2023 The MobileCoin Foundation

//! ISO 7816-4 APDU parsing and construction
//!
//! Commands are classified into the four ISO cases from their encoded
//! length, with extended-length (three byte Lc / two byte Le) support.

use core::fmt;

use strum::{Display, EnumIter};

/// APDU codec errors
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApduError {
    /// Hex string contained characters outside `[0-9A-Fa-f]`
    #[error("invalid hex encoding")]
    InvalidHex,

    /// Hex string length was odd
    #[error("hex string must have even length")]
    OddHexLength,

    /// Encoded command was shorter than the four byte header
    #[error("APDU must be at least 4 bytes (CLA INS P1 P2), got {0}")]
    TooShort(usize),

    /// Lc did not match the available data bytes
    #[error("length field inconsistent with body ({0} trailing bytes)")]
    LengthMismatch(usize),

    /// Data too long for the requested encoding
    #[error("data of {0} bytes does not fit the APDU encoding")]
    DataTooLong(usize),
}

/// ISO 7816-4 command case
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumIter)]
pub enum ApduCase {
    /// Header only
    Case1,
    /// Header + Le
    Case2,
    /// Header + Lc + data
    Case3,
    /// Header + Lc + data + Le
    Case4,
}

/// A parsed command APDU.
///
/// `le` stores the expected response length with the zero encoding
/// already resolved (`00` means 256, extended `0000` means 65536), so a
/// parse/encode round trip reproduces the original bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Command data field (empty for cases 1 and 2)
    pub data: Vec<u8>,
    /// Expected response length (cases 2 and 4)
    pub le: Option<u32>,
    /// Extended-length encoding flag
    pub extended: bool,
}

impl Apdu {
    /// Create a case-1 command from the header bytes
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
            extended: false,
        }
    }

    /// Attach a command data field
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Attach an expected response length
    pub fn with_le(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    /// Command case derived from the populated fields
    pub fn case(&self) -> ApduCase {
        match (self.data.is_empty(), self.le.is_none()) {
            (true, true) => ApduCase::Case1,
            (true, false) => ApduCase::Case2,
            (false, true) => ApduCase::Case3,
            (false, false) => ApduCase::Case4,
        }
    }

    /// Parse a command from raw bytes
    pub fn parse(raw: &[u8]) -> Result<Self, ApduError> {
        if raw.len() < 4 {
            return Err(ApduError::TooShort(raw.len()));
        }

        let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
        let body = &raw[4..];

        let mut apdu = Apdu::new(cla, ins, p1, p2);

        match body.len() {
            // Case 1
            0 => return Ok(apdu),
            // Case 2 short
            1 => {
                apdu.le = Some(decode_le_short(body[0]));
                return Ok(apdu);
            }
            _ => (),
        }

        // Extended encodings start with a zero marker byte and need at
        // least three more bytes to be distinguishable
        if body[0] == 0x00 && body.len() >= 3 {
            apdu.extended = true;

            if body.len() == 3 {
                // Case 2 extended: 00 LeLe
                apdu.le = Some(decode_le_ext(body[1], body[2]));
                return Ok(apdu);
            }

            let lc = u16::from_be_bytes([body[1], body[2]]) as usize;
            let rest = &body[3..];

            if rest.len() == lc {
                // Case 3 extended
                apdu.data = rest.to_vec();
                return Ok(apdu);
            }
            if rest.len() == lc + 2 {
                // Case 4 extended
                apdu.data = rest[..lc].to_vec();
                apdu.le = Some(decode_le_ext(rest[lc], rest[lc + 1]));
                return Ok(apdu);
            }

            return Err(ApduError::LengthMismatch(rest.len().saturating_sub(lc)));
        }

        let lc = body[0] as usize;
        let rest = &body[1..];

        // A zero Lc must be absent rather than encoded
        if lc == 0 {
            return Err(ApduError::LengthMismatch(rest.len()));
        }

        if rest.len() == lc {
            // Case 3 short
            apdu.data = rest.to_vec();
            Ok(apdu)
        } else if rest.len() == lc + 1 {
            // Case 4 short
            apdu.data = rest[..lc].to_vec();
            apdu.le = Some(decode_le_short(rest[lc]));
            Ok(apdu)
        } else {
            Err(ApduError::LengthMismatch(rest.len().saturating_sub(lc)))
        }
    }

    /// Parse a command from a hex string
    pub fn parse_hex(hex_str: &str) -> Result<Self, ApduError> {
        Self::parse(&decode_hex(hex_str)?)
    }

    /// Encode the command to bytes
    pub fn encode(&self) -> Result<Vec<u8>, ApduError> {
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];

        if self.extended {
            if self.data.len() > 0xFFFF {
                return Err(ApduError::DataTooLong(self.data.len()));
            }
            if !self.data.is_empty() {
                out.push(0x00);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&self.data);
                if let Some(le) = self.le {
                    out.extend_from_slice(&encode_le_ext(le));
                }
            } else if let Some(le) = self.le {
                out.push(0x00);
                out.extend_from_slice(&encode_le_ext(le));
            }
        } else {
            if self.data.len() > 0xFF {
                return Err(ApduError::DataTooLong(self.data.len()));
            }
            if !self.data.is_empty() {
                out.push(self.data.len() as u8);
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                out.push(encode_le_short(le));
            }
        }

        Ok(out)
    }

    /// Encode the command to an uppercase hex string
    pub fn to_hex(&self) -> Result<String, ApduError> {
        Ok(hex::encode_upper(self.encode()?))
    }
}

/// Display an APDU as its hex encoding, or header fields when the
/// encoding is inconsistent
impl fmt::Display for Apdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_hex() {
            Ok(h) => write!(f, "{h}"),
            Err(_) => write!(
                f,
                "{:02X}{:02X}{:02X}{:02X}..",
                self.cla, self.ins, self.p1, self.p2
            ),
        }
    }
}

/// Decode a strict hex string (even length, hex alphabet only)
pub fn decode_hex(hex_str: &str) -> Result<Vec<u8>, ApduError> {
    if hex_str.len() % 2 != 0 {
        return Err(ApduError::OddHexLength);
    }
    hex::decode(hex_str).map_err(|_| ApduError::InvalidHex)
}

fn decode_le_short(b: u8) -> u32 {
    if b == 0 {
        256
    } else {
        b as u32
    }
}

fn encode_le_short(le: u32) -> u8 {
    if le >= 256 {
        0x00
    } else {
        le as u8
    }
}

fn decode_le_ext(hi: u8, lo: u8) -> u32 {
    let v = u16::from_be_bytes([hi, lo]) as u32;
    if v == 0 {
        65536
    } else {
        v
    }
}

fn encode_le_ext(le: u32) -> [u8; 2] {
    if le >= 65536 {
        [0x00, 0x00]
    } else {
        (le as u16).to_be_bytes()
    }
}
