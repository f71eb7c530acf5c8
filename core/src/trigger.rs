// Copyright (c) 2022-2023 The MobileCoin Foundation

//! SMS-PP OTA trigger construction
//!
//! Builds the GSM 03.40 SMS-SUBMIT PDU that pushes a card into opening
//! an SCP81 admin session. The command packet carries only
//! `TAR || counter || padding` with no KIC/KID cryptography, which is
//! sufficient to trigger test cards.

use hex::FromHexError;

/// Protocol identifier for SIM data download
pub const PID_SIM_DATA_DOWNLOAD: u8 = 0x7F;

/// Data coding scheme for class-2 8-bit messages
pub const DCS_CLASS2_8BIT: u8 = 0xF6;

/// Default Toolkit Application Reference of the admin agent
pub const DEFAULT_TAR: [u8; 3] = [0xB0, 0xFF, 0x00];

/// Trigger construction errors
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("TAR must be 3 bytes of hex")]
    InvalidTar,

    #[error("counter exceeds 24 bits")]
    CounterTooLarge,

    #[error("destination address must contain digits")]
    InvalidAddress,

    #[error("user data of {0} bytes exceeds a single SMS")]
    DataTooLong(usize),
}

/// An SCP81 admin-session trigger
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminTrigger {
    pub tar: [u8; 3],
    /// 24-bit replay counter
    pub counter: u32,
    pub padding_counter: u8,
}

impl Default for AdminTrigger {
    fn default() -> Self {
        Self {
            tar: DEFAULT_TAR,
            counter: 0,
            padding_counter: 0,
        }
    }
}

impl AdminTrigger {
    /// Create a trigger with a TAR given as 6 hex characters
    pub fn with_tar(tar_hex: &str) -> Result<Self, TriggerError> {
        let bytes = hex::decode(tar_hex).map_err(|_: FromHexError| TriggerError::InvalidTar)?;
        let tar: [u8; 3] = bytes.try_into().map_err(|_| TriggerError::InvalidTar)?;
        Ok(Self {
            tar,
            ..Default::default()
        })
    }

    /// Simplified command packet: `TAR(3) || counter(3) || padding(1)`
    pub fn command_packet(&self) -> Result<Vec<u8>, TriggerError> {
        if self.counter > 0xFF_FFFF {
            return Err(TriggerError::CounterTooLarge);
        }

        let mut packet = Vec::with_capacity(7);
        packet.extend_from_slice(&self.tar);
        packet.extend_from_slice(&self.counter.to_be_bytes()[1..]);
        packet.push(self.padding_counter);
        Ok(packet)
    }

    /// Build the complete SMS-SUBMIT PDU for this trigger
    pub fn to_pdu(&self, destination: &str) -> Result<String, TriggerError> {
        build_submit_pdu(
            destination,
            &self.command_packet()?,
            PID_SIM_DATA_DOWNLOAD,
            DCS_CLASS2_8BIT,
        )
    }
}

/// Build an SMS-SUBMIT PDU carrying raw 8-bit user data.
///
/// The SMSC field is left empty (`00`) so the handset's default centre
/// applies; the first octet requests SMS-SUBMIT with no validity
/// period.
pub fn build_submit_pdu(
    destination: &str,
    user_data: &[u8],
    protocol_id: u8,
    data_coding: u8,
) -> Result<String, TriggerError> {
    if user_data.len() > 140 {
        return Err(TriggerError::DataTooLong(user_data.len()));
    }

    let mut pdu = String::new();

    // No SMSC, SMS-SUBMIT, message reference assigned by the modem
    pdu.push_str("00");
    pdu.push_str("11");
    pdu.push_str("00");

    pdu.push_str(&encode_address(destination)?);

    pdu.push_str(&format!("{protocol_id:02X}"));
    pdu.push_str(&format!("{data_coding:02X}"));

    pdu.push_str(&format!("{:02X}", user_data.len()));
    pdu.push_str(&hex::encode_upper(user_data));

    Ok(pdu)
}

/// Encode a phone number as length, type-of-address and swapped
/// semi-octets
pub fn encode_address(number: &str) -> Result<String, TriggerError> {
    let international = number.starts_with('+');
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return Err(TriggerError::InvalidAddress);
    }

    let type_byte: u8 = if international { 0x91 } else { 0x81 };

    // Semi-octet encoding: pad odd counts with F, swap nibble pairs
    let mut padded = digits.clone();
    if padded.len() % 2 != 0 {
        padded.push('F');
    }

    let mut swapped = String::with_capacity(padded.len());
    let bytes = padded.as_bytes();
    for pair in bytes.chunks(2) {
        swapped.push(pair[1] as char);
        swapped.push(pair[0] as char);
    }

    Ok(format!("{:02X}{type_byte:02X}{swapped}", digits.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_encoding() {
        // International number, even digit count
        assert_eq!(encode_address("+491711234567").unwrap(), "0C91947111325476");

        assert!(encode_address("").is_err());
        assert!(encode_address("+").is_err());
    }

    #[test]
    fn address_encoding_odd_padded() {
        // 5 digits pad with F and swap
        assert_eq!(encode_address("12345").unwrap(), "05812143F5");
    }

    #[test]
    fn command_packet_layout() {
        let trigger = AdminTrigger {
            tar: [0xB0, 0x00, 0x10],
            counter: 0x010203,
            padding_counter: 0x04,
        };

        assert_eq!(
            trigger.command_packet().unwrap(),
            hex::decode("B0001001020304").unwrap()
        );
    }

    #[test]
    fn counter_bounds() {
        let trigger = AdminTrigger {
            counter: 0x0100_0000,
            ..Default::default()
        };
        assert_eq!(trigger.command_packet(), Err(TriggerError::CounterTooLarge));
    }

    #[test]
    fn default_trigger_pdu() {
        let pdu = AdminTrigger::default().to_pdu("12345").unwrap();

        // Header: no SMSC, SMS-SUBMIT, MR 00
        assert!(pdu.starts_with("001100"));
        // PID 7F, DCS F6, UDL 07 and the default packet follow the address
        assert!(pdu.ends_with("7FF607B0FF0000000000"));
        // Whole PDU is valid hex
        assert!(hex::decode(&pdu).is_ok());
    }

    #[test]
    fn tar_parsing() {
        let t = AdminTrigger::with_tar("B00010").unwrap();
        assert_eq!(t.tar, [0xB0, 0x00, 0x10]);

        assert_eq!(AdminTrigger::with_tar("B000"), Err(TriggerError::InvalidTar));
        assert_eq!(AdminTrigger::with_tar("XXYYZZ"), Err(TriggerError::InvalidTar));
    }

    #[test]
    fn user_data_cap() {
        let r = build_submit_pdu("12345", &[0u8; 141], PID_SIM_DATA_DOWNLOAD, DCS_CLASS2_8BIT);
        assert_eq!(r, Err(TriggerError::DataTooLong(141)));
    }
}
