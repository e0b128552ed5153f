/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Datagram codec.
//!
//! The header is packed big-endian: `type:u32, sequence:u32, length:u32,
//! offset:u64`. Fields are extracted explicitly, never by overlaying the
//! datagram buffer with a struct, and the length invariant is checked
//! before any declared field is acted on.

use super::{HEADER_SIZE, NETDUMP_DATASIZE};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("runt datagram ({got} bytes)")]
    Runt { got: usize },
    #[error("length mismatch (header claims {claimed} payload bytes, got {actual})")]
    LengthMismatch { claimed: u32, actual: usize },
    #[error("unknown message type {0}")]
    UnknownType(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Herald,
    Kdh,
    Vmcore,
    Finished,
}

impl MessageType {
    fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::Herald),
            2 => Some(MessageType::Kdh),
            3 => Some(MessageType::Vmcore),
            4 => Some(MessageType::Finished),
            _ => None,
        }
    }
}

/// A parsed datagram, borrowing its payload from the receive buffer.
#[derive(Debug, PartialEq)]
pub struct Datagram<'a> {
    pub msg_type: MessageType,
    pub seqno: u32,
    pub offset: u64,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ParseError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ParseError::Runt { got: bytes.len() });
        }

        let raw_type = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let seqno = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let claimed = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let offset = u64::from_be_bytes([
            bytes[12], bytes[13], bytes[14], bytes[15], bytes[16], bytes[17], bytes[18], bytes[19],
        ]);

        let actual = bytes.len() - HEADER_SIZE;
        if claimed as usize != actual || claimed as usize > NETDUMP_DATASIZE {
            return Err(ParseError::LengthMismatch { claimed, actual });
        }

        let msg_type =
            MessageType::from_wire(raw_type).ok_or(ParseError::UnknownType(raw_type))?;

        Ok(Datagram { msg_type, seqno, offset, payload: &bytes[HEADER_SIZE..] })
    }
}

/// Encode an acknowledgement frame for `seqno`.
pub fn encode_ack(seqno: u32) -> [u8; 4] {
    seqno.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(msg_type: u32, seqno: u32, offset: u64, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&msg_type.to_be_bytes());
        bytes.extend_from_slice(&seqno.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&offset.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn parse_vmcore() {
        let bytes = datagram(3, 7, 1456, b"abc");
        let pkt = Datagram::parse(&bytes).expect("parse");
        assert_eq!(pkt.msg_type, MessageType::Vmcore);
        assert_eq!(pkt.seqno, 7);
        assert_eq!(pkt.offset, 1456);
        assert_eq!(pkt.payload, b"abc");
    }

    #[test]
    fn parse_herald_empty_payload() {
        let bytes = datagram(1, 1, 0, b"");
        let pkt = Datagram::parse(&bytes).expect("parse");
        assert_eq!(pkt.msg_type, MessageType::Herald);
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn runt_is_rejected() {
        let bytes = datagram(3, 7, 0, b"");
        assert_eq!(
            Datagram::parse(&bytes[..HEADER_SIZE - 1]),
            Err(ParseError::Runt { got: HEADER_SIZE - 1 })
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut bytes = datagram(3, 7, 0, b"abcd");
        // Claim one more payload byte than is present.
        bytes[8..12].copy_from_slice(&5u32.to_be_bytes());
        assert_eq!(
            Datagram::parse(&bytes),
            Err(ParseError::LengthMismatch { claimed: 5, actual: 4 })
        );
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let payload = vec![0u8; NETDUMP_DATASIZE + 1];
        let bytes = datagram(3, 7, 0, &payload);
        assert!(matches!(
            Datagram::parse(&bytes),
            Err(ParseError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected_after_length_check() {
        let bytes = datagram(9, 7, 0, b"xy");
        assert_eq!(Datagram::parse(&bytes), Err(ParseError::UnknownType(9)));

        // A malformed length wins over the unknown type.
        let mut bytes = datagram(9, 7, 0, b"xy");
        bytes[8..12].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(
            Datagram::parse(&bytes),
            Err(ParseError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn max_payload_at_offset_zero_is_accepted() {
        let payload = vec![0xAA; NETDUMP_DATASIZE];
        let bytes = datagram(3, 0, 0, &payload);
        let pkt = Datagram::parse(&bytes).expect("parse");
        assert_eq!(pkt.offset, 0);
        assert_eq!(pkt.payload.len(), NETDUMP_DATASIZE);
    }

    #[test]
    fn ack_is_big_endian_seqno() {
        assert_eq!(encode_ack(0x01020304), [1, 2, 3, 4]);
    }
}
