//! # MBAP Codec
//!
//! Encoding and decoding of the 7-byte Modbus Application Protocol header that
//! prefixes every Modbus/IP frame.
//!
//! ## Wire Layout
//!
//! | Offset | Size | Field | Notes |
//! |--------|------|-------|-------|
//! | 0 | 2 | Transaction ID | echoed from request to reply |
//! | 2 | 2 | Protocol ID | always `0x0000` for Modbus |
//! | 4 | 2 | Length | unit id + PDU byte count |
//! | 6 | 1 | Unit ID | sub-device address |
//!
//! All multi-byte fields are big-endian. The length field counts the unit id
//! byte as well, so the PDU is always `length - 1` bytes long. Decoding
//! subtracts that byte and encoding adds it back.
//!
//! ## Example
//!
//! ```rust
//! use modbus_ip::mbap::{encode_header, MbapHeader};
//!
//! let raw = encode_header(0x0001, 0x01, 5);
//! assert_eq!(raw, [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01]);
//!
//! let header = MbapHeader::decode(&raw).unwrap();
//! assert_eq!(header.pdu_len().unwrap(), 5);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID};
use crate::error::{ModbusError, ModbusResult};

/// Modbus unit (sub-device) identifier
pub type UnitId = u8;

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier, echoed back in the reply
    pub transaction_id: u16,
    /// Protocol identifier, 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    /// Unit identifier
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Create a Modbus header for a PDU of `pdu_len` bytes
    #[inline]
    pub fn new(transaction_id: u16, unit_id: UnitId, pdu_len: usize) -> Self {
        debug_assert!(pdu_len < u16::MAX as usize);
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    /// Decode a header from exactly 7 bytes.
    ///
    /// Fails with [`ModbusError::ForeignProtocol`] when the protocol identifier
    /// is not zero.
    pub fn decode(raw: &[u8; MBAP_HEADER_LEN]) -> ModbusResult<Self> {
        let protocol_id = u16::from_be_bytes([raw[2], raw[3]]);
        if protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::foreign_protocol(protocol_id));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([raw[0], raw[1]]),
            protocol_id,
            length: u16::from_be_bytes([raw[4], raw[5]]),
            unit_id: raw[6],
        })
    }

    /// Decode a header from the start of `buf`
    pub fn from_slice(buf: &[u8]) -> ModbusResult<Self> {
        let raw: &[u8; MBAP_HEADER_LEN] = buf
            .get(..MBAP_HEADER_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or_else(|| ModbusError::short_read(MBAP_HEADER_LEN, buf.len()))?;
        Self::decode(raw)
    }

    /// Encode the header to its wire form
    #[inline]
    pub fn encode(&self) -> [u8; MBAP_HEADER_LEN] {
        let mut raw = [0u8; MBAP_HEADER_LEN];
        raw[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        raw[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        raw[4..6].copy_from_slice(&self.length.to_be_bytes());
        raw[6] = self.unit_id;
        raw
    }

    /// PDU byte count announced by this header (`length - 1`).
    ///
    /// A declared length of 0 or 1 leaves no PDU and is rejected with
    /// [`ModbusError::InvalidLength`].
    #[inline]
    pub fn pdu_len(&self) -> ModbusResult<usize> {
        match (self.length as usize).checked_sub(1) {
            Some(len) if len > 0 => Ok(len),
            _ => Err(ModbusError::invalid_length(self.length)),
        }
    }

    /// Header for the reply to this request: same transaction and unit id,
    /// length recomputed for the reply PDU.
    #[inline]
    pub fn reply(&self, pdu_len: usize) -> Self {
        Self::new(self.transaction_id, self.unit_id, pdu_len)
    }
}

/// Encode a header for a PDU of `pdu_len` bytes (`length = pdu_len + 1`)
#[inline]
pub fn encode_header(transaction_id: u16, unit_id: UnitId, pdu_len: usize) -> [u8; MBAP_HEADER_LEN] {
    MbapHeader::new(transaction_id, unit_id, pdu_len).encode()
}

/// Reject PDUs longer than the configured maximum frame size
#[inline]
pub fn validate_length(pdu_len: usize, max_frame: usize) -> ModbusResult<()> {
    if pdu_len > max_frame {
        return Err(ModbusError::frame_too_large(pdu_len, max_frame));
    }
    Ok(())
}

/// Encode a complete frame: header followed by the PDU
pub fn encode_frame(transaction_id: u16, unit_id: UnitId, pdu: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_slice(&encode_header(transaction_id, unit_id, pdu.len()));
    frame.put_slice(pdu);
    frame.freeze()
}

/// How much of the receive buffer an invalid frame invalidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Header plus announced body; a stream transport drains bytes that have
    /// not arrived yet
    Bytes(usize),
    /// The whole pending unit (datagram or buffered stream content)
    All,
}

/// Classification of the bytes at the front of a receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// A full frame is buffered
    Complete { header: MbapHeader, pdu_len: usize },
    /// More bytes are needed before the frame can be decided
    Incomplete { needed: usize },
    /// The frame must be dropped
    Invalid { error: ModbusError, discard: Discard },
}

/// Inspect the start of `buf` without consuming it.
///
/// The header is validated as soon as its 7 bytes are present, so an
/// oversized or foreign frame is rejected before its body is awaited.
pub fn inspect_frame(buf: &[u8], max_frame: usize) -> FrameStatus {
    if buf.len() < MBAP_HEADER_LEN {
        return FrameStatus::Incomplete {
            needed: MBAP_HEADER_LEN - buf.len(),
        };
    }

    let header = match MbapHeader::from_slice(buf) {
        Ok(header) => header,
        Err(error) => {
            return FrameStatus::Invalid {
                error,
                discard: Discard::All,
            }
        }
    };

    let pdu_len = match header.pdu_len() {
        Ok(len) => len,
        Err(error) => {
            let body = (header.length as usize).saturating_sub(1);
            return FrameStatus::Invalid {
                error,
                discard: Discard::Bytes(MBAP_HEADER_LEN + body),
            };
        }
    };

    if let Err(error) = validate_length(pdu_len, max_frame) {
        return FrameStatus::Invalid {
            error,
            discard: Discard::Bytes(MBAP_HEADER_LEN + pdu_len),
        };
    }

    let total = MBAP_HEADER_LEN + pdu_len;
    if buf.len() < total {
        return FrameStatus::Incomplete {
            needed: total - buf.len(),
        };
    }

    FrameStatus::Complete { header, pdu_len }
}
