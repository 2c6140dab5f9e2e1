//! Binary Depth Packet Codec
//!
//! Chained fixed-layout packets; one frame may carry several back to back.
//!
//! Layout (all fields little-endian):
//! ```text
//! Offset  Size  Field
//! 0       2     packet length, header included
//! 2       1     response code (41 = bid, 51 = ask, 50 = disconnect)
//! 3       1     exchange segment
//! 4       4     security id
//! 8       4     sequence
//! 12      16*N  levels: price f64, quantity u32, orders u32
//! ```

use super::{DepthLevel, DepthUpdate, RawUpdate, UpdateKind};
use crate::error::FeedError;

pub const HEADER_LEN: usize = 12;
pub const LEVEL_LEN: usize = 16;

pub const CODE_BID: u8 = 41;
pub const CODE_DISCONNECT: u8 = 50;
pub const CODE_ASK: u8 = 51;

impl UpdateKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            CODE_BID => Self::Bid,
            CODE_ASK => Self::Ask,
            CODE_DISCONNECT => Self::Disconnect,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Bid => CODE_BID,
            Self::Ask => CODE_ASK,
            Self::Disconnect => CODE_DISCONNECT,
            Self::Other(code) => *code,
        }
    }
}

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn read_f64(buf: &[u8], at: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    f64::from_le_bytes(b)
}

/// Decode the first packet of `raw`; the remaining bytes become the continuation.
///
/// All-zero levels are padding and are dropped.
pub fn decode(raw: RawUpdate) -> Result<Option<DepthUpdate>, FeedError> {
    let mut bytes = raw.0;
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() < HEADER_LEN {
        return Err(FeedError::Malformed(format!(
            "truncated header: {} bytes",
            bytes.len()
        )));
    }

    let packet_len = read_u16(&bytes, 0) as usize;
    if packet_len < HEADER_LEN || packet_len > bytes.len() {
        return Err(FeedError::Malformed(format!(
            "packet length {} out of range (frame has {} bytes)",
            packet_len,
            bytes.len()
        )));
    }
    if (packet_len - HEADER_LEN) % LEVEL_LEN != 0 {
        return Err(FeedError::Malformed(format!(
            "packet length {} is not header plus whole levels",
            packet_len
        )));
    }

    let kind = UpdateKind::from_code(bytes[2]);
    let security_id = read_u32(&bytes, 4);
    let sequence = read_u32(&bytes, 8);

    let depth = bytes[HEADER_LEN..packet_len]
        .chunks_exact(LEVEL_LEN)
        .map(|level| DepthLevel {
            price: read_f64(level, 0),
            quantity: read_u32(level, 8) as i64,
            orders: read_u32(level, 12),
        })
        .filter(|level| !(level.price == 0.0 && level.quantity == 0))
        .collect();

    let continuation = if bytes.len() > packet_len {
        Some(RawUpdate(bytes.split_off(packet_len)))
    } else {
        None
    };

    Ok(Some(DepthUpdate {
        kind,
        instrument_id: security_id.to_string(),
        sequence: Some(sequence),
        depth,
        continuation,
    }))
}

/// An encodable packet, for tests and replay tooling.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthPacket {
    pub kind: UpdateKind,
    pub exchange_segment: u8,
    pub security_id: u32,
    pub sequence: u32,
    /// (price, quantity, orders)
    pub levels: Vec<(f64, u32, u32)>,
}

impl DepthPacket {
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.levels.len() * LEVEL_LEN
    }

    /// Append the encoded packet to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let len = self.encoded_len();
        debug_assert!(len <= u16::MAX as usize);
        out.reserve(len);
        out.extend_from_slice(&(len as u16).to_le_bytes());
        out.push(self.kind.code());
        out.push(self.exchange_segment);
        out.extend_from_slice(&self.security_id.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        for &(price, quantity, orders) in &self.levels {
            out.extend_from_slice(&price.to_le_bytes());
            out.extend_from_slice(&quantity.to_le_bytes());
            out.extend_from_slice(&orders.to_le_bytes());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }
}

/// Concatenate packets into a single frame.
pub fn encode_frame(packets: &[DepthPacket]) -> RawUpdate {
    let mut out = Vec::with_capacity(packets.iter().map(|p| p.encoded_len()).sum());
    for packet in packets {
        packet.encode_into(&mut out);
    }
    RawUpdate(out)
}
