//! Depth Record
//!
//! The fixed-shape row persisted per depth level. `Record` is `Copy`: it is
//! written into one ring slot and copied out by value at flush time, so no
//! downstream view aliases a slot that may later be overwritten.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum instrument identifier length in bytes.
pub const MAX_INSTRUMENT_LEN: usize = 20;

/// Rejected record fields.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidRecord {
    #[error("instrument id empty")]
    EmptyInstrument,
    #[error("instrument id longer than {MAX_INSTRUMENT_LEN} bytes: {0}")]
    InstrumentTooLong(String),
    #[error("price must be finite and non-negative, got {0}")]
    BadPrice(f64),
    #[error("quantity must be non-negative, got {0}")]
    BadQuantity(i64),
}

/// Bounded-length, inline instrument identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrumentId {
    bytes: [u8; MAX_INSTRUMENT_LEN],
    len: u8,
}

impl InstrumentId {
    pub fn new(id: &str) -> Result<Self, InvalidRecord> {
        if id.is_empty() {
            return Err(InvalidRecord::EmptyInstrument);
        }
        if id.len() > MAX_INSTRUMENT_LEN {
            return Err(InvalidRecord::InstrumentTooLong(id.to_string()));
        }
        let mut bytes = [0u8; MAX_INSTRUMENT_LEN];
        bytes[..id.len()].copy_from_slice(id.as_bytes());
        Ok(Self {
            bytes,
            len: id.len() as u8,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // Constructed only from a &str, so the prefix is valid UTF-8.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl fmt::Debug for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstrumentId({})", self.as_str())
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Book side of a depth level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bid => "Bid",
            Self::Ask => "Ask",
        }
    }
}

/// One persisted depth level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    /// Processing time, in the recorder's configured unit since the Unix epoch.
    pub timestamp: i64,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub price: f64,
    pub quantity: i32,
}

impl Record {
    /// Build a validated record.
    pub fn new(
        timestamp: i64,
        instrument_id: InstrumentId,
        side: Side,
        price: f64,
        quantity: i64,
    ) -> Result<Self, InvalidRecord> {
        if !price.is_finite() || price < 0.0 {
            return Err(InvalidRecord::BadPrice(price));
        }
        if quantity < 0 || quantity > i32::MAX as i64 {
            return Err(InvalidRecord::BadQuantity(quantity));
        }
        Ok(Self {
            timestamp,
            instrument_id,
            side,
            price,
            quantity: quantity as i32,
        })
    }
}
