//! Depth Feed
//!
//! The recorder consumes market depth through the [`DepthFeed`] trait:
//! - `connect` once, before streaming starts
//! - `receive_next` for each raw frame
//! - `parse` to turn a frame into structured updates, one at a time, following
//!   the `continuation` chain when a frame carries several packets

pub mod channel;
pub mod websocket;
pub mod wire;

use async_trait::async_trait;

use crate::error::FeedError;
use crate::recorder::record::Side;

pub use channel::ChannelFeed;
pub use websocket::{WebSocketFeed, WebSocketFeedConfig};
pub use wire::{DepthPacket, HEADER_LEN, LEVEL_LEN};

/// An undecoded frame (or the undecoded tail of one).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawUpdate(pub Vec<u8>);

impl RawUpdate {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u8>> for RawUpdate {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Event kind of a structured update. Only `Bid` and `Ask` are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Bid,
    Ask,
    Disconnect,
    Other(u8),
}

impl UpdateKind {
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Bid => Some(Side::Bid),
            Self::Ask => Some(Side::Ask),
            _ => None,
        }
    }
}

/// One price level of a depth update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: i64,
    pub orders: u32,
}

/// A structured depth update.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    pub kind: UpdateKind,
    pub instrument_id: String,
    /// Feed-provided sequence, informational only.
    pub sequence: Option<u32>,
    pub depth: Vec<DepthLevel>,
    /// Undecoded remainder of the frame this update came from.
    pub continuation: Option<RawUpdate>,
}

/// Async source of depth updates.
#[async_trait]
pub trait DepthFeed: Send + 'static {
    /// Establish the connection. Fails with [`FeedError::Connection`].
    async fn connect(&mut self) -> Result<(), FeedError>;

    /// Next raw frame. Fails with [`FeedError::Stream`] when the connection drops.
    async fn receive_next(&mut self) -> Result<RawUpdate, FeedError>;

    /// Decode the first update in `raw`. `Ok(None)` when nothing is left.
    fn parse(&self, raw: RawUpdate) -> Result<Option<DepthUpdate>, FeedError> {
        wire::decode(raw)
    }
}
