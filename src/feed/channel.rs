//! In-process depth feed.
//!
//! Bridges any producer (a replay reader, another connection, a test) onto
//! the [`DepthFeed`] trait through a bounded `mpsc` channel. Dropping every
//! sender ends the stream with [`FeedError::Stream`], like a dropped socket.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{DepthFeed, RawUpdate};
use crate::error::FeedError;

pub struct ChannelFeed {
    rx: mpsc::Receiver<RawUpdate>,
    connect_error: Option<String>,
    connected: bool,
}

impl ChannelFeed {
    /// Create a feed and the sender that drives it.
    pub fn new(buffer: usize) -> (mpsc::Sender<RawUpdate>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            tx,
            Self {
                rx,
                connect_error: None,
                connected: false,
            },
        )
    }

    /// Make `connect` fail with the given message.
    pub fn with_connect_error(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }
}

#[async_trait]
impl DepthFeed for ChannelFeed {
    async fn connect(&mut self) -> Result<(), FeedError> {
        if let Some(message) = &self.connect_error {
            return Err(FeedError::Connection(message.clone()));
        }
        self.connected = true;
        Ok(())
    }

    async fn receive_next(&mut self) -> Result<RawUpdate, FeedError> {
        if !self.connected {
            return Err(FeedError::Stream("not connected".to_string()));
        }
        self.rx
            .recv()
            .await
            .ok_or_else(|| FeedError::Stream("channel closed".to_string()))
    }
}
