//! WebSocket depth feed.
//!
//! Connects with `tokio-tungstenite`, optionally sends one subscribe frame,
//! and hands binary frames to the recorder untouched. Session handshakes and
//! credentials belong to whoever builds the URL and subscribe message.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{DepthFeed, RawUpdate};
use crate::error::FeedError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketFeedConfig {
    #[serde(default = "default_url")]
    pub url: String,

    /// Text frame sent right after connecting, if any.
    #[serde(default)]
    pub subscribe_message: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:9443/depth".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for WebSocketFeedConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            subscribe_message: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

pub struct WebSocketFeed {
    config: WebSocketFeedConfig,
    stream: Option<WsStream>,
    frames_received: u64,
}

impl WebSocketFeed {
    pub fn new(config: WebSocketFeedConfig) -> Self {
        Self {
            config,
            stream: None,
            frames_received: 0,
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }
}

#[async_trait]
impl DepthFeed for WebSocketFeed {
    async fn connect(&mut self) -> Result<(), FeedError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        debug!(url = %self.config.url, "connecting");

        let connect_result =
            tokio::time::timeout(timeout, connect_async(self.config.url.as_str())).await;

        let (mut ws, _response) = match connect_result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(FeedError::Connection(e.to_string())),
            Err(_) => {
                return Err(FeedError::Connection(format!(
                    "connect timeout after {}ms",
                    self.config.connect_timeout_ms
                )))
            }
        };

        if let Some(subscribe) = &self.config.subscribe_message {
            ws.send(Message::Text(subscribe.clone()))
                .await
                .map_err(|e| FeedError::Connection(format!("subscribe failed: {}", e)))?;
        }

        info!(url = %self.config.url, "feed_connected");
        self.stream = Some(ws);
        Ok(())
    }

    async fn receive_next(&mut self) -> Result<RawUpdate, FeedError> {
        let ws = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::Stream("not connected".to_string()))?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    self.frames_received += 1;
                    return Ok(RawUpdate(bytes));
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        warn!(error = %e, "pong_send_failed");
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    debug!(len = text.len(), "text_frame_ignored");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "server_close");
                    self.stream = None;
                    return Err(FeedError::Stream("server closed connection".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(FeedError::Stream(e.to_string()));
                }
                None => {
                    self.stream = None;
                    return Err(FeedError::Stream("stream ended".to_string()));
                }
            }
        }
    }
}
