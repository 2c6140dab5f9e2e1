//! Error taxonomy for the recorder and its feed seam.

use thiserror::Error;

/// Errors raised by a [`DepthFeed`](crate::feed::DepthFeed) implementation.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// The feed could not be reached.
    #[error("feed connection failed: {0}")]
    Connection(String),

    /// The connection dropped or the receive call failed mid-stream.
    #[error("feed stream failed: {0}")]
    Stream(String),

    /// A payload could not be decoded. Recoverable: the payload is skipped.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Errors surfaced by [`Recorder::run`](crate::recorder::Recorder::run).
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The recorder was stopped by an external shutdown signal.
    #[error("recorder cancelled")]
    Cancelled,

    #[error("recorder already started")]
    AlreadyStarted,

    #[error("task failed: {0}")]
    Task(String),
}

impl RecorderError {
    /// True for an external stop rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<FeedError> for RecorderError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::Connection(msg) => Self::Connection(msg),
            FeedError::Stream(msg) | FeedError::Malformed(msg) => Self::Stream(msg),
        }
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        Self::Write(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for RecorderError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Self::Write(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for RecorderError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Write(err.to_string())
    }
}
