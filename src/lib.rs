//! Depth Recorder Library
//!
//! Streams order-book depth from a feed into a bounded ring buffer and
//! periodically persists it to time-bucketed Parquet files.

pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod recorder;
pub mod shutdown;
pub mod stats;

pub use config::RecorderConfig;
pub use error::{FeedError, RecorderError};
pub use recorder::{Recorder, RecorderState};
