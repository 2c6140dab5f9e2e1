//! Recorder configuration
//!
//! Loaded from TOML; every field has a default so an empty file (or no file
//! at all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::TimestampUnit;
use crate::error::RecorderError;
use crate::feed::WebSocketFeedConfig;
use crate::recorder::bucket::{BucketTimezone, WriterStrategy};
use crate::recorder::record::MAX_INSTRUMENT_LEN;
use crate::recorder::sink::Compression;

pub const CONFIG_PATH_ENV: &str = "DEPTH_RECORDER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "depth_recorder.toml";
const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Ring capacity in records.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Directory name under `base_dir`.
    #[serde(default = "default_instrument")]
    pub instrument: String,

    /// Bucket width. Divides an hour, or is a whole number of hours that
    /// divides a day.
    #[serde(default = "default_slot_minutes")]
    pub slot_minutes: u32,

    #[serde(default)]
    pub timezone: BucketTimezone,

    #[serde(default)]
    pub timestamp_unit: TimestampUnit,

    #[serde(default)]
    pub writer_strategy: WriterStrategy,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default = "default_final_suffix")]
    pub final_suffix: String,

    #[serde(default = "default_max_consecutive_write_failures")]
    pub max_consecutive_write_failures: u32,

    #[serde(default)]
    pub feed: WebSocketFeedConfig,
}

fn default_buffer_capacity() -> usize {
    2_000_000
}
fn default_flush_interval_ms() -> u64 {
    300_000
}
fn default_base_dir() -> PathBuf {
    PathBuf::from("market_data")
}
fn default_instrument() -> String {
    "NIFTY_FUT".to_string()
}
fn default_slot_minutes() -> u32 {
    1
}
fn default_final_suffix() -> String {
    "FINAL".to_string()
}
fn default_max_consecutive_write_failures() -> u32 {
    3
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            base_dir: default_base_dir(),
            instrument: default_instrument(),
            slot_minutes: default_slot_minutes(),
            timezone: BucketTimezone::default(),
            timestamp_unit: TimestampUnit::default(),
            writer_strategy: WriterStrategy::default(),
            compression: Compression::default(),
            final_suffix: default_final_suffix(),
            max_consecutive_write_failures: default_max_consecutive_write_failures(),
            feed: WebSocketFeedConfig::default(),
        }
    }
}

impl RecorderConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RecorderError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, RecorderError> {
        toml::from_str(contents).map_err(|e| RecorderError::Config(e.to_string()))
    }

    /// Load from `DEPTH_RECORDER_CONFIG` (or `depth_recorder.toml`), falling
    /// back to defaults when the file is missing or unreadable.
    pub fn from_env() -> Self {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default recorder config ({}): {}", path, e);
            Self::default()
        })
    }

    pub fn to_toml(&self) -> Result<String, RecorderError> {
        toml::to_string_pretty(self).map_err(|e| RecorderError::Config(e.to_string()))
    }

    /// Save to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecorderError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        if self.buffer_capacity == 0 {
            return Err(RecorderError::Config("buffer_capacity must be > 0".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(RecorderError::Config("flush_interval_ms must be > 0".to_string()));
        }
        if self.instrument.is_empty() {
            return Err(RecorderError::Config("instrument must not be empty".to_string()));
        }
        if self.instrument.len() > MAX_INSTRUMENT_LEN
            || self.instrument.contains(['/', '\\'])
            || self.instrument == "."
            || self.instrument == ".."
        {
            return Err(RecorderError::Config(format!(
                "instrument {:?} is not a valid directory name",
                self.instrument
            )));
        }
        if !valid_slot_minutes(self.slot_minutes) {
            return Err(RecorderError::Config(format!(
                "slot_minutes {} must divide 60, or be a multiple of 60 dividing 1440",
                self.slot_minutes
            )));
        }
        if self.final_suffix.is_empty() || self.final_suffix.contains(['/', '\\']) {
            return Err(RecorderError::Config(
                "final_suffix must be a non-empty file name fragment".to_string(),
            ));
        }
        if self.max_consecutive_write_failures == 0 {
            return Err(RecorderError::Config(
                "max_consecutive_write_failures must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn valid_slot_minutes(m: u32) -> bool {
    match m {
        0 => false,
        m if m <= 60 => 60 % m == 0,
        m => m % 60 == 0 && MINUTES_PER_DAY % m == 0,
    }
}
