//! Bucket Writer Lifecycle
//!
//! Maps flush ticks to time-windowed output files. A bucket is identified by
//! `(instrument, date, slot)` where the slot is the time of day floored to
//! `slot_minutes`, derived from the wall clock at the moment of the tick.
//!
//! Layout: `<base_dir>/<instrument>/<YYYY-MM-DD>/<HH_MM>.parquet`
//!
//! The open writer is owned exclusively by this type. When the key changes,
//! the old writer is closed (footer written) before the new one is opened;
//! a closed bucket's file is never reopened, later writes to the same slot
//! go to `HH_MM.1.parquet` and so on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::record::Record;
use super::sink::{self, Compression, IncrementalWriter};
use crate::clock::TimestampUnit;
use crate::error::RecorderError;
use crate::stats::RecorderStats;

/// Timezone used to derive a bucket's date and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketTimezone {
    #[default]
    Local,
    Utc,
}

impl BucketTimezone {
    pub fn localize(self, t: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Local => t.with_timezone(&chrono::Local).naive_local(),
            Self::Utc => t.naive_utc(),
        }
    }
}

/// How flush ticks reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterStrategy {
    /// One open writer per bucket, one row group per tick.
    #[default]
    Incremental,
    /// One complete file per tick.
    SingleShot,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub instrument: String,
    pub date: NaiveDate,
    /// Minute of day at which the slot starts.
    pub slot_start: u32,
}

impl BucketKey {
    pub fn for_time(instrument: &str, local: NaiveDateTime, slot_minutes: u32) -> Self {
        let minute_of_day = local.hour() * 60 + local.minute();
        let width = slot_minutes.max(1);
        Self {
            instrument: instrument.to_string(),
            date: local.date(),
            slot_start: minute_of_day / width * width,
        }
    }

    /// `HH_MM`
    pub fn slot_label(&self) -> String {
        format!("{:02}_{:02}", self.slot_start / 60, self.slot_start % 60)
    }

    /// `YYYY-MM-DD`
    pub fn date_label(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// Directory layout and key derivation.
#[derive(Debug, Clone)]
pub struct BucketLayout {
    pub base_dir: PathBuf,
    pub instrument: String,
    pub slot_minutes: u32,
    pub timezone: BucketTimezone,
}

impl BucketLayout {
    pub fn key_for(&self, now: DateTime<Utc>) -> BucketKey {
        BucketKey::for_time(&self.instrument, self.timezone.localize(now), self.slot_minutes)
    }

    pub fn bucket_dir(&self, key: &BucketKey) -> PathBuf {
        self.base_dir.join(&key.instrument).join(key.date_label())
    }

    /// Preferred path for `key`; the actual file may carry a `.N` part suffix.
    pub fn bucket_path(&self, key: &BucketKey) -> PathBuf {
        self.bucket_dir(key)
            .join(format!("{}.{}", key.slot_label(), sink::PARQUET_EXT))
    }

    /// `<instrument>_<YYYYMMDD>_<HHMM>_<suffix>` stem for the final flush.
    pub fn final_stem(&self, now: DateTime<Utc>, suffix: &str) -> (PathBuf, String) {
        let local = self.timezone.localize(now);
        let key = BucketKey::for_time(&self.instrument, local, self.slot_minutes);
        let stem = format!(
            "{}_{}_{}_{}",
            self.instrument,
            local.format("%Y%m%d"),
            local.format("%H%M"),
            suffix
        );
        (self.bucket_dir(&key), stem)
    }
}

/// Result of one successful [`BucketWriterLifecycle::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct BucketWrite {
    pub key: BucketKey,
    pub path: PathBuf,
    pub rows: usize,
    /// A previously open writer was closed to make room for this bucket.
    pub rolled_over: bool,
}

struct ActiveBucket {
    key: BucketKey,
    writer: IncrementalWriter,
}

pub struct BucketWriterLifecycle {
    layout: BucketLayout,
    strategy: WriterStrategy,
    compression: Compression,
    unit: TimestampUnit,
    schema: SchemaRef,
    active: Option<ActiveBucket>,
    closed: bool,
    stats: Arc<RecorderStats>,
}

impl BucketWriterLifecycle {
    pub fn new(
        layout: BucketLayout,
        strategy: WriterStrategy,
        compression: Compression,
        unit: TimestampUnit,
        stats: Arc<RecorderStats>,
    ) -> Self {
        Self {
            layout,
            strategy,
            compression,
            unit,
            schema: sink::depth_schema(unit),
            active: None,
            closed: false,
            stats,
        }
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    /// Key of the currently open writer, if any.
    pub fn active_key(&self) -> Option<&BucketKey> {
        self.active.as_ref().map(|a| &a.key)
    }

    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.writer.path())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `records` as one append to the bucket in effect at `now`.
    ///
    /// `first_seq` is the sequence number of `records[0]`, used to name
    /// single-shot files.
    pub fn write(
        &mut self,
        records: &[Record],
        first_seq: u64,
        now: DateTime<Utc>,
    ) -> Result<BucketWrite, RecorderError> {
        if self.closed {
            return Err(RecorderError::Write("bucket writer already closed".to_string()));
        }

        let key = self.layout.key_for(now);
        let batch = sink::records_to_batch(records, &self.schema, self.unit)?;

        match self.strategy {
            WriterStrategy::Incremental => {
                let mut rolled_over = false;
                if self.active.as_ref().is_some_and(|a| a.key != key) {
                    rolled_over = true;
                    self.close_active()?;
                }

                if self.active.is_none() {
                    let dir = self.layout.bucket_dir(&key);
                    let path = sink::next_free_path(&dir, &key.slot_label());
                    let writer =
                        IncrementalWriter::create(&path, self.schema.clone(), self.compression)?;
                    self.stats.add_files_opened(1);
                    info!(path = %path.display(), "bucket_opened");
                    self.active = Some(ActiveBucket {
                        key: key.clone(),
                        writer,
                    });
                }

                let Some(active) = self.active.as_mut() else {
                    return Err(RecorderError::Write("no active bucket writer".to_string()));
                };
                let path = active.writer.path().to_path_buf();
                if let Err(e) = active.writer.append(&batch) {
                    // A writer that failed mid-append is retired; the retry
                    // goes to a fresh file.
                    self.discard_active();
                    return Err(e);
                }

                Ok(BucketWrite {
                    key,
                    path,
                    rows: records.len(),
                    rolled_over,
                })
            }
            WriterStrategy::SingleShot => {
                let dir = self.layout.bucket_dir(&key);
                let stem = format!("{}-{}", key.slot_label(), first_seq);
                let path = sink::next_free_path(&dir, &stem);
                sink::write_file(&path, &batch, self.compression)?;
                self.stats.add_files_opened(1);
                self.stats.add_files_closed(1);

                Ok(BucketWrite {
                    key,
                    path,
                    rows: records.len(),
                    rolled_over: false,
                })
            }
        }
    }

    /// Write `records` to a standalone final-output file. Independent of
    /// the rolling buckets; allowed after [`close`](Self::close).
    pub fn write_final(
        &mut self,
        records: &[Record],
        now: DateTime<Utc>,
        suffix: &str,
    ) -> Result<PathBuf, RecorderError> {
        let batch = sink::records_to_batch(records, &self.schema, self.unit)?;
        let (dir, stem) = self.layout.final_stem(now, suffix);
        let path = sink::next_free_path(&dir, &stem);
        sink::write_file(&path, &batch, self.compression)?;
        self.stats.add_files_opened(1);
        self.stats.add_files_closed(1);
        Ok(path)
    }

    /// Close the open writer, if any, and refuse further bucket writes.
    /// Returns the path of the file that was closed.
    pub fn close(&mut self) -> Result<Option<PathBuf>, RecorderError> {
        self.closed = true;
        let path = self.active_path().map(Path::to_path_buf);
        self.close_active()?;
        Ok(path)
    }

    fn close_active(&mut self) -> Result<(), RecorderError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let path = active.writer.path().to_path_buf();
        let rows = active.writer.close()?;
        self.stats.add_files_closed(1);
        info!(path = %path.display(), rows, "bucket_closed");
        Ok(())
    }

    fn discard_active(&mut self) {
        if let Some(active) = self.active.take() {
            let path = active.writer.path().to_path_buf();
            if let Err(e) = active.writer.close() {
                warn!(path = %path.display(), error = %e, "bucket_discarded_unclean");
            }
            self.stats.add_files_closed(1);
        }
    }
}

impl Drop for BucketWriterLifecycle {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(e) = self.close_active() {
                warn!(error = %e, "bucket_close_on_drop_failed");
            }
        }
    }
}
