//! Flush Scheduler
//!
//! Periodically hands the records appended since the last successful flush
//! to the bucket writer. The cursor is a ring sequence number ("next
//! sequence not yet flushed"), so it stays valid however far the ring has
//! wrapped between ticks.
//!
//! The cursor and the bucket writer sit behind one mutex and every write
//! runs on the blocking pool: a write is never interrupted half way and
//! never stalls the ingest task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::bucket::{BucketKey, BucketWriterLifecycle};
use super::ring::{RingBuffer, RingDelta};
use crate::clock::Clock;
use crate::error::RecorderError;
use crate::shutdown::Shutdown;
use crate::stats::RecorderStats;

/// What one flush tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing new since the last flush.
    Idle,
    Written {
        rows: usize,
        /// Records overwritten before they could be flushed.
        lost: u64,
        key: BucketKey,
        path: PathBuf,
        rolled_over: bool,
    },
    /// The write failed; the cursor did not move and the next tick retries.
    Failed { error: String, consecutive: u32 },
}

/// What the final flush did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalFlush {
    pub rows: usize,
    pub lost: u64,
    /// Final-output file, if there was anything left to write.
    pub path: Option<PathBuf>,
    /// Bucket file that was open at shutdown.
    pub closed_bucket: Option<PathBuf>,
}

/// Flush cursor plus the bucket writer it feeds.
pub struct Flusher {
    cursor: u64,
    lifecycle: BucketWriterLifecycle,
    final_suffix: String,
    finalized: bool,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
    stats: Arc<RecorderStats>,
}

impl Flusher {
    pub fn new(
        lifecycle: BucketWriterLifecycle,
        final_suffix: impl Into<String>,
        max_consecutive_failures: u32,
        stats: Arc<RecorderStats>,
    ) -> Self {
        Self {
            cursor: 0,
            lifecycle,
            final_suffix: final_suffix.into(),
            finalized: false,
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
            stats,
        }
    }

    /// Next sequence number not yet flushed.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn lifecycle(&self) -> &BucketWriterLifecycle {
        &self.lifecycle
    }

    /// Read the delta past the cursor. Records already overwritten are
    /// accounted here once, and the cursor skips over them.
    fn take_delta(&mut self, ring: &RingBuffer) -> RingDelta {
        let delta = ring.since(self.cursor);
        if delta.lost > 0 {
            warn!(
                lost = delta.lost,
                from_seq = self.cursor,
                resume_seq = delta.first_seq,
                "ring_overflow_records_lost"
            );
            self.stats.add_records_lost(delta.lost);
            self.cursor = delta.first_seq;
        }
        delta
    }

    /// One flush tick at `now`. `Err` only when write failures have become
    /// fatal.
    pub fn flush(&mut self, ring: &RingBuffer, now: DateTime<Utc>) -> Result<FlushOutcome, RecorderError> {
        self.flush_with(ring, || now)
    }

    /// Like [`flush`](Self::flush), reading `clock` only after the delta has
    /// been taken, so every record in it was appended before `now`.
    pub fn flush_at(&mut self, ring: &RingBuffer, clock: &dyn Clock) -> Result<FlushOutcome, RecorderError> {
        self.flush_with(ring, || clock.now())
    }

    fn flush_with(
        &mut self,
        ring: &RingBuffer,
        now: impl FnOnce() -> DateTime<Utc>,
    ) -> Result<FlushOutcome, RecorderError> {
        if self.finalized || ring.appended() <= self.cursor {
            return Ok(FlushOutcome::Idle);
        }

        let delta = self.take_delta(ring);
        if delta.is_empty() {
            return Ok(FlushOutcome::Idle);
        }

        match self.lifecycle.write(&delta.records, delta.first_seq, now()) {
            Ok(written) => {
                self.cursor = delta.next_seq;
                self.consecutive_failures = 0;
                self.stats.add_records_flushed(written.rows as u64);
                Ok(FlushOutcome::Written {
                    rows: written.rows,
                    lost: delta.lost,
                    key: written.key,
                    path: written.path,
                    rolled_over: written.rolled_over,
                })
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.add_write_failures(1);
                if self.consecutive_failures >= self.max_consecutive_failures {
                    error!(
                        error = %e,
                        consecutive = self.consecutive_failures,
                        "flush_write_failed_fatal"
                    );
                    return Err(e);
                }
                warn!(
                    error = %e,
                    consecutive = self.consecutive_failures,
                    "flush_write_failed_will_retry"
                );
                Ok(FlushOutcome::Failed {
                    error: e.to_string(),
                    consecutive: self.consecutive_failures,
                })
            }
        }
    }

    /// Write everything past the cursor to the final-output file, then close
    /// the bucket writer. Runs once; later calls return an empty result.
    pub fn finalize(&mut self, ring: &RingBuffer, now: DateTime<Utc>) -> Result<FinalFlush, RecorderError> {
        if self.finalized {
            return Ok(FinalFlush::default());
        }
        self.finalized = true;

        let delta = self.take_delta(ring);
        let mut result = FinalFlush {
            lost: delta.lost,
            ..FinalFlush::default()
        };

        let written = if delta.is_empty() {
            Ok(())
        } else {
            self.lifecycle
                .write_final(&delta.records, now, &self.final_suffix)
                .map(|path| {
                    self.cursor = delta.next_seq;
                    result.rows = delta.len();
                    result.path = Some(path);
                    self.stats.add_final_records(delta.len() as u64);
                })
        };

        let closed = self.lifecycle.close();
        written?;
        result.closed_bucket = closed?;
        Ok(result)
    }
}

/// Periodic driver for a shared [`Flusher`].
pub struct FlushScheduler {
    flusher: Arc<Mutex<Flusher>>,
    ring: Arc<RingBuffer>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    stats: Arc<RecorderStats>,
}

impl FlushScheduler {
    pub fn new(
        flusher: Arc<Mutex<Flusher>>,
        ring: Arc<RingBuffer>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        stats: Arc<RecorderStats>,
    ) -> Self {
        Self {
            flusher,
            ring,
            clock,
            interval,
            stats,
        }
    }

    /// Sleep `interval`, flush, repeat. The wait is measured from the end of
    /// the previous tick. Returns `Ok` on shutdown, `Err` on fatal failure.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<(), RecorderError> {
        info!(interval_ms = self.interval.as_millis() as u64, "flush_scheduler_started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("flush_scheduler_stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.tick().await?;
        }
    }

    pub async fn tick(&self) -> Result<FlushOutcome, RecorderError> {
        self.stats.add_flush_ticks(1);

        let flusher = Arc::clone(&self.flusher);
        let ring = Arc::clone(&self.ring);
        let clock = Arc::clone(&self.clock);
        let outcome = tokio::task::spawn_blocking(move || {
            flusher.lock().flush_at(&ring, clock.as_ref())
        })
        .await
        .map_err(|e| RecorderError::Task(format!("flush task: {}", e)))??;

        match &outcome {
            FlushOutcome::Idle => debug!("flush_idle"),
            FlushOutcome::Written {
                rows, lost, path, rolled_over, ..
            } => info!(
                rows,
                lost,
                rolled_over,
                path = %path.display(),
                "flush_written"
            ),
            FlushOutcome::Failed { .. } => {}
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TimestampUnit};
    use crate::recorder::bucket::{BucketLayout, BucketTimezone, WriterStrategy};
    use crate::recorder::record::{InstrumentId, Record, Side};
    use crate::recorder::sink::{self, Compression};
    use arrow::array::{Array, Float64Array};
    use chrono::TimeZone;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;
    use std::path::Path;
    use tempfile::tempdir;

    fn flusher(base: &Path, max_failures: u32) -> (Flusher, Arc<RecorderStats>) {
        let stats = Arc::new(RecorderStats::new());
        let lifecycle = BucketWriterLifecycle::new(
            BucketLayout {
                base_dir: base.to_path_buf(),
                instrument: "NIFTY_FUT".to_string(),
                slot_minutes: 1,
                timezone: BucketTimezone::Utc,
            },
            WriterStrategy::Incremental,
            Compression::Zstd,
            TimestampUnit::Nanos,
            Arc::clone(&stats),
        );
        (Flusher::new(lifecycle, "FINAL", max_failures, Arc::clone(&stats)), stats)
    }

    fn rec(price: f64) -> Record {
        Record::new(0, InstrumentId::new("49081").unwrap(), Side::Bid, price, 1).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn prices(path: &Path) -> Vec<f64> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let mut out = Vec::new();
        for batch in reader {
            let batch = batch.unwrap();
            let col = batch.column(3).as_any().downcast_ref::<Float64Array>().unwrap();
            out.extend((0..col.len()).map(|i| col.value(i)));
        }
        out
    }

    #[test]
    fn test_nothing_appended_is_idle() {
        let dir = tempdir().unwrap();
        let (mut f, _stats) = flusher(dir.path(), 3);
        let ring = RingBuffer::new(4);
        assert_eq!(f.flush(&ring, at(9, 15, 0)).unwrap(), FlushOutcome::Idle);
        assert!(f.lifecycle().active_path().is_none());
    }

    #[test]
    fn test_sequence_cursor_survives_wraparound() {
        let dir = tempdir().unwrap();
        let (mut f, _stats) = flusher(dir.path(), 3);
        let ring = RingBuffer::new(3);

        ring.append(rec(1.0));
        ring.append(rec(2.0));
        let first = f.flush(&ring, at(9, 15, 0)).unwrap();
        assert!(matches!(first, FlushOutcome::Written { rows: 2, lost: 0, .. }));

        ring.append(rec(3.0));
        ring.append(rec(4.0));
        let second = f.flush(&ring, at(9, 15, 10)).unwrap();
        assert!(matches!(second, FlushOutcome::Written { rows: 2, lost: 0, .. }));
        assert_eq!(f.flush(&ring, at(9, 15, 20)).unwrap(), FlushOutcome::Idle);

        f.finalize(&ring, at(9, 15, 30)).unwrap();
        let path = dir.path().join("NIFTY_FUT/2024-03-01/09_15.parquet");
        assert_eq!(prices(&path), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_overflow_reported_once() {
        let dir = tempdir().unwrap();
        let (mut f, stats) = flusher(dir.path(), 3);
        let ring = RingBuffer::new(2);
        for p in 1..=5 {
            ring.append(rec(p as f64));
        }

        match f.flush(&ring, at(9, 15, 0)).unwrap() {
            FlushOutcome::Written { rows, lost, .. } => {
                assert_eq!(rows, 2);
                assert_eq!(lost, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.cursor(), 5);
        assert_eq!(stats.snapshot().records_lost, 3);
    }

    #[test]
    fn test_failed_write_keeps_cursor_then_turns_fatal() {
        let dir = tempdir().unwrap();
        // A plain file where the instrument directory should be.
        std::fs::write(dir.path().join("NIFTY_FUT"), b"blocker").unwrap();
        let (mut f, stats) = flusher(dir.path(), 2);
        let ring = RingBuffer::new(8);
        ring.append(rec(1.0));

        match f.flush(&ring, at(9, 15, 0)).unwrap() {
            FlushOutcome::Failed { consecutive, .. } => assert_eq!(consecutive, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.cursor(), 0);

        let err = f.flush(&ring, at(9, 15, 1)).unwrap_err();
        assert!(matches!(err, RecorderError::Write(_)));
        assert_eq!(f.cursor(), 0);
        assert_eq!(stats.snapshot().write_failures, 2);
    }

    #[test]
    fn test_failure_then_recovery_writes_everything() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("NIFTY_FUT");
        std::fs::write(&blocker, b"blocker").unwrap();
        let (mut f, _stats) = flusher(dir.path(), 3);
        let ring = RingBuffer::new(8);
        ring.append(rec(1.0));
        assert!(matches!(
            f.flush(&ring, at(9, 15, 0)).unwrap(),
            FlushOutcome::Failed { .. }
        ));

        std::fs::remove_file(&blocker).unwrap();
        ring.append(rec(2.0));
        let FlushOutcome::Written { rows, path, .. } = f.flush(&ring, at(9, 15, 5)).unwrap() else {
            panic!("expected a write");
        };
        assert_eq!(rows, 2);
        f.finalize(&ring, at(9, 15, 6)).unwrap();
        assert_eq!(prices(&path), vec![1.0, 2.0]);
    }

    #[test]
    fn test_finalize_writes_remainder_exactly_once() {
        let dir = tempdir().unwrap();
        let (mut f, stats) = flusher(dir.path(), 3);
        let ring = RingBuffer::new(16);
        for p in 1..=3 {
            ring.append(rec(p as f64));
        }
        let FlushOutcome::Written { path: bucket, .. } = f.flush(&ring, at(15, 29, 0)).unwrap() else {
            panic!("expected a write");
        };
        for p in 4..=6 {
            ring.append(rec(p as f64));
        }

        let done = f.finalize(&ring, at(15, 30, 0)).unwrap();
        assert_eq!(done.rows, 3);
        assert_eq!(done.closed_bucket.as_ref(), Some(&bucket));
        let final_path = done.path.unwrap();
        assert!(final_path.ends_with("NIFTY_FUT_20240301_1530_FINAL.parquet"));
        assert_eq!(prices(&final_path), vec![4.0, 5.0, 6.0]);
        assert_eq!(prices(&bucket), vec![1.0, 2.0, 3.0]);

        ring.append(rec(7.0));
        assert_eq!(f.finalize(&ring, at(15, 31, 0)).unwrap(), FinalFlush::default());
        assert_eq!(f.flush(&ring, at(15, 31, 0)).unwrap(), FlushOutcome::Idle);
        assert_eq!(stats.snapshot().final_records, 3);
        assert_eq!(sink::count_rows(&final_path).unwrap(), 3);
    }

    #[test]
    fn test_finalize_with_nothing_left() {
        let dir = tempdir().unwrap();
        let (mut f, _stats) = flusher(dir.path(), 3);
        let ring = RingBuffer::new(4);
        let done = f.finalize(&ring, at(9, 0, 0)).unwrap();
        assert_eq!(done.rows, 0);
        assert!(done.path.is_none());
    }

    #[tokio::test]
    async fn test_scheduler_tick_and_stop() {
        let dir = tempdir().unwrap();
        let (f, stats) = flusher(dir.path(), 3);
        let flusher = Arc::new(Mutex::new(f));
        let ring = Arc::new(RingBuffer::new(8));
        let clock = ManualClock::new(at(9, 15, 0));
        let scheduler = FlushScheduler::new(
            Arc::clone(&flusher),
            Arc::clone(&ring),
            Arc::new(clock),
            Duration::from_millis(10),
            Arc::clone(&stats),
        );

        ring.append(rec(1.0));
        assert!(matches!(scheduler.tick().await.unwrap(), FlushOutcome::Written { rows: 1, .. }));
        assert_eq!(scheduler.tick().await.unwrap(), FlushOutcome::Idle);
        assert_eq!(flusher.lock().cursor(), 1);

        let (trigger, shutdown) = crate::shutdown::channel();
        let handle = tokio::spawn(scheduler.run(shutdown));
        ring.append(rec(2.0));
        tokio::time::timeout(Duration::from_secs(5), async {
            while flusher.lock().cursor() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        trigger.trigger();
        handle.await.unwrap().unwrap();
        assert!(stats.snapshot().flush_ticks >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_waits_full_interval() {
        let dir = tempdir().unwrap();
        let (f, stats) = flusher(dir.path(), 3);
        let scheduler = FlushScheduler::new(
            Arc::new(Mutex::new(f)),
            Arc::new(RingBuffer::new(4)),
            Arc::new(ManualClock::new(at(9, 15, 0))),
            Duration::from_secs(300),
            Arc::clone(&stats),
        );
        let (trigger, shutdown) = crate::shutdown::channel();
        let handle = tokio::spawn(scheduler.run(shutdown));

        tokio::time::advance(Duration::from_secs(299)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(stats.snapshot().flush_ticks, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..100 {
            if stats.snapshot().flush_ticks > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(stats.snapshot().flush_ticks, 1);

        trigger.trigger();
        handle.await.unwrap().unwrap();
    }
}
