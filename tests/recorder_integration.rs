//! End-to-end recorder runs against an in-memory feed.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, Float64Array, StringArray};
use chrono::{TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tokio::sync::mpsc;

use depth_recorder::clock::ManualClock;
use depth_recorder::feed::wire::{encode_frame, DepthPacket};
use depth_recorder::feed::{ChannelFeed, RawUpdate, UpdateKind};
use depth_recorder::recorder::{BucketTimezone, WriterStrategy};
use depth_recorder::shutdown::{self, ShutdownTrigger};
use depth_recorder::stats::RecorderStats;
use depth_recorder::{Recorder, RecorderConfig, RecorderError, RecorderState};

type RunHandle = tokio::task::JoinHandle<(Recorder<ChannelFeed>, Result<(), RecorderError>)>;

fn config(base: &Path, capacity: usize, flush_ms: u64) -> RecorderConfig {
    RecorderConfig {
        buffer_capacity: capacity,
        flush_interval_ms: flush_ms,
        base_dir: base.to_path_buf(),
        instrument: "NIFTY_FUT".to_string(),
        timezone: BucketTimezone::Utc,
        ..Default::default()
    }
}

/// One bid packet with `levels` distinct prices starting at `first_price`.
fn bid_frame(first_price: u32, levels: u32) -> RawUpdate {
    let levels = (0..levels)
        .map(|i| ((first_price + i) as f64, 10 + i, 1))
        .collect();
    encode_frame(&[DepthPacket {
        kind: UpdateKind::Bid,
        exchange_segment: 2,
        security_id: 49081,
        sequence: first_price,
        levels,
    }])
}

struct Harness {
    tx: Option<mpsc::Sender<RawUpdate>>,
    trigger: ShutdownTrigger,
    stats: Arc<RecorderStats>,
    handle: RunHandle,
}

fn start(recorder: Recorder<ChannelFeed>, tx: mpsc::Sender<RawUpdate>) -> Harness {
    let mut recorder = recorder;
    let stats = recorder.stats();
    let (trigger, shutdown) = shutdown::channel();
    let handle = tokio::spawn(async move {
        let result = recorder.run(shutdown).await;
        (recorder, result)
    });
    Harness {
        tx: Some(tx),
        trigger,
        stats,
        handle,
    }
}

impl Harness {
    async fn send(&self, frame: RawUpdate) {
        self.tx.as_ref().unwrap().send(frame).await.unwrap();
    }

    async fn finish(self) -> (Recorder<ChannelFeed>, Result<(), RecorderError>) {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("recorder did not stop")
            .unwrap()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn parquet_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "parquet") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

fn read_prices(path: &Path) -> Vec<f64> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
        .unwrap()
        .build()
        .unwrap();
    let mut prices = Vec::new();
    for batch in reader {
        let batch = batch.unwrap();
        let sides = batch.column(2).as_any().downcast_ref::<StringArray>().unwrap();
        assert!((0..sides.len()).all(|i| sides.value(i) == "Bid"));
        let col = batch.column(3).as_any().downcast_ref::<Float64Array>().unwrap();
        prices.extend((0..col.len()).map(|i| col.value(i)));
    }
    prices
}

fn all_prices(root: &Path) -> Vec<f64> {
    parquet_files(root).iter().flat_map(|p| read_prices(p)).collect()
}

fn is_final(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with("_FINAL.parquet"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_flushes_everything_once() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, feed) = ChannelFeed::new(64);
    let recorder = Recorder::new(config(dir.path(), 1_000, 20), feed).unwrap();
    let ring = recorder.ring();
    let h = start(recorder, tx);

    for i in 0..5 {
        h.send(bid_frame(1_000 + i * 10, 5)).await;
    }
    wait_until(|| h.stats.snapshot().records_flushed >= 25).await;

    for i in 0..4 {
        h.send(bid_frame(2_000 + i * 10, 5)).await;
    }
    wait_until(|| ring.appended() == 45).await;
    h.trigger.trigger();

    let (recorder, result) = h.finish().await;
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(recorder.state(), RecorderState::Stopped);

    let prices = all_prices(dir.path());
    assert_eq!(prices.len(), 45);
    let unique: HashSet<u64> = prices.iter().map(|p| p.to_bits()).collect();
    assert_eq!(unique.len(), 45, "duplicate records across files");

    let snap = recorder.stats().snapshot();
    assert_eq!(snap.records_flushed + snap.final_records, 45);
    assert_eq!(snap.records_lost, 0);
}

#[tokio::test]
async fn test_stream_failure_propagates_after_final_flush() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, feed) = ChannelFeed::new(16);
    let recorder = Recorder::new(config(dir.path(), 1_000, 60_000), feed).unwrap();
    let ring = recorder.ring();
    let mut h = start(recorder, tx);

    h.send(bid_frame(100, 3)).await;
    h.send(bid_frame(200, 2)).await;
    wait_until(|| ring.appended() == 5).await;
    h.tx.take();

    let (_recorder, result) = h.finish().await;
    assert!(matches!(result, Err(RecorderError::Stream(_))));

    let files = parquet_files(dir.path());
    assert_eq!(files.len(), 1);
    assert!(is_final(&files[0]));
    assert_eq!(read_prices(&files[0]), vec![100.0, 101.0, 102.0, 200.0, 201.0]);
}

#[tokio::test]
async fn test_connection_failure_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, feed) = ChannelFeed::new(1);
    let recorder = Recorder::new(config(dir.path(), 10, 10), feed.with_connect_error("refused")).unwrap();
    let h = start(recorder, tx);

    let (recorder, result) = h.finish().await;
    assert!(matches!(result, Err(RecorderError::Connection(_))));
    assert_eq!(recorder.state(), RecorderState::Stopped);
    assert!(parquet_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_overflow_keeps_newest_records() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, feed) = ChannelFeed::new(16);
    let recorder = Recorder::new(config(dir.path(), 4, 60_000), feed).unwrap();
    let ring = recorder.ring();
    let h = start(recorder, tx);

    h.send(bid_frame(1, 10)).await;
    wait_until(|| ring.appended() == 10).await;
    h.trigger.trigger();

    let (recorder, result) = h.finish().await;
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(all_prices(dir.path()), vec![7.0, 8.0, 9.0, 10.0]);
    let snap = recorder.stats().snapshot();
    assert_eq!(snap.records_lost, 6);
    assert_eq!(snap.final_records, 4);
}

#[tokio::test]
async fn test_bucket_rollover_on_slot_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 15, 30).unwrap());
    let (tx, feed) = ChannelFeed::new(16);
    let recorder =
        Recorder::with_clock(config(dir.path(), 100, 10), feed, Arc::new(clock.clone())).unwrap();
    let h = start(recorder, tx);

    h.send(bid_frame(10, 3)).await;
    wait_until(|| h.stats.snapshot().records_flushed >= 3).await;

    clock.set(Utc.with_ymd_and_hms(2024, 3, 1, 9, 16, 0).unwrap());
    h.send(bid_frame(20, 2)).await;
    wait_until(|| h.stats.snapshot().records_flushed >= 5).await;
    h.trigger.trigger();

    let (recorder, _) = h.finish().await;
    let day = dir.path().join("NIFTY_FUT").join("2024-03-01");
    assert_eq!(read_prices(&day.join("09_15.parquet")), vec![10.0, 11.0, 12.0]);
    assert_eq!(read_prices(&day.join("09_16.parquet")), vec![20.0, 21.0]);
    assert!(!parquet_files(dir.path()).iter().any(|p| is_final(p)));

    let snap = recorder.stats().snapshot();
    assert_eq!(snap.files_opened, 2);
    assert_eq!(snap.files_closed, 2);
}

#[tokio::test]
async fn test_single_shot_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    let (tx, feed) = ChannelFeed::new(16);
    let cfg = RecorderConfig {
        writer_strategy: WriterStrategy::SingleShot,
        ..config(dir.path(), 100, 10)
    };
    let recorder = Recorder::with_clock(cfg, feed, Arc::new(clock)).unwrap();
    let h = start(recorder, tx);

    h.send(bid_frame(1, 2)).await;
    wait_until(|| h.stats.snapshot().records_flushed >= 2).await;
    h.send(bid_frame(5, 3)).await;
    wait_until(|| h.stats.snapshot().records_flushed >= 5).await;
    h.trigger.trigger();
    h.finish().await;

    let day = dir.path().join("NIFTY_FUT").join("2024-03-01");
    assert_eq!(read_prices(&day.join("10_00-0.parquet")), vec![1.0, 2.0]);
    assert_eq!(read_prices(&day.join("10_00-2.parquet")), vec![5.0, 6.0, 7.0]);
}

#[tokio::test]
async fn test_repeated_write_failures_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("NIFTY_FUT"), b"not a directory").unwrap();
    let (tx, feed) = ChannelFeed::new(16);
    let cfg = RecorderConfig {
        max_consecutive_write_failures: 2,
        ..config(dir.path(), 100, 10)
    };
    let recorder = Recorder::new(cfg, feed).unwrap();
    let h = start(recorder, tx.clone());

    h.send(bid_frame(1, 1)).await;
    let (recorder, result) = h.finish().await;
    assert!(matches!(result, Err(RecorderError::Write(_))));
    assert!(recorder.stats().snapshot().write_failures >= 2);
    drop(tx);
}
