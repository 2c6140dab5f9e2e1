//! Recorder statistics
//!
//! Lock-free counters shared by the ingest and flush paths. Every increment
//! is mirrored to the `metrics` facade so an installed exporter picks it up.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RecorderStats {
    pub updates_received: AtomicU64,
    pub updates_discarded: AtomicU64,
    pub levels_recorded: AtomicU64,
    pub invalid_levels: AtomicU64,
    pub parse_errors: AtomicU64,
    pub flush_ticks: AtomicU64,
    pub records_flushed: AtomicU64,
    pub records_lost: AtomicU64,
    pub write_failures: AtomicU64,
    pub files_opened: AtomicU64,
    pub files_closed: AtomicU64,
    pub final_records: AtomicU64,
}

macro_rules! counter_add {
    ($method:ident, $field:ident, $metric:literal) => {
        #[inline]
        pub fn $method(&self, n: u64) {
            if n == 0 {
                return;
            }
            self.$field.fetch_add(n, Ordering::Relaxed);
            metrics::counter!($metric, n);
        }
    };
}

impl RecorderStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter_add!(add_updates_received, updates_received, "depth_recorder_updates_received_total");
    counter_add!(add_updates_discarded, updates_discarded, "depth_recorder_updates_discarded_total");
    counter_add!(add_levels_recorded, levels_recorded, "depth_recorder_levels_recorded_total");
    counter_add!(add_invalid_levels, invalid_levels, "depth_recorder_invalid_levels_total");
    counter_add!(add_parse_errors, parse_errors, "depth_recorder_parse_errors_total");
    counter_add!(add_flush_ticks, flush_ticks, "depth_recorder_flush_ticks_total");
    counter_add!(add_records_flushed, records_flushed, "depth_recorder_records_flushed_total");
    counter_add!(add_records_lost, records_lost, "depth_recorder_records_lost_total");
    counter_add!(add_write_failures, write_failures, "depth_recorder_write_failures_total");
    counter_add!(add_files_opened, files_opened, "depth_recorder_files_opened_total");
    counter_add!(add_files_closed, files_closed, "depth_recorder_files_closed_total");
    counter_add!(add_final_records, final_records, "depth_recorder_final_records_total");

    pub fn snapshot(&self) -> RecorderStatsSnapshot {
        RecorderStatsSnapshot {
            updates_received: self.updates_received.load(Ordering::Relaxed),
            updates_discarded: self.updates_discarded.load(Ordering::Relaxed),
            levels_recorded: self.levels_recorded.load(Ordering::Relaxed),
            invalid_levels: self.invalid_levels.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            flush_ticks: self.flush_ticks.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            files_closed: self.files_closed.load(Ordering::Relaxed),
            final_records: self.final_records.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStatsSnapshot {
    pub updates_received: u64,
    pub updates_discarded: u64,
    pub levels_recorded: u64,
    pub invalid_levels: u64,
    pub parse_errors: u64,
    pub flush_ticks: u64,
    pub records_flushed: u64,
    pub records_lost: u64,
    pub write_failures: u64,
    pub files_opened: u64,
    pub files_closed: u64,
    pub final_records: u64,
}
