//! Ingest Loop
//!
//! Sole producer for the ring. Awaits feed frames, drains each frame's
//! continuation chain to completion, and appends one [`Record`] per depth
//! level in level order. Timestamps are taken at processing time and clamped
//! so they never go backwards as seen by this loop.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::record::{InstrumentId, Record};
use super::ring::RingBuffer;
use crate::clock::{Clock, TimestampUnit};
use crate::error::RecorderError;
use crate::feed::{DepthFeed, DepthLevel, DepthUpdate, RawUpdate, UpdateKind};
use crate::shutdown::Shutdown;
use crate::stats::RecorderStats;

pub struct IngestLoop<F: DepthFeed> {
    feed: F,
    ring: Arc<RingBuffer>,
    clock: Arc<dyn Clock>,
    unit: TimestampUnit,
    stats: Arc<RecorderStats>,
    last_timestamp: i64,
}

impl<F: DepthFeed> IngestLoop<F> {
    /// `feed` must already be connected.
    pub fn new(
        feed: F,
        ring: Arc<RingBuffer>,
        clock: Arc<dyn Clock>,
        unit: TimestampUnit,
        stats: Arc<RecorderStats>,
    ) -> Self {
        Self {
            feed,
            ring,
            clock,
            unit,
            stats,
            last_timestamp: i64::MIN,
        }
    }

    /// Run until shutdown (`Ok`) or until the feed fails (`Err`, no retry).
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<(), RecorderError> {
        loop {
            let raw = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("ingest_loop_stopped");
                    return Ok(());
                }
                received = self.feed.receive_next() => match received {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(error = %e, "ingest_feed_failed");
                        return Err(e.into());
                    }
                },
            };
            self.process_frame(raw);
        }
    }

    /// Drain one frame and its continuation chain. Returns records appended.
    pub fn process_frame(&mut self, raw: RawUpdate) -> usize {
        let mut remaining = Some(raw);
        let mut appended = 0;

        while let Some(payload) = remaining.take() {
            if payload.is_empty() {
                break;
            }
            let update = match self.feed.parse(payload) {
                Ok(Some(update)) => update,
                Ok(None) => break,
                Err(e) => {
                    // The rest of the chain cannot be located past a bad packet.
                    self.stats.add_parse_errors(1);
                    debug!(error = %e, "malformed_payload_skipped");
                    break;
                }
            };
            self.stats.add_updates_received(1);

            let DepthUpdate {
                kind,
                instrument_id,
                depth,
                continuation,
                ..
            } = update;
            remaining = continuation;
            appended += self.record_update(kind, &instrument_id, &depth);
        }

        appended
    }

    fn record_update(&mut self, kind: UpdateKind, instrument_id: &str, depth: &[DepthLevel]) -> usize {
        let Some(side) = kind.side() else {
            self.stats.add_updates_discarded(1);
            if kind == UpdateKind::Disconnect {
                info!(instrument_id, "feed_disconnect_notice");
            }
            return 0;
        };

        let id = match InstrumentId::new(instrument_id) {
            Ok(id) => id,
            Err(e) => {
                self.stats.add_invalid_levels(depth.len() as u64);
                warn!(error = %e, "update_with_bad_instrument_skipped");
                return 0;
            }
        };

        let mut recorded = 0;
        for level in depth {
            let ts = self.next_timestamp();
            match Record::new(ts, id, side, level.price, level.quantity) {
                Ok(record) => {
                    self.ring.append(record);
                    recorded += 1;
                }
                Err(e) => {
                    self.stats.add_invalid_levels(1);
                    debug!(error = %e, "invalid_level_skipped");
                }
            }
        }
        self.stats.add_levels_recorded(recorded as u64);
        recorded
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = self.unit.from_datetime(&self.clock.now());
        self.last_timestamp = self.last_timestamp.max(now);
        self.last_timestamp
    }
}
