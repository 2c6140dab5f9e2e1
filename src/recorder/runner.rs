//! Recorder
//!
//! Owns the ring and wires the feed, the ingest loop and the flush scheduler
//! together. State machine: `Idle -> Running -> ShuttingDown -> Stopped`.
//!
//! Whichever side initiates the stop (external shutdown, a feed failure, a
//! fatal write failure), both loops are signalled, joined, and then the final
//! flush runs exactly once. If `run` itself is dropped mid-flight the same
//! final flush runs from a drop guard.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bucket::{BucketLayout, BucketWriterLifecycle};
use super::flush::{FinalFlush, FlushScheduler, Flusher};
use super::ingest::IngestLoop;
use super::ring::RingBuffer;
use crate::clock::{Clock, SystemClock};
use crate::config::RecorderConfig;
use crate::error::RecorderError;
use crate::feed::DepthFeed;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::stats::RecorderStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Recorder<F: DepthFeed> {
    config: RecorderConfig,
    feed: Option<F>,
    ring: Arc<RingBuffer>,
    clock: Arc<dyn Clock>,
    stats: Arc<RecorderStats>,
    state: Arc<RwLock<RecorderState>>,
}

impl<F: DepthFeed> Recorder<F> {
    pub fn new(config: RecorderConfig, feed: F) -> Result<Self, RecorderError> {
        Self::with_clock(config, feed, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RecorderConfig,
        feed: F,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RecorderError> {
        config.validate()?;
        let ring = Arc::new(RingBuffer::new(config.buffer_capacity));
        Ok(Self {
            config,
            feed: Some(feed),
            ring,
            clock,
            stats: Arc::new(RecorderStats::new()),
            state: Arc::new(RwLock::new(RecorderState::Idle)),
        })
    }

    pub fn state(&self) -> RecorderState {
        *self.state.read()
    }

    pub fn stats(&self) -> Arc<RecorderStats> {
        Arc::clone(&self.stats)
    }

    pub fn ring(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    fn set_state(&self, next: RecorderState) {
        let mut state = self.state.write();
        debug!(from = ?*state, to = ?next, "recorder_state");
        *state = next;
    }

    /// Record until `shutdown` fires or a loop fails.
    ///
    /// Always returns `Err` carrying the stop cause:
    /// [`RecorderError::Cancelled`] for an external stop, otherwise the first
    /// failure. The final flush has completed by the time this returns.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<(), RecorderError> {
        let Some(mut feed) = self.feed.take() else {
            return Err(RecorderError::AlreadyStarted);
        };

        info!(
            instrument = %self.config.instrument,
            capacity = self.config.buffer_capacity,
            flush_interval_ms = self.config.flush_interval_ms,
            "recorder_connecting"
        );
        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(RecorderError::Cancelled),
            result = feed.connect() => result.map_err(RecorderError::from),
        };
        if let Err(e) = connected {
            error!(error = %e, "recorder_connect_failed");
            self.set_state(RecorderState::Stopped);
            return Err(e);
        }

        let flusher = Arc::new(Mutex::new(self.build_flusher()));
        let (stop_trigger, stop) = shutdown::channel();
        let guard = FinalFlushGuard {
            flusher: Arc::clone(&flusher),
            ring: Arc::clone(&self.ring),
            clock: Arc::clone(&self.clock),
            stop: stop_trigger,
            done: false,
        };

        self.set_state(RecorderState::Running);
        info!("recorder_running");

        let ingest = IngestLoop::new(
            feed,
            Arc::clone(&self.ring),
            Arc::clone(&self.clock),
            self.config.timestamp_unit,
            Arc::clone(&self.stats),
        );
        let scheduler = FlushScheduler::new(
            flusher,
            Arc::clone(&self.ring),
            Arc::clone(&self.clock),
            self.config.flush_interval(),
            Arc::clone(&self.stats),
        );
        let mut ingest_task = tokio::spawn(ingest.run(stop.clone()));
        let mut flush_task = tokio::spawn(scheduler.run(stop));

        let mut ingest_done = false;
        let mut flush_done = false;
        let cause = tokio::select! {
            _ = shutdown.cancelled() => RecorderError::Cancelled,
            res = &mut ingest_task => {
                ingest_done = true;
                stop_cause("ingest", res)
            }
            res = &mut flush_task => {
                flush_done = true;
                stop_cause("flush", res)
            }
        };

        self.set_state(RecorderState::ShuttingDown);
        if cause.is_cancelled() {
            info!("recorder_shutdown_requested");
        } else {
            error!(error = %cause, "recorder_loop_failed");
        }
        guard.stop.trigger();

        if !ingest_done {
            join_ignoring("ingest", ingest_task).await;
        }
        if !flush_done {
            join_ignoring("flush", flush_task).await;
        }

        // Owned by the blocking task so it completes even if `run` is dropped.
        let final_result = tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            guard.run()
        })
        .await;
        match final_result {
            Ok(Ok(done)) => info!(
                rows = done.rows,
                lost = done.lost,
                path = ?done.path,
                closed_bucket = ?done.closed_bucket,
                "final_flush_written"
            ),
            Ok(Err(e)) => error!(error = %e, "final_flush_failed"),
            Err(e) => error!(error = %e, "final_flush_task_failed"),
        }

        self.set_state(RecorderState::Stopped);
        info!(stats = ?self.stats.snapshot(), "recorder_stopped");
        Err(cause)
    }

    fn build_flusher(&self) -> Flusher {
        let layout = BucketLayout {
            base_dir: self.config.base_dir.clone(),
            instrument: self.config.instrument.clone(),
            slot_minutes: self.config.slot_minutes,
            timezone: self.config.timezone,
        };
        let lifecycle = BucketWriterLifecycle::new(
            layout,
            self.config.writer_strategy,
            self.config.compression,
            self.config.timestamp_unit,
            Arc::clone(&self.stats),
        );
        Flusher::new(
            lifecycle,
            self.config.final_suffix.clone(),
            self.config.max_consecutive_write_failures,
            Arc::clone(&self.stats),
        )
    }
}

fn stop_cause(
    name: &str,
    res: Result<Result<(), RecorderError>, tokio::task::JoinError>,
) -> RecorderError {
    match res {
        Ok(Err(e)) => e,
        Ok(Ok(())) => RecorderError::Task(format!("{} loop exited unexpectedly", name)),
        Err(e) => RecorderError::Task(format!("{} task: {}", name, e)),
    }
}

async fn join_ignoring(name: &str, handle: JoinHandle<Result<(), RecorderError>>) {
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = name, error = %e, "loop_failed_during_shutdown"),
        Err(e) => warn!(task = name, error = %e, "loop_join_failed"),
    }
}

/// Final flush as a scoped on-stop action.
struct FinalFlushGuard {
    flusher: Arc<Mutex<Flusher>>,
    ring: Arc<RingBuffer>,
    clock: Arc<dyn Clock>,
    stop: ShutdownTrigger,
    done: bool,
}

impl FinalFlushGuard {
    fn run(&mut self) -> Result<FinalFlush, RecorderError> {
        if self.done {
            return Ok(FinalFlush::default());
        }
        self.done = true;
        self.stop.trigger();
        let now = self.clock.now();
        self.flusher.lock().finalize(&self.ring, now)
    }
}

impl Drop for FinalFlushGuard {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.run() {
                error!(error = %e, "final_flush_on_drop_failed");
            }
        }
    }
}
