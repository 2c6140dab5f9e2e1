//! Market depth recorder
//!
//! ```text
//! feed ──> IngestLoop ──append──> RingBuffer ──since(cursor)──> FlushScheduler
//!                                                                  │
//!                                      BucketWriterLifecycle <─────┘
//!                                      <base>/<instr>/<date>/<HH_MM>.parquet
//! ```

pub mod bucket;
pub mod flush;
pub mod ingest;
pub mod record;
pub mod ring;
pub mod runner;
pub mod sink;

pub use bucket::{BucketKey, BucketLayout, BucketTimezone, BucketWriterLifecycle, WriterStrategy};
pub use flush::{FinalFlush, FlushOutcome, FlushScheduler, Flusher};
pub use ingest::IngestLoop;
pub use record::{InstrumentId, InvalidRecord, Record, Side};
pub use ring::{RingBuffer, RingDelta};
pub use runner::{Recorder, RecorderState};
pub use sink::Compression;
