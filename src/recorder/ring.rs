//! Sequenced Ring Buffer
//!
//! Fixed-capacity circular store with overwrite-on-full semantics. Every
//! append is tagged with a global monotonically increasing sequence number,
//! so a consumer can ask for "everything since sequence N" without caring
//! where the ring physically wrapped.
//!
//! # Memory-ordering contract
//! - Slots are written and read under one short `parking_lot::Mutex`; a
//!   reader never observes a torn append.
//! - `appended` is stored with `Release` after the slot write, and loaded
//!   with `Acquire` by [`RingBuffer::appended`]; a reader that sees count `n`
//!   is guaranteed that records `0..n` have been written (or overwritten).

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::record::Record;

struct RingInner {
    slots: Vec<Record>,
    write_idx: usize,
    full: bool,
    /// Sequence number the next append will receive.
    next_seq: u64,
}

impl RingInner {
    #[inline]
    fn retained(&self) -> u64 {
        self.slots.len() as u64
    }

    #[inline]
    fn oldest_seq(&self) -> u64 {
        self.next_seq - self.retained()
    }

    /// Copy `count` records starting `offset` records after the oldest one.
    fn copy_range(&self, offset: usize, count: usize, out: &mut Vec<Record>) {
        if count == 0 {
            return;
        }
        let len = self.slots.len();
        let start = if self.full { self.write_idx } else { 0 };
        let phys = (start + offset) % len;
        if phys + count <= len {
            out.extend_from_slice(&self.slots[phys..phys + count]);
        } else {
            out.extend_from_slice(&self.slots[phys..]);
            out.extend_from_slice(&self.slots[..count - (len - phys)]);
        }
    }
}

/// Records newly available past a cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingDelta {
    /// Sequence number of `records[0]`.
    pub first_seq: u64,
    /// Sequence number one past the last record; the cursor to resume from.
    pub next_seq: u64,
    /// Records between the requested cursor and `first_seq` that were
    /// overwritten before they could be read.
    pub lost: u64,
    pub records: Vec<Record>,
}

impl RingDelta {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Bounded circular buffer of depth records.
pub struct RingBuffer {
    inner: Mutex<RingInner>,
    appended: AtomicU64,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` records.
    ///
    /// Panics if `capacity` is zero; configuration validation rejects that first.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            inner: Mutex::new(RingInner {
                slots: Vec::with_capacity(capacity),
                write_idx: 0,
                full: false,
                next_seq: 0,
            }),
            appended: AtomicU64::new(0),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, overwriting the oldest once full. Returns its sequence number.
    pub fn append(&self, record: Record) -> u64 {
        let mut inner = self.inner.lock();
        let idx = inner.write_idx;
        if inner.slots.len() < self.capacity {
            inner.slots.push(record);
        } else {
            inner.slots[idx] = record;
        }
        inner.write_idx = (idx + 1) % self.capacity;
        if inner.write_idx == 0 {
            inner.full = true;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        self.appended.store(inner.next_seq, Ordering::Release);
        seq
    }

    /// Total records ever appended; equals the next sequence number. Lock-free.
    #[inline]
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Acquire)
    }

    /// Records currently retained (at most `capacity`).
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().full
    }

    /// Physical index the next append will overwrite.
    pub fn write_index(&self) -> usize {
        self.inner.lock().write_idx
    }

    /// Retained records, oldest first, as one consistent copy.
    pub fn linearized_view(&self) -> Vec<Record> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.slots.len());
        inner.copy_range(0, inner.slots.len(), &mut out);
        out
    }

    /// Records with sequence number `>= cursor`, oldest first.
    ///
    /// If some of them were already overwritten, the delta starts at the
    /// oldest retained record and `lost` counts the gap.
    pub fn since(&self, cursor: u64) -> RingDelta {
        let inner = self.inner.lock();
        if cursor >= inner.next_seq {
            return RingDelta {
                first_seq: inner.next_seq,
                next_seq: inner.next_seq,
                lost: 0,
                records: Vec::new(),
            };
        }

        let oldest = inner.oldest_seq();
        let from = cursor.max(oldest);
        let count = (inner.next_seq - from) as usize;
        let mut records = Vec::with_capacity(count);
        inner.copy_range((from - oldest) as usize, count, &mut records);

        RingDelta {
            first_seq: from,
            next_seq: inner.next_seq,
            lost: from - cursor,
            records,
        }
    }
}
