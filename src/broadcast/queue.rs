//! Per-connection outbound queue.
//!
//! Bounded in frames and in entries. A full frame queue is compacted into a
//! single last-write-wins frame, so a slow cadence only ever holds one word
//! per changed entity. Past the entry budget the queued diffs are dropped.
//! The connection can then no longer be brought up to date incrementally,
//! so the queue flips into "needs snapshot" mode: further diffs are
//! discarded and the next delivery is a fresh full snapshot taken under the
//! queue lock. A new subscriber starts in that mode, which is what makes its
//! first frame a snapshot.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    bitmask::{RISK_MASK, RISK_SHIFT, SHOCK_MASK, SHOCK_SHIFT},
    buffer::Snapshot,
    protocol::merge_diffs,
    record::{read_u32, DiffEntry},
};

/// Minimum risk/shock a word must reach to be forwarded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub min_risk: u8,
    pub min_shock: u8,
}

impl SubscriptionFilter {
    pub fn new(min_risk: u8, min_shock: u8) -> Self {
        Self {
            min_risk,
            min_shock,
        }
    }

    pub fn is_open(&self) -> bool {
        self.min_risk == 0 && self.min_shock == 0
    }

    pub fn passes(&self, meta: u32) -> bool {
        let risk = (meta >> RISK_SHIFT) & RISK_MASK;
        let shock = (meta >> SHOCK_SHIFT) & SHOCK_MASK;
        risk >= self.min_risk as u32 && shock >= self.min_shock as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Nothing in the update concerned this subscriber.
    Filtered,
    /// The entry budget was exceeded and every queued diff dropped; a
    /// snapshot is now pending.
    Overflowed,
    /// A snapshot is already pending, so the diff is redundant.
    SnapshotPending,
    Closed,
}

#[derive(Clone, Debug)]
pub enum Delivery {
    Snapshot(Snapshot),
    /// All queued diffs merged, latest word per index.
    Diff(Vec<DiffEntry>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub dropped: u64,
    pub snapshots: u64,
    pub compactions: u64,
}

/// Entry budget per frame of capacity unless set explicitly.
pub const DEFAULT_ENTRIES_PER_FRAME: usize = 1024;

#[derive(Debug)]
struct QueueState {
    frames: VecDeque<Vec<DiffEntry>>,
    needs_snapshot: bool,
    closed: bool,
    /// Whether the last word forwarded for each index passed the filter.
    passing: Vec<bool>,
    stats: QueueStats,
}

#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    entry_limit: usize,
    filter: SubscriptionFilter,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize, filter: SubscriptionFilter) -> Self {
        Self {
            capacity: capacity.max(1),
            entry_limit: capacity.max(1).saturating_mul(DEFAULT_ENTRIES_PER_FRAME),
            filter,
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity.max(1)),
                needs_snapshot: true,
                closed: false,
                passing: Vec::new(),
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
        }
    }

    /// Caps the queued entries, counted after compaction.
    pub fn with_entry_limit(mut self, entry_limit: usize) -> Self {
        self.entry_limit = entry_limit.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry_limit(&self) -> usize {
        self.entry_limit
    }

    pub fn filter(&self) -> SubscriptionFilter {
        self.filter
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn needs_snapshot(&self) -> bool {
        self.state.lock().needs_snapshot
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    /// Enqueues one diff. Never blocks on the consumer.
    pub fn push(&self, entries: &[DiffEntry]) -> PushOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return PushOutcome::Closed;
        }
        if state.needs_snapshot {
            return PushOutcome::SnapshotPending;
        }

        let frame = if self.filter.is_open() {
            entries.to_vec()
        } else {
            self.filter_entries(&mut state.passing, entries)
        };
        if frame.is_empty() {
            return PushOutcome::Filtered;
        }

        if state.frames.len() >= self.capacity {
            let mut merged = state.frames.pop_front().unwrap_or_default();
            while let Some(next) = state.frames.pop_front() {
                merge_diffs(&mut merged, &next);
            }
            merge_diffs(&mut merged, &frame);
            state.frames.push_back(merged);
            state.stats.compactions += 1;
        } else {
            state.frames.push_back(frame);
        }

        let pending: usize = state.frames.iter().map(Vec::len).sum();
        let outcome = if pending > self.entry_limit {
            state.frames.clear();
            state.needs_snapshot = true;
            state.stats.dropped += 1;
            tracing::debug!(pending, limit = self.entry_limit, "outbound queue overflowed");
            PushOutcome::Overflowed
        } else {
            state.stats.queued += 1;
            PushOutcome::Queued
        };
        drop(state);
        self.notify.notify_one();
        outcome
    }

    fn filter_entries(&self, passing: &mut Vec<bool>, entries: &[DiffEntry]) -> Vec<DiffEntry> {
        let mut out = Vec::new();
        for entry in entries {
            let slot = entry.index.as_usize();
            if slot >= passing.len() {
                // Unknown entities have never been forwarded.
                passing.resize(slot + 1, false);
            }
            let now = self.filter.passes(entry.meta);
            if now || passing[slot] {
                passing[slot] = now;
                out.push(*entry);
            }
        }
        out
    }

    /// Forces the next delivery to be a full snapshot.
    pub fn request_snapshot(&self) {
        let mut state = self.state.lock();
        state.frames.clear();
        state.needs_snapshot = true;
        drop(state);
        self.notify.notify_one();
    }

    /// Takes whatever is ready. A pending snapshot is produced by
    /// `resnapshot` while the queue lock is held, so no diff drained before
    /// it can be delivered after it.
    pub fn take<F>(&self, resnapshot: F) -> Option<Delivery>
    where
        F: FnOnce() -> Snapshot,
    {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        if state.needs_snapshot {
            let snapshot = resnapshot();
            state.frames.clear();
            state.needs_snapshot = false;
            state.stats.snapshots += 1;
            if !self.filter.is_open() {
                state.passing = snapshot_passing(&snapshot, &self.filter);
            }
            return Some(Delivery::Snapshot(snapshot));
        }
        let first = state.frames.pop_front()?;
        let mut merged = first;
        while let Some(next) = state.frames.pop_front() {
            merge_diffs(&mut merged, &next);
        }
        Some(Delivery::Diff(merged))
    }

    /// Waits for the next delivery. Returns `None` once the queue is closed.
    pub async fn recv<F>(&self, resnapshot: F) -> Option<Delivery>
    where
        F: Fn() -> Snapshot,
    {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(delivery) = self.take(&resnapshot) {
                return Some(delivery);
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// The meta word is the trailing `u32` of every record in both encodings.
fn snapshot_passing(snapshot: &Snapshot, filter: &SubscriptionFilter) -> Vec<bool> {
    let stride = snapshot.encoding.stride();
    snapshot
        .bytes
        .chunks_exact(stride)
        .map(|record| filter.passes(read_u32(record, stride - 4)))
        .collect()
}
