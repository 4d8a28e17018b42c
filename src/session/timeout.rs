// src/session/timeout.rs

//! The timeout queue: deadline-ordered scheduled tasks drained by the
//! dispatch loop.
//!
//! Tasks are an explicit enum rather than closures; deferred work (closed
//! status simulation, dictionary encode continuation, login replay) is
//! message-passing even in a single-threaded session, so no user callback is
//! ever entered from inside a registration call.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// A deferred unit of work. Fields reference registry slots, not handles:
/// tasks are internal and never outlive the slot's current occupant (removal
/// cancels the slot's pending tasks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimeoutTask {
    /// Deliver a synthetic closed status to the item, then remove it.
    ItemClosedStatus { slot: usize, text: String },
    /// Encode and deliver the next part of a locally served dictionary.
    DictionaryEncodeContinue { slot: usize },
    /// Remove a closed reserved-stream dictionary item after its grace
    /// period.
    DictionaryItemRemove { slot: usize },
    /// Replay the last login refresh to a late login subscriber.
    LoginReplay { slot: usize },
}

impl TimeoutTask {
    /// The registry slot this task targets.
    pub(crate) fn slot(&self) -> usize {
        match self {
            TimeoutTask::ItemClosedStatus { slot, .. }
            | TimeoutTask::DictionaryEncodeContinue { slot }
            | TimeoutTask::DictionaryItemRemove { slot }
            | TimeoutTask::LoginReplay { slot } => *slot,
        }
    }
}

/// Identifies one scheduled task for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(u64);

struct Entry {
    deadline: Instant,
    seq: u64,
    task: TimeoutTask,
}

// Min-heap on (deadline, seq); seq keeps same-deadline tasks in schedule
// order.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Ordered collection of scheduled tasks with relative deadlines.
#[derive(Default)]
pub(crate) struct TimeoutQueue {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

impl TimeoutQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules a task `delay` from now. `Duration::ZERO` fires on the next
    /// pump iteration.
    pub(crate) fn schedule(&mut self, delay: Duration, task: TimeoutTask) -> TimeoutHandle {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.heap.push(Entry {
            deadline: Instant::now() + delay,
            seq,
            task,
        });
        TimeoutHandle(seq)
    }

    /// Cancels a scheduled task. Returns false if it already fired or was
    /// already cancelled.
    pub(crate) fn cancel(&mut self, handle: TimeoutHandle) -> bool {
        if self.heap.iter().any(|e| e.seq == handle.0) {
            self.cancelled.insert(handle.0)
        } else {
            false
        }
    }

    /// Drops every pending task targeting the given slot. Called when a slot
    /// is vacated so a reused slot never receives a stale task.
    pub(crate) fn cancel_slot(&mut self, slot: usize) {
        let seqs: Vec<u64> = self
            .heap
            .iter()
            .filter(|e| e.task.slot() == slot)
            .map(|e| e.seq)
            .collect();
        self.cancelled.extend(seqs);
    }

    /// The earliest pending deadline, skipping cancelled entries.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|e| !self.cancelled.contains(&e.seq))
            .map(|e| e.deadline)
            .min()
    }

    /// Pops the next task whose deadline is at or before `now`, in deadline
    /// order. Cancelled entries are discarded silently.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimeoutTask> {
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                return None;
            }
            let Some(entry) = self.heap.pop() else {
                return None;
            };
            if self.cancelled.remove(&entry.seq) {
                continue;
            }
            return Some(entry.task);
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.iter().all(|e| self.cancelled.contains(&e.seq))
    }
}
