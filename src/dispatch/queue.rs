//! Timed entry queue backing the dispatcher.
//!
//! Entries are ordered by fire time; entries with equal fire times run in
//! insertion order. The queue itself is not thread-safe, the owning
//! dispatcher guards it with a lock.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub(crate) type EntryFn = Box<dyn FnOnce() + Send>;

pub(crate) struct Entry {
    fire_at: Instant,
    seq: u64,
    callback: EntryFn,
}

impl Entry {
    pub(crate) fn run(self) {
        (self.callback)();
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest fire time, and among
    // equal fire times the lowest insertion sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a callback to fire after `delay_ms`. Negative delays clamp
    /// to zero.
    pub(crate) fn push(&mut self, callback: EntryFn, delay_ms: i64) -> Instant {
        let delay = Duration::from_millis(delay_ms.max(0) as u64);
        let fire_at = Instant::now() + delay;
        self.push_at(callback, fire_at);
        fire_at
    }

    pub(crate) fn push_at(&mut self, callback: EntryFn, fire_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            fire_at,
            seq,
            callback,
        });
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Entry> {
        if self.heap.peek().is_some_and(|e| e.fire_at <= now) {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Fire time of the earliest queued entry.
    pub(crate) fn next_fire_at(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.fire_at)
    }

    /// Removes every queued entry regardless of fire time, earliest first.
    pub(crate) fn drain(&mut self) -> Vec<Entry> {
        let mut entries = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            entries.push(entry);
        }
        entries
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_pop_due_orders_by_fire_time() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let (tx, rx) = mpsc::channel();
        for (label, offset_ms) in [("late", 20u64), ("early", 5), ("mid", 10)] {
            let tx = tx.clone();
            queue.push_at(
                Box::new(move || tx.send(label).unwrap()),
                now + Duration::from_millis(offset_ms),
            );
        }
        let deadline = now + Duration::from_millis(100);
        while let Some(entry) = queue.pop_due(deadline) {
            entry.run();
        }
        let order: Vec<_> = rx.try_iter().collect();
        assert_eq!(order, vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_equal_fire_times_run_fifo() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            queue.push_at(Box::new(move || tx.send(i).unwrap()), now);
        }
        while let Some(entry) = queue.pop_due(now) {
            entry.run();
        }
        let order: Vec<_> = rx.try_iter().collect();
        assert_eq!(order, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_negative_delay_clamps_to_zero() {
        let mut queue = TimerQueue::new();
        let fire_at = queue.push(Box::new(|| {}), -250);
        assert!(fire_at <= Instant::now());
        assert!(queue.pop_due(Instant::now()).is_some());
    }

    #[test]
    fn test_pop_due_holds_future_entries() {
        let mut queue = TimerQueue::new();
        queue.push(Box::new(|| {}), 60_000);
        assert!(queue.pop_due(Instant::now()).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_returns_everything_earliest_first() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.push_at(Box::new(|| {}), now + Duration::from_secs(30));
        queue.push_at(Box::new(|| {}), now);
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].fire_at <= drained[1].fire_at);
        assert!(queue.is_empty());
    }
}
