//! Registry of pending deadlines.

use std::collections::BTreeMap;

type TimerId = u64;

/// Payloads waiting for a local wall-clock deadline.
///
/// Entries are ordered by deadline and then by insertion, so two timers due
/// at the same instant fire in the order they were scheduled.
#[derive(Debug)]
pub struct TimerRegistry<T> {
    entries: BTreeMap<(i64, TimerId), T>,
    next_id: TimerId,
}

impl<T> TimerRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn schedule(&mut self, deadline_ms: i64, payload: T) {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((deadline_ms, id), payload);
    }

    /// Drops every pending entry and returns how many were cancelled.
    pub fn clear(&mut self) -> usize {
        let cancelled = self.entries.len();
        self.entries.clear();
        cancelled
    }

    /// Removes and returns all entries due at or before `now_ms`, earliest first.
    pub fn take_due(&mut self, now_ms: i64) -> Vec<(i64, T)> {
        let pending = self.entries.split_off(&(now_ms.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.entries, pending);
        due.into_iter()
            .map(|((deadline, _), payload)| (deadline, payload))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for TimerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
