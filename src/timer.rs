use std::collections::BTreeMap;

use crate::time::Instant;

/// Position of a timer in wake order.
///
/// `sequence` grows with every insertion, so timers sharing a wake time fire
/// in the order they were scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerKey {
    wake_time: Instant,
    sequence: u64,
}

impl TimerKey {
    pub(crate) fn wake_time(&self) -> Instant {
        self.wake_time
    }
}

/// Timers ordered by wake time, then insertion order.
///
/// Kept in an ordered map rather than a binary heap so a cancelled timer is
/// removed right away instead of lingering until its deadline.
#[derive(Debug)]
pub(crate) struct TimerHeap<T> {
    entries: BTreeMap<TimerKey, T>,
    next_sequence: u64,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerHeap<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, wake_time: Instant, item: T) -> TimerKey {
        let key = TimerKey {
            wake_time,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.insert(key, item);
        key
    }

    pub(crate) fn remove(&mut self, key: TimerKey) -> Option<T> {
        self.entries.remove(&key)
    }

    pub(crate) fn get_mut(&mut self, key: TimerKey) -> Option<&mut T> {
        self.entries.get_mut(&key)
    }

    pub(crate) fn contains(&self, key: TimerKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|key| key.wake_time)
    }

    /// Pops every timer with `wake_time <= now`, earliest first.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().wake_time > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    pub(crate) fn take(&mut self) -> Vec<T> {
        core::mem::take(&mut self.entries).into_values().collect()
    }
}
