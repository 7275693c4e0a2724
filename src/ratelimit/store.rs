//! Per-key window records and the store that holds them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Longest window a record can cover (one year).
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Accounting state for one identity key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    /// Calls counted in the current window
    pub count: u64,
    /// Instant at which this record becomes stale
    pub reset_at: Instant,
}

impl WindowRecord {
    /// Open a new window at `now`, counting the call that opened it.
    ///
    /// Windows longer than [`MAX_WINDOW`] are clamped to it.
    pub fn open(now: Instant, window: Duration) -> Self {
        let reset_at = now
            .checked_add(window.min(MAX_WINDOW))
            .unwrap_or(now);
        Self { count: 1, reset_at }
    }

    /// Whether this record may still be used for decisions at `now`.
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.reset_at
    }

    /// Time left until the window resets, saturating at zero.
    pub fn reset_in(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }
}

/// Mapping from identity key to its [`WindowRecord`].
///
/// Backed by a sharded map, so unrelated keys do not contend. The store knows
/// nothing about expiry except inside [`sweep`](Self::sweep); readers must
/// compare `reset_at` against their own `now` before trusting a record.
///
/// One store belongs to exactly one policy. It lives in process memory, so
/// several service instances each keep their own independent counts.
#[derive(Debug, Default)]
pub struct WindowStore {
    records: DashMap<String, WindowRecord>,
}

impl WindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Get the record for a key, live or not.
    pub fn get(&self, key: &str) -> Option<WindowRecord> {
        self.records.get(key).map(|r| *r.value())
    }

    /// Overwrite the record for a key.
    pub fn put(&self, key: &str, record: WindowRecord) {
        self.records.insert(key.to_string(), record);
    }

    /// Remove the record for a key.
    pub fn delete(&self, key: &str) {
        self.records.remove(key);
    }

    /// Remove every record whose `reset_at` is before `now`.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.reset_at >= now);
        before.saturating_sub(self.records.len())
    }

    /// Read, decide and write the record for `key` as one step.
    ///
    /// The closure runs while the key's shard is locked, so no other `update`,
    /// `put` or `sweep` can interleave with it for the same key. Leaving the
    /// slot `None` removes the record.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut Option<WindowRecord>) -> R) -> R {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let mut slot = Some(*entry.get());
                let result = f(&mut slot);
                match slot {
                    Some(record) => *entry.get_mut() = record,
                    None => {
                        entry.remove();
                    }
                }
                result
            }
            Entry::Vacant(entry) => {
                let mut slot = None;
                let result = f(&mut slot);
                if let Some(record) = slot {
                    entry.insert(record);
                }
                result
            }
        }
    }

    /// Number of records currently held, including stale ones not yet swept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Number of records still live at `now`.
    pub fn live_len(&self, now: Instant) -> usize {
        self.records.iter().filter(|r| r.value().is_live(now)).count()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }
}
