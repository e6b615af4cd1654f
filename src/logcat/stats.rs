use std::sync::atomic::{AtomicU64, Ordering};

use super::entry::{EntryKind, MAX_ENTRY_KIND};

/// Lock-free dispatcher counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for end-of-phase reporting without contention.
pub struct EntryStats {
    lines: AtomicU64,
    entries: [AtomicU64; MAX_ENTRY_KIND + 1],
    unmatched: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`EntryStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryStatsSnapshot {
    pub lines: u64,
    /// Non-zero per-kind emission counts.
    pub entries: Vec<(EntryKind, u64)>,
    pub unmatched: u64,
    pub errors: u64,
}

impl EntryStats {
    /// Create a new zeroed EntryStats.
    pub fn new() -> Self {
        Self {
            lines: AtomicU64::new(0),
            entries: std::array::from_fn(|_| AtomicU64::new(0)),
            unmatched: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_line(&self) {
        self.lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the emission counter for the given kind by one.
    pub fn record(&self, kind: EntryKind) {
        if let Some(counter) = self.entries.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> EntryStatsSnapshot {
        let mut entries = Vec::new();

        for (i, counter) in self.entries.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = EntryKind::from_u8(i as u8) {
                    entries.push((kind, v));
                }
            }
        }

        EntryStatsSnapshot {
            lines: self.lines.swap(0, Ordering::Relaxed),
            entries,
            unmatched: self.unmatched.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for EntryStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryStatsSnapshot {
    /// Emission count for one kind.
    pub fn count(&self, kind: EntryKind) -> u64 {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }
}
