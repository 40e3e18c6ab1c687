use crate::message::{entries_size, Entry};

/// In-memory tail of the log: entries appended but not yet applied.
///
/// `offset` is the index of the first held entry; `entries[i].index ==
/// offset + i` always holds. Entries stay here after storage append so the
/// leader can serve sync requests without touching storage, and are
/// released once applied.
#[derive(Debug, Default)]
struct Unstable {
    offset: u64,
    entries: Vec<Entry>,
}

impl Unstable {
    fn new(offset: u64) -> Self {
        Self {
            offset,
            entries: Vec::new(),
        }
    }

    fn truncate_and_append(&mut self, incoming: Vec<Entry>) {
        let Some(first) = incoming.first() else {
            return;
        };
        let after = first.index;
        if after == self.offset + self.entries.len() as u64 {
            self.entries.extend(incoming);
        } else if after <= self.offset {
            // Replaces everything we hold.
            self.offset = after;
            self.entries = incoming;
        } else {
            // Overwrite the tail from `after` on.
            self.entries.truncate((after - self.offset) as usize);
            self.entries.extend(incoming);
        }
    }

    /// Entries in `[lo, hi)`, clamped to what is held.
    fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        let held_end = self.offset + self.entries.len() as u64;
        let lo = lo.max(self.offset);
        let hi = hi.min(held_end);
        if lo >= hi {
            return &[];
        }
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }

    /// Release entries at or below `index` (they are applied).
    fn applied_to(&mut self, index: u64) {
        if index < self.offset {
            return;
        }
        let keep_from = (index + 1 - self.offset).min(self.entries.len() as u64);
        self.entries.drain(..keep_from as usize);
        self.offset = index + 1;
    }

    /// Drop entries at or above `index` (conflict resolution).
    fn truncate_from(&mut self, index: u64) {
        if index <= self.offset {
            self.entries.clear();
            self.offset = index;
            return;
        }
        let keep = (index - self.offset) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }
}

/// Offset bookkeeping for one group's log.
///
/// Invariant: `applied <= committed <= last_log_index`, and
/// `storaged <= last_log_index`. Violations are programming errors and
/// are reported by [`crate::Replica`] as group-fatal.
#[derive(Debug)]
pub struct ReplicaLog {
    unstable: Unstable,
    pub last_log_index: u64,
    /// Highest index handed to storage (append in flight).
    pub storaging_index: u64,
    /// Highest index durably stored.
    pub storaged_index: u64,
    pub committed_index: u64,
    /// Highest index handed to the application (apply in flight).
    pub applying_index: u64,
    /// Highest index the application confirmed.
    pub applied_index: u64,
}

impl ReplicaLog {
    #[must_use]
    pub fn new(last_index: u64, applied_index: u64) -> Self {
        debug_assert!(last_index >= applied_index);
        let mut log = Self {
            unstable: Unstable::new(last_index + 1),
            last_log_index: 0,
            storaging_index: 0,
            storaged_index: 0,
            committed_index: applied_index,
            applying_index: applied_index,
            applied_index,
        };
        log.update_last_index(last_index);
        log
    }

    /// Reset the tail position, keeping commit/apply consistent. Used at
    /// construction and after conflict truncation.
    pub fn update_last_index(&mut self, last_index: u64) {
        self.last_log_index = last_index;
        self.storaged_index = last_index;
        self.storaging_index = last_index;
        self.unstable.truncate_from(last_index + 1);
        self.unstable.offset = self.unstable.offset.min(last_index + 1);
        if self.committed_index > last_index {
            self.committed_index = last_index;
        }
    }

    pub fn append(&mut self, entries: Vec<Entry>) {
        let Some(last) = entries.last() else {
            return;
        };
        let last_index = last.index;
        self.unstable.truncate_and_append(entries);
        self.last_log_index = last_index;
    }

    /// Entries needing a storage append, or empty when storage is caught
    /// up or an append is already in flight.
    #[must_use]
    pub fn next_storage_entries(&self) -> Vec<Entry> {
        if self.storaging_index >= self.last_log_index {
            return Vec::new();
        }
        self.unstable
            .slice(self.storaging_index + 1, self.last_log_index + 1)
            .to_vec()
    }

    pub fn storaging_to(&mut self, index: u64) {
        self.storaging_index = index;
    }

    pub fn storaged_to(&mut self, index: u64) {
        self.storaged_index = index;
        self.storaging_index = self.storaging_index.max(index);
    }

    /// Committed-but-unapplied span `[lo, hi]`, if any.
    #[must_use]
    pub fn next_apply_range(&self) -> Option<(u64, u64)> {
        if self.applying_index >= self.committed_index {
            return None;
        }
        Some((self.applying_index + 1, self.committed_index))
    }

    pub fn applying_to(&mut self, index: u64) {
        self.applying_index = index;
    }

    pub fn applied_to(&mut self, index: u64) {
        self.applied_index = index;
        self.applying_index = self.applying_index.max(index);
        self.unstable.applied_to(index);
    }

    /// Entries `[lo, hi)` from the unstable tail, capped at `max_size`
    /// encoded bytes (at least one entry when available). The bool is true
    /// when the cap cut the result short.
    #[must_use]
    pub fn entries_from_unstable(&self, lo: u64, hi: u64, max_size: u64) -> (Vec<Entry>, bool) {
        if lo < self.unstable.offset || lo >= hi {
            return (Vec::new(), false);
        }
        let slice = self.unstable.slice(lo, hi);
        let mut out = Vec::new();
        let mut size = 0u64;
        for entry in slice {
            size += entry.size();
            if !out.is_empty() && size > max_size {
                return (out, true);
            }
            out.push(entry.clone());
        }
        (out, false)
    }

    /// First index still resident in memory.
    #[must_use]
    pub fn unstable_offset(&self) -> u64 {
        self.unstable.offset
    }

    /// Truncate the log so that `index - 1` is the new last index.
    pub fn truncate_from(&mut self, index: u64) {
        self.unstable.truncate_from(index);
        let new_last = index.saturating_sub(1);
        self.last_log_index = new_last;
        self.storaged_index = self.storaged_index.min(new_last);
        self.storaging_index = self.storaging_index.min(new_last);
        if self.committed_index > new_last {
            self.committed_index = new_last;
        }
    }

    /// Term of the newest held entry, when one is in memory.
    #[must_use]
    pub fn last_unstable_term(&self) -> Option<u32> {
        self.unstable.entries.last().map(|e| e.term)
    }

    /// Byte size of the committed-but-unapplied span held in memory.
    #[must_use]
    pub fn unapplied_size(&self) -> u64 {
        match self.next_apply_range() {
            Some((lo, hi)) => entries_size(self.unstable.slice(lo, hi + 1)),
            None => 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(index: u64, term: u32) -> Entry {
        Entry::new(index, term, Bytes::from_static(b"x"))
    }

    #[test]
    fn test_append_advances_last_index() {
        let mut log = ReplicaLog::new(0, 0);
        log.append(vec![entry(1, 1), entry(2, 1)]);
        assert_eq!(log.last_log_index, 2);
        assert_eq!(log.next_storage_entries().len(), 2);
    }

    #[test]
    fn test_storage_cursor() {
        let mut log = ReplicaLog::new(0, 0);
        log.append(vec![entry(1, 1), entry(2, 1)]);
        log.storaging_to(2);
        assert!(log.next_storage_entries().is_empty());
        log.storaged_to(2);
        assert_eq!(log.storaged_index, 2);
    }

    #[test]
    fn test_apply_range_and_release() {
        let mut log = ReplicaLog::new(0, 0);
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]);
        log.committed_index = 2;
        assert_eq!(log.next_apply_range(), Some((1, 2)));
        log.applying_to(2);
        assert_eq!(log.next_apply_range(), None);
        log.applied_to(2);
        assert_eq!(log.applied_index, 2);
        assert_eq!(log.unstable_offset(), 3);
        // Entry 3 must still be servable.
        let (entries, _) = log.entries_from_unstable(3, 4, u64::MAX);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_monotonicity_invariant() {
        let mut log = ReplicaLog::new(10, 5);
        assert!(log.applied_index <= log.committed_index);
        assert!(log.committed_index <= log.last_log_index);
        log.append(vec![entry(11, 2)]);
        log.committed_index = 11;
        log.applied_to(11);
        assert!(log.applied_index <= log.committed_index);
        assert!(log.committed_index <= log.last_log_index);
    }

    #[test]
    fn test_entries_from_unstable_respects_cap() {
        let mut log = ReplicaLog::new(0, 0);
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]);
        let (entries, exceeded) = log.entries_from_unstable(1, 4, entry(1, 1).size());
        assert_eq!(entries.len(), 1);
        assert!(exceeded);
        let (all, exceeded) = log.entries_from_unstable(1, 4, u64::MAX);
        assert_eq!(all.len(), 3);
        assert!(!exceeded);
    }

    #[test]
    fn test_truncate_from_conflict() {
        let mut log = ReplicaLog::new(0, 0);
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]);
        log.storaging_to(3);
        log.storaged_to(3);
        log.truncate_from(3);
        assert_eq!(log.last_log_index, 2);
        assert_eq!(log.storaged_index, 2);
        // Re-append at the truncated position with the new term.
        log.append(vec![entry(3, 3)]);
        assert_eq!(log.last_log_index, 3);
        let (entries, _) = log.entries_from_unstable(3, 4, u64::MAX);
        assert_eq!(entries[0].term, 3);
    }

    #[test]
    fn test_overwrite_append() {
        let mut log = ReplicaLog::new(0, 0);
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]);
        // A fresh batch starting inside the held range overwrites the tail.
        log.append(vec![entry(2, 2), entry(3, 2)]);
        assert_eq!(log.last_log_index, 3);
        let (entries, _) = log.entries_from_unstable(2, 4, u64::MAX);
        assert!(entries.iter().all(|e| e.term == 2));
    }
}
