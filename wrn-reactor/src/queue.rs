/// Append-only work queue with a processing cursor.
///
/// Items live at global indices starting from 1. `last_index` is the index
/// of the newest item; `processing_index` marks how far dispatch has
/// progressed. The pending slice is `(processing_index, last_index]`; items
/// are released once acknowledged. An optional byte budget drops appends
/// when exceeded (the caller decides how loudly).
#[derive(Debug)]
pub struct MsgQueue<T> {
    items: std::collections::VecDeque<T>,
    /// Global index of the first held item minus one.
    base_index: u64,
    pub processing_index: u64,
    pub last_index: u64,
    size: u64,
    max_size: u64,
    size_of: fn(&T) -> u64,
}

impl<T: Clone> MsgQueue<T> {
    /// `max_size` of zero means unbounded.
    #[must_use]
    pub fn new(max_size: u64, size_of: fn(&T) -> u64) -> Self {
        Self {
            items: std::collections::VecDeque::new(),
            base_index: 0,
            processing_index: 0,
            last_index: 0,
            size: 0,
            max_size,
            size_of,
        }
    }

    /// Append an item; false when the byte budget is exhausted.
    pub fn append(&mut self, item: T) -> bool {
        let item_size = (self.size_of)(&item);
        if self.max_size > 0 && self.size + item_size > self.max_size {
            return false;
        }
        self.size += item_size;
        self.items.push_back(item);
        self.last_index += 1;
        true
    }

    /// True when unprocessed items are pending.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.processing_index < self.last_index
    }

    /// Clone the pending slice `(processing_index, last_index]`.
    #[must_use]
    pub fn pending(&self) -> Vec<T> {
        if !self.has_pending() {
            return Vec::new();
        }
        let start = (self.processing_index - self.base_index) as usize;
        self.items.iter().skip(start).cloned().collect()
    }

    /// Mark items up to `index` dispatched and release them.
    pub fn advance_to(&mut self, index: u64) {
        let index = index.min(self.last_index);
        if index <= self.processing_index {
            return;
        }
        self.processing_index = index;
        while self.base_index < self.processing_index {
            if let Some(item) = self.items.pop_front() {
                self.size = self.size.saturating_sub((self.size_of)(&item));
            }
            self.base_index += 1;
        }
    }

    /// Forget dispatch progress so pending items are re-delivered. Used on
    /// role switches, where half-processed work is no longer meaningful.
    pub fn reset_processing(&mut self) {
        self.processing_index = self.base_index;
    }

    /// Drop everything, keeping the index positions.
    pub fn clear(&mut self) {
        self.advance_to(self.last_index);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Held byte size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn queue() -> MsgQueue<String> {
        MsgQueue::new(0, |s| s.len() as u64)
    }

    #[test]
    fn test_pending_slice_and_advance() {
        let mut q = queue();
        assert!(!q.has_pending());
        q.append("a".into());
        q.append("b".into());
        q.append("c".into());
        assert_eq!(q.pending(), vec!["a", "b", "c"]);

        q.advance_to(2);
        assert_eq!(q.pending(), vec!["c"]);
        assert_eq!(q.len(), 1);

        q.advance_to(3);
        assert!(!q.has_pending());
        assert!(q.is_empty());
    }

    #[test]
    fn test_reset_processing_redelivers() {
        let mut q = queue();
        q.append("a".into());
        q.append("b".into());
        // Dispatch in flight, then a role switch resets the cursor: both
        // items must come back because nothing was released yet.
        q.reset_processing();
        assert_eq!(q.pending(), vec!["a", "b"]);
        q.advance_to(2);
        q.append("c".into());
        q.reset_processing();
        assert_eq!(q.pending(), vec!["c"]);
    }

    #[test]
    fn test_byte_budget_drops_appends() {
        let mut q: MsgQueue<String> = MsgQueue::new(3, |s| s.len() as u64);
        assert!(q.append("ab".into()));
        assert!(!q.append("cd".into()));
        assert_eq!(q.last_index, 1);
        // Releasing frees budget.
        q.advance_to(1);
        assert!(q.append("cd".into()));
    }

    #[test]
    fn test_advance_is_clamped() {
        let mut q = queue();
        q.append("a".into());
        q.advance_to(99);
        assert_eq!(q.processing_index, 1);
        assert!(q.is_empty());
    }
}
