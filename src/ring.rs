// =============================================================================
// Recent Ring -- bounded FIFO of the most recent enriched results
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::types::EnrichedResult;

/// Thread-safe FIFO of up to `capacity` [`EnrichedResult`]s. No persistence
/// guarantees: on restart it is empty. Reads return newest-first.
pub struct RecentRing {
    entries: RwLock<VecDeque<EnrichedResult>>,
    capacity: usize,
}

impl RecentRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a result, evicting the oldest entry if over capacity.
    pub fn push(&self, result: EnrichedResult) {
        let mut entries = self.entries.write();
        entries.push_back(result);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Most recent `limit` entries, newest-first.
    pub fn recent(&self, limit: usize) -> Vec<EnrichedResult> {
        let entries = self.entries.read();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, newest-first, for in-memory stats fallback.
    pub fn all(&self) -> Vec<EnrichedResult> {
        let entries = self.entries.read();
        entries.iter().rev().cloned().collect()
    }
}
