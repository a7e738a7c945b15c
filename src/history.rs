// =============================================================================
// History Store -- bounded sliding windows per user, merchant, and IP
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::HistoryEntry;

/// A read-only view over one entity's window at a point in time, taken
/// strictly before the current transaction is appended.
pub struct HistorySnapshot<'a> {
    entries: &'a [HistoryEntry],
}

impl<'a> HistorySnapshot<'a> {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }
}

/// One bounded ring-buffer-per-key namespace. Used identically for the user,
/// merchant, and IP history stores -- only the key space differs.
struct Window {
    buffers: RwLock<HashMap<String, VecDeque<HistoryEntry>>>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Run `f` over a read snapshot of `key`'s window without mutating it.
    fn with_snapshot<R>(&self, key: &str, f: impl FnOnce(HistorySnapshot<'_>) -> R) -> R {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let entries: Vec<HistoryEntry> = ring.iter().cloned().collect();
                f(HistorySnapshot { entries: &entries })
            }
            None => f(HistorySnapshot { entries: &[] }),
        }
    }

    fn append(&self, key: &str, entry: HistoryEntry) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity + 1));
        ring.push_back(entry);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    fn count(&self, key: &str) -> usize {
        self.buffers.read().get(key).map_or(0, VecDeque::len)
    }
}

/// Owns the three independent per-entity history namespaces (user, merchant,
/// IP). Each namespace is a capacity-`W` ring buffer keyed by entity id.
///
/// The extractor always snapshots a window before appending the current
/// transaction's entry -- that ordering is what yields the
/// "features-before-self" invariant: a transaction's own feature vector never
/// includes itself among its own history aggregates.
pub struct HistoryStore {
    user: Window,
    merchant: Window,
    ip: Window,
}

impl HistoryStore {
    pub fn new(window_size: usize) -> Self {
        Self {
            user: Window::new(window_size),
            merchant: Window::new(window_size),
            ip: Window::new(window_size),
        }
    }

    pub fn user_snapshot<R>(&self, user_id: &str, f: impl FnOnce(HistorySnapshot<'_>) -> R) -> R {
        self.user.with_snapshot(user_id, f)
    }

    pub fn merchant_snapshot<R>(
        &self,
        merchant_id: &str,
        f: impl FnOnce(HistorySnapshot<'_>) -> R,
    ) -> R {
        self.merchant.with_snapshot(merchant_id, f)
    }

    pub fn ip_snapshot<R>(&self, ip: &str, f: impl FnOnce(HistorySnapshot<'_>) -> R) -> R {
        self.ip.with_snapshot(ip, f)
    }

    pub fn append_user(&self, user_id: &str, entry: HistoryEntry) {
        self.user.append(user_id, entry);
    }

    pub fn append_merchant(&self, merchant_id: &str, entry: HistoryEntry) {
        self.merchant.append(merchant_id, entry);
    }

    pub fn append_ip(&self, ip: &str, entry: HistoryEntry) {
        self.ip.append(ip, entry);
    }

    pub fn user_count(&self, user_id: &str) -> usize {
        self.user.count(user_id)
    }
}
