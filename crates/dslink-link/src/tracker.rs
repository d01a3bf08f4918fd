//! Per-session registry of open response streams.

use dashmap::DashSet;

/// Set of rids whose response stream is still live for one session.
///
/// Shared between the parse path and external close requests, so every
/// operation takes `&self`. A rid is present at most once; tracking it again
/// simply keeps it tracked.
#[derive(Debug, Default)]
pub struct ResponseTracker {
    rids: DashSet<i64>,
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, rid: i64) {
        let _ = self.rids.insert(rid);
    }

    /// Returns `true` if `rid` was tracked.
    pub fn untrack(&self, rid: i64) -> bool {
        self.rids.remove(&rid).is_some()
    }

    pub fn is_tracking(&self, rid: i64) -> bool {
        self.rids.contains(&rid)
    }

    pub fn len(&self) -> usize {
        self.rids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rids.is_empty()
    }

    /// Tracked rids in ascending order.
    pub fn rids(&self) -> Vec<i64> {
        let mut rids: Vec<i64> = self.rids.iter().map(|r| *r).collect();
        rids.sort_unstable();
        rids
    }

    /// Forget every stream. Used at session teardown; no close notifications
    /// are sent.
    pub fn clear(&self) {
        self.rids.clear();
    }
}
