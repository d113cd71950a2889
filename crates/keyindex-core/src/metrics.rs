//! Engine counters.

use serde::Serialize;

use crate::types::EventKind;

/// Snapshot of an engine's activity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub added: u64,
    pub changed: u64,
    pub removed: u64,
    pub moved: u64,
    /// `added` notifications replayed to late subscribers.
    pub replayed: u64,
    /// Times an `added` had to wait for its predecessor.
    pub deferred: u64,
    /// Messages dropped because their subscription or wait was no longer current.
    pub stale: u64,
    /// Inbox messages handled by the engine task.
    pub processed: u64,
    /// Keys tracked at snapshot time.
    pub tracked: usize,
}

impl EngineMetrics {
    pub(crate) fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::Added => self.added += 1,
            EventKind::Changed => self.changed += 1,
            EventKind::Removed => self.removed += 1,
            EventKind::Moved => self.moved += 1,
        }
    }

    /// Total notifications emitted, replays excluded.
    pub fn emitted(&self) -> u64 {
        self.added + self.changed + self.removed + self.moved
    }
}
