//! Child tracker — per-key bookkeeping for every entry currently in the index.
//!
//! A tracker owns the record-store watch for its key, remembers where the key
//! sits in index order, and exposes a completion signal that fires once the
//! first real value has been delivered as `added`.

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::{RecordStore, SubscriptionId};
use crate::types::Snapshot;

/// An outstanding dependency wait.
struct PendingWait {
    token: u64,
    task: JoinHandle<()>,
}

/// Tracking state for a single indexed key.
pub struct ChildTracker {
    key: String,
    /// Creation sequence; replays follow this order.
    seq: u64,
    /// Key immediately before this one in index order (`None` = first).
    predecessor: Option<String>,
    /// Set once `added` has been emitted. Never reverts.
    loaded: bool,
    /// Whether listeners currently see this record.
    present: bool,
    /// Last non-absent value delivered by the record store.
    last_value: Option<Value>,
    pending: Option<PendingWait>,
    subscription: SubscriptionId,
    forwarder: JoinHandle<()>,
    completion: watch::Sender<bool>,
}

impl ChildTracker {
    pub fn new(
        key: impl Into<String>,
        predecessor: Option<String>,
        seq: u64,
        subscription: SubscriptionId,
        forwarder: JoinHandle<()>,
    ) -> Self {
        let (completion, _) = watch::channel(false);
        Self {
            key: key.into(),
            seq,
            predecessor,
            loaded: false,
            present: false,
            last_value: None,
            pending: None,
            subscription,
            forwarder,
            completion,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn predecessor(&self) -> Option<&str> {
        self.predecessor.as_deref()
    }

    pub fn set_predecessor(&mut self, predecessor: Option<String>) {
        self.predecessor = predecessor;
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Loaded and not deleted on the record side.
    pub fn is_visible(&self) -> bool {
        self.loaded && self.present
    }

    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    /// Snapshot built from the last known value (`null` if none was seen).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.key.clone(), self.last_value.clone().unwrap_or(Value::Null))
    }

    /// Receiver that resolves to `true` once this tracker is loaded. The
    /// receiver errors instead if the tracker is disposed first.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completion.subscribe()
    }

    /// Record a value that arrived before the first load.
    pub fn stash(&mut self, value: Value) {
        self.last_value = Some(value);
    }

    /// Record a value for an already loaded key.
    pub fn update(&mut self, value: Value) {
        self.last_value = Some(value);
        self.present = true;
    }

    /// The record was deleted after it had been delivered.
    pub fn mark_absent(&mut self) {
        self.present = false;
    }

    /// Mark loaded and fire the completion signal.
    pub fn mark_loaded(&mut self) {
        self.clear_pending();
        self.loaded = true;
        self.present = true;
        self.completion.send_replace(true);
    }

    pub fn pending_token(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.token)
    }

    /// Arm a new wait, aborting any previous one. The stashed value is kept.
    pub fn set_pending(&mut self, token: u64, task: JoinHandle<()>) {
        self.abort_pending();
        self.pending = Some(PendingWait { token, task });
    }

    /// Abort the pending wait, if any.
    pub fn abort_pending(&mut self) {
        if let Some(wait) = self.pending.take() {
            wait.task.abort();
        }
    }

    /// Forget the pending wait without aborting it (it has already resumed).
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Abort the pending wait and drop any value stashed before the first load.
    pub fn cancel_pending(&mut self) {
        self.abort_pending();
        if !self.loaded {
            self.last_value = None;
        }
    }

    /// Release the record watch and every task owned by this tracker.
    pub fn dispose(mut self, records: &dyn RecordStore) {
        self.abort_pending();
        records.unwatch(self.subscription);
        self.forwarder.abort();
    }
}

impl std::fmt::Debug for ChildTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildTracker")
            .field("key", &self.key)
            .field("seq", &self.seq)
            .field("predecessor", &self.predecessor)
            .field("loaded", &self.loaded)
            .field("present", &self.present)
            .field("pending", &self.pending_token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker(key: &str, predecessor: Option<&str>) -> ChildTracker {
        let forwarder = tokio::spawn(async {});
        ChildTracker::new(key, predecessor.map(str::to_string), 0, SubscriptionId(1), forwarder)
    }

    #[tokio::test]
    async fn completion_fires_on_load() {
        let mut t = tracker("a", None);
        let mut rx = t.completion();
        assert!(!*rx.borrow());

        t.stash(json!({"n": 1}));
        assert!(!t.is_visible());
        t.mark_loaded();

        rx.wait_for(|loaded| *loaded).await.unwrap();
        assert!(t.is_loaded());
        assert_eq!(t.snapshot().value(), &json!({"n": 1}));
    }

    #[tokio::test]
    async fn cancel_before_load_forgets_value() {
        let mut t = tracker("b", Some("a"));
        t.stash(json!(2));
        t.set_pending(7, tokio::spawn(std::future::pending::<()>()));
        assert_eq!(t.pending_token(), Some(7));

        t.cancel_pending();
        assert_eq!(t.pending_token(), None);
        assert!(t.last_value().is_none());
    }

    #[tokio::test]
    async fn arming_a_wait_keeps_stashed_value() {
        let mut t = tracker("b", Some("a"));
        t.stash(json!("early"));
        t.set_pending(1, tokio::spawn(std::future::pending::<()>()));
        t.set_pending(2, tokio::spawn(std::future::pending::<()>()));
        assert_eq!(t.pending_token(), Some(2));
        assert_eq!(t.last_value(), Some(&json!("early")));

        t.abort_pending();
        assert_eq!(t.pending_token(), None);
        assert_eq!(t.last_value(), Some(&json!("early")));
    }

    #[tokio::test]
    async fn absent_after_load_keeps_last_value() {
        let mut t = tracker("c", None);
        t.stash(json!("v1"));
        t.mark_loaded();
        t.mark_absent();
        assert!(t.is_loaded());
        assert!(!t.is_visible());
        assert_eq!(t.snapshot().value(), &json!("v1"));

        t.update(json!("v2"));
        assert!(t.is_visible());
    }

    #[tokio::test]
    async fn moved_updates_predecessor_in_place() {
        let mut t = tracker("d", Some("a"));
        t.set_predecessor(Some("c".into()));
        assert_eq!(t.predecessor(), Some("c"));
        t.set_predecessor(None);
        assert_eq!(t.predecessor(), None);
    }
}
