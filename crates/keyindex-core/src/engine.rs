//! The index engine — reconciles index membership with record contents.
//!
//! # Flow
//!
//! ```text
//! IndexStore ──membership──┐
//!                          ├──► inbox ──► engine task ──► ListenerRegistry ──► callbacks
//! RecordStore ──per key────┘        ▲
//!                                   └── Resume (OrderDependencyResolver)
//! ```
//!
//! Everything that touches tracking state runs on a single engine task, one
//! inbox message at a time. Store subscriptions and dependency waits only post
//! messages into the inbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builder::IndexEngineBuilder;
use crate::config::EngineConfig;
use crate::error::IndexError;
use crate::listener::{Callback, Context, Invocable, ListenerRegistry};
use crate::metrics::EngineMetrics;
use crate::resolver::{Dependency, OrderDependencyResolver};
use crate::store::{ChildRef, IndexStore, MembershipEvent, RecordStore, SubscriptionId};
use crate::tracker::ChildTracker;
use crate::types::{EventKind, Notification, Order, Snapshot};
use crate::view::WindowedView;

/// Messages processed by the engine task.
enum EngineMsg {
    Membership(MembershipEvent),
    Record {
        key: String,
        subscription: SubscriptionId,
        value: Option<Value>,
    },
    Resume {
        key: String,
        token: u64,
    },
    Replay {
        target: Invocable,
        keys: Vec<String>,
    },
}

struct EngineState {
    disposed: bool,
    /// Taken when the engine task starts.
    inbox_rx: Option<mpsc::UnboundedReceiver<EngineMsg>>,
    driver: Option<JoinHandle<()>>,
    membership: Option<(SubscriptionId, JoinHandle<()>)>,
    listeners: ListenerRegistry,
    children: HashMap<String, ChildTracker>,
    next_seq: u64,
    next_token: u64,
}

struct Shared {
    index: Arc<dyn IndexStore>,
    records: Arc<dyn RecordStore>,
    config: EngineConfig,
    resolver: OrderDependencyResolver,
    inbox: mpsc::UnboundedSender<EngineMsg>,
    state: Mutex<EngineState>,
    metrics: Mutex<EngineMetrics>,
}

/// A live, ordered view of the records whose keys are in an index.
///
/// The engine is inert until the first [`on`](Self::on) call. From then on it
/// follows index membership, watches the record behind every indexed key, and
/// delivers `added` / `changed` / `removed` / `moved` notifications. `added`
/// notifications always arrive in index order, however the record fetches
/// race.
///
/// Requires a Tokio runtime once started.
pub struct IndexEngine {
    shared: Arc<Shared>,
}

impl IndexEngine {
    pub fn new(index: Arc<dyn IndexStore>, records: Arc<dyn RecordStore>) -> Self {
        Self::with_config(index, records, EngineConfig::default())
    }

    pub fn with_config(index: Arc<dyn IndexStore>, records: Arc<dyn RecordStore>, config: EngineConfig) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let state = EngineState {
            disposed: false,
            inbox_rx: Some(inbox_rx),
            driver: None,
            membership: None,
            listeners: ListenerRegistry::new(),
            children: HashMap::new(),
            next_seq: 0,
            next_token: 0,
        };
        Self {
            shared: Arc::new(Shared {
                resolver: OrderDependencyResolver::from_config(&config),
                index,
                records,
                config,
                inbox,
                state: Mutex::new(state),
                metrics: Mutex::new(EngineMetrics::default()),
            }),
        }
    }

    pub fn builder(index: Arc<dyn IndexStore>, records: Arc<dyn RecordStore>) -> IndexEngineBuilder {
        IndexEngineBuilder::new(index, records)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // ─── Mutation ────────────────────────────────────────────────────────────

    /// Put `key` into the index, optionally with an order rank.
    ///
    /// Records that don't exist yet are fine: the key stays silent until data
    /// appears.
    pub async fn add(&self, key: &str, order: Option<Order>) -> Result<(), IndexError> {
        self.shared.ensure_live()?;
        self.shared.index.set(key, order).await
    }

    /// Take `key` out of the index. The record itself is left untouched.
    pub async fn drop(&self, key: &str) -> Result<(), IndexError> {
        self.shared.ensure_live()?;
        self.shared.index.remove(key).await
    }

    /// Direct access to the record stored under `key`.
    pub fn child(&self, key: &str) -> Result<ChildRef, IndexError> {
        self.shared.ensure_live()?;
        Ok(ChildRef::new(key, Arc::clone(&self.shared.records)))
    }

    // ─── Subscription ────────────────────────────────────────────────────────

    /// Register `callback` for `kind` and return the invocable actually stored.
    ///
    /// `kind` is an [`EventKind`] or one of its names (`"added"`,
    /// `"child_added"`, ...). The first call starts the engine. Registering for
    /// `added` also replays every record already delivered, in the index's
    /// current order.
    pub fn on(
        &self,
        kind: impl AsRef<str>,
        callback: Callback,
        context: Option<Context>,
    ) -> Result<Invocable, IndexError> {
        let kind: EventKind = kind.as_ref().parse()?;
        let mut state = self.shared.state();
        if state.disposed {
            return Err(IndexError::Disposed);
        }
        self.shared.start(&mut state)?;
        let invocable = state.listeners.add(kind, callback, context);

        if kind == EventKind::Added {
            let mut visible: Vec<&ChildTracker> = state.children.values().filter(|t| t.is_visible()).collect();
            visible.sort_by_key(|t| t.seq());
            let keys: Vec<String> = visible.iter().map(|t| t.key().to_string()).collect();
            if !keys.is_empty() {
                let _ = self.shared.inbox.send(EngineMsg::Replay {
                    target: Arc::clone(&invocable),
                    keys,
                });
            }
        }
        Ok(invocable)
    }

    /// Remove every registration of `(callback, context)` under `kind`.
    ///
    /// Returns how many registrations were removed.
    pub fn off(&self, kind: impl AsRef<str>, callback: &Callback, context: Option<&Context>) -> Result<usize, IndexError> {
        let kind: EventKind = kind.as_ref().parse()?;
        let mut state = self.shared.state();
        if state.disposed {
            return Err(IndexError::Disposed);
        }
        Ok(state.listeners.remove(kind, callback, context))
    }

    // ─── Windows ─────────────────────────────────────────────────────────────

    /// Read-only view of entries at or after `(order, key)`.
    pub fn start_at(&self, order: Option<Order>, key: Option<&str>) -> Result<WindowedView, IndexError> {
        self.shared.ensure_live()?;
        Ok(self.window(self.shared.index.start_at(order, key), "start_at"))
    }

    /// Read-only view of entries at or before `(order, key)`.
    pub fn end_at(&self, order: Option<Order>, key: Option<&str>) -> Result<WindowedView, IndexError> {
        self.shared.ensure_live()?;
        Ok(self.window(self.shared.index.end_at(order, key), "end_at"))
    }

    /// Read-only view of at most `n` entries.
    pub fn limit(&self, n: usize) -> Result<WindowedView, IndexError> {
        self.shared.ensure_live()?;
        Ok(self.window(self.shared.index.limit(n), &format!("limit({n})")))
    }

    fn window(&self, index: Arc<dyn IndexStore>, label: &str) -> WindowedView {
        let config = self.shared.config.for_view(label);
        WindowedView::new(IndexEngine::with_config(index, Arc::clone(&self.shared.records), config))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Release every subscription and invalidate the engine.
    ///
    /// Every later call fails with [`IndexError::Disposed`].
    pub fn dispose(&self) -> Result<(), IndexError> {
        if self.shared.teardown() {
            Ok(())
        } else {
            Err(IndexError::Disposed)
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state().disposed
    }

    /// Keys currently tracked, in the order they entered the index.
    pub fn tracked_keys(&self) -> Result<Vec<String>, IndexError> {
        let state = self.shared.state();
        if state.disposed {
            return Err(IndexError::Disposed);
        }
        let mut trackers: Vec<&ChildTracker> = state.children.values().collect();
        trackers.sort_by_key(|t| t.seq());
        Ok(trackers.into_iter().map(|t| t.key().to_string()).collect())
    }

    pub fn metrics(&self) -> EngineMetrics {
        let tracked = self.shared.state().children.len();
        let mut m = self.shared.metrics().clone();
        m.tracked = tracked;
        m
    }
}

impl Drop for IndexEngine {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl std::fmt::Debug for IndexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEngine")
            .field("name", &self.shared.config.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ─── Engine internals ─────────────────────────────────────────────────────────

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> MutexGuard<'_, EngineMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<(), IndexError> {
        if self.state().disposed {
            Err(IndexError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Subscribe to membership and spawn the engine task (once).
    fn start(self: &Arc<Self>, state: &mut EngineState) -> Result<(), IndexError> {
        if state.driver.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| IndexError::Runtime(e.to_string()))?;
        let Some(inbox_rx) = state.inbox_rx.take() else {
            return Err(IndexError::Runtime("engine task already consumed its inbox".into()));
        };

        let sub = self.index.watch_membership();
        let forwarder = runtime.spawn(forward_membership(sub.events, self.inbox.clone()));
        state.membership = Some((sub.id, forwarder));
        state.driver = Some(runtime.spawn(drive(Arc::clone(self), inbox_rx)));

        info!(index = %self.config.name, strategy = ?self.resolver.strategy(), "index engine started");
        Ok(())
    }

    /// Release everything. Returns `false` if already disposed.
    fn teardown(&self) -> bool {
        let mut state = self.state();
        if state.disposed {
            return false;
        }
        state.disposed = true;
        for (_, tracker) in state.children.drain() {
            tracker.dispose(self.records.as_ref());
        }
        if let Some((id, forwarder)) = state.membership.take() {
            self.index.unwatch_membership(id);
            forwarder.abort();
        }
        state.listeners.clear();
        state.inbox_rx = None;
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        info!(index = %self.config.name, "index engine disposed");
        true
    }

    fn handle(&self, msg: EngineMsg) -> Vec<Notification> {
        let mut state = self.state();
        if state.disposed {
            return vec![];
        }
        match msg {
            EngineMsg::Membership(MembershipEvent::Added { key, predecessor }) => {
                self.index_added(&mut state, key, predecessor)
            }
            EngineMsg::Membership(MembershipEvent::Removed { key }) => self.index_removed(&mut state, &key),
            EngineMsg::Membership(MembershipEvent::Moved { key, predecessor }) => {
                self.index_moved(&mut state, &key, predecessor)
            }
            EngineMsg::Record {
                key,
                subscription,
                value,
            } => self.record_changed(&mut state, &key, subscription, value),
            EngineMsg::Resume { key, token } => self.resume(&mut state, &key, token),
            // Replays need to await the record store; `drive` routes them.
            EngineMsg::Replay { .. } => vec![],
        }
    }

    fn index_added(&self, state: &mut EngineState, key: String, predecessor: Option<String>) -> Vec<Notification> {
        if let Some(previous) = state.children.remove(&key) {
            debug!(index = %self.config.name, key = %key, "replacing tracker for re-added key");
            previous.dispose(self.records.as_ref());
        }

        let sub = self.records.watch(&key);
        let forwarder = tokio::spawn(forward_records(key.clone(), sub.id, sub.values, self.inbox.clone()));
        let seq = state.next_seq;
        state.next_seq += 1;

        debug!(index = %self.config.name, key = %key, predecessor = ?predecessor, "tracking key");
        let tracker = ChildTracker::new(key.clone(), predecessor, seq, sub.id, forwarder);
        state.children.insert(key, tracker);
        vec![]
    }

    fn index_removed(&self, state: &mut EngineState, key: &str) -> Vec<Notification> {
        let Some(tracker) = state.children.remove(key) else {
            return vec![];
        };
        debug!(index = %self.config.name, key = %key, loaded = tracker.is_loaded(), "untracking key");
        let notes = if tracker.is_visible() {
            vec![Notification::new(EventKind::Removed, tracker.snapshot(), None)]
        } else {
            vec![]
        };
        tracker.dispose(self.records.as_ref());
        notes
    }

    fn index_moved(&self, state: &mut EngineState, key: &str, predecessor: Option<String>) -> Vec<Notification> {
        let Some(tracker) = state.children.get_mut(key) else {
            return vec![];
        };
        tracker.set_predecessor(predecessor.clone());
        let mut notes = vec![Notification::new(EventKind::Moved, tracker.snapshot(), predecessor)];

        // A wait armed on the old predecessor no longer applies.
        if tracker.pending_token().is_some() {
            tracker.abort_pending();
            notes.extend(self.try_load(state, key));
        }
        notes
    }

    fn record_changed(
        &self,
        state: &mut EngineState,
        key: &str,
        subscription: SubscriptionId,
        value: Option<Value>,
    ) -> Vec<Notification> {
        let Some(tracker) = state.children.get_mut(key).filter(|t| t.subscription() == subscription) else {
            self.metrics().stale += 1;
            return vec![];
        };

        match value {
            None if tracker.is_visible() => {
                tracker.mark_absent();
                vec![Notification::new(EventKind::Removed, tracker.snapshot(), None)]
            }
            None => {
                // Absent before the first load carries no event.
                if !tracker.is_loaded() {
                    tracker.cancel_pending();
                }
                vec![]
            }
            Some(value) if tracker.is_loaded() => {
                tracker.update(value);
                vec![Notification::new(EventKind::Changed, tracker.snapshot(), None)]
            }
            Some(value) => {
                tracker.stash(value);
                if tracker.pending_token().is_some() {
                    return vec![];
                }
                self.try_load(state, key)
            }
        }
    }

    fn resume(&self, state: &mut EngineState, key: &str, token: u64) -> Vec<Notification> {
        let Some(tracker) = state.children.get_mut(key).filter(|t| t.pending_token() == Some(token)) else {
            self.metrics().stale += 1;
            return vec![];
        };
        tracker.clear_pending();
        if tracker.is_loaded() || tracker.last_value().is_none() {
            return vec![];
        }
        self.try_load(state, key)
    }

    /// Emit `added` for `key` if its predecessor is out of the way, otherwise
    /// defer until it might be.
    fn try_load(&self, state: &mut EngineState, key: &str) -> Vec<Notification> {
        let Some(predecessor) = state.children.get(key).map(|t| t.predecessor().map(str::to_string)) else {
            return vec![];
        };

        match self.resolver.check(&state.children, predecessor.as_deref()) {
            Dependency::Ready => {
                let Some(tracker) = state.children.get_mut(key) else {
                    return vec![];
                };
                let Some(value) = tracker.last_value().cloned() else {
                    return vec![];
                };
                tracker.mark_loaded();
                vec![Notification::new(EventKind::Added, Snapshot::new(key, value), predecessor)]
            }
            Dependency::Blocked(signal) => {
                let token = state.next_token;
                state.next_token += 1;
                let inbox = self.inbox.clone();
                let resume_key = key.to_string();
                let task = self.resolver.defer(signal, move || {
                    let _ = inbox.send(EngineMsg::Resume { key: resume_key, token });
                });
                if let Some(tracker) = state.children.get_mut(key) {
                    tracker.set_pending(token, task);
                }
                debug!(index = %self.config.name, key = %key, predecessor = ?predecessor, "waiting for predecessor");
                self.metrics().deferred += 1;
                vec![]
            }
        }
    }

    /// Deliver notifications to the listeners registered at delivery time.
    fn dispatch(&self, notes: Vec<Notification>) {
        for note in notes {
            let targets = {
                let state = self.state();
                if state.disposed {
                    return;
                }
                state.listeners.invocables(note.kind)
            };
            self.metrics().record(note.kind);
            for target in targets {
                target(&note);
            }
        }
    }

    /// Send the current value of each key to a late `added` subscriber, in
    /// current index order.
    async fn replay(&self, target: Invocable, mut keys: Vec<String>) {
        // Tracker predecessors go stale when neighbours move, so ask the index.
        let order = match self.index.ordered_keys().await {
            Ok(order) => order,
            Err(e) => {
                warn!(index = %self.config.name, error = %e, "replay order read failed, using tracking order");
                vec![]
            }
        };
        let position: HashMap<&str, usize> = order.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();
        keys.sort_by_key(|k| position.get(k.as_str()).copied().unwrap_or(usize::MAX));

        let reads = keys.iter().map(|k| self.records.get_once(k));
        let values = futures::future::join_all(reads).await;

        for (key, value) in keys.iter().zip(values) {
            let value = match value {
                Ok(Some(v)) => v,
                Ok(None) => continue,
                Err(e) => {
                    warn!(index = %self.config.name, key = %key, error = %e, "replay read failed");
                    continue;
                }
            };
            let from_index = position
                .get(key.as_str())
                .map(|&i| i.checked_sub(1).map(|p| order[p].clone()));
            let predecessor = {
                let state = self.state();
                if state.disposed {
                    return;
                }
                match state.children.get(key) {
                    Some(t) if t.is_visible() => match from_index {
                        Some(p) => p,
                        None => t.predecessor().map(str::to_string),
                    },
                    _ => continue,
                }
            };
            self.metrics().replayed += 1;
            target(&Notification::new(EventKind::Added, Snapshot::new(key.as_str(), value), predecessor));
        }
    }
}

async fn drive(shared: Arc<Shared>, mut inbox: mpsc::UnboundedReceiver<EngineMsg>) {
    while let Some(msg) = inbox.recv().await {
        match msg {
            EngineMsg::Replay { target, keys } => shared.replay(target, keys).await,
            other => {
                let notes = shared.handle(other);
                shared.dispatch(notes);
            }
        }
        shared.metrics().processed += 1;
    }
}

async fn forward_membership(
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    inbox: mpsc::UnboundedSender<EngineMsg>,
) {
    while let Some(event) = events.recv().await {
        if inbox.send(EngineMsg::Membership(event)).is_err() {
            break;
        }
    }
}

async fn forward_records(
    key: String,
    subscription: SubscriptionId,
    mut values: mpsc::UnboundedReceiver<Option<Value>>,
    inbox: mpsc::UnboundedSender<EngineMsg>,
) {
    while let Some(value) = values.recv().await {
        let msg = EngineMsg::Record {
            key: key.clone(),
            subscription,
            value,
        };
        if inbox.send(msg).is_err() {
            break;
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitStrategy;
    use crate::listener::{callback, context};
    use crate::memory::{MemoryIndexStore, MemoryRecordStore};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        index: Arc<MemoryIndexStore>,
        records: Arc<MemoryRecordStore>,
        engine: IndexEngine,
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default())
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let index = Arc::new(MemoryIndexStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let engine = IndexEngine::with_config(index.clone(), records.clone(), config);
        Harness { index, records, engine }
    }

    /// Subscribe one channel to every event kind.
    fn listen(engine: &IndexEngine) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb = callback(move |_, n| {
            let _ = tx.send(n.clone());
        });
        for kind in EventKind::ALL {
            engine.on(kind, Arc::clone(&cb), None).unwrap();
        }
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("listener channel closed")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Wait until the engine task has handled `n` inbox messages in total.
    /// Notifications for those messages have been dispatched by then.
    async fn processed(engine: &IndexEngine, n: u64) {
        wait_until(|| engine.metrics().processed >= n).await;
    }

    fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Notification>) {
        if let Ok(n) = rx.try_recv() {
            panic!("unexpected notification: {n:?}");
        }
    }

    fn order(n: i64) -> Option<Order> {
        Some(Order::from(n))
    }

    #[tokio::test]
    async fn added_fires_once_record_arrives() {
        let h = harness();
        let mut rx = listen(&h.engine);

        h.engine.add("a", None).await.unwrap();
        processed(&h.engine, 2).await;
        assert_quiet(&mut rx);

        h.records.set("a", json!({"n": 1})).await.unwrap();
        let n = next(&mut rx).await;
        assert_eq!(n.kind, EventKind::Added);
        assert_eq!(n.key(), "a");
        assert_eq!(n.value(), &json!({"n": 1}));
        assert_eq!(n.predecessor, None);

        processed(&h.engine, 3).await;
        assert_quiet(&mut rx);
    }

    #[tokio::test]
    async fn added_waits_for_predecessor() {
        let h = harness();
        let mut rx = listen(&h.engine);

        h.engine.add("a", order(1)).await.unwrap();
        h.engine.add("b", order(2)).await.unwrap();
        processed(&h.engine, 4).await;

        h.records.set("b", json!("second")).await.unwrap();
        wait_until(|| h.engine.metrics().deferred == 1).await;
        assert_quiet(&mut rx);

        h.records.set("a", json!("first")).await.unwrap();
        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        assert_eq!((first.kind, first.key()), (EventKind::Added, "a"));
        assert_eq!((second.kind, second.key()), (EventKind::Added, "b"));
        assert_eq!(second.value(), &json!("second"));
        assert_eq!(second.predecessor.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn burst_is_delivered_in_index_order() {
        let h = harness();
        let keys: Vec<String> = (0..12).map(|i| format!("k{i:02}")).collect();
        for (i, k) in keys.iter().enumerate() {
            h.index.set(k, order(i as i64)).await.unwrap();
        }
        let mut rx = listen(&h.engine);
        processed(&h.engine, 24).await;

        for k in keys.iter().rev() {
            h.records.set(k, json!({ "key": k })).await.unwrap();
        }

        let mut seen = vec![];
        for _ in &keys {
            let n = next(&mut rx).await;
            assert_eq!(n.kind, EventKind::Added);
            seen.push(n.key().to_string());
        }
        assert_eq!(seen, keys);
    }

    #[tokio::test]
    async fn preloaded_records_keep_index_order() {
        let h = harness();
        let keys = ["x", "m", "c", "q"];
        for (i, k) in keys.iter().enumerate() {
            h.records.set(k, json!(i)).await.unwrap();
            h.index.set(k, order(i as i64)).await.unwrap();
        }

        let mut rx = listen(&h.engine);
        for (i, k) in keys.iter().enumerate() {
            let n = next(&mut rx).await;
            assert_eq!(n.key(), *k);
            let expected_prev = i.checked_sub(1).map(|p| keys[p].to_string());
            assert_eq!(n.predecessor, expected_prev);
        }
    }

    #[tokio::test]
    async fn late_added_subscriber_gets_replay() {
        let h = harness();
        h.engine.on("changed", callback(|_, _| {}), None).unwrap();
        h.records.set("x", json!(1)).await.unwrap();
        h.records.set("y", json!(2)).await.unwrap();
        h.engine.add("x", order(1)).await.unwrap();
        h.engine.add("y", order(2)).await.unwrap();
        h.engine.add("z", order(3)).await.unwrap();
        wait_until(|| h.engine.metrics().added == 2).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        h.engine
            .on(
                "child_added",
                callback(move |_, n| {
                    let _ = tx.send(n.clone());
                }),
                None,
            )
            .unwrap();

        let x = next(&mut rx).await;
        let y = next(&mut rx).await;
        assert_eq!((x.key(), x.value()), ("x", &json!(1)));
        assert_eq!((y.key(), y.value()), ("y", &json!(2)));
        assert_eq!(y.predecessor.as_deref(), Some("x"));
        assert_quiet(&mut rx);
        assert_eq!(h.engine.metrics().replayed, 2);
    }

    #[tokio::test]
    async fn replay_follows_current_index_order() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.records.set("a", json!("a")).await.unwrap();
        h.records.set("b", json!("b")).await.unwrap();
        h.engine.add("a", order(1)).await.unwrap();
        h.engine.add("b", order(2)).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        h.engine.add("a", order(3)).await.unwrap();
        assert_eq!(next(&mut rx).await.kind, EventKind::Moved);

        let (tx, mut late) = mpsc::unbounded_channel();
        h.engine
            .on(
                "added",
                callback(move |_, n| {
                    let _ = tx.send((n.key().to_string(), n.predecessor.clone()));
                }),
                None,
            )
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), late.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), late.recv()).await.unwrap().unwrap();
        assert_eq!(first, ("b".to_string(), None));
        assert_eq!(second, ("a".to_string(), Some("b".to_string())));
    }

    #[tokio::test]
    async fn absence_before_load_is_silent() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.engine.add("ghost", None).await.unwrap();
        processed(&h.engine, 2).await;
        h.records.remove("ghost").await.unwrap();
        processed(&h.engine, 3).await;
        assert_quiet(&mut rx);
        assert_eq!(h.engine.tracked_keys().unwrap(), vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn dropping_untracked_key_is_noop() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.engine.drop("nobody").await.unwrap();
        assert_quiet(&mut rx);
        assert_eq!(h.engine.metrics().processed, 0);
    }

    #[tokio::test]
    async fn dropped_before_load_never_notifies() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.engine.add("c", None).await.unwrap();
        processed(&h.engine, 2).await;
        h.engine.drop("c").await.unwrap();
        processed(&h.engine, 3).await;
        assert_eq!(h.records.watcher_count(Some("c")), 0);

        h.records.set("c", json!("late")).await.unwrap();
        assert_quiet(&mut rx);
        assert_eq!(h.engine.metrics().emitted(), 0);
    }

    #[tokio::test]
    async fn dependent_released_when_predecessor_dropped_mid_load() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.engine.add("a", order(1)).await.unwrap();
        h.engine.add("b", order(2)).await.unwrap();
        processed(&h.engine, 4).await;

        h.records.set("b", json!("waiting")).await.unwrap();
        wait_until(|| h.engine.metrics().deferred == 1).await;
        assert_quiet(&mut rx);

        h.engine.drop("a").await.unwrap();
        let n = next(&mut rx).await;
        assert_eq!((n.kind, n.key()), (EventKind::Added, "b"));
        assert_eq!(n.value(), &json!("waiting"));
        assert_eq!(n.predecessor.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn polling_strategy_preserves_order() {
        let h = harness_with(EngineConfig {
            wait_strategy: WaitStrategy::Poll,
            poll_interval_ms: 5,
            ..Default::default()
        });
        let mut rx = listen(&h.engine);
        h.engine.add("a", order(1)).await.unwrap();
        h.engine.add("b", order(2)).await.unwrap();
        h.engine.add("c", order(3)).await.unwrap();
        processed(&h.engine, 6).await;

        h.records.set("c", json!(3)).await.unwrap();
        h.records.set("b", json!(2)).await.unwrap();
        processed(&h.engine, 8).await;
        assert_quiet(&mut rx);

        h.records.set("a", json!(1)).await.unwrap();
        let keys: Vec<String> = [next(&mut rx).await, next(&mut rx).await, next(&mut rx).await]
            .iter()
            .map(|n| n.key().to_string())
            .collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn changed_removed_and_reappeared() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.records.set("a", json!(1)).await.unwrap();
        h.engine.add("a", None).await.unwrap();
        assert_eq!(next(&mut rx).await.kind, EventKind::Added);

        h.records.set("a", json!(2)).await.unwrap();
        let changed = next(&mut rx).await;
        assert_eq!((changed.kind, changed.value()), (EventKind::Changed, &json!(2)));

        h.records.remove("a").await.unwrap();
        let removed = next(&mut rx).await;
        assert_eq!((removed.kind, removed.value()), (EventKind::Removed, &json!(2)));

        h.records.set("a", json!(3)).await.unwrap();
        assert_eq!(next(&mut rx).await.kind, EventKind::Changed);

        h.engine.drop("a").await.unwrap();
        let removed = next(&mut rx).await;
        assert_eq!((removed.kind, removed.value()), (EventKind::Removed, &json!(3)));
        processed(&h.engine, 6).await;
        assert_quiet(&mut rx);
    }

    #[tokio::test]
    async fn reorder_emits_moved_with_new_predecessor() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.records.set("a", json!("a")).await.unwrap();
        h.records.set("b", json!("b")).await.unwrap();
        h.engine.add("a", order(1)).await.unwrap();
        h.engine.add("b", order(2)).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        h.engine.add("a", order(3)).await.unwrap();
        let moved = next(&mut rx).await;
        assert_eq!((moved.kind, moved.key()), (EventKind::Moved, "a"));
        assert_eq!(moved.predecessor.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn moved_fires_for_keys_not_yet_loaded() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.engine.add("a", order(1)).await.unwrap();
        h.engine.add("b", order(2)).await.unwrap();
        processed(&h.engine, 4).await;

        h.engine.add("a", order(3)).await.unwrap();
        let moved = next(&mut rx).await;
        assert_eq!((moved.kind, moved.key()), (EventKind::Moved, "a"));
        assert_eq!(moved.predecessor.as_deref(), Some("b"));
        assert_eq!(moved.value(), &Value::Null);

        processed(&h.engine, 5).await;
        assert_quiet(&mut rx);
    }

    #[tokio::test]
    async fn move_releases_wait_on_old_predecessor() {
        let h = harness();
        let mut rx = listen(&h.engine);
        h.records.set("a", json!("a")).await.unwrap();
        h.engine.add("a", order(1)).await.unwrap();
        h.engine.add("b", order(2)).await.unwrap();
        h.engine.add("c", order(3)).await.unwrap();
        assert_eq!(next(&mut rx).await.key(), "a");
        processed(&h.engine, 6).await;

        // "b" never gets a record, so "c" stays blocked behind it.
        h.records.set("c", json!("c")).await.unwrap();
        wait_until(|| h.engine.metrics().deferred == 1).await;
        assert_quiet(&mut rx);

        h.engine.add("c", Some(Order::from(1.5))).await.unwrap();
        let moved = next(&mut rx).await;
        assert_eq!((moved.kind, moved.key()), (EventKind::Moved, "c"));
        assert_eq!(moved.predecessor.as_deref(), Some("a"));
        let added = next(&mut rx).await;
        assert_eq!((added.kind, added.key(), added.value()), (EventKind::Added, "c", &json!("c")));
        assert_eq!(added.predecessor.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn off_removes_all_matching_registrations() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cb = callback(move |ctx, n| {
            let tag = ctx.and_then(|c| c.downcast_ref::<&str>()).copied().unwrap_or("none");
            let _ = tx.send((tag, n.key().to_string()));
        });
        let first = context("first");
        let second = context("second");
        h.engine.on(EventKind::Added, Arc::clone(&cb), Some(Arc::clone(&first))).unwrap();
        h.engine.on(EventKind::Added, Arc::clone(&cb), Some(Arc::clone(&first))).unwrap();
        h.engine.on(EventKind::Added, Arc::clone(&cb), Some(Arc::clone(&second))).unwrap();

        assert_eq!(h.engine.off("added", &cb, Some(&first)).unwrap(), 2);

        h.records.set("k", json!(true)).await.unwrap();
        h.engine.add("k", None).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, ("second", "k".to_string()));
        processed(&h.engine, 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_event_kind_leaves_engine_usable() {
        let h = harness();
        let cb = callback(|_, _| {});
        assert!(matches!(
            h.engine.on("value", Arc::clone(&cb), None),
            Err(IndexError::InvalidEventKind(kind)) if kind == "value"
        ));
        assert!(h.engine.off("child_value", &cb, None).is_err());
        assert!(h.engine.on("moved", cb, None).is_ok());
    }

    #[tokio::test]
    async fn subscription_is_lazy() {
        let h = harness();
        assert_eq!(h.index.watcher_count(), 0);
        h.engine.on("removed", callback(|_, _| {}), None).unwrap();
        h.engine.on("changed", callback(|_, _| {}), None).unwrap();
        assert_eq!(h.index.watcher_count(), 1);
    }

    #[tokio::test]
    async fn store_errors_pass_through_without_tracking() {
        let h = harness();
        let _rx = listen(&h.engine);
        h.index.fail_writes(Some("permission denied"));
        let err = h.engine.add("a", None).await.unwrap_err();
        assert_eq!(err, IndexError::Store("permission denied".into()));
        assert!(err.is_store_error());
        assert!(h.engine.tracked_keys().unwrap().is_empty());
        assert_eq!(h.engine.metrics().processed, 0);
    }

    #[tokio::test]
    async fn child_gives_direct_record_access() {
        let h = harness();
        let child = h.engine.child("a").unwrap();
        child.set(json!({"name": "alpha"})).await.unwrap();
        assert_eq!(h.records.get_once("a").await.unwrap(), Some(json!({"name": "alpha"})));
        assert_eq!(child.get().await.unwrap(), Some(json!({"name": "alpha"})));
        child.remove().await.unwrap();
        assert!(h.records.is_empty());
    }

    #[tokio::test]
    async fn dispose_releases_everything() {
        let h = harness();
        let _rx = listen(&h.engine);
        h.engine.add("a", None).await.unwrap();
        h.engine.add("b", None).await.unwrap();
        wait_until(|| h.records.watcher_count(None) == 2).await;

        h.engine.dispose().unwrap();
        assert_eq!(h.records.watcher_count(None), 0);
        assert_eq!(h.index.watcher_count(), 0);
        assert!(h.engine.is_disposed());

        let cb = callback(|_, _| {});
        assert!(matches!(h.engine.on("added", Arc::clone(&cb), None), Err(IndexError::Disposed)));
        assert_eq!(h.engine.off("added", &cb, None).unwrap_err(), IndexError::Disposed);
        assert_eq!(h.engine.add("c", None).await.unwrap_err(), IndexError::Disposed);
        assert_eq!(h.engine.drop("a").await.unwrap_err(), IndexError::Disposed);
        assert_eq!(h.engine.limit(1).unwrap_err(), IndexError::Disposed);
        assert_eq!(h.engine.dispose().unwrap_err(), IndexError::Disposed);
    }

    #[test]
    fn on_outside_runtime_is_an_error() {
        let index = Arc::new(MemoryIndexStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let engine = IndexEngine::new(index, records);
        assert!(matches!(
            engine.on("added", callback(|_, _| {}), None),
            Err(IndexError::Runtime(_))
        ));
    }
}
