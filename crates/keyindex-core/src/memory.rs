//! In-memory index and record stores.
//!
//! Both stores keep everything in RAM and push notifications through the
//! channels handed out by their `watch*` methods. They back the test suite and
//! the demo CLI; production deployments plug their own realtime backend in
//! behind the same traits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::IndexError;
use crate::store::{
    IndexStore, MembershipEvent, MembershipSubscription, RecordStore, RecordSubscription,
    SubscriptionId,
};
use crate::types::Order;

type Entry = (String, Option<Order>);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Query ────────────────────────────────────────────────────────────────────

/// One end of a range restriction.
#[derive(Debug, Clone)]
struct Bound {
    order: Option<Order>,
    key: Option<String>,
}

impl Bound {
    /// `None` when both parts are absent, which means "unbounded".
    fn new(order: Option<Order>, key: Option<&str>) -> Option<Self> {
        if order.is_none() && key.is_none() {
            return None;
        }
        Some(Self {
            order,
            key: key.map(str::to_string),
        })
    }

    fn cmp_entry(&self, (key, order): &Entry) -> std::cmp::Ordering {
        Order::compare(order.as_ref(), self.order.as_ref()).then_with(|| match &self.key {
            Some(bound) => key.as_str().cmp(bound.as_str()),
            None => std::cmp::Ordering::Equal,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Query {
    start: Option<Bound>,
    end: Option<Bound>,
    limit: Option<usize>,
}

impl Query {
    fn admits(&self, entry: &Entry) -> bool {
        let after_start = self.start.as_ref().map_or(true, |b| b.cmp_entry(entry).is_ge());
        let before_end = self.end.as_ref().map_or(true, |b| b.cmp_entry(entry).is_le());
        after_start && before_end
    }

    /// Entries visible through this query, in index order.
    ///
    /// A limit anchored only at the start keeps the first `n` entries;
    /// otherwise it keeps the last `n`.
    fn visible(&self, entries: &HashMap<String, Option<Order>>) -> Vec<Entry> {
        let mut sorted: Vec<Entry> = entries
            .iter()
            .map(|(k, o)| (k.clone(), o.clone()))
            .filter(|e| self.admits(e))
            .collect();
        sorted.sort_by(|a, b| Order::compare(a.1.as_ref(), b.1.as_ref()).then_with(|| a.0.cmp(&b.0)));
        if let Some(n) = self.limit {
            if self.start.is_some() && self.end.is_none() {
                sorted.truncate(n);
            } else {
                let skip = sorted.len().saturating_sub(n);
                sorted.drain(..skip);
            }
        }
        sorted
    }
}

/// Membership events that turn `old` into `new`.
fn diff(old: &[Entry], new: &[Entry]) -> Vec<MembershipEvent> {
    let old_pos: HashMap<&str, usize> = old.iter().enumerate().map(|(i, e)| (e.0.as_str(), i)).collect();
    let new_keys: HashMap<&str, ()> = new.iter().map(|e| (e.0.as_str(), ())).collect();

    let mut events: Vec<MembershipEvent> = old
        .iter()
        .filter(|e| !new_keys.contains_key(e.0.as_str()))
        .map(|e| MembershipEvent::Removed { key: e.0.clone() })
        .collect();

    for (i, (key, order)) in new.iter().enumerate() {
        let predecessor = i.checked_sub(1).map(|p| new[p].0.clone());
        match old_pos.get(key.as_str()) {
            None => events.push(MembershipEvent::Added {
                key: key.clone(),
                predecessor,
            }),
            Some(&j) => {
                let old_predecessor = j.checked_sub(1).map(|p| old[p].0.clone());
                if old[j].1 != *order && old_predecessor != predecessor {
                    events.push(MembershipEvent::Moved {
                        key: key.clone(),
                        predecessor,
                    });
                }
            }
        }
    }
    events
}

// ─── MemoryIndexStore ─────────────────────────────────────────────────────────

struct MembershipWatcher {
    query: Query,
    visible: Vec<Entry>,
    sender: mpsc::UnboundedSender<MembershipEvent>,
}

#[derive(Default)]
struct IndexData {
    entries: HashMap<String, Option<Order>>,
    watchers: HashMap<SubscriptionId, MembershipWatcher>,
    next_id: u64,
    fail_writes: Option<String>,
}

impl IndexData {
    fn publish(&mut self) {
        let entries = &self.entries;
        self.watchers.retain(|_, w| {
            let visible = w.query.visible(entries);
            let events = diff(&w.visible, &visible);
            w.visible = visible;
            events.into_iter().all(|e| w.sender.send(e).is_ok())
        });
    }
}

/// In-memory ordered index.
///
/// Cloning shares the same data. Range/limit handles share it too and only
/// differ in what their watchers see.
#[derive(Clone, Default)]
pub struct MemoryIndexStore {
    inner: Arc<Mutex<IndexData>>,
    query: Query,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `reason` (`None` restores writes).
    pub fn fail_writes(&self, reason: Option<&str>) {
        lock(&self.inner).fail_writes = reason.map(str::to_string);
    }

    /// All keys in index order, ignoring this handle's window.
    pub fn keys(&self) -> Vec<String> {
        Query::default()
            .visible(&lock(&self.inner).entries)
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live membership watchers across all handles.
    pub fn watcher_count(&self) -> usize {
        lock(&self.inner).watchers.len()
    }

    fn narrowed(&self, f: impl FnOnce(&mut Query)) -> Arc<dyn IndexStore> {
        let mut query = self.query.clone();
        f(&mut query);
        Arc::new(Self {
            inner: Arc::clone(&self.inner),
            query,
        })
    }

    fn check_writable(data: &IndexData) -> Result<(), IndexError> {
        match &data.fail_writes {
            Some(reason) => Err(IndexError::Store(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn set(&self, key: &str, order: Option<Order>) -> Result<(), IndexError> {
        let mut data = lock(&self.inner);
        Self::check_writable(&data)?;
        data.entries.insert(key.to_string(), order);
        data.publish();
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), IndexError> {
        let mut data = lock(&self.inner);
        Self::check_writable(&data)?;
        if data.entries.remove(key).is_some() {
            data.publish();
        }
        Ok(())
    }

    async fn ordered_keys(&self) -> Result<Vec<String>, IndexError> {
        let data = lock(&self.inner);
        Ok(self.query.visible(&data.entries).into_iter().map(|(k, _)| k).collect())
    }

    fn watch_membership(&self) -> MembershipSubscription {
        let (sender, events) = mpsc::unbounded_channel();
        let mut data = lock(&self.inner);
        let visible = self.query.visible(&data.entries);
        for event in diff(&[], &visible) {
            let _ = sender.send(event);
        }
        data.next_id += 1;
        let id = SubscriptionId(data.next_id);
        data.watchers.insert(
            id,
            MembershipWatcher {
                query: self.query.clone(),
                visible,
                sender,
            },
        );
        MembershipSubscription { id, events }
    }

    fn unwatch_membership(&self, id: SubscriptionId) {
        lock(&self.inner).watchers.remove(&id);
    }

    fn start_at(&self, order: Option<Order>, key: Option<&str>) -> Arc<dyn IndexStore> {
        self.narrowed(|q| q.start = Bound::new(order, key))
    }

    fn end_at(&self, order: Option<Order>, key: Option<&str>) -> Arc<dyn IndexStore> {
        self.narrowed(|q| q.end = Bound::new(order, key))
    }

    fn limit(&self, n: usize) -> Arc<dyn IndexStore> {
        self.narrowed(|q| q.limit = Some(n))
    }
}

// ─── MemoryRecordStore ────────────────────────────────────────────────────────

struct RecordWatcher {
    key: String,
    sender: mpsc::UnboundedSender<Option<Value>>,
}

#[derive(Default)]
struct RecordData {
    values: HashMap<String, Value>,
    watchers: HashMap<SubscriptionId, RecordWatcher>,
    next_id: u64,
    fail_writes: Option<String>,
}

impl RecordData {
    fn publish(&mut self, key: &str, value: Option<&Value>) {
        self.watchers
            .retain(|_, w| w.key != key || w.sender.send(value.cloned()).is_ok());
    }
}

/// In-memory keyed record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<RecordData>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `reason` (`None` restores writes).
    pub fn fail_writes(&self, reason: Option<&str>) {
        lock(&self.inner).fail_writes = reason.map(str::to_string);
    }

    /// Number of live watchers, optionally for a single key.
    pub fn watcher_count(&self, key: Option<&str>) -> usize {
        lock(&self.inner)
            .watchers
            .values()
            .filter(|w| key.map_or(true, |k| w.key == k))
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn watch(&self, key: &str) -> RecordSubscription {
        let (sender, values) = mpsc::unbounded_channel();
        let mut data = lock(&self.inner);
        let _ = sender.send(data.values.get(key).cloned());
        data.next_id += 1;
        let id = SubscriptionId(data.next_id);
        data.watchers.insert(
            id,
            RecordWatcher {
                key: key.to_string(),
                sender,
            },
        );
        RecordSubscription { id, values }
    }

    fn unwatch(&self, id: SubscriptionId) {
        lock(&self.inner).watchers.remove(&id);
    }

    async fn get_once(&self, key: &str) -> Result<Option<Value>, IndexError> {
        Ok(lock(&self.inner).values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), IndexError> {
        let mut data = lock(&self.inner);
        if let Some(reason) = &data.fail_writes {
            return Err(IndexError::Store(reason.clone()));
        }
        data.values.insert(key.to_string(), value.clone());
        data.publish(key, Some(&value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), IndexError> {
        let mut data = lock(&self.inner);
        if let Some(reason) = &data.fail_writes {
            return Err(IndexError::Store(reason.clone()));
        }
        data.values.remove(key);
        data.publish(key, None);
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
