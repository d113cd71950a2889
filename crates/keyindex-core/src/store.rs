//! Collaborator traits — the ordered index store and the keyed record store.
//!
//! Both stores push notifications through unbounded channels handed out at
//! subscription time. The engine never owns their data; it only reacts to
//! what they deliver.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::IndexError;
use crate::types::Order;

/// A handle identifying one live subscription on a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A change in index membership or order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// `key` entered the index after `predecessor` (`None` = first).
    Added { key: String, predecessor: Option<String> },
    /// `key` left the index.
    Removed { key: String },
    /// `key` changed position and now follows `predecessor`.
    Moved { key: String, predecessor: Option<String> },
}

impl MembershipEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Removed { key } | Self::Moved { key, .. } => key,
        }
    }
}

/// A live membership subscription.
#[derive(Debug)]
pub struct MembershipSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<MembershipEvent>,
}

/// A live watch on a single record. `None` means the record is absent.
#[derive(Debug)]
pub struct RecordSubscription {
    pub id: SubscriptionId,
    pub values: mpsc::UnboundedReceiver<Option<Value>>,
}

/// The ordered key-value store holding index membership.
///
/// Range and limit queries return new handles over the same data; mutating
/// through a filtered handle writes to the underlying index.
#[async_trait]
pub trait IndexStore: Send + Sync + 'static {
    /// Put `key` into the index, optionally with an order rank.
    async fn set(&self, key: &str, order: Option<Order>) -> Result<(), IndexError>;

    /// Remove `key` from the index.
    async fn remove(&self, key: &str) -> Result<(), IndexError>;

    /// Keys visible through this handle, in current index order.
    async fn ordered_keys(&self) -> Result<Vec<String>, IndexError>;

    /// Subscribe to membership changes. Entries already present are delivered
    /// first as `Added`, in index order.
    fn watch_membership(&self) -> MembershipSubscription;

    /// Release a membership subscription.
    fn unwatch_membership(&self, id: SubscriptionId);

    /// Restrict to entries at or after `(order, key)`.
    fn start_at(&self, order: Option<Order>, key: Option<&str>) -> Arc<dyn IndexStore>;

    /// Restrict to entries at or before `(order, key)`.
    fn end_at(&self, order: Option<Order>, key: Option<&str>) -> Arc<dyn IndexStore>;

    /// Restrict to at most `n` entries.
    fn limit(&self, n: usize) -> Arc<dyn IndexStore>;
}

/// The keyed store holding record values.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Watch `key`. The current value (or absence) is delivered first,
    /// followed by every change.
    fn watch(&self, key: &str) -> RecordSubscription;

    /// Release a record watch.
    fn unwatch(&self, id: SubscriptionId);

    /// Read the current value once.
    async fn get_once(&self, key: &str) -> Result<Option<Value>, IndexError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), IndexError>;

    async fn remove(&self, key: &str) -> Result<(), IndexError>;
}

/// Direct access to one record through the engine's record store.
#[derive(Clone)]
pub struct ChildRef {
    key: String,
    records: Arc<dyn RecordStore>,
}

impl ChildRef {
    pub(crate) fn new(key: impl Into<String>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            key: key.into(),
            records,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn get(&self) -> Result<Option<Value>, IndexError> {
        self.records.get_once(&self.key).await
    }

    pub async fn set(&self, value: Value) -> Result<(), IndexError> {
        self.records.set(&self.key, value).await
    }

    pub async fn remove(&self) -> Result<(), IndexError> {
        self.records.remove(&self.key).await
    }
}

impl std::fmt::Debug for ChildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildRef").field("key", &self.key).finish()
    }
}
