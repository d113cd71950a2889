//! Shared types: order ranks, snapshots, and the notifications delivered to listeners.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexError;

// ─── Order ────────────────────────────────────────────────────────────────────

/// An opaque rank attached to an index entry.
///
/// The engine never compares orders itself; it only forwards them to the
/// index store. Stores that need a total order can use [`Order::compare`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Order {
    Number(f64),
    Text(String),
}

impl Order {
    /// Priority ordering: no order first, then numbers ascending, then text
    /// lexicographically.
    pub fn compare(a: Option<&Order>, b: Option<&Order>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(Order::Number(x)), Some(Order::Number(y))) => x.total_cmp(y),
            (Some(Order::Number(_)), Some(Order::Text(_))) => Ordering::Less,
            (Some(Order::Text(_)), Some(Order::Number(_))) => Ordering::Greater,
            (Some(Order::Text(x)), Some(Order::Text(y))) => x.cmp(y),
        }
    }
}

impl From<f64> for Order {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Order {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Order {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Order {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

// ─── EventKind ────────────────────────────────────────────────────────────────

/// The four notification kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Changed,
    Removed,
    Moved,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [Self::Added, Self::Changed, Self::Removed, Self::Moved];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
            Self::Moved => "moved",
        }
    }
}

impl AsRef<str> for EventKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for EventKind {
    type Err = IndexError;

    /// Accepts both the short names and the `child_*` names used by
    /// realtime backends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" | "child_added" => Ok(Self::Added),
            "changed" | "child_changed" => Ok(Self::Changed),
            "removed" | "child_removed" => Ok(Self::Removed),
            "moved" | "child_moved" => Ok(Self::Moved),
            other => Err(IndexError::InvalidEventKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Snapshot / Notification ──────────────────────────────────────────────────

/// The record a notification refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    key: String,
    value: Value,
}

impl Snapshot {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// A reconciled notification delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: EventKind,
    pub snapshot: Snapshot,
    /// Key of the entry immediately before this one in index order
    /// (`added` and `moved` only; `None` means first).
    pub predecessor: Option<String>,
}

impl Notification {
    pub fn new(kind: EventKind, snapshot: Snapshot, predecessor: Option<String>) -> Self {
        Self {
            kind,
            snapshot,
            predecessor,
        }
    }

    pub fn key(&self) -> &str {
        self.snapshot.key()
    }

    pub fn value(&self) -> &Value {
        self.snapshot.value()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
