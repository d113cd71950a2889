//! keyindex-core — order-preserving reconciliation of a key index with a record store.
//!
//! # Architecture
//!
//! ```text
//! IndexEngine
//!     ├── ListenerRegistry         (per-kind callbacks, exact-match removal)
//!     ├── ChildTracker per key     (record watch, loaded flag, completion signal)
//!     ├── OrderDependencyResolver  (added waits for its predecessor)
//!     ├── IndexStore               (membership + order, range/limit queries)
//!     └── RecordStore              (per-key values)
//!
//! WindowedView = read-only IndexEngine over a filtered IndexStore
//! ```

pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod resolver;
pub mod store;
pub mod tracker;
pub mod types;
pub mod view;

pub use builder::IndexEngineBuilder;
pub use config::{EngineConfig, WaitStrategy};
pub use engine::IndexEngine;
pub use error::IndexError;
pub use listener::{callback, context, Callback, Context, Invocable, ListenerRegistry};
pub use metrics::EngineMetrics;
pub use resolver::OrderDependencyResolver;
pub use store::{ChildRef, IndexStore, MembershipEvent, RecordStore, SubscriptionId};
pub use tracker::ChildTracker;
pub use types::{EventKind, Notification, Order, Snapshot};
pub use view::WindowedView;
