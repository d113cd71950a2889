//! Windowed view — a read-only engine over a range/limit-filtered index.

use crate::engine::IndexEngine;
use crate::error::IndexError;
use crate::listener::{Callback, Context, Invocable};
use crate::metrics::EngineMetrics;
use crate::store::ChildRef;
use crate::types::Order;

/// A read-only index produced by [`IndexEngine::start_at`],
/// [`IndexEngine::end_at`] or [`IndexEngine::limit`].
///
/// Reads behave exactly like the base engine. Mutation and direct child
/// access fail with [`IndexError::UnsupportedOperation`]. Windows compose:
/// each call narrows the view's own (already filtered) index.
#[derive(Debug)]
pub struct WindowedView {
    engine: IndexEngine,
}

impl WindowedView {
    pub(crate) fn new(engine: IndexEngine) -> Self {
        Self { engine }
    }

    pub async fn add(&self, _key: &str, _order: Option<Order>) -> Result<(), IndexError> {
        Err(IndexError::unsupported("add to index"))
    }

    pub async fn drop(&self, _key: &str) -> Result<(), IndexError> {
        Err(IndexError::unsupported("drop from index"))
    }

    pub fn child(&self, _key: &str) -> Result<ChildRef, IndexError> {
        Err(IndexError::unsupported("access child"))
    }

    pub fn on(&self, kind: impl AsRef<str>, callback: Callback, context: Option<Context>) -> Result<Invocable, IndexError> {
        self.engine.on(kind, callback, context)
    }

    pub fn off(&self, kind: impl AsRef<str>, callback: &Callback, context: Option<&Context>) -> Result<usize, IndexError> {
        self.engine.off(kind, callback, context)
    }

    pub fn start_at(&self, order: Option<Order>, key: Option<&str>) -> Result<WindowedView, IndexError> {
        self.engine.start_at(order, key)
    }

    pub fn end_at(&self, order: Option<Order>, key: Option<&str>) -> Result<WindowedView, IndexError> {
        self.engine.end_at(order, key)
    }

    pub fn limit(&self, n: usize) -> Result<WindowedView, IndexError> {
        self.engine.limit(n)
    }

    pub fn dispose(&self) -> Result<(), IndexError> {
        self.engine.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_disposed()
    }

    pub fn tracked_keys(&self) -> Result<Vec<String>, IndexError> {
        self.engine.tracked_keys()
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.engine.metrics()
    }

    pub fn name(&self) -> &str {
        &self.engine.config().name
    }
}
