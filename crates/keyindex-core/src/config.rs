//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Retry interval used by [`WaitStrategy::Poll`] when no other value is configured.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// How a deferred `added` notification waits for its predecessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Await the predecessor's completion signal.
    #[default]
    Signal,
    /// Re-check the predecessor every `poll_interval_ms`.
    Poll,
}

/// Configuration for an [`IndexEngine`](crate::engine::IndexEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Label attached to log records from this engine.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub wait_strategy: WaitStrategy,
    /// Only used by [`WaitStrategy::Poll`].
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_name() -> String {
    "index".into()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            wait_strategy: WaitStrategy::Signal,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    /// Config for a windowed view derived from this engine.
    pub(crate) fn for_view(&self, window: &str) -> Self {
        Self {
            name: format!("{}/{}", self.name, window),
            ..self.clone()
        }
    }
}
