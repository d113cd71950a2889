//! Fluent builder for index engines.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyindex_core::{IndexEngine, WaitStrategy};
//! use keyindex_core::memory::{MemoryIndexStore, MemoryRecordStore};
//!
//! let engine = IndexEngine::builder(
//!         Arc::new(MemoryIndexStore::new()),
//!         Arc::new(MemoryRecordStore::new()),
//!     )
//!     .name("widgets")
//!     .wait_strategy(WaitStrategy::Poll)
//!     .poll_interval_ms(25)
//!     .build();
//! ```

use std::sync::Arc;

use crate::config::{EngineConfig, WaitStrategy};
use crate::engine::IndexEngine;
use crate::store::{IndexStore, RecordStore};

/// Fluent builder for [`IndexEngine`].
pub struct IndexEngineBuilder {
    index: Arc<dyn IndexStore>,
    records: Arc<dyn RecordStore>,
    config: EngineConfig,
}

impl IndexEngineBuilder {
    pub fn new(index: Arc<dyn IndexStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            index,
            records,
            config: EngineConfig::default(),
        }
    }

    /// Label used in log records.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.config.wait_strategy = strategy;
        self
    }

    /// Re-check interval for [`WaitStrategy::Poll`].
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> IndexEngine {
        IndexEngine::with_config(self.index, self.records, self.config)
    }
}
