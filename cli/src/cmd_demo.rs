//! `keyindex demo` — index a run of keys, write their records out of order,
//! and show that `added` still arrives in index order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::ValueEnum;
use keyindex_core::memory::{MemoryIndexStore, MemoryRecordStore};
use keyindex_core::{EventKind, IndexEngine, Order, RecordStore, WaitStrategy};
use serde_json::json;
use tracing::info;

use crate::output::{print_metrics, Collector};

/// Order in which record values are written.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Delivery {
    Forward,
    Reverse,
    /// Odd positions last-to-first, then even positions.
    Interleave,
}

impl Delivery {
    fn sequence(self, n: usize) -> Vec<usize> {
        match self {
            Self::Forward => (0..n).collect(),
            Self::Reverse => (0..n).rev().collect(),
            Self::Interleave => (0..n)
                .filter(|i| i % 2 == 1)
                .rev()
                .chain((0..n).filter(|i| i % 2 == 0))
                .collect(),
        }
    }
}

pub struct DemoArgs {
    pub keys: usize,
    pub delivery: Delivery,
    pub strategy: WaitStrategy,
    pub poll_interval_ms: u64,
    pub write_delay_ms: u64,
    pub json: bool,
}

pub async fn run(args: DemoArgs) -> Result<()> {
    if args.keys == 0 {
        bail!("--keys must be at least 1");
    }

    let index = Arc::new(MemoryIndexStore::new());
    let records = Arc::new(MemoryRecordStore::new());
    let engine = IndexEngine::builder(index.clone(), records.clone())
        .name("demo")
        .wait_strategy(args.strategy)
        .poll_interval_ms(args.poll_interval_ms)
        .build();

    let mut collector = Collector::attach(args.json, |kind, cb| engine.on(kind, cb, None))?;

    let keys: Vec<String> = (0..args.keys).map(|i| format!("item-{i:03}")).collect();
    for (i, key) in keys.iter().enumerate() {
        engine.add(key, Some(Order::from(i as i64))).await?;
    }

    let order = args.delivery.sequence(keys.len());
    info!(delivery = ?args.delivery, "writing records");
    for i in order {
        records.set(&keys[i], json!({ "position": i })).await?;
        if args.write_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.write_delay_ms)).await;
        }
    }

    let added = collector
        .wait_for(EventKind::Added, keys.len(), Duration::from_secs(5))
        .await?;
    let delivered: Vec<&str> = added.iter().map(|n| n.key()).collect();
    if delivered != keys.iter().map(String::as_str).collect::<Vec<_>>() {
        bail!("added events arrived out of index order: {delivered:?}");
    }

    print_metrics(&engine.metrics(), args.json)?;
    engine.dispose()?;
    Ok(())
}
