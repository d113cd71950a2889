//! `keyindex window` — watch a range/limit view of a seeded index, then append
//! keys past the end to show entries sliding in and out of the window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keyindex_core::memory::{MemoryIndexStore, MemoryRecordStore};
use keyindex_core::{IndexEngine, IndexStore, Order, RecordStore};
use serde_json::json;

use crate::output::{print_metrics, Collector};

pub struct WindowArgs {
    pub keys: usize,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub limit: Option<usize>,
    pub append: usize,
    pub json: bool,
}

const QUIET: Duration = Duration::from_millis(150);

pub async fn run(args: WindowArgs) -> Result<()> {
    let index = Arc::new(MemoryIndexStore::new());
    let records = Arc::new(MemoryRecordStore::new());
    for i in 0..args.keys + args.append {
        records.set(&key(i), json!({ "position": i })).await?;
    }
    for i in 0..args.keys {
        index.set(&key(i), Some(Order::from(i as i64))).await?;
    }

    let engine = IndexEngine::builder(index.clone(), records.clone()).name("window").build();

    // An absent bound is unbounded, so the chain is a no-op for unset flags.
    let mut view = engine
        .start_at(args.start.map(Order::from), None)?
        .end_at(args.end.map(Order::from), None)?;
    if let Some(n) = args.limit {
        view = view.limit(n)?;
    }
    if !args.json {
        println!("view {}", view.name());
    }

    let mut collector = Collector::attach(args.json, |kind, cb| view.on(kind, cb, None))?;
    collector.drain(QUIET).await?;

    for i in args.keys..args.keys + args.append {
        index.set(&key(i), Some(Order::from(i as i64))).await?;
        collector.drain(QUIET).await?;
    }

    print_metrics(&view.metrics(), args.json)?;
    view.dispose()?;
    engine.dispose()?;
    Ok(())
}

fn key(i: usize) -> String {
    format!("item-{i:03}")
}
