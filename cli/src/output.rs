//! Shared listener plumbing and printing for the CLI commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keyindex_core::{callback, EngineMetrics, EventKind, Invocable, Notification};
use tokio::sync::mpsc;

/// Receives every notification from the listeners it registered.
pub struct Collector {
    rx: mpsc::UnboundedReceiver<Notification>,
    json: bool,
}

impl Collector {
    /// Register one callback for all event kinds via `on`.
    pub fn attach<F>(json: bool, on: F) -> Result<Self>
    where
        F: Fn(EventKind, keyindex_core::Callback) -> Result<Invocable, keyindex_core::IndexError>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb = callback(move |_, n| {
            let _ = tx.send(n.clone());
        });
        for kind in EventKind::ALL {
            on(kind, Arc::clone(&cb)).with_context(|| format!("subscribing to {kind}"))?;
        }
        Ok(Self { rx, json })
    }

    /// Print exactly `count` notifications of `kind`, failing after `timeout`.
    pub async fn wait_for(&mut self, kind: EventKind, count: usize, timeout: Duration) -> Result<Vec<Notification>> {
        let mut seen = Vec::with_capacity(count);
        while seen.len() < count {
            let n = tokio::time::timeout(timeout, self.rx.recv())
                .await
                .with_context(|| format!("timed out after {} of {count} {kind} events", seen.len()))?
                .context("listener channel closed")?;
            self.print(&n)?;
            if n.kind == kind {
                seen.push(n);
            }
        }
        Ok(seen)
    }

    /// Print notifications until none arrives for `quiet`.
    pub async fn drain(&mut self, quiet: Duration) -> Result<Vec<Notification>> {
        let mut seen = vec![];
        while let Ok(Some(n)) = tokio::time::timeout(quiet, self.rx.recv()).await {
            self.print(&n)?;
            seen.push(n);
        }
        Ok(seen)
    }

    fn print(&self, n: &Notification) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(n)?);
        } else {
            let after = n.predecessor.as_deref().unwrap_or("-");
            println!("{:<8} {:<10} after {:<10} {}", n.kind, n.key(), after, n.value());
        }
        Ok(())
    }
}

pub fn print_metrics(metrics: &EngineMetrics, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(metrics)?);
    } else {
        println!();
        println!(
            "emitted {} (added {}, changed {}, removed {}, moved {}), deferred {}, tracked {}",
            metrics.emitted(),
            metrics.added,
            metrics.changed,
            metrics.removed,
            metrics.moved,
            metrics.deferred,
            metrics.tracked,
        );
    }
    Ok(())
}
