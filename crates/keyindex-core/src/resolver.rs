//! Order dependency resolver — sequences `added` notifications in index order.
//!
//! Before a key can be announced, the key in front of it must have been
//! announced. The resolver answers "is the predecessor done?" against the
//! current trackers and, when it is not, schedules a continuation that fires
//! once it might be.
//!
//! A predecessor that is not tracked (never indexed, not yet arrived, or
//! dropped while others wait on it) counts as satisfied.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, WaitStrategy};
use crate::tracker::ChildTracker;

/// Result of checking a predecessor.
#[derive(Debug)]
pub enum Dependency {
    /// No predecessor, predecessor untracked, or predecessor already loaded.
    Ready,
    /// Predecessor is tracked but not loaded yet.
    Blocked(watch::Receiver<bool>),
}

/// Resolves ordering dependencies between trackers.
#[derive(Debug, Clone)]
pub struct OrderDependencyResolver {
    strategy: WaitStrategy,
    poll_interval: Duration,
}

impl OrderDependencyResolver {
    pub fn new(strategy: WaitStrategy, poll_interval: Duration) -> Self {
        Self {
            strategy,
            poll_interval,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.wait_strategy, Duration::from_millis(config.poll_interval_ms))
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Check whether `predecessor` is out of the way.
    pub fn check(&self, trackers: &HashMap<String, ChildTracker>, predecessor: Option<&str>) -> Dependency {
        let Some(tracker) = predecessor.and_then(|p| trackers.get(p)) else {
            return Dependency::Ready;
        };
        if tracker.is_loaded() {
            Dependency::Ready
        } else {
            Dependency::Blocked(tracker.completion())
        }
    }

    /// Run `resume` once the blocking predecessor may have cleared.
    ///
    /// With [`WaitStrategy::Signal`] this waits for the completion signal,
    /// which also resolves when the predecessor is disposed. With
    /// [`WaitStrategy::Poll`] it sleeps one interval; the caller re-checks and
    /// defers again if still blocked.
    pub fn defer<F>(&self, mut blocked_on: watch::Receiver<bool>, resume: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.strategy {
            WaitStrategy::Signal => tokio::spawn(async move {
                // Err means the predecessor's tracker is gone.
                let _ = blocked_on.wait_for(|loaded| *loaded).await;
                resume();
            }),
            WaitStrategy::Poll => {
                let interval = self.poll_interval;
                tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    resume();
                })
            }
        }
    }
}
