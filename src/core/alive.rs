//! # Execution tracker with sequence-based ordering.
//!
//! Knows which task paths currently hold a lease in this process. It is fed
//! from the runner's bus listener and only consulted for shutdown reporting
//! (which masters were still running when the grace period ran out).
//!
//! ## Rules
//! - `LeaseAcquired` marks a path alive; any execution-ending event marks it stopped
//! - Events with `seq <= last_seq` for the path are **rejected** (stale)
//! - Reads are eventually consistent

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::events::{Event, EventKind};

#[derive(Debug, Clone)]
struct TaskState {
    last_seq: u64,
    alive: bool,
}

/// Thread-safe tracker of executing task paths.
#[derive(Default)]
pub struct AliveTracker {
    state: RwLock<HashMap<String, TaskState>>,
}

impl AliveTracker {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `ev` if it is newer than the last event seen for its path.
    ///
    /// Returns true when the alive state changed.
    pub async fn update(&self, ev: &Event) -> bool {
        let Some(name) = ev.task.as_deref() else {
            return false;
        };
        let alive = match ev.kind {
            EventKind::LeaseAcquired => true,
            _ if ev.ends_execution() => false,
            _ => return false,
        };

        let mut state = self.state.write().await;
        let entry = state.entry(name.to_string()).or_insert(TaskState {
            last_seq: 0,
            alive: false,
        });
        if ev.seq <= entry.last_seq {
            return false;
        }
        entry.last_seq = ev.seq;
        let changed = entry.alive != alive;
        entry.alive = alive;
        changed
    }

    /// Sorted list of paths currently executing.
    pub async fn snapshot(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut alive: Vec<String> = state
            .iter()
            .filter(|(_, ts)| ts.alive)
            .map(|(name, _)| name.clone())
            .collect();
        alive.sort_unstable();
        alive
    }

    /// True if `name` currently holds a lease.
    pub async fn is_alive(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .get(name)
            .is_some_and(|ts| ts.alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_events_are_rejected() {
        let t = AliveTracker::new();
        let acquired = Event::new(EventKind::LeaseAcquired).with_task("a");
        let stopped = Event::new(EventKind::TaskStopped).with_task("a");

        assert!(!t.update(&stopped).await);
        assert!(!t.update(&acquired).await);
        assert!(!t.is_alive("a").await);

        let again = Event::new(EventKind::LeaseAcquired).with_task("a");
        assert!(t.update(&again).await);
        assert_eq!(t.snapshot().await, vec!["a".to_string()]);
    }
}
