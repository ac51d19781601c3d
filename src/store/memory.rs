//! # In-process coordination store.
//!
//! [`MemoryStore`] implements the [`Store`] contract over a `BTreeMap`. It is
//! linearizable (one lock), honours TTLs against the tokio clock (so paused-time
//! tests see leases expire deterministically) and can be made unreachable to
//! exercise fail-safe paths: while unreachable, every operation waits.
//!
//! Expired keys are purged lazily, on the next operation touching the store;
//! their deletion is published as [`Change::Delete`] with `expired = true`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;

use super::{Change, Node, Store, StoreError, Version, Watch};

/// Default capacity of the change channel.
const CHANGE_CAPACITY: usize = 1024;

struct Entry {
    value: Value,
    version: Version,
    expires: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    version: Version,
}

impl Inner {
    fn next_version(&mut self) -> Version {
        self.version += 1;
        self.version
    }

    /// Removes expired entries, returning their deletions.
    fn purge(&mut self, now: Instant) -> Vec<Change> {
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();
        dead.into_iter()
            .map(|key| {
                self.entries.remove(&key);
                Change::Delete { key, expired: true }
            })
            .collect()
    }

    fn check_prev(&self, key: &str, prev: Option<Version>) -> Result<(), StoreError> {
        let Some(expected) = prev else { return Ok(()) };
        match self.entries.get(key) {
            None => Err(StoreError::NotFound { key: key.to_string() }),
            Some(e) if e.version != expected => Err(StoreError::CompareFailed {
                key: key.to_string(),
                expected,
                actual: e.version,
            }),
            Some(_) => Ok(()),
        }
    }
}

/// In-memory [`Store`] with TTL leases, compare-and-swap and watches.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<Change>,
    reachable: watch::Sender<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty, reachable store.
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(CHANGE_CAPACITY);
        let (reachable, _rx) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner::default()),
            changes,
            reachable,
        }
    }

    /// Creates an empty store behind an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes the store (un)reachable. Operations issued while unreachable wait.
    pub fn set_reachable(&self, up: bool) {
        self.reachable.send_replace(up);
    }

    /// Makes the store unreachable for `dur`, then reachable again.
    pub fn block_for(self: &Arc<Self>, dur: Duration) {
        self.set_reachable(false);
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            me.set_reachable(true);
        });
    }

    /// Number of live (unexpired) keys; test helper.
    pub async fn len(&self) -> usize {
        self.with_inner(|inner, _| (Ok(inner.entries.len()), Vec::new()))
            .await
            .unwrap_or(0)
    }

    /// True if no live key exists.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn ready(&self) {
        let mut rx = self.reachable.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn publish(&self, changes: Vec<Change>) {
        for c in changes {
            let _ = self.changes.send(c);
        }
    }

    /// Runs `op` under the lock after purging expired keys, then publishes
    /// the purge and whatever `op` reports.
    async fn with_inner<T>(
        &self,
        op: impl FnOnce(&mut Inner, Instant) -> (Result<T, StoreError>, Vec<Change>),
    ) -> Result<T, StoreError> {
        self.ready().await;
        let now = Instant::now();
        let (res, changes) = {
            let mut inner = self.inner.lock().await;
            let mut purged = inner.purge(now);
            let (res, changes) = op(&mut inner, now);
            purged.extend(changes);
            (res, purged)
        };
        self.publish(changes);
        res
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Node>, StoreError> {
        self.with_inner(|inner, _| {
            let node = inner.entries.get(key).map(|e| Node {
                key: key.to_string(),
                value: e.value.clone(),
                version: e.version,
            });
            (Ok(node), Vec::new())
        })
        .await
    }

    async fn children(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        self.with_inner(|inner, _| {
            let prefix = if dir.is_empty() {
                String::new()
            } else {
                format!("{dir}/")
            };
            let names: BTreeSet<String> = inner
                .entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            (Ok(names.into_iter().collect()), Vec::new())
        })
        .await
    }

    async fn create(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<Version, StoreError> {
        self.with_inner(|inner, now| {
            if inner.entries.contains_key(key) {
                return (
                    Err(StoreError::AlreadyExists { key: key.to_string() }),
                    Vec::new(),
                );
            }
            let version = inner.next_version();
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value,
                    version,
                    expires: ttl.map(|d| now + d),
                },
            );
            (
                Ok(version),
                vec![Change::Put { key: key.to_string(), version }],
            )
        })
        .await
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        prev: Option<Version>,
    ) -> Result<Version, StoreError> {
        self.with_inner(|inner, now| {
            if let Err(e) = inner.check_prev(key, prev) {
                return (Err(e), Vec::new());
            }
            let version = inner.next_version();
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value,
                    version,
                    expires: ttl.map(|d| now + d),
                },
            );
            (
                Ok(version),
                vec![Change::Put { key: key.to_string(), version }],
            )
        })
        .await
    }

    async fn delete(&self, key: &str, prev: Option<Version>) -> Result<(), StoreError> {
        self.with_inner(|inner, _| {
            if let Err(e) = inner.check_prev(key, prev) {
                return (Err(e), Vec::new());
            }
            match inner.entries.remove(key) {
                Some(_) => (
                    Ok(()),
                    vec![Change::Delete { key: key.to_string(), expired: false }],
                ),
                None => (Err(StoreError::NotFound { key: key.to_string() }), Vec::new()),
            }
        })
        .await
    }

    async fn delete_tree(&self, dir: &str) -> Result<usize, StoreError> {
        self.with_inner(|inner, _| {
            let prefix = format!("{dir}/");
            let doomed: Vec<String> = inner
                .entries
                .keys()
                .filter(|k| k.as_str() == dir || k.starts_with(&prefix))
                .cloned()
                .collect();
            let changes: Vec<Change> = doomed
                .into_iter()
                .map(|key| {
                    inner.entries.remove(&key);
                    Change::Delete { key, expired: false }
                })
                .collect();
            (Ok(changes.len()), changes)
        })
        .await
    }

    fn watch(&self, prefix: &str) -> Watch {
        Watch::new(prefix, self.changes.subscribe())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        self.ready().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn create_is_exclusive() {
        let s = MemoryStore::new();
        s.create("a", json!(1), None).await.unwrap();
        let err = s.create("a", json!(2), None).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists { key: "a".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_and_notifies() {
        let s = MemoryStore::new();
        let mut w = s.watch("lease");
        s.create("lease", json!(1), Some(Duration::from_secs(2))).await.unwrap();
        assert!(matches!(w.changed().await, Some(Change::Put { .. })));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(s.get("lease").await.unwrap().is_none());
        assert_eq!(
            w.changed().await,
            Some(Change::Delete { key: "lease".into(), expired: true })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn compare_and_swap_rejects_stale_version() {
        let s = MemoryStore::new();
        let v1 = s.create("k", json!("a"), None).await.unwrap();
        let v2 = s.set("k", json!("b"), None, Some(v1)).await.unwrap();
        let err = s.set("k", json!("c"), None, Some(v1)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::CompareFailed { key: "k".into(), expected: v1, actual: v2 }
        );
        assert!(s.delete("k", Some(v1)).await.is_err());
        s.delete("k", Some(v2)).await.unwrap();
        assert!(s.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn children_lists_direct_segments() {
        let s = MemoryStore::new();
        for k in ["task/a/:task", "task/a/b/:task", "task/c/:task", "taskx/d"] {
            s.set(k, json!({}), None, None).await.unwrap();
        }
        assert_eq!(s.children("task").await.unwrap(), vec!["a", "c"]);
        assert_eq!(s.children("task/a").await.unwrap(), vec![":task", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_tree_removes_subtree_only() {
        let s = MemoryStore::new();
        for k in ["task/a/:task", "task/a/b/:task", "task/ab/:task"] {
            s.set(k, json!({}), None, None).await.unwrap();
        }
        assert_eq!(s.delete_tree("task/a").await.unwrap(), 2);
        assert_eq!(s.children("task").await.unwrap(), vec!["ab"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_delays_operations() {
        let s = MemoryStore::shared();
        s.block_for(Duration::from_secs(4));
        let start = Instant::now();
        s.set("k", json!(1), None, None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
