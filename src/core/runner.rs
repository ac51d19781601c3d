//! # Runner: one task master per instance in the job tree.
//!
//! The [`Runner`] owns the event bus, the subscriber fan-out and the set of
//! live [`TaskMaster`]s. It follows the job tree below its prefix and keeps
//! exactly one master per instance path.
//!
//! ## High-level architecture
//! ```text
//! run_until(stop):
//!   listener: Bus.subscribe() ─► AliveTracker::update ─► SubscriberSet::emit
//!   watch task/<prefix>        (before the first scan)
//!   scan ─► Registry.add(TaskMaster) per instance path
//!
//!   loop select! {
//!     stop                 ─► ShutdownRequested, cancel all, wait `grace`
//!     Registry.join_next() ─► account result (exit code), TaskRemoved
//!                             kill_fail + error ─► cancel all, wait `grace`
//!     tree change          ─► rescan: add new paths, remove vanished ones
//!   }                         (standalone: no rescans, exit once empty)
//!
//! wait `grace`:
//!   ├─ all joined  → AllStoppedWithin
//!   └─ timeout     → GraceExceeded, abort, RuntimeError::GraceExceeded
//!                    (AliveTracker.snapshot() for the stuck paths)
//! ```
//!
//! ## Exit code
//! The number of masters that ended with an error. Cancellation, masters
//! removed by a tree change and masters whose instance vanished do not count.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use leasevisor::{Catalog, Config, LogWriter, Runner, Subscribe};
//! use leasevisor::store::MemoryStore;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config {
//!         standalone: true,
//!         ..Config::default()
//!     };
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter)];
//!     let runner = Runner::new(cfg, MemoryStore::shared(), Catalog::with_builtin(), subs);
//!     runner.publish_definitions().await?;
//!
//!     // Nothing to run: a standalone runner exits at once.
//!     let failed = runner.run().await?;
//!     assert_eq!(failed, 0);
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::alive::AliveTracker;
use crate::core::config::Config;
use crate::core::master::{StatusFn, TaskMaster};
use crate::core::registry::{Joined, Registry};
use crate::core::shutdown;
use crate::error::{RuntimeError, TaskError};
use crate::events::{Bus, Event, EventKind};
use crate::store::{self, Change, StoreError, StoreRef, layout};
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::tasks::{Catalog, TaskInstance};

/// Runs and follows every task instance below a prefix of the job tree.
pub struct Runner {
    cfg: Config,
    store: StoreRef,
    catalog: Arc<Catalog>,
    bus: Bus,
    subscribers: Vec<Arc<dyn Subscribe>>,
    alive: Arc<AliveTracker>,
    prefix: String,
    callback: Option<StatusFn>,
}

/// Loop state of one `run_until` call.
#[derive(Default)]
struct Books {
    /// Paths whose master ended; not restarted until their instance is written again.
    finished: HashSet<String>,
    errors: usize,
    following: bool,
}

impl Runner {
    /// Creates a runner for the whole job tree.
    pub fn new(
        cfg: Config,
        store: StoreRef,
        catalog: Catalog,
        subscribers: Vec<Arc<dyn Subscribe>>,
    ) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        Self {
            cfg,
            store,
            catalog: Arc::new(catalog),
            bus,
            subscribers,
            alive: Arc::new(AliveTracker::new()),
            prefix: String::new(),
            callback: None,
        }
    }

    /// Only runs instances at or below `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = layout::normalize(&prefix.into());
        self
    }

    /// Status callback installed on every master.
    pub fn with_callback(mut self, f: StatusFn) -> Self {
        self.callback = Some(f);
        self
    }

    /// The event bus shared with every master.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Tracker of executing paths.
    pub fn alive(&self) -> Arc<AliveTracker> {
        Arc::clone(&self.alive)
    }

    /// Writes the catalog's definitions into the store.
    pub async fn publish_definitions(&self) -> Result<usize, StoreError> {
        self.catalog.publish(self.store.as_ref()).await
    }

    /// Every instance below the prefix, sorted by path.
    pub async fn list(&self) -> Result<Vec<(String, TaskInstance)>, StoreError> {
        let mut out = Vec::new();
        for path in self.scan().await? {
            if let Some(inst) = store::load(self.store.as_ref(), &layout::task_key(&path)).await? {
                out.push((path, inst));
            }
        }
        Ok(out)
    }

    /// Runs until every master ended (standalone) or an OS termination signal.
    pub async fn run(&self) -> Result<usize, RuntimeError> {
        self.run_until(async {
            match shutdown::terminated().await {
                Ok(signal) => info!(signal, "termination requested"),
                Err(e) => {
                    warn!(error = %e, "signal handlers unavailable");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Runs until `stop` completes, then shuts down within `grace`.
    ///
    /// Returns the number of masters that ended with an error.
    pub async fn run_until<F>(&self, stop: F) -> Result<usize, RuntimeError>
    where
        F: Future<Output = ()>,
    {
        let listening = CancellationToken::new();
        let listener = self.subscriber_listener(listening.clone());

        let res = self.drive(stop).await;

        listening.cancel();
        let _ = listener.await;
        res
    }

    async fn drive<F>(&self, stop: F) -> Result<usize, RuntimeError>
    where
        F: Future<Output = ()>,
    {
        let token = CancellationToken::new();
        let mut tree = self.store.watch(&layout::task_dir(&self.prefix));
        let mut reg = Registry::new();
        let mut books = Books {
            following: !self.cfg.standalone,
            ..Books::default()
        };
        self.rescan(&mut reg, &books, &token).await?;

        tokio::pin!(stop);
        loop {
            if reg.is_empty() && !books.following {
                info!(failed = books.errors, "all masters ended");
                return Ok(books.errors);
            }
            tokio::select! {
                _ = &mut stop => {
                    self.bus.publish(Event::new(EventKind::ShutdownRequested));
                    return self.shut_down(&mut reg, &mut books, &token).await;
                }
                Some(joined) = reg.join_next(), if !reg.is_empty() => {
                    if self.account(joined, &mut books).await && self.cfg.kill_fail {
                        warn!("a master failed, stopping");
                        return self.shut_down(&mut reg, &mut books, &token).await;
                    }
                }
                change = tree.changed(), if books.following => match change {
                    Some(change) => {
                        if let Change::Put { key, .. } = &change {
                            if let Some(path) = layout::instance_path(key) {
                                books.finished.remove(path);
                            }
                        }
                        if let Err(e) = self.rescan(&mut reg, &books, &token).await {
                            warn!(error = %e, "rescan failed");
                        }
                    }
                    None => books.following = false,
                },
            }
        }
    }

    /// Cancels every master and waits for them within `grace`.
    async fn shut_down(
        &self,
        reg: &mut Registry,
        books: &mut Books,
        token: &CancellationToken,
    ) -> Result<usize, RuntimeError> {
        token.cancel();
        reg.cancel_all();
        let grace = self.cfg.grace;
        let done = async {
            while let Some(joined) = reg.join_next().await {
                self.account(joined, books).await;
            }
        };
        match tokio::time::timeout(grace, done).await {
            Ok(()) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(books.errors)
            }
            Err(_) => {
                self.bus.publish(Event::new(EventKind::GraceExceeded));
                reg.abort_all();
                let stuck = self.alive.snapshot().await;
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }

    /// Books a finished master; true if it counts as an error.
    async fn account(&self, joined: Joined, books: &mut Books) -> bool {
        let Joined {
            path,
            result,
            removed,
        } = joined;
        self.bus
            .publish(Event::new(EventKind::TaskRemoved).with_task(path.as_str()));
        if !removed {
            books.finished.insert(path.clone());
        }
        let err = match result {
            Ok(_) | Err(TaskError::Canceled) => return false,
            Err(_) if removed => return false,
            Err(e) => e,
        };
        // an instance deleted under a running master is a removal too
        if matches!(
            self.store.get(&layout::task_key(&path)).await,
            Ok(None)
        ) {
            return false;
        }
        warn!(%path, error = %err, "master ended with an error");
        books.errors += 1;
        true
    }

    /// Brings the registry in line with the tree.
    async fn rescan(
        &self,
        reg: &mut Registry,
        books: &Books,
        token: &CancellationToken,
    ) -> Result<(), StoreError> {
        let wanted = self.scan().await?;
        for path in reg.paths() {
            if !wanted.contains(&path) {
                info!(%path, "instance gone, stopping master");
                reg.remove(&path);
            }
        }
        for path in wanted {
            if reg.contains(&path) || books.finished.contains(&path) {
                continue;
            }
            if reg.add(self.master(&path), token) {
                self.bus
                    .publish(Event::new(EventKind::TaskAdded).with_task(path.as_str()));
            }
        }
        Ok(())
    }

    fn master(&self, path: &str) -> TaskMaster {
        let master = TaskMaster::new(
            path,
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            self.bus.clone(),
        )
        .with_config(&self.cfg);
        match &self.callback {
            Some(cb) => master.with_callback(Arc::clone(cb)),
            None => master,
        }
    }

    /// Instance paths at or below the prefix.
    async fn scan(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut found = BTreeSet::new();
        let mut pending = vec![self.prefix.clone()];
        while let Some(path) = pending.pop() {
            for child in self.store.children(&layout::task_dir(&path)).await? {
                if child == layout::TASK {
                    if !path.is_empty() {
                        found.insert(path.clone());
                    }
                } else if !layout::is_tag(&child) {
                    pending.push(layout::join(&path, &child));
                }
            }
        }
        Ok(found)
    }

    /// Feeds bus events to the alive tracker and the subscribers until `stop`,
    /// then drains what is left and shuts the subscribers down.
    fn subscriber_listener(&self, stop: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        let set = SubscriberSet::new(self.subscribers.clone(), self.bus.clone());
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            alive.update(&ev).await;
                            set.emit(&ev);
                        }
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "event listener lagged"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = stop.cancelled() => {
                        while let Ok(ev) = rx.try_recv() {
                            alive.update(&ev).await;
                            set.emit(&ev);
                        }
                        break;
                    }
                }
            }
            set.shutdown().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use crate::tasks::TaskDef;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    async fn instance(store: &MemoryStore, path: &str, def: &str, data: serde_json::Value) {
        let inst = TaskInstance::new(def).with_data(data.as_object().cloned().unwrap_or_default());
        store::save(store, &layout::task_key(path), &inst).await.unwrap();
    }

    fn runner(store: Arc<MemoryStore>, cfg: Config) -> Runner {
        Runner::new(cfg, store, Catalog::with_builtin(), Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn list_walks_the_prefix() {
        let store = MemoryStore::shared();
        instance(&store, "home/heat", "test/sleep", json!({})).await;
        instance(&store, "home/heat/pump", "test/sleep", json!({})).await;
        instance(&store, "garden", "test/sleep", json!({})).await;

        let r = runner(store, Config::default()).with_prefix("home");
        let paths: Vec<String> = r.list().await.unwrap().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["home/heat", "home/heat/pump"]);
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_counts_failed_masters() {
        let store = MemoryStore::shared();
        let r = runner(store.clone(), Config { standalone: true, ..Config::default() });
        r.publish_definitions().await.unwrap();
        instance(&store, "ok", "test/sleep", json!({"delay": 1})).await;
        instance(&store, "bad", "test/error", json!({"retry": 0})).await;
        instance(&store, "worse", "test/error", json!({"retry": 0})).await;

        let failed = r.run_until(std::future::pending()).await.unwrap();
        assert_eq!(failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_new_and_removed_instances() {
        let store = MemoryStore::shared();
        let def = TaskDef { code: "test/sleep".into(), ..TaskDef::default() };
        store::save(store.as_ref(), &layout::taskdef_key("test/sleep"), &def).await.unwrap();
        let r = runner(store.clone(), Config::default());
        let alive = r.alive();

        let stop = CancellationToken::new();
        let s = stop.clone();
        let st = store.clone();
        let script = async move {
            instance(&st, "late", "test/sleep", json!({"delay": 100})).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(alive.is_alive("late").await);
            st.delete_tree(&layout::task_dir("late")).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(!alive.is_alive("late").await);
            s.cancel();
        };
        let (res, ()) = tokio::join!(r.run_until(async move { stop.cancelled().await }), script);
        assert_eq!(res.unwrap(), 0);
    }
}
