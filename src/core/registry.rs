//! # Master registry: the runner's set of live task masters.
//!
//! ```text
//! add(master)  ──► JoinSet.spawn(catch_unwind(master.run(child_token)))
//! remove(path) ──► cancel child token, mark removed
//! join_next()  ──► Joined { path, result, removed }
//! ```
//!
//! ## Rules
//! - At most one master per instance path.
//! - A panicking master surfaces as [`TaskError::Panicked`], never as a lost path.
//! - `removed` tells the runner the master ended because the tree no longer wants it.

use std::collections::HashMap;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::master::TaskMaster;
use crate::error::TaskError;

struct Handle {
    cancel: CancellationToken,
    removed: bool,
}

/// A master that ended.
#[derive(Debug)]
pub struct Joined {
    /// Instance path.
    pub path: String,
    /// Final result of the master.
    pub result: Result<String, TaskError>,
    /// True if it was removed through [`Registry::remove`].
    pub removed: bool,
}

/// Live masters keyed by instance path.
#[derive(Default)]
pub struct Registry {
    masters: JoinSet<(String, Result<String, TaskError>)>,
    handles: HashMap<String, Handle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `master` under a child of `token`; false if its path is taken.
    pub fn add(&mut self, master: TaskMaster, token: &CancellationToken) -> bool {
        let path = master.path().to_string();
        if self.handles.contains_key(&path) {
            return false;
        }
        let cancel = token.child_token();
        let handle = Handle {
            cancel: cancel.clone(),
            removed: false,
        };
        let key = path.clone();
        self.masters.spawn(async move {
            let res = std::panic::AssertUnwindSafe(master.run(cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(TaskError::Panicked {
                        info: panic_info(panic.as_ref()),
                    })
                });
            (key, res)
        });
        debug!(%path, "master added");
        self.handles.insert(path, handle);
        true
    }

    /// Cancels the master of `path`; false if there is none.
    pub fn remove(&mut self, path: &str) -> bool {
        match self.handles.get_mut(path) {
            Some(h) => {
                h.removed = true;
                h.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Waits for the next master to end; `None` when none is left.
    pub async fn join_next(&mut self) -> Option<Joined> {
        loop {
            match self.masters.join_next().await? {
                Ok((path, result)) => {
                    let removed = self.handles.remove(&path).is_some_and(|h| h.removed);
                    return Some(Joined {
                        path,
                        result,
                        removed,
                    });
                }
                // aborted by abort_all; its handle is already gone
                Err(_) => continue,
            }
        }
    }

    /// Cancels every master.
    pub fn cancel_all(&self) {
        for h in self.handles.values() {
            h.cancel.cancel();
        }
    }

    /// Aborts every master without waiting.
    pub fn abort_all(&mut self) {
        self.handles.clear();
        self.masters.abort_all();
    }

    /// Sorted instance paths with a live master.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.handles.keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    pub fn contains(&self, path: &str) -> bool {
        self.handles.contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

fn panic_info(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Bus;
    use crate::store::{self, MemoryStore, layout};
    use crate::tasks::{Catalog, TaskDef, TaskInstance};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn paths_are_unique_and_removal_is_flagged() {
        let store = MemoryStore::shared();
        let def = TaskDef {
            code: "test/sleep".into(),
            ..TaskDef::default()
        };
        store::save(store.as_ref(), &layout::taskdef_key("test/sleep"), &def)
            .await
            .unwrap();
        let mut data = crate::tasks::VarMap::new();
        data.insert("delay".into(), 100.into());
        store::save(
            store.as_ref(),
            &layout::task_key("a"),
            &TaskInstance::new("test/sleep").with_data(data),
        )
        .await
        .unwrap();

        let catalog = Arc::new(Catalog::with_builtin());
        let bus = Bus::new(64);
        let token = CancellationToken::new();
        let mut reg = Registry::new();
        let master = || TaskMaster::new("a", store.clone(), Arc::clone(&catalog), bus.clone());

        assert!(reg.add(master(), &token));
        assert!(!reg.add(master(), &token));
        assert_eq!(reg.paths(), vec!["a".to_string()]);

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(reg.remove("a"));
        let joined = reg.join_next().await.unwrap();
        assert_eq!(joined.path, "a");
        assert!(joined.removed);
        assert_eq!(joined.result, Err(TaskError::Canceled));
        assert!(reg.is_empty());
        assert!(reg.join_next().await.is_none());
    }
}
