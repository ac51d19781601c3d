//! Applies [`Collected`] steps to the job tree.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::collect::Collected;
use crate::error::TaskError;
use crate::store::{self, StoreRef, layout};
use crate::tasks::{TaskInstance, VarMap};

/// Writes the instances a collector asks for and prunes the rest.
///
/// `me` is the collector's own instance path; instances it creates name it as
/// their parent, so they go away once the collector's instance does.
pub struct Reconciler {
    store: StoreRef,
    me: String,
    def: String,
    /// Direct children of `me` produced since the collector started.
    known: BTreeSet<String>,
}

impl Reconciler {
    /// `def` is the collector's definition, used for nested `Scan` instances.
    pub fn new(store: StoreRef, me: impl Into<String>, def: impl Into<String>) -> Self {
        Self {
            store,
            me: layout::normalize(&me.into()),
            def: def.into(),
            known: BTreeSet::new(),
        }
    }

    pub async fn apply(&mut self, step: &Collected) -> Result<(), TaskError> {
        match step {
            Collected::Add {
                taskdef,
                path,
                data,
            } => self.put(path, taskdef, data).await,
            Collected::Scan { path, data } => {
                let def = self.def.clone();
                self.put(path, &def, data).await
            }
            Collected::Drop { path } => {
                let removed = self.store.delete_tree(&layout::task_dir(path)).await?;
                debug!(%path, removed, "dropped instance");
                if let Some(name) = self.child_name(path) {
                    self.known.remove(&name);
                }
                Ok(())
            }
            Collected::Watch => self.prune().await,
        }
    }

    /// Names of direct children produced so far.
    pub fn known(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }

    async fn put(&mut self, path: &str, taskdef: &str, data: &VarMap) -> Result<(), TaskError> {
        let key = layout::task_key(path);
        let current: Option<TaskInstance> = store::load(self.store.as_ref(), &key).await?;
        let mut wanted = TaskInstance::new(taskdef)
            .with_parent(self.me.as_str())
            .with_data(data.clone());
        if let Some(cur) = &current {
            wanted.name = cur.name.clone();
            wanted.descr = cur.descr.clone();
        }
        if current.as_ref() != Some(&wanted) {
            store::save(self.store.as_ref(), &key, &wanted).await?;
            debug!(%path, %taskdef, "instance written");
        }
        if let Some(name) = self.child_name(path) {
            self.known.insert(name);
        }
        Ok(())
    }

    /// Deletes untagged children of `me` that no step produced.
    async fn prune(&self) -> Result<(), TaskError> {
        let dir = layout::task_dir(&self.me);
        for child in self.store.children(&dir).await? {
            if layout::is_tag(&child) || self.known.contains(&child) {
                continue;
            }
            info!(path = %layout::join(&self.me, &child), "deleting stale instance");
            self.store.delete_tree(&layout::join(&dir, &child)).await?;
        }
        Ok(())
    }

    fn child_name(&self, path: &str) -> Option<String> {
        let path = layout::normalize(path);
        let (parent, name) = layout::split_last(&path);
        (parent == self.me).then(|| name.to_string())
    }
}
