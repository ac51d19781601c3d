//! Enumeration sources feeding a [`Collector`](super::Collector).

use async_trait::async_trait;
use futures::future;
use serde_json::Value;

use crate::error::TaskError;
use crate::store::{StoreRef, Watch, layout};
use crate::tasks::VarMap;

/// One thing a source wants to exist in the job tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    /// A task instance of `taskdef` at `path`.
    Task {
        taskdef: String,
        path: String,
        data: VarMap,
    },
    /// A nested collector at `path`, using the collector's own definition.
    Scan { path: String, data: VarMap },
}

impl Entry {
    /// Instance path of the entry.
    pub fn path(&self) -> &str {
        match self {
            Entry::Task { path, .. } | Entry::Scan { path, .. } => path,
        }
    }
}

/// Something that can list entries and tell when the list may have changed.
#[async_trait]
pub trait Source: Send + 'static {
    /// Lists the current entries.
    async fn enumerate(&mut self) -> Result<Vec<Entry>, TaskError>;

    /// Waits until the entries may differ from the last enumeration.
    async fn changed(&mut self) -> Result<(), TaskError>;
}

/// A static list. Never changes.
#[derive(Clone, Debug, Default)]
pub struct FixedSource {
    entries: Vec<Entry>,
}

impl FixedSource {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl Source for FixedSource {
    async fn enumerate(&mut self) -> Result<Vec<Entry>, TaskError> {
        Ok(self.entries.clone())
    }

    async fn changed(&mut self) -> Result<(), TaskError> {
        future::pending().await
    }
}

/// Every child of a store directory becomes a task instance.
///
/// Child `dir/<name>` maps to instance `<target>/<name>` of `taskdef`; a JSON
/// object stored at `dir/<name>` becomes the instance's data.
pub struct SubtreeSource {
    store: StoreRef,
    dir: String,
    target: String,
    taskdef: String,
    watch: Option<Watch>,
}

impl SubtreeSource {
    pub fn new(
        store: StoreRef,
        dir: impl Into<String>,
        target: impl Into<String>,
        taskdef: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dir: layout::normalize(&dir.into()),
            target: layout::normalize(&target.into()),
            taskdef: taskdef.into(),
            watch: None,
        }
    }
}

#[async_trait]
impl Source for SubtreeSource {
    async fn enumerate(&mut self) -> Result<Vec<Entry>, TaskError> {
        if self.watch.is_none() {
            self.watch = Some(self.store.watch(&self.dir));
        }
        let mut entries = Vec::new();
        for child in self.store.children(&self.dir).await? {
            if layout::is_tag(&child) {
                continue;
            }
            let data = match self.store.get(&layout::join(&self.dir, &child)).await? {
                Some(node) => match node.value {
                    Value::Object(map) => map,
                    _ => VarMap::new(),
                },
                None => VarMap::new(),
            };
            entries.push(Entry::Task {
                taskdef: self.taskdef.clone(),
                path: layout::join(&self.target, &child),
                data,
            });
        }
        Ok(entries)
    }

    async fn changed(&mut self) -> Result<(), TaskError> {
        let Some(watch) = self.watch.as_mut() else {
            return Ok(());
        };
        match watch.changed().await {
            Some(_) => Ok(()),
            None => future::pending().await,
        }
    }
}
