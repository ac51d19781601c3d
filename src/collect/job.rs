//! The collector as an ordinary supervised job.
//!
//! Job data picks the source:
//!
//! ```text
//! {"items": [{"path": "a", "taskdef": "test/sleep", "data": {...}},
//!            {"path": "sub"}]}                     → FixedSource (no taskdef = Scan)
//! {"subtree": "devices/fs20", "taskdef": "fs20/switch", "target": "fs20"}
//!                                                   → SubtreeSource
//! ```
//!
//! Relative paths are resolved below the collector's own instance path.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::collect::{Collected, Collector, Entry, FixedSource, Reconciler, SubtreeSource};
use crate::error::{ConfigError, TaskError};
use crate::store::layout;
use crate::tasks::{Job, JobContext, VarMap};

/// Runs a [`Collector`] and applies its steps with a [`Reconciler`].
#[derive(Debug, Default, Clone)]
pub struct CollectorJob;

impl CollectorJob {
    /// Catalog code of the collector.
    pub const CODE: &'static str = "task/collect";
}

#[derive(Deserialize)]
struct Item {
    path: String,
    #[serde(default)]
    taskdef: Option<String>,
    #[serde(default)]
    data: VarMap,
}

fn text(ctx: &JobContext, key: &'static str) -> Result<Option<String>, ConfigError> {
    match ctx.value(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
        }),
    }
}

fn collector(ctx: &JobContext) -> Result<Collector, ConfigError> {
    if let Some(items) = ctx.value("items") {
        let items: Vec<Item> =
            serde_json::from_value(items.clone()).map_err(|e| ConfigError::Invalid {
                key: "items",
                value: e.to_string(),
            })?;
        let entries = items
            .into_iter()
            .map(|it| {
                let path = layout::join(&ctx.path, &it.path);
                match it.taskdef {
                    Some(taskdef) => Entry::Task {
                        taskdef,
                        path,
                        data: it.data,
                    },
                    None => Entry::Scan { path, data: it.data },
                }
            })
            .collect();
        return Ok(Collector::new(FixedSource::new(entries)));
    }
    if let Some(dir) = text(ctx, "subtree")? {
        let taskdef = text(ctx, "taskdef")?.ok_or_else(|| ConfigError::Missing {
            key: "taskdef".into(),
        })?;
        let target = match text(ctx, "target")? {
            Some(t) => layout::join(&ctx.path, &t),
            None => ctx.path.clone(),
        };
        return Ok(Collector::new(SubtreeSource::new(
            ctx.store.clone(),
            dir,
            target,
            taskdef,
        )));
    }
    Err(ConfigError::Missing {
        key: "items".into(),
    })
}

#[async_trait]
impl Job for CollectorJob {
    async fn run(&self, ctx: JobContext) -> Result<String, TaskError> {
        let mut collector = collector(&ctx)?.one_shot(ctx.vars.one_shot);
        let mut rec = Reconciler::new(ctx.store.clone(), ctx.path.as_str(), ctx.taskdef.as_str());
        debug!(path = %ctx.path, "start collecting");

        let mut changes = 0usize;
        loop {
            let step = tokio::select! {
                step = collector.next() => step?,
                _ = ctx.token.cancelled() => return Err(TaskError::Canceled),
            };
            let Some(step) = step else { break };
            debug!(path = %ctx.path, ?step, "collected");
            rec.apply(&step).await?;
            if step != Collected::Watch {
                changes += 1;
            }
        }
        Ok(format!("{changes} changes applied"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::Reg;
    use crate::store::{self, MemoryStore, Store};
    use crate::tasks::{TaskInstance, TaskVars};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx(store: std::sync::Arc<MemoryStore>, data: Value) -> JobContext {
        JobContext {
            path: "coll".into(),
            taskdef: CollectorJob::CODE.into(),
            data: data.as_object().cloned().unwrap_or_default(),
            vars: TaskVars {
                one_shot: true,
                ..TaskVars::default()
            },
            token: CancellationToken::new(),
            reg: Reg::new(),
            store,
        }
    }

    #[tokio::test]
    async fn items_become_children_of_the_collector() {
        let store = MemoryStore::shared();
        let data = json!({"items": [
            {"path": "a", "taskdef": "test/sleep", "data": {"delay": 1}},
            {"path": "b", "taskdef": "test/sleep"},
            {"path": "nested"},
        ]});
        let msg = CollectorJob.run(ctx(store.clone(), data)).await.unwrap();
        assert_eq!(msg, "3 changes applied");

        assert_eq!(store.children("task/coll").await.unwrap(), vec!["a", "b", "nested"]);
        let nested: TaskInstance = store::load(store.as_ref(), &layout::task_key("coll/nested"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nested.taskdef, CollectorJob::CODE);
        assert_eq!(nested.parent.as_deref(), Some("coll"));
    }

    #[tokio::test]
    async fn subtree_without_taskdef_is_a_config_error() {
        let store = MemoryStore::shared();
        let err = CollectorJob
            .run(ctx(store, json!({"subtree": "devices"})))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn subtree_entries_follow_store_children() {
        let store = MemoryStore::shared();
        store.set("devices/lamp", json!({"addr": 7}), None, None).await.unwrap();
        store.set("devices/fan", json!(null), None, None).await.unwrap();
        let data = json!({"subtree": "devices", "taskdef": "test/sleep"});
        CollectorJob.run(ctx(store.clone(), data)).await.unwrap();

        let lamp: TaskInstance = store::load(store.as_ref(), &layout::task_key("coll/lamp"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lamp.data.get("addr"), Some(&json!(7)));
        assert!(store.get(&layout::task_key("coll/fan")).await.unwrap().is_some());
    }
}
