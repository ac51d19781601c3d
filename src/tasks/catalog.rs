//! # Job catalog.
//!
//! Maps a definition's `code` to a factory producing its [`Job`]. Each
//! [`TaskMaster`](crate::TaskMaster) resolves its job once, at init; an
//! unknown code is a fatal [`TaskError::UnknownJob`].
//!
//! [`Catalog::publish`] writes a definition for every registered code into
//! the store (`meta/task/<code>/:taskdef`), so instances can refer to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::collect::CollectorJob;
use crate::error::TaskError;
use crate::store::{self, Store, StoreError, layout};
use crate::tasks::builtin::{Failer, SleepFailer, Sleeper};
use crate::tasks::job::JobRef;
use crate::tasks::record::TaskDef;

/// Language tag of definitions published from this catalog.
pub const LANGUAGE: &str = "rust";

/// Produces a job instance.
pub type JobFactory = Arc<dyn Fn() -> JobRef + Send + Sync>;

#[derive(Clone)]
struct Entry {
    summary: String,
    factory: JobFactory,
}

/// Registry of job kinds, keyed by `code`.
#[derive(Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, Entry>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in jobs: `test/sleep`, `test/error`,
    /// `test/sleep/error` and the collector `task/collect`.
    pub fn with_builtin() -> Self {
        let mut c = Self::new();
        c.register("test/sleep", "A simple delay", || Arc::new(Sleeper));
        c.register("test/error", "A job that always fails", || Arc::new(Failer));
        c.register("test/sleep/error", "A delay, terminated by an error", || {
            Arc::new(SleepFailer)
        });
        c.register(CollectorJob::CODE, "Runs a task collector", || {
            Arc::new(CollectorJob::default())
        });
        c
    }

    /// Registers (or replaces) a job kind.
    pub fn register<F>(&mut self, code: &str, summary: &str, factory: F) -> &mut Self
    where
        F: Fn() -> JobRef + Send + Sync + 'static,
    {
        self.entries.insert(
            code.to_string(),
            Entry {
                summary: summary.to_string(),
                factory: Arc::new(factory),
            },
        );
        self
    }

    /// Produces the job for `code`.
    pub fn resolve(&self, code: &str) -> Result<JobRef, TaskError> {
        self.entries
            .get(code)
            .map(|e| (e.factory)())
            .ok_or_else(|| TaskError::UnknownJob {
                code: code.to_string(),
            })
    }

    /// True if `code` is registered.
    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    /// Registered codes, sorted.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Writes a definition for every code whose stored definition is missing
    /// or differs. Returns the number of definitions written.
    pub async fn publish(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let mut written = 0;
        for (code, entry) in &self.entries {
            let key = layout::taskdef_key(code);
            let current: Option<TaskDef> = store::load(store, &key).await?;
            let wanted = TaskDef {
                language: LANGUAGE.to_string(),
                code: code.clone(),
                data: current.as_ref().map(|d| d.data.clone()).unwrap_or_default(),
                summary: entry.summary.clone(),
            };
            if current.as_ref() == Some(&wanted) {
                continue;
            }
            debug!(%code, "publishing definition");
            store::save(store, &key, &wanted).await?;
            written += 1;
        }
        Ok(written)
    }
}
