//! # Job abstraction.
//!
//! A [`Job`] is the payload of a task: the code a definition's `code` key
//! resolves to through the [`Catalog`](crate::Catalog). Each execution gets a
//! fresh [`JobContext`] carrying the instance path, its resolved variables, a
//! cancellation token, the execution's resource registry and the store.
//!
//! Jobs should watch `ctx.token` and return [`TaskError::Canceled`] promptly
//! once it fires; a job that ignores it is aborted after `cancel_grace`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, TaskError};
use crate::reg::Reg;
use crate::store::StoreRef;
use crate::tasks::vars::{self, TaskVars, VarMap};

/// Everything one execution of a job may use.
#[derive(Clone)]
pub struct JobContext {
    /// Instance path.
    pub path: String,
    /// Definition path of the instance.
    pub taskdef: String,
    /// Job data: definition defaults overlaid with instance data.
    pub data: VarMap,
    /// Resolved supervision knobs.
    pub vars: TaskVars,
    /// Fires when the execution must stop.
    pub token: CancellationToken,
    /// Resources acquired here are released at teardown.
    pub reg: Reg,
    /// The coordination store.
    pub store: StoreRef,
}

impl JobContext {
    /// Job data value for `key`.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Job data value for `key`, read as seconds.
    pub fn seconds(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        self.value(key).map(|v| vars::seconds(key, v)).transpose()
    }

    /// Sleeps for `dur` unless the execution is cancelled first.
    pub async fn sleep(&self, dur: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = tokio::time::sleep(dur) => Ok(()),
            _ = self.token.cancelled() => Err(TaskError::Canceled),
        }
    }
}

/// # Payload of a task.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use leasevisor::{Job, JobContext, TaskError};
///
/// struct Hello;
///
/// #[async_trait]
/// impl Job for Hello {
///     async fn run(&self, ctx: JobContext) -> Result<String, TaskError> {
///         Ok(format!("hello from {}", ctx.path))
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Runs one execution. The returned text is recorded as the run's message.
    async fn run(&self, ctx: JobContext) -> Result<String, TaskError>;
}

/// Shared handle to a job.
pub type JobRef = Arc<dyn Job>;
