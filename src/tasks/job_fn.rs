//! # Function-backed job.
//!
//! [`JobFn`] wraps a closure `Fn(JobContext) -> Fut`, producing a fresh future
//! per execution. Nothing is shared between executions unless the closure
//! captures it explicitly (e.g. an `Arc`).
//!
//! ```rust
//! use leasevisor::{JobContext, JobFn, JobRef, TaskError};
//!
//! let job: JobRef = JobFn::arc(|ctx: JobContext| async move {
//!     Ok::<_, TaskError>(format!("ran {}", ctx.path))
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::tasks::job::{Job, JobContext};

/// Function-backed job.
#[derive(Debug, Clone)]
pub struct JobFn<F> {
    f: F,
}

impl<F> JobFn<F> {
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Wraps `f` and returns it as a shared handle.
    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Job for JobFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, TaskError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<String, TaskError> {
        (self.f)(ctx).await
    }
}
