//! Built-in test jobs.
//!
//! | code               | behaviour                                   |
//! |--------------------|---------------------------------------------|
//! | `test/sleep`       | sleeps `delay` seconds, then succeeds       |
//! | `test/error`       | fails immediately                           |
//! | `test/sleep/error` | sleeps `delay` seconds, then fails          |
//!
//! Useful as stand-ins for real jobs, and with a sleeping instance as a way
//! to bound the runtime of a standalone runner.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::tasks::job::{Job, JobContext};

const DELAY: &str = "delay";

fn delay(ctx: &JobContext) -> Result<Duration, TaskError> {
    Ok(ctx.seconds(DELAY)?.unwrap_or(Duration::ZERO))
}

/// Waits for the configured `delay`.
#[derive(Debug, Default)]
pub struct Sleeper;

#[async_trait]
impl Job for Sleeper {
    async fn run(&self, ctx: JobContext) -> Result<String, TaskError> {
        let d = delay(&ctx)?;
        ctx.sleep(d).await?;
        Ok(format!("slept {}s", d.as_secs_f64()))
    }
}

/// Always fails.
#[derive(Debug, Default)]
pub struct Failer;

#[async_trait]
impl Job for Failer {
    async fn run(&self, _ctx: JobContext) -> Result<String, TaskError> {
        Err(TaskError::fail("test job refuses to work"))
    }
}

/// Waits for the configured `delay`, then fails.
#[derive(Debug, Default)]
pub struct SleepFailer;

#[async_trait]
impl Job for SleepFailer {
    async fn run(&self, ctx: JobContext) -> Result<String, TaskError> {
        ctx.sleep(delay(&ctx)?).await?;
        Err(TaskError::fail("test job gave up after sleeping"))
    }
}
