//! # Logging subscriber.
//!
//! [`LogWriter`] renders runtime events through `tracing`, one line per event:
//!
//! ```text
//! INFO  task=home/heat attempt=1 starting
//! INFO  task=home/heat lease acquired
//! WARN  task=home/heat reason="Run marker deleted" lease lost
//! INFO  task=home/heat delay_ms=1500 source=Failure backoff scheduled
//! ```
//!
//! The crate never installs a `tracing` subscriber; the host application does.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Writes every runtime event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let task = e.task.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::TaskStarting => info!(task, attempt = e.attempt, "starting"),
            EventKind::LeaseAcquired => info!(task, "lease acquired"),
            EventKind::LeaseBusy => info!(task, "already running elsewhere"),
            EventKind::LeaseLost => warn!(task, reason, "lease lost"),
            EventKind::TimeoutHit => warn!(task, ttl_ms = e.timeout_ms, "lease timed out"),
            EventKind::TaskStopped => info!(task, result = reason, "done"),
            EventKind::TaskErrored => warn!(task, error = reason, "errored"),
            EventKind::TaskFailed => warn!(task, reason, "failed"),
            EventKind::TaskCancelled => info!(task, "cancelled"),
            EventKind::BackoffScheduled => info!(
                task,
                delay_ms = e.delay_ms,
                source = ?e.backoff_source,
                "backoff scheduled"
            ),
            EventKind::MasterFinished => debug!(task, "master finished"),
            EventKind::MasterDead => error!(task, error = reason, "master dead"),
            EventKind::TaskAdded => debug!(task, "added"),
            EventKind::TaskRemoved => debug!(task, "removed"),
            EventKind::ShutdownRequested => info!("shutdown requested"),
            EventKind::AllStoppedWithin => info!("all tasks stopped within grace"),
            EventKind::GraceExceeded => error!("grace exceeded"),
            EventKind::SubscriberPanicked => error!(subscriber = task, reason, "subscriber panicked"),
            EventKind::SubscriberOverflow => warn!(subscriber = task, reason, "subscriber overflow"),
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
