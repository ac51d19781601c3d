//! # Runtime events emitted by tasks, masters and the runner.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Task events**: one execution (starting, lease acquired/lost, ok, error, fail)
//! - **Master events**: restart scheduling and terminal master states
//! - **Runner events**: masters added/removed, shutdown progress
//! - **Subscriber events**: overflow and panics of event subscribers
//!
//! The [`Event`] struct carries metadata such as timestamps, the task path,
//! reasons and backoff delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use leasevisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::TaskFailed)
//!     .with_task("home/heat")
//!     .with_reason("Aborted by timeout")
//!     .with_attempt(3)
//!     .with_timeout(Duration::from_secs(5));
//!
//! assert_eq!(ev.kind, EventKind::TaskFailed);
//! assert_eq!(ev.task.as_deref(), Some("home/heat"));
//! assert_eq!(ev.reason.as_deref(), Some("Aborted by timeout"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing (`task` = subscriber name).
    SubscriberPanicked,
    /// Subscriber dropped an event, queue full or closed (`task` = subscriber name).
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (OS signal or caller).
    ShutdownRequested,
    /// All masters stopped within the grace period.
    AllStoppedWithin,
    /// Grace period exceeded; some masters were aborted.
    GraceExceeded,

    // === Task events ===
    /// A task execution is starting (`attempt` set).
    TaskStarting,
    /// The lease was created; the payload is about to run.
    LeaseAcquired,
    /// Another holder owns the lease; the payload did not run.
    LeaseBusy,
    /// The lease was deleted or superseded (`reason` set).
    LeaseLost,
    /// The lease could not be refreshed before its TTL (`timeout_ms` set).
    TimeoutHit,
    /// The payload completed (`reason` = result).
    TaskStopped,
    /// The payload returned an error or panicked (`reason` set).
    TaskErrored,
    /// The execution was aborted: lease lost, timeout, parent gone (`reason` set).
    TaskFailed,
    /// The execution was cancelled from outside.
    TaskCancelled,

    // === Master events ===
    /// Next execution scheduled (`delay_ms`, `backoff_source`).
    BackoffScheduled,
    /// Master finished normally (success with `restart = 0`, or cancellation).
    MasterFinished,
    /// Master ended with an error it does not retry (`reason` set).
    MasterDead,

    // === Runner events ===
    /// A master was spawned for an instance path.
    TaskAdded,
    /// A master was joined and forgotten.
    TaskRemoved,
}

/// Reason for scheduling the next execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffSource {
    /// Restart after a success (`restart` delay).
    Success,
    /// Retry after an error (backoff delay).
    Failure,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Task instance path (or subscriber name), if applicable.
    pub task: Option<Arc<str>>,
    /// Execution count of the master (starting from 1).
    pub attempt: Option<u32>,
    /// Human-readable reason (errors, results, overflow details).
    pub reason: Option<Arc<str>>,
    /// Lease TTL in milliseconds.
    pub timeout_ms: Option<u32>,
    /// Delay before the next execution in milliseconds.
    pub delay_ms: Option<u32>,
    /// Source of a scheduled delay.
    pub backoff_source: Option<BackoffSource>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            task: None,
            attempt: None,
            reason: None,
            timeout_ms: None,
            delay_ms: None,
            backoff_source: None,
        }
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a task path.
    #[inline]
    pub fn with_task(mut self, task: impl Into<Arc<str>>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Attaches a lease TTL (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(millis(d));
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(millis(d));
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Marks that this delay follows a success.
    #[inline]
    pub fn with_backoff_success(mut self) -> Self {
        self.backoff_source = Some(BackoffSource::Success);
        self
    }

    /// Marks that this delay follows an error.
    #[inline]
    pub fn with_backoff_failure(mut self) -> Self {
        self.backoff_source = Some(BackoffSource::Failure);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_task(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_task(subscriber)
            .with_reason(info)
    }

    /// True for the terminal events of one task execution.
    pub fn ends_execution(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskStopped
                | EventKind::TaskErrored
                | EventKind::TaskFailed
                | EventKind::TaskCancelled
                | EventKind::LeaseBusy
        )
    }
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let a = Event::new(EventKind::TaskStarting);
        let b = Event::new(EventKind::TaskStopped);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn delays_saturate_at_u32() {
        let ev = Event::new(EventKind::BackoffScheduled).with_delay(Duration::from_secs(u64::MAX / 2));
        assert_eq!(ev.delay_ms, Some(u32::MAX));
    }
}
