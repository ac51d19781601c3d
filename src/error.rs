//! Error types used by the leasevisor runtime and tasks.
//!
//! - [`TaskError`] errors ending one task execution (and the master's decision input).
//! - [`RuntimeError`] errors raised by the runner itself.
//! - [`ConfigError`] invalid task variables.
//!
//! Store and registry failures live next to their modules
//! ([`StoreError`](crate::store::StoreError), [`RegError`](crate::reg::RegError)).
//! All types provide `as_label` for logs.

use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// # Errors produced by the runner.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some masters had to be aborted.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Task paths that did not stop in time.
        stuck: Vec<String>,
    },

    /// The job tree could not be read.
    #[error("job tree unavailable: {0}")]
    Store(#[from] StoreError),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use leasevisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::Store(_) => "runtime_store",
        }
    }
}

/// # Invalid task variable.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The value has the wrong type or is out of range.
    #[error("invalid value for `{key}`: {value}")]
    Invalid {
        /// Variable name (`ttl`, `retry`, ...).
        key: &'static str,
        /// Offending value, rendered as JSON.
        value: String,
    },

    /// A job-specific key the payload requires is missing.
    #[error("missing required value `{key}`")]
    Missing {
        /// Variable name.
        key: String,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "config_invalid",
            ConfigError::Missing { .. } => "config_missing",
        }
    }
}

/// # Errors ending a task execution.
///
/// Whatever ends a [`Task`](crate::Task) is written to its run-state record
/// first and then returned here. The [`TaskMaster`](crate::TaskMaster) uses
/// [`is_fatal`](TaskError::is_fatal) to decide between retry and propagation.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Another holder owns the lease; the payload never ran.
    #[error("task {path} is already running")]
    IsRunning {
        /// Instance path.
        path: String,
    },

    /// The lease was deleted or replaced by someone else.
    #[error("run marker of {path} is gone: {reason}")]
    MarkGone {
        /// Instance path.
        path: String,
        /// `deleted` or `superseded`.
        reason: &'static str,
    },

    /// A declared parent instance does not exist (or vanished while running).
    #[error("parent {parent} is gone")]
    ParentGone {
        /// Parent instance path.
        parent: String,
    },

    /// The lease could not be refreshed before its TTL ran out.
    #[error("aborted by timeout after {ttl:?}")]
    Timeout {
        /// Lease TTL that ran out.
        ttl: Duration,
    },

    /// Payload error; retried according to policy.
    #[error("{message}")]
    Fail {
        /// Error text (recorded as `message`).
        message: String,
        /// Debug chain (recorded as `debug`).
        debug: String,
    },

    /// Non-recoverable payload error (never retried).
    #[error("fatal error (no retry): {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// The payload panicked.
    #[error("payload panicked: {info}")]
    Panicked {
        /// Panic message.
        info: String,
    },

    /// The instance's definition reference changed or the instance vanished.
    #[error("definition of {path} changed")]
    DefinitionChanged {
        /// Instance path.
        path: String,
    },

    /// The job catalog has no entry for the definition's code.
    #[error("unknown job kind {code:?}")]
    UnknownJob {
        /// Job kind key.
        code: String,
    },

    /// A required record (instance or definition) is missing.
    #[error("not found: {key}")]
    NotFound {
        /// Missing key.
        key: String,
    },

    /// Invalid task variables.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A store operation failed where it could not be absorbed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Execution was cancelled from outside (shutdown or removal).
    #[error("context cancelled")]
    Canceled,
}

impl TaskError {
    /// Wraps a payload error message (its `Display` doubles as debug text).
    pub fn fail(message: impl Into<String>) -> Self {
        let message = message.into();
        TaskError::Fail {
            debug: message.clone(),
            message,
        }
    }

    /// Wraps any error, keeping its source chain as debug text.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut debug = format!("{err:?}");
        let mut src = err.source();
        while let Some(cause) = src {
            debug.push_str(&format!("\ncaused by: {cause}"));
            src = cause.source();
        }
        TaskError::Fail {
            message: err.to_string(),
            debug,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use leasevisor::TaskError;
    ///
    /// let err = TaskError::ParentGone { parent: "a".into() };
    /// assert_eq!(err.as_label(), "task_parent_gone");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::IsRunning { .. } => "task_is_running",
            TaskError::MarkGone { .. } => "task_mark_gone",
            TaskError::ParentGone { .. } => "task_parent_gone",
            TaskError::Timeout { .. } => "task_timeout",
            TaskError::Fail { .. } => "task_failed",
            TaskError::Fatal { .. } => "task_fatal",
            TaskError::Panicked { .. } => "task_panicked",
            TaskError::DefinitionChanged { .. } => "task_definition_changed",
            TaskError::UnknownJob { .. } => "task_unknown_job",
            TaskError::NotFound { .. } => "task_not_found",
            TaskError::Config(_) => "task_config",
            TaskError::Store(_) => "task_store",
            TaskError::Canceled => "task_canceled",
        }
    }

    /// Errors the master propagates without retrying.
    ///
    /// # Example
    /// ```
    /// use leasevisor::TaskError;
    ///
    /// assert!(TaskError::fail("boom").is_retryable());
    /// assert!(TaskError::Fatal { error: "nope".into() }.is_fatal());
    /// assert!(!TaskError::Canceled.is_retryable());
    /// ```
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaskError::Fatal { .. }
                | TaskError::Panicked { .. }
                | TaskError::ParentGone { .. }
                | TaskError::DefinitionChanged { .. }
                | TaskError::UnknownJob { .. }
                | TaskError::NotFound { .. }
                | TaskError::Config(_)
        )
    }

    /// Errors that feed the backoff.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, TaskError::Canceled)
    }

    /// Debug text recorded next to the message.
    pub fn debug_text(&self) -> String {
        match self {
            TaskError::Fail { debug, .. } => debug.clone(),
            other => format!("{other:?}"),
        }
    }
}
