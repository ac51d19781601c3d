//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the [`Runner`](crate::Runner)
//! and every [`TaskMaster`](crate::TaskMaster) it spawns.
//!
//! Per-task knobs (`ttl`, `refresh`, `retry`, ...) are not set here directly:
//! [`Config::vars`] only supplies the lowest layer of
//! [`TaskVars`] resolution (instance → definition → `config/run` → `Config::vars`).

use std::time::Duration;

use crate::policies::BackoffPolicy;
use crate::tasks::TaskVars;

/// Global configuration for the runtime.
///
/// ## Field semantics
/// - `grace`: maximum wait for masters to stop after a shutdown request (`0s` = abort immediately)
/// - `cancel_grace`: how long a cancelled payload may take to honour its token before it is aborted
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
/// - `vars`: built-in defaults for task variables
/// - `backoff`: restart backoff policy used by every master
/// - `kill_fail`: stop the whole runner when one master ends in error
/// - `standalone`: run the tasks found at startup and do not follow tree changes
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum time to wait for graceful shutdown before aborting masters.
    pub grace: Duration,

    /// Window between cooperative cancellation and abort of a payload.
    pub cancel_grace: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    ///
    /// Slow subscribers that lag behind more than `bus_capacity` messages will
    /// receive `Lagged` and skip older items.
    pub bus_capacity: usize,

    /// Lowest layer of task variable resolution.
    pub vars: TaskVars,

    /// Backoff policy for restarts after errors.
    pub backoff: BackoffPolicy,

    /// End the runner on the first master that fails.
    pub kill_fail: bool,

    /// Do not follow job tree changes; exit once every master ended.
    pub standalone: bool,
}

impl Config {
    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `grace = 30s`
    /// - `cancel_grace = 5s`
    /// - `bus_capacity = 1024`
    /// - `vars = TaskVars::default()`
    /// - `backoff = BackoffPolicy::default()` (additive, `retry/2` per error)
    /// - `kill_fail = false`, `standalone = false`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
            bus_capacity: 1024,
            vars: TaskVars::default(),
            backoff: BackoffPolicy::default(),
            kill_fail: false,
            standalone: false,
        }
    }
}
