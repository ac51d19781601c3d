//! Runtime core: executions, supervision and the runner.
//!
//! Public API from this module: [`Runner`], [`TaskMaster`], [`Task`] and
//! their companions.
//!
//! Internal modules:
//! - [`task`]: one execution under a lease (heartbeat, deadline, parent watch);
//! - [`master`]: restart policy and backoff for one instance path;
//! - [`runner`]: one master per instance, tree following, graceful shutdown;
//! - [`registry`]: the runner's set of live masters;
//! - [`alive`]: which paths currently hold a lease;
//! - [`shutdown`]: OS signal handling.

mod alive;
mod config;
mod master;
mod registry;
mod runner;
mod shutdown;
mod task;

pub use alive::AliveTracker;
pub use config::Config;
pub use master::{Status, StatusFn, TaskMaster, Trigger};
pub use runner::Runner;
pub use task::{Phase, Task};
