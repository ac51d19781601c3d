//! # Jobs, definitions and task records.
//!
//! - [`Job`], [`JobFn`], [`JobRef`], [`JobContext`] the payload abstraction
//! - [`Catalog`] code → job factory, plus definition publishing
//! - [`TaskDef`], [`TaskInstance`], [`RunState`], [`RunStatus`] stored records
//! - [`TaskVars`] layered supervision knobs

mod builtin;
mod catalog;
mod job;
mod job_fn;
mod record;
mod vars;

pub use builtin::{Failer, SleepFailer, Sleeper};
pub use catalog::{Catalog, JobFactory};
pub use job::{Job, JobContext, JobRef};
pub use job_fn::JobFn;
pub use record::{RunState, RunStatus, TaskDef, TaskInstance, field, timestamp};
pub use vars::{TaskVars, VarMap, lookup, merge, seconds};
