//! # Tree reconciliation.
//!
//! A [`Collector`] turns a [`Source`] into a stream of [`Collected`] steps;
//! a [`Reconciler`] applies them to the job tree. [`CollectorJob`] wires both
//! into a job so a collector runs under a [`TaskMaster`](crate::TaskMaster)
//! like any other task, and the [`Runner`](crate::Runner) picks up the
//! instances it writes.

mod collector;
mod job;
mod reconcile;
mod source;

pub use collector::{Collected, Collector};
pub use job::CollectorJob;
pub use reconcile::Reconciler;
pub use source::{Entry, FixedSource, Source, SubtreeSource};
