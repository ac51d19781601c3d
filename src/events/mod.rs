//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Task` (execution lifecycle), `TaskMaster` (restart
//!   scheduling, terminal states), `Runner` (added/removed, shutdown),
//!   `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the runner's listener, which feeds `AliveTracker` and
//!   fans out to `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{BackoffSource, Event, EventKind};
