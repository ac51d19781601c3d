//! # Event subscribers.
//!
//! ```text
//! Task / TaskMaster / Runner ── publish(Event) ──► Bus ──► Runner listener
//!                                                              │
//!                                                    SubscriberSet::emit
//!                                                    ┌─────────┼─────────┐
//!                                                    ▼         ▼         ▼
//!                                                LogWriter   custom     ...
//! ```
//!
//! - [`Subscribe`] the extension trait
//! - [`SubscriberSet`] per-subscriber queues with panic isolation
//! - [`LogWriter`] renders events through `tracing`

mod log;
mod subscriber;
mod subscriber_set;

pub use log::LogWriter;
pub use subscriber::Subscribe;
pub use subscriber_set::SubscriberSet;
