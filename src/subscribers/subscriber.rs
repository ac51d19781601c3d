//! # Event subscriber trait.
//!
//! [`Subscribe`] plugs custom handlers (alerting, status displays, metrics)
//! into the runtime. Each subscriber gets its own bounded queue and worker
//! task inside a [`SubscriberSet`](crate::SubscriberSet), so a slow or
//! panicking subscriber never delays task supervision.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use leasevisor::{Event, EventKind, Subscribe};
//!
//! struct Alerts;
//!
//! #[async_trait]
//! impl Subscribe for Alerts {
//!     async fn on_event(&self, ev: &Event) {
//!         if matches!(ev.kind, EventKind::MasterDead) {
//!             // page someone
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "alerts" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Event subscriber for runtime observability.
///
/// Events are delivered in FIFO order per subscriber, from a dedicated worker.
/// Panics are caught and published as `SubscriberPanicked`.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event.
    async fn on_event(&self, event: &Event);

    /// Name used in overflow/panic events. Defaults to the type name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred queue capacity (clamped to at least 1). Default: 1024.
    ///
    /// When the queue is full the event is dropped for this subscriber only
    /// and `SubscriberOverflow` is published.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
