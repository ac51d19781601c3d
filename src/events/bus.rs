//! Event bus shared by the runner, its masters and their tasks.
//!
//! One [`Bus`] per runner. The runner's listener is the only consumer that
//! matters for correctness (it feeds the alive tracker); everything else is
//! best effort. A lagging receiver skips the oldest events.

use tokio::sync::broadcast;

use super::event::Event;

/// Fire-and-forget broadcast of [`Event`]s.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Ring buffer of `capacity` events (at least 1), shared by all receivers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sends `ev`; dropped when nobody listens.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Receiver of events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
