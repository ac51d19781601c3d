//! # Change notifications for a store subtree.
//!
//! A [`Watch`] is a subscription on every key at or below a prefix. Stores
//! publish [`Change`]s on a broadcast channel; the watch filters them and hands
//! them to the owning state machine.
//!
//! ## Rules
//! - A watch only sees changes made **after** it was created.
//! - A receiver that falls behind gets [`Change::Resync`]: some changes were
//!   skipped and the subtree must be re-read.
//! - `changed()` returns `None` once the store is gone.

use tokio::sync::broadcast;

use super::Version;

/// A change to one key of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// The key was created or overwritten.
    Put {
        /// Changed key.
        key: String,
        /// Version after the write.
        version: Version,
    },
    /// The key was deleted, explicitly or by TTL expiry.
    Delete {
        /// Removed key.
        key: String,
        /// True when the TTL ran out.
        expired: bool,
    },
    /// Changes were dropped; re-read everything below the prefix.
    Resync,
}

impl Change {
    /// Returns the affected key (`None` for [`Change::Resync`]).
    pub fn key(&self) -> Option<&str> {
        match self {
            Change::Put { key, .. } | Change::Delete { key, .. } => Some(key),
            Change::Resync => None,
        }
    }

    /// True for deletions, including expiry.
    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete { .. })
    }
}

/// Subscription to changes at or below a key prefix.
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<Change>,
}

impl Watch {
    /// Wraps a raw change receiver, keeping only keys under `prefix`.
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<Change>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// The watched prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Waits for the next change below the prefix.
    pub async fn changed(&mut self) -> Option<Change> {
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    if change.key().is_some_and(|k| self.covers(k)) {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(Change::Resync),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// True if `key` is the prefix itself or lies below it.
    pub fn covers(&self, key: &str) -> bool {
        if self.prefix.is_empty() {
            return true;
        }
        key.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}
