//! Coordination store contract.
//!
//! The engine needs a hierarchical key/value store with:
//! - TTL leases (a key disappears unless refreshed in time),
//! - atomic create and version compare-and-swap on set/delete,
//! - per-subtree change notification ([`Watch`]).
//!
//! Any backend offering these can implement [`Store`]. [`MemoryStore`] is the
//! in-process implementation used by tests and single-host setups.
//!
//! ## Contents
//! - [`Store`], [`StoreRef`] the contract and its shared handle
//! - [`Node`], [`Version`] stored values
//! - [`Change`], [`Watch`] change notifications
//! - [`layout`] key layout of the job tree

pub mod layout;

mod error;
mod memory;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use watch::{Change, Watch};

/// Version token of a stored value; changes on every write.
pub type Version = u64;

/// Shared handle to a store.
pub type StoreRef = Arc<dyn Store>;

/// A stored value with its version token.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Full key.
    pub key: String,
    /// JSON value.
    pub value: Value,
    /// Version token of this value.
    pub version: Version,
}

/// Hierarchical key/value store with leases, compare-and-swap and watches.
///
/// Keys are `/`-separated paths. Every write returns a fresh [`Version`];
/// conditional operations take the version the caller believes is current.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads one key.
    async fn get(&self, key: &str) -> Result<Option<Node>, StoreError>;

    /// Lists the direct child segments below `dir` (sorted, deduplicated).
    async fn children(&self, dir: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically creates `key`; fails with [`StoreError::AlreadyExists`] if present.
    async fn create(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<Version, StoreError>;

    /// Writes `key`. With `prev`, only if the stored version equals it.
    ///
    /// A `None` TTL makes the key permanent.
    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        prev: Option<Version>,
    ) -> Result<Version, StoreError>;

    /// Deletes `key`. With `prev`, only if the stored version equals it.
    async fn delete(&self, key: &str, prev: Option<Version>) -> Result<(), StoreError>;

    /// Deletes `dir` and everything below it; returns the number of removed keys.
    async fn delete_tree(&self, dir: &str) -> Result<usize, StoreError>;

    /// Subscribes to changes at or below `prefix`.
    fn watch(&self, prefix: &str) -> Watch;

    /// Waits until previously issued writes are visible to every reader.
    async fn sync(&self) -> Result<(), StoreError>;
}

/// Reads and decodes a JSON record.
pub async fn load<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        None => Ok(None),
        Some(node) => serde_json::from_value(node.value)
            .map(Some)
            .map_err(|e| StoreError::Codec {
                key: key.to_string(),
                error: e.to_string(),
            }),
    }
}

/// Encodes and writes a JSON record unconditionally.
pub async fn save<T: Serialize>(
    store: &dyn Store,
    key: &str,
    record: &T,
) -> Result<Version, StoreError> {
    let value = serde_json::to_value(record).map_err(|e| StoreError::Codec {
        key: key.to_string(),
        error: e.to_string(),
    })?;
    store.set(key, value, None, None).await
}
