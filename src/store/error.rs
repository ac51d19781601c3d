use thiserror::Error;

use super::Version;

/// Errors returned by a coordination [`Store`](super::Store).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Atomic create found the key already present.
    #[error("key already exists: {key}")]
    AlreadyExists {
        /// The contested key.
        key: String,
    },

    /// A conditional operation targeted a key that does not exist.
    #[error("key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// Compare-and-swap failed: the stored version is not the expected one.
    #[error("compare failed on {key}: expected version {expected}, found {actual}")]
    CompareFailed {
        /// The contested key.
        key: String,
        /// Version the caller held.
        expected: Version,
        /// Version currently stored.
        actual: Version,
    },

    /// The store could not be reached or refused the operation.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Transport or backend detail.
        reason: String,
    },

    /// A stored value could not be (de)serialized.
    #[error("bad value at {key}: {error}")]
    Codec {
        /// Key holding the value.
        key: String,
        /// Decoder message.
        error: String,
    },
}

impl StoreError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::AlreadyExists { .. } => "store_already_exists",
            StoreError::NotFound { .. } => "store_not_found",
            StoreError::CompareFailed { .. } => "store_compare_failed",
            StoreError::Unavailable { .. } => "store_unavailable",
            StoreError::Codec { .. } => "store_codec",
        }
    }

    /// True when the error proves the key is no longer the one the caller created.
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::CompareFailed { .. }
        )
    }
}
