//! Tier contracts consumed by the cache orchestrator.
//!
//! The local tier is an in-process, synchronous store. The shared tier is a
//! remote store reached asynchronously; it always supports the legacy
//! byte-array calls and may additionally expose a buffer-oriented read path
//! and native tag invalidation. Capability probes take `self: Arc<Self>` so
//! the orchestrator can resolve them once, at construction.
//!
//! Cancelling a shared-tier call means dropping its future.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::StorageError;
use crate::types::{EvictionCallback, LocalEntry, LocalValue, SharedEntryOptions};

/// In-process cache store.
///
/// Implementations must be thread-safe and must invoke eviction callbacks
/// without holding any internal lock, since a callback may call back into
/// code that uses the store.
pub trait LocalStore: Send + Sync {
    /// Returns the live value for `key`, if any.
    fn try_get(&self, key: &str) -> Option<LocalValue>;

    /// Stores an entry, replacing any previous one.
    ///
    /// Returns `false` if the store declined the entry (for example because
    /// it would exceed the size budget). A replaced entry's callback fires
    /// with [`EvictionReason::Replaced`](crate::EvictionReason::Replaced).
    fn set(&self, key: &str, entry: LocalEntry, on_evicted: Option<EvictionCallback>) -> bool;

    /// Removes an entry. Returns `true` if one was present.
    fn remove(&self, key: &str) -> bool;

    /// Number of entries currently held, expired or not.
    fn len(&self) -> usize;

    /// Returns `true` if the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared (distributed) cache store, byte-array flavour.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Returns a freshly allocated copy of the stored payload.
    ///
    /// # Errors
    ///
    /// Returns an error only for backend faults, not for missing keys.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores a payload with the given expiry.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &SharedEntryOptions,
    ) -> Result<(), StorageError>;

    /// Removes a payload. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Returns the name of this backend for logging/debugging.
    fn backend_name(&self) -> &'static str;

    /// Returns the buffer-oriented view of this store, if it has one.
    fn buffered(self: Arc<Self>) -> Option<Arc<dyn BufferedSharedStore>> {
        None
    }

    /// Returns the tag invalidation view of this store, if it has one.
    fn tag_invalidation(self: Arc<Self>) -> Option<Arc<dyn TagInvalidation>> {
        None
    }
}

/// Shared store that can read into, and write from, caller-owned buffers.
#[async_trait]
pub trait BufferedSharedStore: SharedStore {
    /// Appends the stored payload for `key` to `destination`.
    ///
    /// Returns `false` on a miss, leaving `destination` untouched.
    async fn try_get_into(&self, key: &str, destination: &mut BytesMut)
    -> Result<bool, StorageError>;

    /// Stores an already-encoded payload without copying it.
    async fn set_bytes(
        &self,
        key: &str,
        value: Bytes,
        options: &SharedEntryOptions,
    ) -> Result<(), StorageError>;
}

/// Native bulk invalidation by tag.
#[async_trait]
pub trait TagInvalidation: Send + Sync {
    /// Removes every entry carrying at least one of `tags`.
    async fn remove_by_tags(&self, tags: &[String]) -> Result<(), StorageError>;
}

/// Capabilities of a shared backend, probed once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendFeatures {
    /// The backend exposes [`BufferedSharedStore`].
    pub buffered: bool,
    /// The backend exposes [`TagInvalidation`].
    pub tag_invalidation: bool,
}
