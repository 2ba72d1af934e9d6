//! In-memory shared tier.
//!
//! Stands in for a distributed key/value service. The store can be shaped
//! like every kind of backend the orchestrator supports:
//!
//! | Mode       | Legacy calls | Buffered calls | Tag invalidation      |
//! |------------|--------------|----------------|-----------------------|
//! | `Legacy`   | yes          | no             | when `tags_enabled`   |
//! | `Buffered` | yes          | yes            | when `tags_enabled`   |
//!
//! An optional artificial latency makes every call suspend, which is how
//! tests exercise the slow (non-immediate) completion path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use octocache_storage::{
    BufferedSharedStore, CacheEntry, SharedEntryOptions, SharedStore, StorageError, StorageResult,
    TagInvalidation,
};

/// Which access pattern the store exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedStoreMode {
    /// Only the byte-array calls.
    Legacy,
    /// Byte-array calls plus the buffer-oriented ones.
    #[default]
    Buffered,
}

/// Options for [`InMemorySharedStore`].
#[derive(Debug, Clone, Default)]
pub struct SharedStoreOptions {
    pub mode: SharedStoreMode,
    /// Expose native tag invalidation.
    pub tags_enabled: bool,
    /// Artificial delay applied to every call.
    pub latency: Option<Duration>,
}

impl SharedStoreOptions {
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            mode: SharedStoreMode::Legacy,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn buffered() -> Self {
        Self {
            mode: SharedStoreMode::Buffered,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tags(mut self) -> Self {
        self.tags_enabled = true;
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[derive(Debug, Clone)]
struct SharedSlot {
    payload: Bytes,
    expires_at: Option<Instant>,
}

impl SharedSlot {
    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Call counters for [`InMemorySharedStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedStoreStats {
    /// Byte-array reads.
    pub gets: u64,
    /// Buffer-oriented reads.
    pub buffered_gets: u64,
    /// Writes through either path.
    pub sets: u64,
    /// Key removals.
    pub removes: u64,
    /// Tag invalidation calls.
    pub tag_removals: u64,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    buffered_gets: AtomicU64,
    sets: AtomicU64,
    removes: AtomicU64,
    tag_removals: AtomicU64,
}

/// Shared tier kept in process memory.
pub struct InMemorySharedStore {
    entries: DashMap<String, SharedSlot>,
    options: SharedStoreOptions,
    available: AtomicBool,
    counters: Counters,
}

impl InMemorySharedStore {
    /// Creates a buffered store without tag support or latency.
    pub fn new() -> Self {
        Self::with_options(SharedStoreOptions::default())
    }

    pub fn with_options(options: SharedStoreOptions) -> Self {
        Self {
            entries: DashMap::new(),
            options,
            available: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    pub fn mode(&self) -> SharedStoreMode {
        self.options.mode
    }

    /// Simulates the backend going away (`false`) or coming back (`true`).
    ///
    /// While unavailable every call fails with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Returns the raw stored payload, ignoring expiry.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|slot| slot.payload.clone())
    }

    /// Stores a payload as-is, bypassing counters and availability.
    pub fn insert_raw(&self, key: impl Into<String>, payload: impl Into<Bytes>) {
        self.entries.insert(
            key.into(),
            SharedSlot {
                payload: payload.into(),
                expires_at: None,
            },
        );
    }

    /// Returns `true` if a live entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|slot| !slot.is_expired_at(now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> SharedStoreStats {
        SharedStoreStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            buffered_gets: self.counters.buffered_gets.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
            tag_removals: self.counters.tag_removals.load(Ordering::Relaxed),
        }
    }

    async fn enter(&self) -> StorageResult<()> {
        if let Some(latency) = self.options.latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StorageError::connection_error(format!(
                "{} is unavailable",
                self.backend_name()
            )))
        }
    }

    fn lookup(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        {
            let slot = self.entries.get(key)?;
            if !slot.is_expired_at(now) {
                return Some(slot.payload.clone());
            }
        }
        self.entries
            .remove_if(key, |_, slot| slot.is_expired_at(now));
        tracing::trace!(key = %key, "shared entry expired");
        None
    }

    fn store(&self, key: &str, payload: Bytes, options: &SharedEntryOptions) {
        let expires_at = options
            .absolute_expiration_relative_to_now
            .and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .insert(key.to_owned(), SharedSlot { payload, expires_at });
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemorySharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySharedStore")
            .field("entries", &self.entries.len())
            .field("options", &self.options)
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.enter().await?;
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.lookup(key).map(|payload| payload.to_vec()))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &SharedEntryOptions,
    ) -> StorageResult<()> {
        self.enter().await?;
        self.store(key, Bytes::copy_from_slice(value), options);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.enter().await?;
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        self.entries.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }

    fn buffered(self: Arc<Self>) -> Option<Arc<dyn BufferedSharedStore>> {
        match self.options.mode {
            SharedStoreMode::Buffered => Some(self),
            SharedStoreMode::Legacy => None,
        }
    }

    fn tag_invalidation(self: Arc<Self>) -> Option<Arc<dyn TagInvalidation>> {
        if self.options.tags_enabled {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl BufferedSharedStore for InMemorySharedStore {
    async fn try_get_into(&self, key: &str, destination: &mut BytesMut) -> StorageResult<bool> {
        self.enter().await?;
        self.counters.buffered_gets.fetch_add(1, Ordering::Relaxed);
        match self.lookup(key) {
            Some(payload) => {
                destination.extend_from_slice(&payload);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_bytes(
        &self,
        key: &str,
        value: Bytes,
        options: &SharedEntryOptions,
    ) -> StorageResult<()> {
        self.enter().await?;
        self.store(key, value, options);
        Ok(())
    }
}

#[async_trait]
impl TagInvalidation for InMemorySharedStore {
    async fn remove_by_tags(&self, tags: &[String]) -> StorageResult<()> {
        self.enter().await?;
        self.counters.tag_removals.fetch_add(1, Ordering::Relaxed);

        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|slot| match CacheEntry::decode(slot.payload.clone()) {
                Ok(entry) => tags.iter().any(|tag| entry.tags.contains(tag)),
                Err(_) => false,
            })
            .map(|slot| slot.key().clone())
            .collect();

        for key in &matching {
            self.entries.remove(key);
        }
        tracing::debug!(tags = ?tags, removed = matching.len(), "shared entries removed by tag");
        Ok(())
    }
}
