use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use octocache_storage::{EvictionCallback, EvictionReason, LocalEntry, LocalStore, LocalValue};

/// Options for [`InMemoryLocalStore`].
#[derive(Debug, Clone, Default)]
pub struct LocalStoreOptions {
    /// Upper bound on the sum of `estimated_size` over all entries.
    ///
    /// `None` disables the budget.
    pub max_total_bytes: Option<usize>,
}

struct StoredEntry {
    entry: LocalEntry,
    on_evicted: Option<EvictionCallback>,
}

/// In-process cache store backed by a sharded `DashMap`.
///
/// Expired entries are dropped lazily on read and by [`purge_expired`].
/// When a size budget is configured, writes that would overflow it are
/// declined after a purge attempt rather than evicting live entries.
///
/// Eviction callbacks run after the map guard for the key is released.
///
/// [`purge_expired`]: InMemoryLocalStore::purge_expired
pub struct InMemoryLocalStore {
    entries: DashMap<String, StoredEntry>,
    total_bytes: AtomicUsize,
    declined: AtomicU64,
    options: LocalStoreOptions,
}

impl InMemoryLocalStore {
    /// Creates a store without a size budget.
    pub fn new() -> Self {
        Self::with_options(LocalStoreOptions::default())
    }

    /// Creates a store with the given options.
    pub fn with_options(options: LocalStoreOptions) -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicUsize::new(0),
            declined: AtomicU64::new(0),
            options,
        }
    }

    /// Sum of `estimated_size` over the entries currently held.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Number of writes declined because of the size budget.
    pub fn declined_writes(&self) -> u64 {
        self.declined.load(Ordering::Relaxed)
    }

    /// Removes every expired entry, firing their callbacks.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|stored| stored.entry.is_expired_at(now))
            .map(|stored| stored.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if let Some((key, stored)) = self
                .entries
                .remove_if(&key, |_, stored| stored.entry.is_expired_at(now))
            {
                self.release(&stored);
                Self::notify(&key, stored, EvictionReason::Expired);
                removed += 1;
            }
        }
        removed
    }

    fn release(&self, stored: &StoredEntry) {
        self.total_bytes
            .fetch_sub(stored.entry.estimated_size, Ordering::AcqRel);
    }

    fn notify(key: &str, stored: StoredEntry, reason: EvictionReason) {
        if let Some(callback) = stored.on_evicted {
            callback(key, reason);
        }
    }

    /// Moves the byte total from `released` to `added` in one step.
    ///
    /// Fails, leaving the total untouched, when the result would exceed the
    /// budget.
    fn account(&self, released: usize, added: usize) -> bool {
        let max = self.options.max_total_bytes;
        self.total_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                let next = total.checked_sub(released)?.checked_add(added)?;
                match max {
                    Some(max) if next > max => None,
                    _ => Some(next),
                }
            })
            .is_ok()
    }

    /// Inserts under the key's entry guard, so the replaced size and the
    /// accounting cannot race a removal of the same key.
    ///
    /// Hands `stored` back when the budget declines it.
    fn try_insert(
        &self,
        key: &str,
        stored: StoredEntry,
    ) -> Result<Option<StoredEntry>, StoredEntry> {
        let size = stored.entry.estimated_size;
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let replaced = occupied.get().entry.estimated_size;
                if !self.account(replaced, size) {
                    return Err(stored);
                }
                Ok(Some(occupied.insert(stored)))
            }
            Entry::Vacant(vacant) => {
                if !self.account(0, size) {
                    return Err(stored);
                }
                vacant.insert(stored);
                Ok(None)
            }
        }
    }
}

impl Default for InMemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for InMemoryLocalStore {
    fn try_get(&self, key: &str) -> Option<LocalValue> {
        let now = Instant::now();
        {
            let stored = self.entries.get(key)?;
            if !stored.entry.is_expired_at(now) {
                return Some(stored.entry.value.clone());
            }
        }

        if let Some((key, stored)) = self
            .entries
            .remove_if(key, |_, stored| stored.entry.is_expired_at(now))
        {
            tracing::trace!(key = %key, "local entry expired");
            self.release(&stored);
            Self::notify(&key, stored, EvictionReason::Expired);
        }
        None
    }

    fn set(&self, key: &str, entry: LocalEntry, on_evicted: Option<EvictionCallback>) -> bool {
        let size = entry.estimated_size;
        let oversized = self.options.max_total_bytes.is_some_and(|max| size > max);
        let outcome = if oversized {
            Err(StoredEntry { entry, on_evicted })
        } else {
            match self.try_insert(key, StoredEntry { entry, on_evicted }) {
                Err(stored) => {
                    self.purge_expired();
                    self.try_insert(key, stored)
                }
                inserted => inserted,
            }
        };

        match outcome {
            Ok(previous) => {
                if let Some(previous) = previous {
                    Self::notify(key, previous, EvictionReason::Replaced);
                }
                true
            }
            Err(_) => {
                self.declined.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %key,
                    size,
                    max_total_bytes = ?self.options.max_total_bytes,
                    "local cache at capacity, skipping insertion"
                );
                false
            }
        }
    }

    fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((key, stored)) => {
                self.release(&stored);
                Self::notify(&key, stored, EvictionReason::Removed);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for InMemoryLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLocalStore")
            .field("entries", &self.entries.len())
            .field("total_bytes", &self.total_bytes())
            .field("max_total_bytes", &self.options.max_total_bytes)
            .finish()
    }
}
