//! Tag index over the local tier.
//!
//! [`TaggedLocalStore`] wraps a [`LocalStore`] and keeps a reverse index from
//! tag to the keys currently stored with it. A key is listed under a tag if
//! and only if the entry stored for that key carries the tag.
//!
//! Every index mutation happens under one lock, and `set` writes to the
//! store while still holding it, so an `evict_by_tag` can never slip in
//! between the index update and the store write. The store may invoke
//! eviction callbacks synchronously from inside `set` or `remove`; the lock
//! is reentrant so those callbacks can prune the index on the same thread.
//!
//! Plain key lookups go straight to the store and never touch the index.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use octocache_storage::{EvictionCallback, EvictionReason, LocalEntry, LocalStore, LocalValue};
use parking_lot::ReentrantMutex;

#[derive(Debug)]
struct TaggedEntry {
    /// Identifies which write of the key this index row belongs to.
    generation: u64,
    tags: Vec<String>,
}

#[derive(Debug, Default)]
struct TagState {
    by_tag: HashMap<String, HashSet<String>>,
    entries: HashMap<String, TaggedEntry>,
}

impl TagState {
    fn attach(&mut self, key: &str, generation: u64, tags: Vec<String>) {
        for tag in &tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_owned());
        }
        self.entries
            .insert(key.to_owned(), TaggedEntry { generation, tags });
    }

    fn detach(&mut self, key: &str) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        for tag in entry.tags {
            if let Some(keys) = self.by_tag.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(&tag);
                }
            }
        }
    }

    fn detach_generation(&mut self, key: &str, generation: u64) -> bool {
        let current = self.entries.get(key).map(|entry| entry.generation);
        if current == Some(generation) {
            self.detach(key);
            true
        } else {
            false
        }
    }
}

struct TagIndex {
    state: ReentrantMutex<RefCell<TagState>>,
    generations: AtomicU64,
}

impl TagIndex {
    fn on_entry_evicted(&self, key: &str, generation: u64, reason: EvictionReason) {
        // The replacing write already re-indexed the key
        if reason == EvictionReason::Replaced {
            return;
        }
        let guard = self.state.lock();
        if guard.borrow_mut().detach_generation(key, generation) {
            tracing::trace!(key = %key, %reason, "pruned evicted entry from tag index");
        }
    }
}

/// A local store with a tag index.
pub struct TaggedLocalStore<L: LocalStore + ?Sized> {
    store: Arc<L>,
    index: Arc<TagIndex>,
}

impl<L: LocalStore + ?Sized> TaggedLocalStore<L> {
    pub fn new(store: Arc<L>) -> Self {
        Self {
            store,
            index: Arc::new(TagIndex {
                state: ReentrantMutex::new(RefCell::new(TagState::default())),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<L> {
        &self.store
    }

    /// Reads a value without consulting the index.
    pub fn try_get(&self, key: &str) -> Option<LocalValue> {
        self.store.try_get(key)
    }

    /// Stores `entry` under `key`, indexed by `tags`.
    ///
    /// Any tags of the entry being replaced are dropped from the index. If
    /// the store declines the write, the key is removed outright so the
    /// index and the store still agree.
    pub fn set<I, T>(&self, key: &str, entry: LocalEntry, tags: I) -> bool
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        tags.sort_unstable();
        tags.dedup();

        let guard = self.index.state.lock();
        let generation = self.index.generations.fetch_add(1, Ordering::Relaxed);
        let callback = {
            let mut state = guard.borrow_mut();
            state.detach(key);
            if tags.is_empty() {
                None
            } else {
                state.attach(key, generation, tags);
                Some(self.callback(generation))
            }
        };

        let stored = self.store.set(key, entry, callback);
        if !stored {
            self.store.remove(key);
            guard.borrow_mut().detach_generation(key, generation);
        }
        stored
    }

    /// Removes one key and its index rows.
    pub fn remove(&self, key: &str) -> bool {
        let guard = self.index.state.lock();
        guard.borrow_mut().detach(key);
        self.store.remove(key)
    }

    /// Removes every entry carrying `tag`. Returns how many were removed.
    pub fn evict_by_tag(&self, tag: &str) -> usize {
        self.evict_by_tags(std::slice::from_ref(&tag))
    }

    /// Removes every entry carrying at least one of `tags`.
    pub fn evict_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let guard = self.index.state.lock();
        let keys: HashSet<String> = {
            let state = guard.borrow();
            tags.iter()
                .filter_map(|tag| state.by_tag.get(tag.as_ref()))
                .flat_map(|keys| keys.iter().cloned())
                .collect()
        };

        let mut removed = 0;
        for key in &keys {
            guard.borrow_mut().detach(key);
            if self.store.remove(key) {
                removed += 1;
            }
        }
        tracing::debug!(
            tags = tags.len(),
            keys = keys.len(),
            removed,
            "evicted local entries by tag"
        );
        removed
    }

    /// Keys currently indexed under `tag`, sorted.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let guard = self.index.state.lock();
        let state = guard.borrow();
        let mut keys: Vec<String> = state
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of tags with at least one key.
    pub fn tag_count(&self) -> usize {
        let guard = self.index.state.lock();
        let count = guard.borrow().by_tag.len();
        count
    }

    fn callback(&self, generation: u64) -> EvictionCallback {
        let index: Weak<TagIndex> = Arc::downgrade(&self.index);
        Arc::new(move |key: &str, reason: EvictionReason| {
            if let Some(index) = index.upgrade() {
                index.on_entry_evicted(key, generation, reason);
            }
        })
    }
}

impl<L: LocalStore + ?Sized> std::fmt::Debug for TaggedLocalStore<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedLocalStore")
            .field("entries", &self.store.len())
            .field("tags", &self.tag_count())
            .finish()
    }
}
