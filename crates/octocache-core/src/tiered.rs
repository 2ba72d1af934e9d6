//! Tiered read-through cache.
//!
//! ## Read path
//!
//! 1. Local tier. Immutable types are held as shared instances; everything
//!    else is held serialized and decoded on every read.
//! 2. Shared tier, through the buffered or the legacy access path. Which one
//!    is decided once, when the cache is built.
//! 3. On a full miss, the factory runs under the stampede coordinator. The
//!    value is serialized once into a pooled envelope buffer; the body slice
//!    goes to the local tier and the whole envelope to the shared tier.
//!
//! A factory returning `None` means "delete": the key is removed from both
//! tiers and nothing is cached.
//!
//! ## Shared tier faults
//!
//! On the read-through path a failing shared store is logged and counted,
//! and the caller still gets its value. Explicit removals report the fault.
//!
//! ## Tags
//!
//! Tags are written into the shared envelope and into the local tag index.
//! `remove_by_tag` always evicts locally and delegates to the shared store's
//! native invalidation when it has one. A shared store without it keeps its
//! tagged entries until they expire.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::poll_immediate;
use octocache_storage::{
    BackendFeatures, BufferedSharedStore, CacheEntry, DynLocalStore, DynSharedStore, LocalEntry,
    LocalStore, LocalValue, SharedEntryOptions, StorageResult, TagInvalidation,
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;
use crate::error::{CacheError, CacheResult};
use crate::options::{CacheOptions, CallOptions, EntryFlags, EntryOptions};
use crate::serializer::SerializerRegistry;
use crate::stampede::StampedeCoordinator;
use crate::stats::{CacheCounters, CacheStats};
use crate::tags::TaggedLocalStore;

/// A value that can be cached.
///
/// Types reporting `is_immutable() == true` are kept in the local tier as a
/// shared instance and cloned on read. All others are kept serialized.
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct User { id: u64, name: String }
///
/// impl CacheValue for User {}
/// ```
pub trait CacheValue: Clone + Send + Sync + 'static {
    fn is_immutable() -> bool {
        false
    }
}

impl CacheValue for String {
    fn is_immutable() -> bool {
        true
    }
}

impl CacheValue for Vec<u8> {
    fn is_immutable() -> bool {
        true
    }
}

impl CacheValue for Bytes {
    fn is_immutable() -> bool {
        true
    }
}

/// Shared tier access, resolved once from the backend's capabilities.
struct SharedTier {
    legacy: DynSharedStore,
    buffered: Option<Arc<dyn BufferedSharedStore>>,
    tags: Option<Arc<dyn TagInvalidation>>,
    features: BackendFeatures,
}

impl SharedTier {
    fn probe(store: DynSharedStore) -> Self {
        let buffered = Arc::clone(&store).buffered();
        let tags = Arc::clone(&store).tag_invalidation();
        let features = BackendFeatures {
            buffered: buffered.is_some(),
            tag_invalidation: tags.is_some(),
        };
        tracing::debug!(
            backend = store.backend_name(),
            buffered = features.buffered,
            tag_invalidation = features.tag_invalidation,
            "shared tier capabilities resolved"
        );
        Self {
            legacy: store,
            buffered,
            tags,
            features,
        }
    }

    /// Fetches the raw envelope for `key`.
    async fn fetch(
        &self,
        key: &str,
        buffers: &BufferPool,
        counters: &CacheCounters,
    ) -> StorageResult<Option<Bytes>> {
        match &self.buffered {
            Some(buffered) => {
                let mut buf = buffers.rent();
                let found = complete(buffered.try_get_into(key, &mut buf), counters).await?;
                Ok(found.then(|| buf.split().freeze()))
            }
            None => Ok(complete(self.legacy.get(key), counters)
                .await?
                .map(Bytes::from)),
        }
    }

    async fn store(
        &self,
        key: &str,
        envelope: Bytes,
        options: &SharedEntryOptions,
    ) -> StorageResult<()> {
        match &self.buffered {
            Some(buffered) => buffered.set_bytes(key, envelope, options).await,
            None => self.legacy.set(key, &envelope, options).await,
        }
    }
}

/// Awaits a shared-tier call, skipping the suspension when it is already done.
async fn complete<F: Future>(future: F, counters: &CacheCounters) -> F::Output {
    let mut future = std::pin::pin!(future);
    if let Some(output) = poll_immediate(future.as_mut()).await {
        counters.shared_completed_sync();
        return output;
    }
    future.await
}

struct Inner {
    local: TaggedLocalStore<dyn LocalStore>,
    shared: Option<SharedTier>,
    serializers: SerializerRegistry,
    stampede: StampedeCoordinator,
    buffers: BufferPool,
    options: CacheOptions,
    counters: CacheCounters,
}

/// Read-through cache over a local and an optional shared tier.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

impl TieredCache {
    /// Starts building a cache over `local`.
    pub fn builder(local: DynLocalStore) -> TieredCacheBuilder {
        TieredCacheBuilder {
            local,
            shared: None,
            serializers: SerializerRegistry::new(),
            options: CacheOptions::default(),
            buffers: BufferPool::default(),
        }
    }

    /// Looks `key` up in the tiers without invoking any factory.
    ///
    /// Returns `Ok(None)` on a miss.
    pub async fn get<T: CacheValue>(
        &self,
        key: &str,
        options: &CallOptions,
    ) -> CacheResult<Option<T>> {
        validate_key(key)?;
        if !self.inner.is_cacheable(key) {
            return Ok(None);
        }
        let entry = self.inner.entry_options(options.entry.as_ref());

        if let Some(value) = self.inner.read_local::<T>(key, entry)? {
            return Ok(Some(value));
        }
        let shared = with_cancellation(
            key,
            options.cancellation.as_ref(),
            self.inner.read_shared::<T>(key, entry),
        )
        .await??;
        if shared.is_none() {
            self.inner.counters.miss();
            tracing::debug!(key = %key, "cache miss");
        }
        Ok(shared)
    }

    /// Stores `value` in both tiers.
    pub async fn set<T: CacheValue>(
        &self,
        key: &str,
        value: &T,
        options: &CallOptions,
    ) -> CacheResult<()> {
        validate_key(key)?;
        validate_tags(&options.tags)?;
        if !self.inner.is_cacheable(key) {
            return Ok(());
        }
        let entry = self.inner.entry_options(options.entry.as_ref());
        self.inner.store_value(key, value, entry, &options.tags).await
    }

    /// Returns the cached value for `key`, producing it with `factory` on a
    /// miss.
    ///
    /// Concurrent calls for the same key share one factory run. The factory
    /// receives `state` and a token that fires once every caller waiting on
    /// the run has gone away. A factory result of `None` removes `key` from
    /// both tiers.
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidKey`] / [`CacheError::InvalidTag`] for bad input.
    /// - [`CacheError::TypeMismatch`] if `key` is cached or in flight as
    ///   another type.
    /// - [`CacheError::Factory`] / [`CacheError::FactoryPanicked`] when the
    ///   factory fails; every waiter sees the same error.
    /// - [`CacheError::Cancelled`] when this caller's token fires.
    pub async fn get_or_create<T, S, F, Fut>(
        &self,
        key: &str,
        state: S,
        factory: F,
        options: &CallOptions,
    ) -> CacheResult<Option<T>>
    where
        T: CacheValue,
        S: Send + 'static,
        F: FnOnce(S, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        validate_key(key)?;
        validate_tags(&options.tags)?;
        let entry = self.inner.entry_options(options.entry.as_ref());

        if !self.inner.is_cacheable(key) {
            if entry.has(EntryFlags::DISABLE_UNDERLYING_DATA) {
                return Ok(None);
            }
            let token = options.cancellation.clone().unwrap_or_default();
            self.inner.counters.factory_invoked();
            return factory(state, token)
                .await
                .map_err(|e| CacheError::factory(key, e));
        }

        if let Some(value) = self.inner.read_local::<T>(key, entry)? {
            return Ok(Some(value));
        }

        if entry.has(EntryFlags::DISABLE_UNDERLYING_DATA) {
            let shared = with_cancellation(
                key,
                options.cancellation.as_ref(),
                self.inner.read_shared::<T>(key, entry),
            )
            .await??;
            if shared.is_none() {
                self.inner.counters.miss();
            }
            return Ok(shared);
        }

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_owned();
        let call_entry = options.entry.clone();
        let tags = options.tags.clone();
        self.inner
            .stampede
            .run_or_join::<Option<T>, _, _>(key, options.cancellation.as_ref(), move |token| {
                async move {
                    let entry = inner.entry_options(call_entry.as_ref());
                    inner
                        .populate(&owned_key, state, factory, entry, &tags, token)
                        .await
                }
            })
            .await
    }

    /// Removes `key` from both tiers.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        validate_key(key)?;
        self.inner.local.remove(key);
        if let Some(shared) = &self.inner.shared {
            shared.legacy.remove(key).await?;
        }
        Ok(())
    }

    /// Removes every key in `keys` from both tiers.
    ///
    /// All keys are attempted; the first shared-tier error is returned.
    pub async fn remove_many<I, K>(&self, keys: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        for key in &keys {
            validate_key(key.as_ref())?;
        }

        let mut first_error = None;
        for key in &keys {
            let key = key.as_ref();
            self.inner.local.remove(key);
            if let Some(shared) = &self.inner.shared {
                if let Err(e) = shared.legacy.remove(key).await {
                    tracing::warn!(key = %key, error = %e, "shared remove failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Removes every entry tagged with `tag`. See [`remove_by_tags`](Self::remove_by_tags).
    pub async fn remove_by_tag(&self, tag: &str) -> CacheResult<usize> {
        self.remove_by_tags(&[tag]).await
    }

    /// Removes every entry carrying at least one of `tags`.
    ///
    /// Returns the number of local entries evicted. Shared entries are
    /// removed only when the shared store supports tag invalidation.
    pub async fn remove_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> CacheResult<usize> {
        let tags: Vec<String> = tags.iter().map(|tag| tag.as_ref().to_owned()).collect();
        validate_tags(&tags)?;

        let evicted = self.inner.local.evict_by_tags(&tags);
        match self.inner.shared.as_ref() {
            Some(SharedTier {
                tags: Some(invalidation),
                ..
            }) => invalidation.remove_by_tags(&tags).await?,
            Some(shared) => {
                tracing::debug!(
                    backend = shared.legacy.backend_name(),
                    "shared tier has no tag invalidation, evicted local entries only"
                );
            }
            None => {}
        }
        Ok(evicted)
    }

    pub fn stats(&self) -> CacheStats {
        let stampede = &self.inner.stampede;
        self.inner
            .counters
            .snapshot(stampede.joined(), stampede.in_flight())
    }

    /// Capabilities of the shared tier, if there is one.
    pub fn shared_features(&self) -> Option<BackendFeatures> {
        self.inner.shared.as_ref().map(|shared| shared.features)
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Keys the local tag index lists under `tag`.
    pub fn local_keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.inner.local.keys_for_tag(tag)
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("local", &self.inner.local)
            .field("shared", &self.shared_features())
            .field("in_flight", &self.inner.stampede.in_flight())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl Inner {
    /// The call's entry options, or the cache-wide defaults.
    fn entry_options<'a>(&'a self, entry: Option<&'a EntryOptions>) -> &'a EntryOptions {
        entry.unwrap_or(&self.options.default_entry)
    }

    fn is_cacheable(&self, key: &str) -> bool {
        if key.len() > self.options.maximum_key_length {
            tracing::warn!(
                key_length = key.len(),
                maximum = self.options.maximum_key_length,
                "key too long, bypassing cache"
            );
            return false;
        }
        true
    }

    fn read_local<T: CacheValue>(&self, key: &str, entry: &EntryOptions) -> CacheResult<Option<T>> {
        if entry.has(EntryFlags::DISABLE_LOCAL_READ) {
            return Ok(None);
        }
        let Some(stored) = self.local.try_get(key) else {
            return Ok(None);
        };
        if !stored.holds::<T>() {
            return Err(CacheError::TypeMismatch {
                key: key.to_owned(),
                expected: std::any::type_name::<T>(),
                actual: stored.type_name().unwrap_or("a different cached type"),
            });
        }
        let value = match stored {
            LocalValue::Object(object) => {
                let Ok(value) = object.downcast::<T>() else {
                    return Ok(None);
                };
                T::clone(&value)
            }
            LocalValue::Bytes { body, .. } => {
                let serializer = self.serializers.resolve::<T>()?;
                match serializer.deserialize(&body) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "dropping undecodable local entry");
                        self.local.remove(key);
                        return Ok(None);
                    }
                }
            }
        };
        self.counters.local_hit();
        tracing::debug!(key = %key, "local hit");
        Ok(Some(value))
    }

    /// Reads `key` from the shared tier and copies a hit into the local tier.
    async fn read_shared<T: CacheValue>(
        &self,
        key: &str,
        entry: &EntryOptions,
    ) -> CacheResult<Option<T>> {
        let Some(shared) = &self.shared else {
            return Ok(None);
        };
        if entry.has(EntryFlags::DISABLE_SHARED_READ) {
            return Ok(None);
        }
        let serializer = self.serializers.resolve::<T>()?;

        let payload = match shared.fetch(key, &self.buffers, &self.counters).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.counters.shared_fault();
                tracing::warn!(key = %key, error = %e, "shared get failed, treating as miss");
                return Ok(None);
            }
        };

        let decoded = CacheEntry::decode(payload)
            .map_err(|e| e.to_string())
            .and_then(|stored| {
                serializer
                    .deserialize(&stored.body)
                    .map(|value| (value, stored))
                    .map_err(|e| e.to_string())
            });
        let (value, stored) = match decoded {
            Ok(decoded) => decoded,
            Err(message) => {
                self.counters.corrupt_payload();
                tracing::warn!(key = %key, error = %message, "corrupt shared payload, removing");
                if let Err(e) = shared.legacy.remove(key).await {
                    self.counters.shared_fault();
                    tracing::warn!(key = %key, error = %e, "shared remove failed");
                }
                return Ok(None);
            }
        };

        self.counters.shared_hit();
        tracing::debug!(key = %key, "shared hit");
        self.write_local(key, &value, &stored.body, &stored.tags, entry);
        Ok(Some(value))
    }

    /// Body of a stampede run: shared lookup, factory, then both tier writes.
    async fn populate<T, S, F, Fut>(
        &self,
        key: &str,
        state: S,
        factory: F,
        entry: &EntryOptions,
        tags: &[String],
        token: CancellationToken,
    ) -> CacheResult<Option<T>>
    where
        T: CacheValue,
        F: FnOnce(S, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        if let Some(value) = self.read_shared::<T>(key, entry).await? {
            return Ok(Some(value));
        }

        self.counters.miss();
        self.counters.factory_invoked();
        tracing::debug!(key = %key, "cache miss, running factory");
        let produced = factory(state, token)
            .await
            .map_err(|e| CacheError::factory(key, e))?;

        match produced {
            Some(value) => {
                self.store_value(key, &value, entry, tags).await?;
                Ok(Some(value))
            }
            None => {
                self.discard(key, entry).await;
                Ok(None)
            }
        }
    }

    /// Serializes `value` once and writes it to both tiers.
    async fn store_value<T: CacheValue>(
        &self,
        key: &str,
        value: &T,
        entry: &EntryOptions,
        tags: &[String],
    ) -> CacheResult<()> {
        let serializer = self.serializers.resolve::<T>()?;
        let tags: BTreeSet<String> = tags.iter().cloned().collect();

        let (envelope, header_len) = {
            let mut buf = self.buffers.rent();
            let header_len =
                CacheEntry::write_header(&mut buf, OffsetDateTime::now_utc(), 0, &tags)?;
            serializer.serialize(value, &mut buf)?;
            (buf.split().freeze(), header_len)
        };
        let body = envelope.slice(header_len..);

        if body.len() > self.options.maximum_payload_bytes {
            self.counters.oversized_payload();
            tracing::warn!(
                key = %key,
                size = body.len(),
                maximum = self.options.maximum_payload_bytes,
                "payload too large, not caching"
            );
            return Ok(());
        }

        self.write_local(key, value, &body, &tags, entry);

        if let Some(shared) = &self.shared {
            if !entry.has(EntryFlags::DISABLE_SHARED_WRITE) {
                if let Err(e) = shared.store(key, envelope, entry.shared_options()).await {
                    self.counters.shared_fault();
                    tracing::warn!(key = %key, error = %e, "shared set failed");
                }
            }
        }
        Ok(())
    }

    fn write_local<T: CacheValue>(
        &self,
        key: &str,
        value: &T,
        body: &Bytes,
        tags: &BTreeSet<String>,
        entry: &EntryOptions,
    ) {
        if entry.has(EntryFlags::DISABLE_LOCAL_WRITE) {
            return;
        }
        let local_value = if T::is_immutable() {
            LocalValue::Object(Arc::new(value.clone()))
        } else {
            LocalValue::serialized::<T>(body.clone())
        };
        let local_entry = LocalEntry::new(local_value, entry.local_expiration(), body.len());
        if !self.local.set(key, local_entry, tags.iter().cloned()) {
            tracing::debug!(key = %key, "local tier declined entry");
        }
    }

    /// Handles a factory that produced nothing: the key is deleted everywhere.
    async fn discard(&self, key: &str, entry: &EntryOptions) {
        self.local.remove(key);
        let Some(shared) = &self.shared else {
            return;
        };
        if entry.has(EntryFlags::DISABLE_SHARED_WRITE) {
            return;
        }
        if let Err(e) = shared.legacy.remove(key).await {
            self.counters.shared_fault();
            tracing::warn!(key = %key, error = %e, "shared remove after empty factory result failed");
        }
    }
}

/// Builder for [`TieredCache`].
pub struct TieredCacheBuilder {
    local: DynLocalStore,
    shared: Option<DynSharedStore>,
    serializers: SerializerRegistry,
    options: CacheOptions,
    buffers: BufferPool,
}

impl TieredCacheBuilder {
    #[must_use]
    pub fn shared_store(mut self, shared: DynSharedStore) -> Self {
        self.shared = Some(shared);
        self
    }

    #[must_use]
    pub fn serializers(mut self, serializers: SerializerRegistry) -> Self {
        self.serializers = serializers;
        self
    }

    #[must_use]
    pub fn options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn buffer_pool(mut self, max_retained: usize, max_buffer_bytes: usize) -> Self {
        self.buffers = BufferPool::new(max_retained, max_buffer_bytes);
        self
    }

    pub fn build(self) -> TieredCache {
        TieredCache {
            inner: Arc::new(Inner {
                local: TaggedLocalStore::new(self.local),
                shared: self.shared.map(SharedTier::probe),
                serializers: self.serializers,
                stampede: StampedeCoordinator::new(),
                buffers: self.buffers,
                options: self.options,
                counters: CacheCounters::default(),
            }),
        }
    }
}

fn validate_key(key: &str) -> CacheResult<()> {
    if key.trim().is_empty() {
        return Err(CacheError::invalid_key("key must not be empty or whitespace"));
    }
    Ok(())
}

fn validate_tags(tags: &[String]) -> CacheResult<()> {
    match tags.iter().find(|tag| tag.trim().is_empty()) {
        Some(tag) => Err(CacheError::invalid_tag(
            tag.as_str(),
            "tag must not be empty or whitespace",
        )),
        None => Ok(()),
    }
}

async fn with_cancellation<F: Future>(
    key: &str,
    token: Option<&CancellationToken>,
    future: F,
) -> CacheResult<F::Output> {
    match token {
        None => Ok(future.await),
        Some(token) => {
            tokio::select! {
                biased;
                output = future => Ok(output),
                () = token.cancelled() => Err(CacheError::cancelled(key)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializerFactory;
    use octocache_db_memory::{InMemoryLocalStore, InMemorySharedStore, SharedStoreOptions};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    impl CacheValue for User {}

    struct Fixture {
        cache: TieredCache,
        local: Arc<InMemoryLocalStore>,
        shared: Arc<InMemorySharedStore>,
    }

    fn fixture_with(shared: SharedStoreOptions, options: CacheOptions) -> Fixture {
        let local = Arc::new(InMemoryLocalStore::new());
        let shared = Arc::new(InMemorySharedStore::with_options(shared));
        let cache = cache_over(local.clone(), shared.clone(), options);
        Fixture {
            cache,
            local,
            shared,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SharedStoreOptions::buffered(), CacheOptions::default())
    }

    fn cache_over(
        local: Arc<InMemoryLocalStore>,
        shared: Arc<InMemorySharedStore>,
        options: CacheOptions,
    ) -> TieredCache {
        TieredCache::builder(local)
            .shared_store(shared)
            .serializers(
                SerializerRegistry::new().with_factory(JsonSerializerFactory::new().with_type::<User>()),
            )
            .options(options)
            .build()
    }

    async fn produce<T>(calls: Arc<AtomicUsize>, value: Option<T>) -> anyhow::Result<Option<T>> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }

    fn ann() -> User {
        User {
            id: 42,
            name: "Ann".into(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_populates_both_tiers() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CallOptions::new().with_tags(["users"]);

        let first: Option<User> = f
            .cache
            .get_or_create("user:42", calls.clone(), |c, _| produce(c, Some(ann())), &options)
            .await
            .unwrap();
        let second: Option<User> = f
            .cache
            .get_or_create("user:42", calls.clone(), |c, _| produce(c, Some(ann())), &options)
            .await
            .unwrap();

        assert_eq!(first, Some(ann()));
        assert_eq!(second, Some(ann()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(f.shared.contains("user:42"));
        assert_eq!(f.cache.local_keys_for_tag("users"), vec!["user:42".to_string()]);

        let stats = f.cache.stats();
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.factory_invocations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_shared_hit_through_both_access_paths() {
        for (mode, buffered) in [
            (SharedStoreOptions::buffered(), true),
            (SharedStoreOptions::legacy(), false),
        ] {
            let f = fixture_with(mode, CacheOptions::default());
            assert_eq!(f.cache.shared_features().map(|x| x.buffered), Some(buffered));
            f.cache
                .set("user:42", &ann(), &CallOptions::new().with_tags(["users"]))
                .await
                .unwrap();

            // A second node with a cold local tier
            let other = cache_over(
                Arc::new(InMemoryLocalStore::new()),
                f.shared.clone(),
                CacheOptions::default(),
            );
            let value: Option<User> = other.get("user:42", &CallOptions::new()).await.unwrap();
            assert_eq!(value, Some(ann()));
            assert_eq!(other.stats().shared_hits, 1);
            // The envelope's tags follow the value into the local tier
            assert_eq!(other.local_keys_for_tag("users"), vec!["user:42".to_string()]);

            let shared_stats = f.shared.stats();
            if buffered {
                assert_eq!(shared_stats.buffered_gets, 1);
                assert_eq!(shared_stats.gets, 0);
            } else {
                assert_eq!(shared_stats.buffered_gets, 0);
                assert_eq!(shared_stats.gets, 1);
            }

            let again: Option<User> = other.get("user:42", &CallOptions::new()).await.unwrap();
            assert_eq!(again, Some(ann()));
            assert_eq!(other.stats().local_hits, 1);
        }
    }

    #[tokio::test]
    async fn test_immediate_shared_completion_counted() {
        let f = fixture();
        let _: Option<String> = f.cache.get("missing", &CallOptions::new()).await.unwrap();
        assert_eq!(f.cache.stats().shared_sync_completions, 1);
    }

    #[test]
    fn test_immediate_shared_read_never_suspends() {
        let f = fixture();
        let options = CallOptions::new();
        let mut get = tokio_test::task::spawn(f.cache.get::<User>("missing", &options));
        let value = tokio_test::assert_ready_ok!(get.poll());
        assert_eq!(value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_shared_completion_not_counted() {
        let f = fixture_with(
            SharedStoreOptions::buffered().with_latency(Duration::from_millis(20)),
            CacheOptions::default(),
        );
        let _: Option<String> = f.cache.get("missing", &CallOptions::new()).await.unwrap();
        let stats = f.cache.stats();
        assert_eq!(stats.shared_sync_completions, 0);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_honours_cancellation() {
        let f = fixture_with(
            SharedStoreOptions::buffered().with_latency(Duration::from_secs(1)),
            CacheOptions::default(),
        );
        let token = CancellationToken::new();
        token.cancel();
        let result: CacheResult<Option<String>> = f
            .cache
            .get("k", &CallOptions::new().with_cancellation(token))
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_factory_result_deletes_everywhere() {
        let f = fixture();
        f.cache
            .set("user:42", &ann(), &CallOptions::new())
            .await
            .unwrap();
        assert!(f.shared.contains("user:42"));

        let reload = CallOptions::new().with_entry(
            EntryOptions::default()
                .with_flags(EntryFlags::DISABLE_LOCAL_READ | EntryFlags::DISABLE_SHARED_READ),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let value: Option<User> = f
            .cache
            .get_or_create("user:42", calls.clone(), |c, _| produce(c, None), &reload)
            .await
            .unwrap();

        assert_eq!(value, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!f.shared.contains("user:42"));
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_payload_returned_but_not_cached() {
        let f = fixture_with(
            SharedStoreOptions::buffered(),
            CacheOptions {
                maximum_payload_bytes: 8,
                ..CacheOptions::default()
            },
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let big = "x".repeat(64);

        for _ in 0..2 {
            let value: Option<String> = f
                .cache
                .get_or_create("big", calls.clone(), |c, _| produce(c, Some("x".repeat(64))), &CallOptions::new())
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some(big.as_str()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(f.local.is_empty());
        assert!(f.shared.is_empty());
        assert_eq!(f.cache.stats().oversized_payloads, 2);
    }

    #[tokio::test]
    async fn test_long_key_bypasses_cache() {
        let f = fixture_with(
            SharedStoreOptions::buffered(),
            CacheOptions {
                maximum_key_length: 8,
                ..CacheOptions::default()
            },
        );
        let key = "k".repeat(20);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let value: Option<String> = f
                .cache
                .get_or_create(&key, calls.clone(), |c, _| produce(c, Some("v".to_string())), &CallOptions::new())
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("v"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        f.cache
            .set(&key, &"v".to_string(), &CallOptions::new())
            .await
            .unwrap();
        let value: Option<String> = f.cache.get(&key, &CallOptions::new()).await.unwrap();
        assert_eq!(value, None);
        assert!(f.local.is_empty());
        assert!(f.shared.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key_and_tag_rejected() {
        let f = fixture();

        let err = f
            .cache
            .get::<String>("   ", &CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));

        let err = f
            .cache
            .set("k", &"v".to_string(), &CallOptions::new().with_tags(["ok", " "]))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidTag { .. }));

        let err = f.cache.remove_by_tag("").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidTag { .. }));
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_shared_payload_is_a_miss() {
        let f = fixture();
        f.shared.insert_raw("user:42", &b"not an envelope"[..]);

        let value: Option<User> = f.cache.get("user:42", &CallOptions::new()).await.unwrap();
        assert_eq!(value, None);
        assert!(!f.shared.contains("user:42"));

        let stats = f.cache.stats();
        assert_eq!(stats.corrupt_payloads, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_shared_faults_do_not_fail_reads() {
        let f = fixture();
        f.shared.set_available(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let value: Option<User> = f
            .cache
            .get_or_create("user:42", calls.clone(), |c, _| produce(c, Some(ann())), &CallOptions::new())
            .await
            .unwrap();
        assert_eq!(value, Some(ann()));
        // Failed read, then failed write
        assert_eq!(f.cache.stats().shared_faults, 2);

        let again: Option<User> = f.cache.get("user:42", &CallOptions::new()).await.unwrap();
        assert_eq!(again, Some(ann()));
        assert_eq!(f.cache.stats().local_hits, 1);

        let err = f.cache.remove("user:42").await.unwrap_err();
        assert!(matches!(err, CacheError::Storage(_)));
    }

    #[tokio::test]
    async fn test_remove_by_tag_uses_shared_invalidation() {
        let f = fixture_with(SharedStoreOptions::buffered().with_tags(), CacheOptions::default());
        let tagged = CallOptions::new().with_tags(["users"]);
        f.cache.set("a", &ann(), &tagged).await.unwrap();
        f.cache.set("b", &ann(), &tagged).await.unwrap();
        f.cache.set("c", &ann(), &CallOptions::new()).await.unwrap();

        assert_eq!(f.cache.remove_by_tag("users").await.unwrap(), 2);
        assert!(!f.shared.contains("a"));
        assert!(!f.shared.contains("b"));
        assert!(f.shared.contains("c"));
        assert_eq!(f.shared.stats().tag_removals, 1);

        let gone: Option<User> = f.cache.get("a", &CallOptions::new()).await.unwrap();
        assert_eq!(gone, None);
    }

    #[tokio::test]
    async fn test_remove_by_tag_without_shared_support_is_local_only() {
        let f = fixture();
        f.cache
            .set("a", &ann(), &CallOptions::new().with_tags(["users"]))
            .await
            .unwrap();

        assert_eq!(f.cache.remove_by_tag("users").await.unwrap(), 1);
        assert!(f.local.is_empty());
        assert!(f.shared.contains("a"));
    }

    #[tokio::test]
    async fn test_remove_and_remove_many() {
        let f = fixture();
        for key in ["a", "b", "c"] {
            f.cache
                .set(key, &key.to_string(), &CallOptions::new())
                .await
                .unwrap();
        }

        f.cache.remove("a").await.unwrap();
        assert!(!f.shared.contains("a"));
        f.cache.remove_many(["b", "c"]).await.unwrap();
        assert!(f.shared.is_empty());
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn test_disable_underlying_data_never_runs_factory() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CallOptions::new()
            .with_entry(EntryOptions::default().with_flags(EntryFlags::DISABLE_UNDERLYING_DATA));

        let value: Option<User> = f
            .cache
            .get_or_create("user:42", calls.clone(), |c, _| produce(c, Some(ann())), &options)
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        f.cache.set("user:42", &ann(), &CallOptions::new()).await.unwrap();
        let value: Option<User> = f
            .cache
            .get_or_create("user:42", calls.clone(), |c, _| produce(c, Some(ann())), &options)
            .await
            .unwrap();
        assert_eq!(value, Some(ann()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_underlying_data_honours_cancellation() {
        let f = fixture_with(
            SharedStoreOptions::buffered().with_latency(Duration::from_secs(3600)),
            CacheOptions::default(),
        );
        let token = CancellationToken::new();
        token.cancel();
        let options = CallOptions::new()
            .with_entry(EntryOptions::default().with_flags(EntryFlags::DISABLE_UNDERLYING_DATA))
            .with_cancellation(token);

        let started = tokio::time::Instant::now();
        let err = f
            .cache
            .get_or_create::<User, _, _, _>(
                "user:42",
                (),
                |_, _| async { Ok(Some(ann())) },
                &options,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unbounded_expiration_is_cached() {
        let f = fixture();
        let forever = CallOptions::new().with_entry(EntryOptions::new(Duration::MAX));
        f.cache.set("user:42", &ann(), &forever).await.unwrap();
        assert!(f.shared.contains("user:42"));

        let value: Option<User> = f.cache.get("user:42", &CallOptions::new()).await.unwrap();
        assert_eq!(value, Some(ann()));
        assert_eq!(f.cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_unbounded_default_expiration_runs_factory_once() {
        let f = fixture_with(
            SharedStoreOptions::buffered(),
            CacheOptions {
                default_entry: EntryOptions::new(Duration::from_secs(u64::MAX)),
                ..CacheOptions::default()
            },
        );
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let value: Option<User> = f
                .cache
                .get_or_create(
                    "user:42",
                    calls.clone(),
                    |c, _| produce(c, Some(ann())),
                    &CallOptions::new(),
                )
                .await
                .unwrap();
            assert_eq!(value, Some(ann()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(f.shared.contains("user:42"));
    }

    #[tokio::test]
    async fn test_default_entry_options_are_reused() {
        let f = fixture();
        assert!(std::ptr::eq(
            f.cache.inner.entry_options(None),
            &f.cache.options().default_entry
        ));

        let _: Option<User> = f
            .cache
            .get_or_create("user:42", (), |_, _| async { Ok(Some(ann())) }, &CallOptions::new())
            .await
            .unwrap();
        assert!(f.cache.options().default_entry.is_shared_resolved());
    }

    #[tokio::test]
    async fn test_tier_bypass_flags() {
        let f = fixture();
        let local_only = CallOptions::new()
            .with_entry(EntryOptions::default().with_flags(EntryFlags::DISABLE_SHARED));
        f.cache.set("l", &ann(), &local_only).await.unwrap();
        assert!(!f.shared.contains("l"));
        assert_eq!(f.local.len(), 1);

        let shared_only = CallOptions::new()
            .with_entry(EntryOptions::default().with_flags(EntryFlags::DISABLE_LOCAL));
        f.cache.set("s", &ann(), &shared_only).await.unwrap();
        assert!(f.shared.contains("s"));
        assert_eq!(f.local.len(), 1);

        let value: Option<User> = f.cache.get("s", &shared_only).await.unwrap();
        assert_eq!(value, Some(ann()));
        assert_eq!(f.local.len(), 1);
    }

    #[tokio::test]
    async fn test_immutable_values_shared_by_instance() {
        let f = fixture();
        f.cache
            .set("greeting", &"hello".to_string(), &CallOptions::new())
            .await
            .unwrap();
        assert!(matches!(f.local.try_get("greeting"), Some(LocalValue::Object(_))));

        f.cache.set("user:42", &ann(), &CallOptions::new()).await.unwrap();
        assert!(matches!(f.local.try_get("user:42"), Some(LocalValue::Bytes { .. })));
    }

    #[tokio::test]
    async fn test_reading_with_wrong_type_fails() {
        let f = fixture();
        f.cache
            .set("greeting", &"hello".to_string(), &CallOptions::new())
            .await
            .unwrap();

        let err = f
            .cache
            .get::<Vec<u8>>("greeting", &CallOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_type_mismatch());
    }

    #[tokio::test]
    async fn test_reading_serialized_entry_with_wrong_type_fails() {
        let f = fixture();
        f.cache.set("user:42", &ann(), &CallOptions::new()).await.unwrap();

        let err = f
            .cache
            .get::<Vec<u8>>("user:42", &CallOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_type_mismatch());
        assert!(err.to_string().contains("User"));

        let err = f
            .cache
            .get::<String>("user:42", &CallOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_type_mismatch());

        // The entry itself is left alone
        assert_eq!(f.local.len(), 1);
        let value: Option<User> = f.cache.get("user:42", &CallOptions::new()).await.unwrap();
        assert_eq!(value, Some(ann()));
    }

    #[tokio::test]
    async fn test_missing_serializer_reported() {
        let cache = TieredCache::builder(Arc::new(InMemoryLocalStore::new()))
            .serializers(SerializerRegistry::empty())
            .build();
        let err = cache
            .set("k", &"v".to_string(), &CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SerializerMissing { .. }));
    }

    #[tokio::test]
    async fn test_factory_error_surfaces() {
        let f = fixture();
        let err = f
            .cache
            .get_or_create::<User, _, _, _>(
                "user:42",
                (),
                |_, _| async { Err(anyhow::anyhow!("database down")) },
                &CallOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.factory_error().map(ToString::to_string).as_deref(),
            Some("database down")
        );
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn test_local_only_cache() {
        let local = Arc::new(InMemoryLocalStore::new());
        let cache = TieredCache::builder(local.clone()).build();
        assert!(cache.shared_features().is_none());

        cache
            .set("k", &"v".to_string(), &CallOptions::new())
            .await
            .unwrap();
        let value: Option<String> = cache.get("k", &CallOptions::new()).await.unwrap();
        assert_eq!(value.as_deref(), Some("v"));

        cache.remove("k").await.unwrap();
        assert!(local.is_empty());
    }
}
