pub mod config;
pub mod demo;
pub mod stampede;

use std::time::Duration;

use octocache_core::{
    CacheSettings, JsonSerializerFactory, SerializerRegistry, SharedAccessMode, TieredCache,
};
use octocache_db_memory::{
    LocalStoreOptions, MemoryBackendConfig, SharedBackend, SharedStoreOptions, create_local_store,
};
use octocache_storage::DynSharedStore;

use demo::User;

/// Maps the config file onto the in-memory backends.
pub fn backend_config(settings: &CacheSettings) -> MemoryBackendConfig {
    let mut shared = match settings.shared.mode {
        SharedAccessMode::Legacy => SharedStoreOptions::legacy(),
        SharedAccessMode::Buffered => SharedStoreOptions::buffered(),
    };
    if settings.shared.tags {
        shared = shared.with_tags();
    }
    if let Some(ms) = settings.shared.latency_ms {
        shared = shared.with_latency(Duration::from_millis(ms));
    }
    MemoryBackendConfig {
        local: LocalStoreOptions {
            max_total_bytes: settings.local.max_total_bytes,
        },
        shared_backend: if settings.shared.enabled {
            SharedBackend::InMemory
        } else {
            SharedBackend::None
        },
        shared,
    }
}

/// Builds a cache node with a fresh local tier over `shared`.
pub fn build_node(
    settings: &CacheSettings,
    backend: &MemoryBackendConfig,
    shared: Option<DynSharedStore>,
) -> TieredCache {
    let mut builder = TieredCache::builder(create_local_store(backend))
        .serializers(
            SerializerRegistry::new().with_factory(JsonSerializerFactory::new().with_type::<User>()),
        )
        .options(settings.cache_options())
        .buffer_pool(
            settings.buffer_pool.max_retained,
            settings.buffer_pool.max_buffer_bytes,
        );
    if let Some(shared) = shared {
        builder = builder.shared_store(shared);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use octocache_db_memory::{SharedStoreMode, create_shared_store};

    #[test]
    fn test_backend_config_follows_settings() {
        let mut settings = CacheSettings::default();
        settings.shared.mode = SharedAccessMode::Legacy;
        settings.shared.tags = true;
        settings.shared.latency_ms = Some(5);
        settings.local.max_total_bytes = Some(4096);

        let backend = backend_config(&settings);
        assert_eq!(backend.shared.mode, SharedStoreMode::Legacy);
        assert!(backend.shared.tags_enabled);
        assert_eq!(backend.shared.latency, Some(Duration::from_millis(5)));
        assert_eq!(backend.local.max_total_bytes, Some(4096));
        assert_eq!(backend.shared_backend, SharedBackend::InMemory);
    }

    #[test]
    fn test_disabled_shared_tier_builds_local_only_node() {
        let mut settings = CacheSettings::default();
        settings.shared.enabled = false;

        let backend = backend_config(&settings);
        let shared = create_shared_store(&backend);
        assert!(shared.is_none());

        let node = build_node(&settings, &backend, shared);
        assert!(node.shared_features().is_none());
    }
}
