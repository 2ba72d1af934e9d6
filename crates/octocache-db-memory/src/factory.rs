use std::sync::Arc;

use octocache_storage::{DynLocalStore, DynSharedStore};

use crate::{InMemoryLocalStore, InMemorySharedStore, LocalStoreOptions, SharedStoreOptions};

/// Supported shared tier backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedBackend {
    /// No shared tier; the cache runs local-only.
    None,
    /// In-process stand-in for a distributed store.
    #[default]
    InMemory,
}

/// Factory configuration for the in-memory tiers.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackendConfig {
    pub local: LocalStoreOptions,
    pub shared_backend: SharedBackend,
    pub shared: SharedStoreOptions,
}

/// Creates the local tier store.
pub fn create_local_store(config: &MemoryBackendConfig) -> DynLocalStore {
    Arc::new(InMemoryLocalStore::with_options(config.local.clone()))
}

/// Creates the shared tier store, or `None` when the cache is local-only.
pub fn create_shared_store(config: &MemoryBackendConfig) -> Option<DynSharedStore> {
    match config.shared_backend {
        SharedBackend::None => None,
        SharedBackend::InMemory => {
            let store: DynSharedStore =
                Arc::new(InMemorySharedStore::with_options(config.shared.clone()));
            Some(store)
        }
    }
}
