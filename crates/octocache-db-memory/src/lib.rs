//! In-memory tier stores for octocache.
//!
//! This crate provides implementations of the `LocalStore`, `SharedStore`,
//! `BufferedSharedStore`, and `TagInvalidation` contracts from
//! `octocache-storage`, using `DashMap` for concurrent access.
//!
//! # Example
//!
//! ```ignore
//! use octocache_db_memory::{InMemorySharedStore, SharedStoreOptions};
//! use octocache_storage::{SharedEntryOptions, SharedStore};
//!
//! let shared = InMemorySharedStore::with_options(SharedStoreOptions::legacy().with_tags());
//! shared.set("user:42", b"...", &SharedEntryOptions::default()).await?;
//! ```

pub mod factory;
pub mod local;
pub mod shared;

pub use factory::{MemoryBackendConfig, SharedBackend, create_local_store, create_shared_store};
pub use local::{InMemoryLocalStore, LocalStoreOptions};
pub use shared::{InMemorySharedStore, SharedStoreMode, SharedStoreOptions, SharedStoreStats};

// Re-export the tier contracts for convenience
pub use octocache_storage::{LocalStore, SharedStore, StorageError};
