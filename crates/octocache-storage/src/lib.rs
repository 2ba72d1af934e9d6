//! # octocache-storage
//!
//! Tier contracts for the octocache read-through cache.
//!
//! This crate defines the traits and types every cache tier must implement.
//! It does not contain any implementations - those are provided by separate
//! crates (`octocache-db-memory` ships in-memory ones).
//!
//! ## Overview
//!
//! - [`LocalStore`]: in-process store with absolute expiry, size accounting,
//!   and eviction callbacks.
//! - [`SharedStore`]: remote byte-array store (get/set/remove).
//! - [`BufferedSharedStore`]: optional buffer-oriented variant of the shared
//!   store that reads into pooled buffers.
//! - [`TagInvalidation`]: optional native bulk invalidation by tag.
//! - [`CacheEntry`]: the persisted unit and its binary envelope.
//!
//! ## Implementing a shared backend
//!
//! ```ignore
//! use async_trait::async_trait;
//! use octocache_storage::{SharedEntryOptions, SharedStore, StorageError};
//!
//! struct MyStore {
//!     // ...
//! }
//!
//! #[async_trait]
//! impl SharedStore for MyStore {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
//!         // Implementation
//!     }
//!     // ... other methods
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{BackendFeatures, BufferedSharedStore, LocalStore, SharedStore, TagInvalidation};
pub use types::{
    CacheEntry, ENVELOPE_FIXED_HEADER_LEN, ENVELOPE_MAGIC, ENVELOPE_VERSION, EvictionCallback,
    EvictionReason, LocalEntry, LocalValue, SharedEntryOptions,
};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared local store.
pub type DynLocalStore = std::sync::Arc<dyn LocalStore>;

/// Type alias for a shared remote store.
pub type DynSharedStore = std::sync::Arc<dyn SharedStore>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octocache_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::traits::{
        BackendFeatures, BufferedSharedStore, LocalStore, SharedStore, TagInvalidation,
    };
    pub use crate::types::{
        CacheEntry, EvictionCallback, EvictionReason, LocalEntry, LocalValue, SharedEntryOptions,
    };
    pub use crate::{DynLocalStore, DynSharedStore, StorageResult};
}
