//! # octocache-core
//!
//! A tiered, stampede-protected read-through cache.
//!
//! [`TieredCache`] sits in front of an in-process [`LocalStore`] and an
//! optional remote [`SharedStore`]. On a miss it runs a caller-supplied
//! factory exactly once per key, no matter how many callers ask at the same
//! time, and writes the result to both tiers.
//!
//! ```ignore
//! use octocache_core::{CallOptions, TieredCache};
//!
//! let cache = TieredCache::builder(local).shared_store(shared).build();
//! let user: Option<User> = cache
//!     .get_or_create(
//!         "user:42",
//!         db.clone(),
//!         |db, token| async move { db.load_user(42, token).await },
//!         &CallOptions::new().with_tags(["users"]),
//!     )
//!     .await?;
//! cache.remove_by_tag("users").await?;
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod options;
pub mod serializer;
pub mod stampede;
pub mod stats;
pub mod tags;
pub mod tiered;

pub use buffer::{BufferPool, PooledBuffer};
pub use config::{CacheSettings, SharedAccessMode};
pub use error::{CacheError, CacheResult, ErrorCategory};
pub use options::{CacheOptions, CallOptions, EntryFlags, EntryOptions};
pub use serializer::{
    CacheSerializer, JsonSerializer, JsonSerializerFactory, MessagePackSerializer,
    MessagePackSerializerFactory, RawBytesSerializer, SerializerFactory, SerializerRegistry,
    Utf8Serializer,
};
pub use stampede::StampedeCoordinator;
pub use stats::CacheStats;
pub use tags::TaggedLocalStore;
pub use tiered::{CacheValue, TieredCache, TieredCacheBuilder};

pub use octocache_storage::{LocalStore, SharedStore};
pub use tokio_util::sync::CancellationToken;
