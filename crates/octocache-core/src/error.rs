//! Error types for the cache orchestrator.
//!
//! Misses and expired entries are never errors. Everything here is either a
//! contract violation by the caller, a downstream fault, or a cancellation.

use std::fmt;
use std::sync::Arc;

use octocache_storage::StorageError;

/// Errors surfaced by [`TieredCache`](crate::TieredCache) operations.
///
/// The type is `Clone` so a single stampede outcome can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The key is empty or whitespace.
    #[error("Invalid cache key: {reason}")]
    InvalidKey { reason: String },

    /// A tag is empty or whitespace.
    #[error("Invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: String },

    /// No serializer is registered for the requested type.
    #[error("No serializer registered for type {type_name}")]
    SerializerMissing { type_name: &'static str },

    /// The serializer failed to encode or decode a value.
    #[error("Serialization failed for type {type_name}: {message}")]
    Serialization {
        type_name: &'static str,
        message: String,
    },

    /// Stored bytes could not be turned back into a value.
    #[error("Invalid payload for key {key}: {message}")]
    InvalidPayload { key: String, message: String },

    /// A key was requested as a different type than it is cached or in
    /// flight as.
    #[error("Type mismatch for key {key}: held as {actual}, requested as {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The value factory returned an error.
    #[error("Factory failed for key {key}: {cause}")]
    Factory {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    /// The value factory panicked.
    #[error("Factory panicked for key {key}: {message}")]
    FactoryPanicked { key: String, message: String },

    /// The caller's cancellation fired, or every caller went away.
    #[error("Operation cancelled for key {key}")]
    Cancelled { key: String },

    /// A tier store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CacheError {
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub fn invalid_tag(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTag {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization(type_name: &'static str, message: impl fmt::Display) -> Self {
        Self::Serialization {
            type_name,
            message: message.to_string(),
        }
    }

    pub fn cancelled(key: impl Into<String>) -> Self {
        Self::Cancelled { key: key.into() }
    }

    pub fn factory(key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Factory {
            key: key.into(),
            cause: Arc::new(source),
        }
    }

    /// Returns `true` if this is a cancellation outcome.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if two callers disagreed on the value type for a key.
    #[must_use]
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }

    /// The factory's own error, if this came from a failing factory.
    pub fn factory_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Factory { cause, .. } => Some(&**cause),
            _ => None,
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidKey { .. } | Self::InvalidTag { .. } => ErrorCategory::Precondition,
            Self::SerializerMissing { .. } => ErrorCategory::Configuration,
            Self::TypeMismatch { .. } => ErrorCategory::TypeContract,
            Self::Serialization { .. } | Self::InvalidPayload { .. } => ErrorCategory::Payload,
            Self::Factory { .. } | Self::FactoryPanicked { .. } | Self::Storage(_) => {
                ErrorCategory::Downstream
            }
            Self::Cancelled { .. } => ErrorCategory::Cancellation,
        }
    }
}

/// Categories of cache errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad key or tag supplied by the caller.
    Precondition,
    /// Missing serializer registration.
    Configuration,
    /// Conflicting value types for one key.
    TypeContract,
    /// Bytes that could not be encoded or decoded.
    Payload,
    /// The factory or a tier store failed.
    Downstream,
    /// The caller stopped waiting.
    Cancellation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition => write!(f, "precondition"),
            Self::Configuration => write!(f, "configuration"),
            Self::TypeContract => write!(f, "type_contract"),
            Self::Payload => write!(f, "payload"),
            Self::Downstream => write!(f, "downstream"),
            Self::Cancellation => write!(f, "cancellation"),
        }
    }
}

/// Type alias for a cache result.
pub type CacheResult<T> = Result<T, CacheError>;
