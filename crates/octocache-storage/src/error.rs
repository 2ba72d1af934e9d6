//! Storage error types for the cache tier contracts.
//!
//! These errors are raised by local and shared store implementations. Misses
//! are never errors: a lookup that finds nothing returns `Ok(None)`.

use std::fmt;

/// Errors that can occur while talking to a cache tier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// A stored payload could not be decoded.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        /// Description of why the payload is invalid.
        message: String,
    },

    /// The backend refused the operation for this key.
    #[error("Rejected write for key {key}: {message}")]
    Rejected {
        /// The key the write was issued for.
        key: String,
        /// Description of the rejection.
        message: String,
    },

    /// Failed to reach the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// The backend did not answer in time.
    #[error("Backend timed out after {elapsed_ms}ms")]
    Timeout {
        /// How long the call ran before giving up.
        elapsed_ms: u64,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `InvalidPayload` error.
    #[must_use]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates a new `Rejected` error.
    #[must_use]
    pub fn rejected(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(elapsed_ms: u64) -> Self {
        Self::Timeout { elapsed_ms }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if the stored bytes were unreadable.
    #[must_use]
    pub fn is_invalid_payload(&self) -> bool {
        matches!(self, Self::InvalidPayload { .. })
    }

    /// Returns `true` if the failure is likely transient (connection or timeout).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError { .. } | Self::Timeout { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPayload { .. } => ErrorCategory::Payload,
            Self::Rejected { .. } => ErrorCategory::Rejected,
            Self::ConnectionError { .. } | Self::Timeout { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Stored bytes could not be decoded.
    Payload,
    /// The backend declined the write.
    Rejected,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payload => write!(f, "payload"),
            Self::Rejected => write!(f, "rejected"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
