//! Entry, cache, and per-call options.

use std::sync::OnceLock;
use std::time::Duration;

use bitflags::bitflags;
use octocache_storage::SharedEntryOptions;
use tokio_util::sync::CancellationToken;

/// Default entry lifetime.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(300);

/// Default upper bound on a serialized payload.
pub const DEFAULT_MAXIMUM_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default upper bound on key length, in bytes.
pub const DEFAULT_MAXIMUM_KEY_LENGTH: usize = 1024;

bitflags! {
    /// Per-entry switches that bypass parts of the read-through pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        /// Do not read from the local tier.
        const DISABLE_LOCAL_READ = 1 << 0;
        /// Do not write to the local tier.
        const DISABLE_LOCAL_WRITE = 1 << 1;
        /// Skip the local tier entirely.
        const DISABLE_LOCAL = Self::DISABLE_LOCAL_READ.bits() | Self::DISABLE_LOCAL_WRITE.bits();
        /// Do not read from the shared tier.
        const DISABLE_SHARED_READ = 1 << 2;
        /// Do not write to the shared tier.
        const DISABLE_SHARED_WRITE = 1 << 3;
        /// Skip the shared tier entirely.
        const DISABLE_SHARED = Self::DISABLE_SHARED_READ.bits() | Self::DISABLE_SHARED_WRITE.bits();
        /// Never invoke the factory; `get_or_create` behaves like `get`.
        const DISABLE_UNDERLYING_DATA = 1 << 4;
        /// Write payloads uncompressed.
        const DISABLE_COMPRESSION = 1 << 5;
    }
}

/// Expiry and bypass flags for a cache entry.
///
/// Immutable once built. The options handed to the shared tier are derived
/// on first use and cached.
#[derive(Debug, Clone)]
pub struct EntryOptions {
    expiration: Duration,
    local_expiration: Option<Duration>,
    flags: EntryFlags,
    shared: OnceLock<SharedEntryOptions>,
}

impl EntryOptions {
    /// Entry that lives for `expiration` in both tiers.
    #[must_use]
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            local_expiration: None,
            flags: EntryFlags::empty(),
            shared: OnceLock::new(),
        }
    }

    /// Overrides the lifetime in the local tier.
    #[must_use]
    pub fn with_local_expiration(self, local_expiration: Duration) -> Self {
        Self::from_parts(self.expiration, Some(local_expiration), self.flags)
    }

    #[must_use]
    pub fn with_flags(self, flags: EntryFlags) -> Self {
        Self::from_parts(self.expiration, self.local_expiration, self.flags | flags)
    }

    fn from_parts(
        expiration: Duration,
        local_expiration: Option<Duration>,
        flags: EntryFlags,
    ) -> Self {
        Self {
            expiration,
            local_expiration,
            flags,
            shared: OnceLock::new(),
        }
    }

    /// Lifetime in the shared tier.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Lifetime in the local tier; falls back to [`expiration`](Self::expiration).
    pub fn local_expiration(&self) -> Duration {
        self.local_expiration.unwrap_or(self.expiration)
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    /// Returns `true` if every bit in `flag` is set.
    pub fn has(&self, flag: EntryFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Options for the shared tier write.
    pub fn shared_options(&self) -> &SharedEntryOptions {
        self.shared
            .get_or_init(|| SharedEntryOptions::expires_in(self.expiration))
    }

    #[cfg(test)]
    pub(crate) fn is_shared_resolved(&self) -> bool {
        self.shared.get().is_some()
    }
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRATION)
    }
}

impl PartialEq for EntryOptions {
    fn eq(&self, other: &Self) -> bool {
        self.expiration == other.expiration
            && self.local_expiration == other.local_expiration
            && self.flags == other.flags
    }
}

impl Eq for EntryOptions {}

/// Cache-wide settings consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Used when a call does not supply its own entry options.
    pub default_entry: EntryOptions,
    /// Payloads larger than this are returned but not cached.
    pub maximum_payload_bytes: usize,
    /// Keys longer than this are never cached.
    pub maximum_key_length: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            default_entry: EntryOptions::default(),
            maximum_payload_bytes: DEFAULT_MAXIMUM_PAYLOAD_BYTES,
            maximum_key_length: DEFAULT_MAXIMUM_KEY_LENGTH,
        }
    }
}

/// Options for a single cache call.
///
/// ```ignore
/// let options = CallOptions::new()
///     .with_tags(["users"])
///     .with_cancellation(token.child_token());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub entry: Option<EntryOptions>,
    pub tags: Vec<String>,
    /// `None` means the call cannot be cancelled, which is the cheapest path.
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(mut self, entry: EntryOptions) -> Self {
        self.entry = Some(entry);
        self
    }

    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_expiration_falls_back() {
        let options = EntryOptions::new(Duration::from_secs(60));
        assert_eq!(options.local_expiration(), Duration::from_secs(60));

        let options = options.with_local_expiration(Duration::from_secs(5));
        assert_eq!(options.local_expiration(), Duration::from_secs(5));
        assert_eq!(options.expiration(), Duration::from_secs(60));
    }

    #[test]
    fn test_composite_flags() {
        let options = EntryOptions::default().with_flags(EntryFlags::DISABLE_LOCAL);
        assert!(options.has(EntryFlags::DISABLE_LOCAL_READ));
        assert!(options.has(EntryFlags::DISABLE_LOCAL_WRITE));
        assert!(!options.has(EntryFlags::DISABLE_SHARED_READ));

        let options = options.with_flags(EntryFlags::DISABLE_SHARED_WRITE);
        assert!(options.has(EntryFlags::DISABLE_LOCAL));
        assert!(!options.has(EntryFlags::DISABLE_SHARED));
    }

    #[test]
    fn test_shared_options_are_cached() {
        let options = EntryOptions::new(Duration::from_secs(30));
        let first = options.shared_options() as *const SharedEntryOptions;
        let second = options.shared_options() as *const SharedEntryOptions;
        assert_eq!(first, second);
        assert_eq!(
            options.shared_options().absolute_expiration_relative_to_now,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_builder_resets_derived_options() {
        let options = EntryOptions::new(Duration::from_secs(30));
        let _ = options.shared_options();
        let updated = options
            .with_local_expiration(Duration::from_secs(10))
            .with_flags(EntryFlags::DISABLE_COMPRESSION);
        assert_eq!(updated.local_expiration(), Duration::from_secs(10));
        assert!(updated.has(EntryFlags::DISABLE_COMPRESSION));
        assert_eq!(
            updated.shared_options().absolute_expiration_relative_to_now,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_call_options_builder() {
        let token = CancellationToken::new();
        let options = CallOptions::new()
            .with_tags(["users", "tenant:1"])
            .with_cancellation(token.clone());
        assert_eq!(options.tags, vec!["users".to_string(), "tenant:1".to_string()]);
        assert!(options.cancellation.is_some());
        assert!(options.entry.is_none());
    }

    #[test]
    fn test_cache_option_defaults() {
        let options = CacheOptions::default();
        assert_eq!(options.maximum_payload_bytes, 1024 * 1024);
        assert_eq!(options.maximum_key_length, 1024);
        assert_eq!(options.default_entry.expiration(), Duration::from_secs(300));
    }
}
