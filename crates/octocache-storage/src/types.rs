//! Data types shared by every cache tier.
//!
//! [`CacheEntry`] is the persisted unit. In the shared tier it travels as an
//! envelope: a small binary header carrying the creation time, an opaque
//! status, and the entry's tags, followed by the serialized body.
//!
//! ```text
//! +-------+---------+-------+------------+--------+-----------+------+------+
//! | magic | version | flags | created_ms | status | tag_count | tags | body |
//! |  u16  |   u8    |  u8   |    i64     |  u16   |    u16    | ...  | rest |
//! +-------+---------+-------+------------+--------+-----------+------+------+
//! ```
//!
//! Each tag is a big-endian `u16` length followed by UTF-8 bytes.

use std::any::{Any, TypeId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::StorageResult;

/// Envelope magic ("OC").
pub const ENVELOPE_MAGIC: u16 = 0x4F43;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Size of the fixed part of the envelope header.
pub const ENVELOPE_FIXED_HEADER_LEN: usize = 16;

/// A cached unit: creation time, opaque status, tags, and serialized body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// When the entry was produced.
    pub created_at: OffsetDateTime,
    /// Domain-specific status; never interpreted by the cache.
    pub status: u16,
    /// Tags attached at write time.
    pub tags: BTreeSet<String>,
    /// The serialized value.
    pub body: Bytes,
}

impl CacheEntry {
    /// Creates a new entry stamped with the current time.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            created_at: OffsetDateTime::now_utc(),
            status: 0,
            tags: BTreeSet::new(),
            body: body.into(),
        }
    }

    /// Adds tags to the entry.
    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Sets the opaque status.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Writes the envelope header into `buf` and returns its length.
    ///
    /// The body is expected to be appended by the caller right after, which
    /// lets a serializer write straight into the envelope buffer.
    pub fn write_header<'a, I>(
        buf: &mut BytesMut,
        created_at: OffsetDateTime,
        status: u16,
        tags: I,
    ) -> StorageResult<usize>
    where
        I: IntoIterator<Item = &'a String>,
        I::IntoIter: ExactSizeIterator,
    {
        let tags = tags.into_iter();
        let tag_count = u16::try_from(tags.len())
            .map_err(|_| StorageError::invalid_payload("too many tags for envelope"))?;

        let start = buf.len();
        buf.put_u16(ENVELOPE_MAGIC);
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(0);
        buf.put_i64(unix_millis(created_at));
        buf.put_u16(status);
        buf.put_u16(tag_count);
        for tag in tags {
            let len = u16::try_from(tag.len()).map_err(|_| {
                StorageError::invalid_payload(format!("tag longer than {} bytes", u16::MAX))
            })?;
            buf.put_u16(len);
            buf.put_slice(tag.as_bytes());
        }
        Ok(buf.len() - start)
    }

    /// Encodes the full envelope (header and body) into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> StorageResult<()> {
        Self::write_header(buf, self.created_at, self.status, &self.tags)?;
        buf.put_slice(&self.body);
        Ok(())
    }

    /// Encodes the envelope into a fresh buffer.
    pub fn encode(&self) -> StorageResult<Bytes> {
        let mut buf = BytesMut::with_capacity(ENVELOPE_FIXED_HEADER_LEN + self.body.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes an envelope. The body is sliced out of `payload` without copying.
    pub fn decode(payload: Bytes) -> StorageResult<Self> {
        let mut cursor = payload.clone();
        if cursor.remaining() < ENVELOPE_FIXED_HEADER_LEN {
            return Err(StorageError::invalid_payload(format!(
                "envelope truncated: {} bytes",
                payload.len()
            )));
        }

        let magic = cursor.get_u16();
        if magic != ENVELOPE_MAGIC {
            return Err(StorageError::invalid_payload(format!(
                "bad envelope magic {magic:#06x}"
            )));
        }
        let version = cursor.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(StorageError::invalid_payload(format!(
                "unsupported envelope version {version}"
            )));
        }
        let _flags = cursor.get_u8();
        let created_ms = cursor.get_i64();
        let status = cursor.get_u16();
        let tag_count = cursor.get_u16();

        let mut tags = BTreeSet::new();
        for _ in 0..tag_count {
            if cursor.remaining() < 2 {
                return Err(StorageError::invalid_payload("envelope truncated in tag list"));
            }
            let len = usize::from(cursor.get_u16());
            if cursor.remaining() < len {
                return Err(StorageError::invalid_payload("envelope truncated in tag"));
            }
            let raw = cursor.split_to(len);
            let tag = std::str::from_utf8(&raw)
                .map_err(|_| StorageError::invalid_payload("tag is not valid UTF-8"))?;
            tags.insert(tag.to_owned());
        }

        let created_at =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(created_ms) * 1_000_000)
                .map_err(|e| StorageError::invalid_payload(format!("bad timestamp: {e}")))?;

        Ok(Self {
            created_at,
            status,
            tags,
            body: cursor,
        })
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Expiry settings handed to the shared tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedEntryOptions {
    /// Entry lifetime measured from the moment of the write.
    pub absolute_expiration_relative_to_now: Option<Duration>,
}

impl SharedEntryOptions {
    /// Creates options that expire `ttl` after the write.
    #[must_use]
    pub fn expires_in(ttl: Duration) -> Self {
        Self {
            absolute_expiration_relative_to_now: Some(ttl),
        }
    }
}

/// Why an entry left the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Explicitly removed.
    Removed,
    /// Overwritten by a newer entry for the same key.
    Replaced,
    /// Its absolute expiration passed.
    Expired,
    /// Dropped to stay within the store's size budget.
    Capacity,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed => write!(f, "removed"),
            Self::Replaced => write!(f, "replaced"),
            Self::Expired => write!(f, "expired"),
            Self::Capacity => write!(f, "capacity"),
        }
    }
}

/// Invoked by a local store once an entry has left it.
pub type EvictionCallback = Arc<dyn Fn(&str, EvictionReason) + Send + Sync>;

/// A value held by the local tier.
///
/// Immutable values are kept as shared instances; everything else is kept
/// serialized so each read produces a fresh copy.
#[derive(Clone)]
pub enum LocalValue {
    /// Serialized body of a value of type `type_name`.
    Bytes {
        body: Bytes,
        type_id: TypeId,
        type_name: &'static str,
    },
    /// A shared, read-only instance.
    Object(Arc<dyn Any + Send + Sync>),
}

impl LocalValue {
    /// Serialized body of a `T`.
    #[must_use]
    pub fn serialized<T: 'static>(body: Bytes) -> Self {
        Self::Bytes {
            body,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Returns `true` if the value was stored as a `T`.
    pub fn holds<T: 'static>(&self) -> bool {
        match self {
            Self::Bytes { type_id, .. } => *type_id == TypeId::of::<T>(),
            Self::Object(object) => object.is::<T>(),
        }
    }

    /// Name of the stored type, when it is known.
    pub fn type_name(&self) -> Option<&'static str> {
        match self {
            Self::Bytes { type_name, .. } => Some(type_name),
            Self::Object(_) => None,
        }
    }
}

impl fmt::Debug for LocalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes {
                body, type_name, ..
            } => f
                .debug_struct("Bytes")
                .field("len", &body.len())
                .field("type", type_name)
                .finish(),
            Self::Object(_) => f.write_str("Object(..)"),
        }
    }
}

/// A local-tier write.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// The stored value.
    pub value: LocalValue,
    /// When the entry stops being served. `None` never expires.
    pub absolute_expiration: Option<Instant>,
    /// Size accounted against the store's budget.
    pub estimated_size: usize,
}

impl LocalEntry {
    /// Creates an entry that expires `ttl` from now.
    ///
    /// A `ttl` past the clock's range yields an entry that never expires.
    #[must_use]
    pub fn new(value: LocalValue, ttl: Duration, estimated_size: usize) -> Self {
        Self {
            value,
            absolute_expiration: Instant::now().checked_add(ttl),
            estimated_size,
        }
    }

    /// Returns `true` once the entry's expiration has passed.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.absolute_expiration.is_some_and(|at| at <= now)
    }
}
