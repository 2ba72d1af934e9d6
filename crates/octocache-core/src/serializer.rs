//! Serializer registry.
//!
//! Maps a value type to a [`CacheSerializer`] that turns it into bytes and
//! back. Resolution happens once per type and is memoised:
//!
//! 1. serializers registered explicitly for the exact type,
//! 2. factories, most recently added first; the first one that can handle
//!    the type wins.
//!
//! A type nothing can handle is a configuration error. There is no fallback
//! encoding.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, CacheResult};

/// Converts values of `T` to and from bytes.
pub trait CacheSerializer<T>: Send + Sync {
    /// Appends the encoded value to `target`.
    fn serialize(&self, value: &T, target: &mut BytesMut) -> CacheResult<()>;

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<T>;
}

/// UTF-8 serializer for `String`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Serializer;

impl CacheSerializer<String> for Utf8Serializer {
    fn serialize(&self, value: &String, target: &mut BytesMut) -> CacheResult<()> {
        target.put_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<String> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| CacheError::serialization(type_name::<String>(), e))
    }
}

/// Identity serializer for raw byte values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytesSerializer;

impl CacheSerializer<Vec<u8>> for RawBytesSerializer {
    fn serialize(&self, value: &Vec<u8>, target: &mut BytesMut) -> CacheResult<()> {
        target.put_slice(value);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

impl CacheSerializer<Bytes> for RawBytesSerializer {
    fn serialize(&self, value: &Bytes, target: &mut BytesMut) -> CacheResult<()> {
        target.put_slice(value);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// JSON via `serde_json`.
pub struct JsonSerializer<T>(PhantomData<fn() -> T>);

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheSerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, target: &mut BytesMut) -> CacheResult<()> {
        serde_json::to_writer(target.writer(), value)
            .map_err(|e| CacheError::serialization(type_name::<T>(), e))
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::serialization(type_name::<T>(), e))
    }
}

/// MessagePack via `rmp-serde`, with named struct fields.
pub struct MessagePackSerializer<T>(PhantomData<fn() -> T>);

impl<T> MessagePackSerializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for MessagePackSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheSerializer<T> for MessagePackSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, target: &mut BytesMut) -> CacheResult<()> {
        let mut writer = target.writer();
        rmp_serde::encode::write_named(&mut writer, value)
            .map_err(|e| CacheError::serialization(type_name::<T>(), e))
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<T> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::serialization(type_name::<T>(), e))
    }
}

/// A serializer with its value type erased, keyed by `TypeId`.
#[derive(Clone)]
pub struct ErasedSerializer {
    type_id: TypeId,
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ErasedSerializer {
    pub fn new<T, S>(serializer: S) -> Self
    where
        T: 'static,
        S: CacheSerializer<T> + 'static,
    {
        let typed: Arc<dyn CacheSerializer<T>> = Arc::new(serializer);
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            inner: Arc::new(typed),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recovers the typed serializer; `None` if `T` is not the erased type.
    pub fn downcast<T: 'static>(&self) -> Option<Arc<dyn CacheSerializer<T>>> {
        self.inner
            .downcast_ref::<Arc<dyn CacheSerializer<T>>>()
            .cloned()
    }
}

impl std::fmt::Debug for ErasedSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedSerializer")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Produces serializers for families of types.
pub trait SerializerFactory: Send + Sync {
    /// Returns a serializer for `type_id`, or `None` if this factory does
    /// not handle it.
    fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer>;
}

/// Factory producing [`JsonSerializer`]s for opted-in types.
#[derive(Debug, Default)]
pub struct JsonSerializerFactory {
    types: HashMap<TypeId, ErasedSerializer>,
}

impl JsonSerializerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_type<T>(mut self) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.types.insert(
            TypeId::of::<T>(),
            ErasedSerializer::new::<T, _>(JsonSerializer::<T>::new()),
        );
        self
    }
}

impl SerializerFactory for JsonSerializerFactory {
    fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer> {
        self.types.get(&type_id).cloned()
    }
}

/// Factory producing [`MessagePackSerializer`]s for opted-in types.
#[derive(Debug, Default)]
pub struct MessagePackSerializerFactory {
    types: HashMap<TypeId, ErasedSerializer>,
}

impl MessagePackSerializerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_type<T>(mut self) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.types.insert(
            TypeId::of::<T>(),
            ErasedSerializer::new::<T, _>(MessagePackSerializer::<T>::new()),
        );
        self
    }
}

impl SerializerFactory for MessagePackSerializerFactory {
    fn try_create(&self, type_id: TypeId) -> Option<ErasedSerializer> {
        self.types.get(&type_id).cloned()
    }
}

/// Resolves and memoises the serializer for each value type.
pub struct SerializerRegistry {
    explicit: HashMap<TypeId, ErasedSerializer>,
    factories: Vec<Arc<dyn SerializerFactory>>,
    resolved: DashMap<TypeId, Option<ErasedSerializer>>,
}

impl SerializerRegistry {
    /// Registry with serializers for `String`, `Vec<u8>`, and `Bytes`.
    pub fn new() -> Self {
        Self::empty()
            .with_serializer::<String, _>(Utf8Serializer)
            .with_serializer::<Vec<u8>, _>(RawBytesSerializer)
            .with_serializer::<Bytes, _>(RawBytesSerializer)
    }

    /// Registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            explicit: HashMap::new(),
            factories: Vec::new(),
            resolved: DashMap::new(),
        }
    }

    /// Registers a serializer for exactly `T`, replacing any previous one.
    #[must_use]
    pub fn with_serializer<T, S>(mut self, serializer: S) -> Self
    where
        T: 'static,
        S: CacheSerializer<T> + 'static,
    {
        self.explicit
            .insert(TypeId::of::<T>(), ErasedSerializer::new::<T, S>(serializer));
        self.resolved.clear();
        self
    }

    /// Adds a factory. Later factories take precedence over earlier ones.
    #[must_use]
    pub fn with_factory(mut self, factory: impl SerializerFactory + 'static) -> Self {
        self.factories.push(Arc::new(factory));
        self.resolved.clear();
        self
    }

    /// Returns the serializer for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::SerializerMissing`] if no registration or
    /// factory handles `T`.
    pub fn resolve<T: 'static>(&self) -> CacheResult<Arc<dyn CacheSerializer<T>>> {
        let type_id = TypeId::of::<T>();
        let cached = self.resolved.get(&type_id).map(|hit| hit.value().clone());
        let erased = match cached {
            Some(erased) => erased,
            None => {
                let found = self.lookup(type_id, type_name::<T>());
                self.resolved
                    .entry(type_id)
                    .or_insert(found)
                    .value()
                    .clone()
            }
        };

        erased
            .and_then(|erased| erased.downcast::<T>())
            .ok_or(CacheError::SerializerMissing {
                type_name: type_name::<T>(),
            })
    }

    fn lookup(&self, type_id: TypeId, requested: &'static str) -> Option<ErasedSerializer> {
        if let Some(explicit) = self.explicit.get(&type_id) {
            return Some(explicit.clone());
        }
        for factory in self.factories.iter().rev() {
            let Some(candidate) = factory.try_create(type_id) else {
                continue;
            };
            if candidate.type_id() == type_id {
                tracing::debug!(type_name = requested, "serializer resolved from factory");
                return Some(candidate);
            }
            tracing::warn!(
                requested,
                produced = candidate.type_name(),
                "serializer factory returned a serializer for the wrong type"
            );
        }
        None
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("explicit", &self.explicit.len())
            .field("factories", &self.factories.len())
            .field("resolved", &self.resolved.len())
            .finish()
    }
}
