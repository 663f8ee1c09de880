//! Typed collections: serde values over byte collections.

use crate::error::{CoreError, CoreResult};
use crate::replica::Replica;
use crate::store::CollectionHandle;
use crate::transaction::{CancellationToken, Transaction};
use crate::types::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;

/// A collection whose keys and values are CBOR-encoded Rust types.
///
/// ```rust,ignore
/// let sessions: TypedCollection<String, Session> = TypedCollection::open(&replica, "sessions")?;
/// replica.run(|tx| {
///     sessions.compute(&replica, tx, &user, |current| {
///         let mut session = current.unwrap_or_default();
///         session.hits += 1;
///         session
///     }, timeout, &token)
/// })?;
/// ```
pub struct TypedCollection<K, V> {
    handle: CollectionHandle,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedCollection<K, V> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> std::fmt::Debug for TypedCollection<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCollection")
            .field("name", &self.handle.name())
            .finish()
    }
}

impl<K, V> TypedCollection<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    /// Opens the collection called `name` on `replica`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty name.
    pub fn open(replica: &Replica, name: &str) -> CoreResult<Self> {
        Ok(Self {
            handle: replica.collection(name)?,
            _types: PhantomData,
        })
    }

    /// The underlying byte collection.
    #[must_use]
    pub fn handle(&self) -> &CollectionHandle {
        &self.handle
    }

    /// Typed `compute_and_set`: `compute` maps the current value to the new one.
    ///
    /// # Errors
    ///
    /// Returns `Encoding` if a value cannot be encoded or decoded, plus
    /// everything [`Replica::compute_and_set`] returns.
    pub fn compute<F>(
        &self,
        replica: &Replica,
        tx: &mut Transaction,
        key: &K,
        mut compute: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CoreResult<V>
    where
        F: FnMut(Option<V>) -> V,
    {
        let key = encode(key)?;
        let bytes = replica.compute_and_set(
            tx,
            &self.handle,
            &key,
            |_, current| {
                let current = current.map(decode::<V>).transpose()?;
                encode(&compute(current))
            },
            timeout,
            cancel,
        )?;
        decode(&bytes)
    }

    /// Transactional typed read.
    ///
    /// # Errors
    ///
    /// Returns `Encoding` for undecodable values, or `InvalidState` if the
    /// transaction is terminal.
    pub fn get(&self, replica: &Replica, tx: &mut Transaction, key: &K) -> CoreResult<Option<V>> {
        replica
            .get(tx, &self.handle, &encode(key)?)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Committed typed read outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns `Encoding` for undecodable keys or values.
    pub fn read(&self, replica: &Replica, key: &K) -> CoreResult<Option<(V, Version)>> {
        replica
            .read(&self.handle, &encode(key)?)
            .map(|current| decode(&current.value).map(|value| (value, current.version)))
            .transpose()
    }

    /// Stages removal of `key`, returning its previous value.
    ///
    /// # Errors
    ///
    /// Returns `Encoding` for undecodable values, or `InvalidState` if the
    /// transaction is terminal.
    pub fn remove(
        &self,
        replica: &Replica,
        tx: &mut Transaction,
        key: &K,
    ) -> CoreResult<Option<V>> {
        replica
            .remove(tx, &self.handle, &encode(key)?)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| CoreError::encoding(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::encoding(e.to_string()))
}
