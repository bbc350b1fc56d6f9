//! Key-value storage contract.
//!
//! The rate limiter and any rule that needs shared state talk to storage
//! through [`StorageAdapter`]. Concrete backends (Redis, SQL, ...) live
//! outside this crate; [`InMemoryStorage`] is the reference implementation.
//!
//! `update` is the atomic compare-and-update primitive. Adapters that cannot
//! provide it leave [`StorageAdapter::supports_update`] at `false`, and callers
//! fall back to a non-atomic `get` followed by `set`.

mod memory;

pub use memory::InMemoryStorage;

use crate::{Error, Result};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// New value (and optional TTL) produced by an update closure.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageUpdate<T> {
    /// Value to persist
    pub value: T,
    /// Time to live for the persisted value
    pub ttl: Option<Duration>,
}

impl<T> StorageUpdate<T> {
    /// Persist `value` without expiry.
    pub fn new(value: T) -> Self {
        Self { value, ttl: None }
    }

    /// Persist `value` with the given TTL.
    pub fn with_ttl(value: T, ttl: Duration) -> Self {
        Self {
            value,
            ttl: Some(ttl),
        }
    }
}

/// Update closure: receives the current value (if any, and not expired) and
/// returns the value to write, or `None` to leave the key untouched.
pub type Updater<'a, T> = &'a (dyn Fn(Option<T>) -> Option<StorageUpdate<T>> + Send + Sync);

/// Atomic key-value storage over values of type `T`.
#[async_trait]
pub trait StorageAdapter<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Read a value. Expired values read as `None`.
    async fn get(&self, key: &str) -> Result<Option<T>>;

    /// Write a value with an optional TTL.
    async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether [`StorageAdapter::update`] is implemented atomically.
    fn supports_update(&self) -> bool {
        false
    }

    /// Atomically apply `updater` to the value under `key`.
    ///
    /// Returns the value stored after the update (the untouched current value
    /// when the updater returns `None`).
    async fn update(&self, key: &str, updater: Updater<'_, T>) -> Result<Option<T>> {
        let _ = (key, updater);
        Err(Error::unsupported("update"))
    }
}

/// Shared storage handle.
pub type SharedStorage<T> = Arc<dyn StorageAdapter<T>>;

/// Untyped storage capability exposed to rules through the context tools.
pub type JsonStorage = SharedStorage<serde_json::Value>;

/// Apply `updater` through the atomic primitive when available, otherwise
/// through a non-atomic read-then-write.
pub async fn update_or_fallback<T>(
    storage: &dyn StorageAdapter<T>,
    key: &str,
    updater: Updater<'_, T>,
) -> Result<Option<T>>
where
    T: Clone + Send + Sync + 'static,
{
    if storage.supports_update() {
        return storage.update(key, updater).await;
    }

    let current = storage.get(key).await?;
    match updater(current.clone()) {
        Some(update) => {
            storage
                .set(key, update.value.clone(), update.ttl)
                .await?;
            Ok(Some(update.value))
        }
        None => Ok(current),
    }
}
