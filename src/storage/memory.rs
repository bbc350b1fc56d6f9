//! In-memory storage adapter.

use super::{StorageAdapter, StorageUpdate, Updater};
use crate::clock::{system_clock, SharedClock};
use crate::Result;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

struct StoredEntry<T> {
    value: T,
    expires_at: Option<u64>,
}

impl<T> StoredEntry<T> {
    fn new(update: StorageUpdate<T>, now: u64) -> Self {
        Self {
            value: update.value,
            expires_at: update.ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64)),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Process-local storage backed by a sharded concurrent map.
///
/// `update` holds the shard lock for the key while the updater runs, so
/// concurrent updates to one key are serialised. Expired entries are removed
/// lazily on access or by [`InMemoryStorage::purge_expired`].
pub struct InMemoryStorage<T> {
    entries: DashMap<String, StoredEntry<T>>,
    clock: SharedClock,
}

impl<T> InMemoryStorage<T> {
    /// Create an empty store reading time from the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> StorageAdapter<T> for InMemoryStorage<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<T>> {
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now_ms();
        self.entries.insert(
            key.to_string(),
            StoredEntry::new(StorageUpdate { value, ttl }, now),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn supports_update(&self) -> bool {
        true
    }

    async fn update(&self, key: &str, updater: Updater<'_, T>) -> Result<Option<T>> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().is_expired(now) {
                    None
                } else {
                    Some(occupied.get().value.clone())
                };
                match updater(current.clone()) {
                    Some(update) => {
                        let value = update.value.clone();
                        occupied.insert(StoredEntry::new(update, now));
                        Ok(Some(value))
                    }
                    None => {
                        if current.is_none() {
                            occupied.remove();
                        }
                        Ok(current)
                    }
                }
            }
            Entry::Vacant(vacant) => match updater(None) {
                Some(update) => {
                    let value = update.value.clone();
                    vacant.insert(StoredEntry::new(update, now));
                    Ok(Some(value))
                }
                None => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store() -> (Arc<ManualClock>, InMemoryStorage<u64>) {
        let clock = ManualClock::shared(1_000);
        let storage = InMemoryStorage::with_clock(clock.clone());
        (clock, storage)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_, storage) = store();
        storage.set("a", 1, None).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some(1));

        storage.delete("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
        storage.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (clock, storage) = store();
        storage
            .set("a", 1, Some(Duration::from_millis(100)))
            .await
            .unwrap();

        clock.advance(99);
        assert_eq!(storage.get("a").await.unwrap(), Some(1));

        clock.advance(1);
        assert_eq!(storage.get("a").await.unwrap(), None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_update_sees_expired_as_absent() {
        let (clock, storage) = store();
        storage
            .set("a", 41, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        clock.advance(10);

        let seen = parking_lot::Mutex::new(None);
        let result = storage
            .update("a", &|current| {
                *seen.lock() = Some(current);
                Some(StorageUpdate::new(1))
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock(), Some(None));
        assert_eq!(result, Some(1));
    }

    #[tokio::test]
    async fn test_update_none_keeps_value() {
        let (_, storage) = store();
        storage.set("a", 5, None).await.unwrap();
        assert_eq!(storage.update("a", &|_| None).await.unwrap(), Some(5));
        assert_eq!(storage.update("b", &|_| None).await.unwrap(), None);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialised() {
        let storage = Arc::new(InMemoryStorage::<u64>::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    storage
                        .update("counter", &|c| Some(StorageUpdate::new(c.unwrap_or(0) + 1)))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(storage.get("counter").await.unwrap(), Some(800));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, storage) = store();
        storage
            .set("short", 1, Some(Duration::from_millis(5)))
            .await
            .unwrap();
        storage.set("forever", 2, None).await.unwrap();
        clock.advance(5);

        assert_eq!(storage.purge_expired(), 1);
        assert_eq!(storage.len(), 1);
    }
}
