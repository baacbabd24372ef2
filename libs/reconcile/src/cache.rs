//! Local object cache mirroring remote state.
//!
//! The cache has exactly one [`Writer`], owned by the watcher that keeps it in
//! step with the remote store, and any number of cloneable [`Store`] readers.
//! The writer also owns the has-synced signal: readers can check or wait for
//! it, but only the writer can raise it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

type Objects<T> = Arc<RwLock<HashMap<String, Arc<T>>>>;

/// Create an empty cache, returning its reader and its single writer.
pub fn store<T>() -> (Store<T>, Writer<T>) {
    let objects: Objects<T> = Arc::new(RwLock::new(HashMap::new()));
    let (synced_tx, synced_rx) = watch::channel(false);

    let reader = Store {
        objects: Arc::clone(&objects),
        synced: synced_rx,
    };
    let writer = Writer {
        objects,
        synced: synced_tx,
    };

    (reader, writer)
}

/// Read-only view of the cache.
#[derive(Debug)]
pub struct Store<T> {
    objects: Objects<T>,
    synced: watch::Receiver<bool>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            synced: self.synced.clone(),
        }
    }
}

impl<T> Store<T> {
    /// Look up an object by key.
    pub async fn get(&self, key: &str) -> Option<Arc<T>> {
        self.objects.read().await.get(key).cloned()
    }

    /// All keys currently cached, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of cached objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Returns true if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the initial enumeration has been applied.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial enumeration has been applied.
    ///
    /// Returns false if the writer went away before the cache synced.
    pub async fn wait_until_synced(&self) -> bool {
        let mut synced = self.synced.clone();
        let result = synced.wait_for(|synced| *synced).await;
        result.is_ok()
    }
}

/// The single writer of the cache.
#[derive(Debug)]
pub struct Writer<T> {
    objects: Objects<T>,
    synced: watch::Sender<bool>,
}

impl<T> Writer<T> {
    /// Another reader for this cache.
    pub fn reader(&self) -> Store<T> {
        Store {
            objects: Arc::clone(&self.objects),
            synced: self.synced.subscribe(),
        }
    }

    /// Insert or replace an object, returning the previous version.
    pub async fn upsert(&self, key: String, object: T) -> Option<Arc<T>> {
        self.objects.write().await.insert(key, Arc::new(object))
    }

    /// Remove an object, returning the last cached version.
    pub async fn remove(&self, key: &str) -> Option<Arc<T>> {
        self.objects.write().await.remove(key)
    }

    /// Replace the whole content with a fresh enumeration.
    ///
    /// Returns the keys that were cached but are absent from `objects`.
    pub async fn replace(&self, objects: Vec<(String, T)>) -> Vec<String> {
        let fresh: HashMap<String, Arc<T>> = objects
            .into_iter()
            .map(|(key, object)| (key, Arc::new(object)))
            .collect();

        let mut current = self.objects.write().await;
        let mut removed: Vec<String> = current
            .keys()
            .filter(|key| !fresh.contains_key(*key))
            .cloned()
            .collect();
        removed.sort();

        *current = fresh;
        removed
    }

    /// Raise the has-synced signal. It stays raised for the cache's lifetime.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Whether the has-synced signal has been raised.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (store, writer) = store::<String>();

        assert!(writer.upsert("node-1".to_string(), "v1".to_string()).await.is_none());
        let previous = writer.upsert("node-1".to_string(), "v2".to_string()).await;
        assert_eq!(previous.as_deref().map(String::as_str), Some("v1"));

        let current = store.get("node-1").await.unwrap();
        assert_eq!(current.as_str(), "v2");
        assert!(store.get("node-2").await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, writer) = store::<u32>();
        writer.upsert("node-1".to_string(), 1).await;

        assert_eq!(writer.remove("node-1").await.as_deref(), Some(&1));
        assert!(writer.remove("node-1").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_replace_reports_removed_keys() {
        let (store, writer) = store::<u32>();
        writer.upsert("node-1".to_string(), 1).await;
        writer.upsert("node-2".to_string(), 2).await;

        let removed = writer
            .replace(vec![("node-2".to_string(), 20), ("node-3".to_string(), 3)])
            .await;

        assert_eq!(removed, vec!["node-1".to_string()]);
        assert_eq!(store.keys().await, vec!["node-2".to_string(), "node-3".to_string()]);
        assert_eq!(store.get("node-2").await.as_deref(), Some(&20));
    }

    #[tokio::test]
    async fn test_sync_signal() {
        let (store, writer) = store::<u32>();
        assert!(!store.has_synced());

        let waiter = tokio::spawn({
            let store = store.clone();
            async move { store.wait_until_synced().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        writer.mark_synced();
        assert!(waiter.await.unwrap());
        assert!(store.has_synced());
        assert!(writer.reader().has_synced());
    }

    #[tokio::test]
    async fn test_wait_returns_false_when_writer_dropped() {
        let (store, writer) = store::<u32>();
        drop(writer);
        assert!(!store.wait_until_synced().await);
    }
}
