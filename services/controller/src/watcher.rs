//! Change watcher keeping the object cache in step with the remote store.
//!
//! The watcher:
//! - Lists every object, replaces the cache content and queues every key
//! - Raises the has-synced signal after the first successful list
//! - Watches from the list's resource version so no change falls in between
//! - Upserts added/modified objects and queues their keys
//! - Removes deleted objects without queueing them
//!
//! Stream failures never escape: the watcher reconnects with backoff, and
//! relists when the store reports its resource version as expired. A stream
//! that closes without delivering anything, or within a second of opening, is
//! a failure too. Only the shutdown signal stops it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use nodelabel_reconcile::{BackoffPolicy, WorkQueue, Writer};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::object::{ChangeKind, Object, ObjectList, WatchEvent};
use crate::store::{RemoteStore, StoreError, WatchStream};

/// A watch closing sooner than this, or without delivering anything, counts
/// as a failure.
const MIN_WATCH_DURATION: Duration = Duration::from_secs(1);

/// How a watch stream ended.
enum StreamEnd {
    /// The server closed the stream after delivering `events` items.
    Closed { events: usize },
    /// The resource version expired; relist.
    Relist,
    /// The stream failed; reconnect after backoff.
    Failed(StoreError),
    /// Shutdown was signalled.
    Shutdown,
}

/// Feeds the object cache and the work queue from the remote store.
pub struct Watcher {
    remote: Arc<dyn RemoteStore>,
    writer: Writer<Object>,
    queue: WorkQueue<String>,
    backoff: BackoffPolicy,
}

impl Watcher {
    /// Create a new watcher. It is the only writer of the cache.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        writer: Writer<Object>,
        queue: WorkQueue<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            remote,
            writer,
            queue,
            backoff,
        }
    }

    /// Run until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            backoff_base_ms = self.backoff.base.as_millis() as u64,
            backoff_max_ms = self.backoff.max.as_millis() as u64,
            "Starting watcher"
        );

        let mut failures = 0u32;

        'relist: loop {
            let listed = tokio::select! {
                result = self.remote.list_all() => result,
                _ = wait_for_shutdown(&mut shutdown) => break 'relist,
            };

            let list = match listed {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, failures, "Failed to list objects; retrying");
                    if !self.wait_backoff(&mut failures, &mut shutdown).await {
                        break 'relist;
                    }
                    continue 'relist;
                }
            };

            failures = 0;
            let mut resource_version = self.apply_list(list).await;

            loop {
                let opened = tokio::select! {
                    result = self.remote.watch(resource_version.as_deref()) => result,
                    _ = wait_for_shutdown(&mut shutdown) => break 'relist,
                };

                let mut stream = match opened {
                    Ok(stream) => stream,
                    Err(e) if e.needs_relist() => {
                        info!(error = %e, "Watch version expired; relisting");
                        continue 'relist;
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            resource_version = ?resource_version,
                            failures,
                            "Failed to start watch; retrying"
                        );
                        if !self.wait_backoff(&mut failures, &mut shutdown).await {
                            break 'relist;
                        }
                        continue;
                    }
                };

                debug!(resource_version = ?resource_version, "Watch started");
                let opened_at = Instant::now();

                match self
                    .consume(&mut stream, &mut resource_version, &mut failures, &mut shutdown)
                    .await
                {
                    StreamEnd::Closed { events }
                        if events > 0 && opened_at.elapsed() >= MIN_WATCH_DURATION =>
                    {
                        debug!(resource_version = ?resource_version, "Watch closed; reconnecting");
                    }
                    StreamEnd::Closed { events } => {
                        warn!(
                            events,
                            lifetime_ms = opened_at.elapsed().as_millis() as u64,
                            failures,
                            "Watch closed early; reconnecting with backoff"
                        );
                        if !self.wait_backoff(&mut failures, &mut shutdown).await {
                            break 'relist;
                        }
                    }
                    StreamEnd::Relist => {
                        info!("Watch version expired; relisting");
                        continue 'relist;
                    }
                    StreamEnd::Failed(e) => {
                        warn!(error = %e, failures, "Watch stream failed; reconnecting");
                        if !self.wait_backoff(&mut failures, &mut shutdown).await {
                            break 'relist;
                        }
                    }
                    StreamEnd::Shutdown => break 'relist,
                }
            }
        }

        info!("Watcher stopped");
    }

    /// Replace the cache with a fresh enumeration and queue every key.
    async fn apply_list(&self, list: ObjectList) -> Option<String> {
        let mut entries = Vec::with_capacity(list.items.len());
        for object in list.items {
            match object.key() {
                Ok(key) => entries.push((key, object)),
                Err(e) => error!(error = %e, "Dropping listed object without a key"),
            }
        }

        let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        let removed = self.writer.replace(entries).await;
        for key in &removed {
            debug!(key = %key, "Object gone after relist");
        }

        for key in &keys {
            self.queue.add(key.clone());
        }

        info!(
            object_count = keys.len(),
            removed_count = removed.len(),
            resource_version = ?list.resource_version,
            "Objects listed"
        );

        if !self.writer.has_synced() {
            self.writer.mark_synced();
            info!(object_count = keys.len(), "Initial sync complete");
        }

        list.resource_version
    }

    async fn consume(
        &self,
        stream: &mut WatchStream,
        resource_version: &mut Option<String>,
        failures: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let mut events = 0usize;
        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                _ = wait_for_shutdown(shutdown) => return StreamEnd::Shutdown,
            };

            match next {
                None => return StreamEnd::Closed { events },
                Some(Ok(event)) => {
                    events += 1;
                    *failures = 0;
                    self.apply_event(event, resource_version).await;
                }
                Some(Err(e)) if e.needs_relist() => return StreamEnd::Relist,
                Some(Err(e)) => return StreamEnd::Failed(e),
            }
        }
    }

    async fn apply_event(&self, event: WatchEvent, resource_version: &mut Option<String>) {
        let (kind, object) = match event {
            WatchEvent::Bookmark(version) => {
                *resource_version = Some(version);
                return;
            }
            WatchEvent::Changed(kind, object) => (kind, object),
        };

        if let Some(version) = &object.resource_version {
            *resource_version = Some(version.clone());
        }

        let key = match object.key() {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, kind = %kind, "Dropping notification without a key");
                return;
            }
        };

        match kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let replaced = self.writer.upsert(key.clone(), object).await.is_some();
                debug!(key = %key, kind = %kind, replaced, "Object upserted");
                self.queue.add(key);
            }
            ChangeKind::Deleted => {
                let existed = self.writer.remove(&key).await.is_some();
                debug!(key = %key, existed, "Object deleted");
            }
        }
    }

    /// Sleep for the next backoff delay. Returns false if shutdown arrived first.
    async fn wait_backoff(&self, failures: &mut u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.backoff.delay(*failures);
        *failures = failures.saturating_add(1);

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_shutdown(shutdown) => false,
        }
    }
}

/// Resolves once shutdown is signalled or the signal sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use nodelabel_reconcile::{store, Store};
    use serde_json::Value;

    use super::*;

    struct EmptyStore;

    #[async_trait]
    impl RemoteStore for EmptyStore {
        async fn list_all(&self) -> Result<ObjectList, StoreError> {
            Ok(ObjectList::default())
        }

        async fn watch(&self, _resource_version: Option<&str>) -> Result<WatchStream, StoreError> {
            Ok(Box::pin(futures_util::stream::pending()))
        }

        async fn patch_label(&self, _key: &str, _label: &str, _value: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Every watch ends immediately without delivering anything.
    #[derive(Default)]
    struct ClosingStore {
        watch_calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for ClosingStore {
        async fn list_all(&self) -> Result<ObjectList, StoreError> {
            Ok(ObjectList::default())
        }

        async fn watch(&self, _resource_version: Option<&str>) -> Result<WatchStream, StoreError> {
            self.watch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(futures_util::stream::empty()))
        }

        async fn patch_label(&self, _key: &str, _label: &str, _value: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn watcher() -> (Watcher, Store<Object>, WorkQueue<String>) {
        let (reader, writer) = store();
        let queue = WorkQueue::with_default_rate_limiter("test");
        let watcher = Watcher::new(
            Arc::new(EmptyStore),
            writer,
            queue.clone(),
            BackoffPolicy::default(),
        );
        (watcher, reader, queue)
    }

    async fn drain(queue: &WorkQueue<String>) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            let item = queue.get().await.unwrap();
            keys.push(item.key().clone());
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_apply_list_replaces_cache_and_queues_keys() {
        let (watcher, reader, queue) = watcher();
        watcher
            .writer
            .upsert("stale".to_string(), Object::new("stale", Value::Null))
            .await;

        let version = watcher
            .apply_list(ObjectList {
                items: vec![
                    Object::new("node-1", Value::Null),
                    Object::new("node-2", Value::Null),
                    Object::new("", Value::Null),
                ],
                resource_version: Some("7".to_string()),
            })
            .await;

        assert_eq!(version.as_deref(), Some("7"));
        assert!(reader.has_synced());
        assert_eq!(reader.keys().await, vec!["node-1", "node-2"]);
        assert_eq!(drain(&queue).await, vec!["node-1", "node-2"]);
    }

    #[tokio::test]
    async fn test_apply_events() {
        let (watcher, reader, queue) = watcher();
        let mut version = Some("1".to_string());

        watcher
            .apply_event(
                WatchEvent::Changed(
                    ChangeKind::Added,
                    Object::new("node-1", Value::Null).with_resource_version("2"),
                ),
                &mut version,
            )
            .await;
        assert_eq!(version.as_deref(), Some("2"));
        assert!(reader.get("node-1").await.is_some());
        assert_eq!(drain(&queue).await, vec!["node-1"]);

        watcher
            .apply_event(WatchEvent::Bookmark("5".to_string()), &mut version)
            .await;
        assert_eq!(version.as_deref(), Some("5"));
        assert!(queue.is_empty());

        watcher
            .apply_event(
                WatchEvent::Changed(
                    ChangeKind::Deleted,
                    Object::new("node-1", Value::Null).with_resource_version("6"),
                ),
                &mut version,
            )
            .await;
        assert_eq!(version.as_deref(), Some("6"));
        assert!(reader.get("node-1").await.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (watcher, reader, _queue) = watcher();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watcher.run(shutdown_rx));
        assert!(reader.wait_until_synced().await);

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_watch_streams_back_off() {
        let remote = Arc::new(ClosingStore::default());
        let (_reader, writer) = store();
        let watcher = Watcher::new(
            remote.clone(),
            writer,
            WorkQueue::with_default_rate_limiter("test"),
            BackoffPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_millis(100),
                jitter: 0.0,
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watcher.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        // Reopened at 0, 50, 150 and 250 ms.
        let calls = remote.watch_calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "watch reopened only {calls} times");
        assert!(calls < 10, "watch reopened {calls} times without backing off");
    }
}
