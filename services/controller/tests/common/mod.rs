//! Shared test harness: an in-memory remote store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodelabel_controller::error::ReconcileError;
use nodelabel_controller::object::{ChangeKind, Object, ObjectList, WatchEvent};
use nodelabel_controller::reconciler::ErrorHandler;
use nodelabel_controller::store::{RemoteStore, StoreError, WatchStream};
use nodelabel_controller::ControllerConfig;
use nodelabel_reconcile::BackoffPolicy;
use serde_json::json;
use tokio::sync::mpsc;

pub const COREOS: &str = "Container Linux by CoreOS 2345.3.0 (Rhyolite)";
pub const UBUNTU: &str = "Ubuntu 20.04.1 LTS";

/// A node with the given OS image.
pub fn node(name: &str, os_image: &str) -> Object {
    Object::new(name, json!({ "nodeInfo": { "osImage": os_image } }))
}

/// Controller settings with short delays.
pub fn fast_config(workers: usize) -> ControllerConfig {
    ControllerConfig {
        workers,
        sync_timeout: Duration::from_secs(5),
        worker_restart_period: Duration::from_millis(10),
        watch_backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: 0.0,
        },
        ..ControllerConfig::default()
    }
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Object>,
    version: u64,
    list_failures: VecDeque<StoreError>,
    watchers: Vec<mpsc::UnboundedSender<Result<WatchEvent, StoreError>>>,
    watch_versions: Vec<Option<String>>,
    watch_opened: Vec<tokio::time::Instant>,
    patches: Vec<(String, String, String)>,
    in_flight: HashSet<String>,
}

/// In-memory remote store.
///
/// Successful patches update the stored object and notify active watches,
/// like a real API server would.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
    list_calls: AtomicU32,
    list_delay: Mutex<Duration>,
    fail_all_lists: AtomicBool,
    patch_attempts: AtomicU32,
    patch_failures: AtomicU32,
    fail_all_patches: AtomicBool,
    patch_delay: Mutex<Duration>,
    overlap: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_objects(objects: impl IntoIterator<Item = Object>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut state = store.state.lock().unwrap();
            for object in objects {
                state.version += 1;
                let object = object.with_resource_version(state.version.to_string());
                state.objects.insert(object.key().unwrap(), object);
            }
        }
        Arc::new(store)
    }

    // ---- scripting ----------------------------------------------------------

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_list(&self, error: StoreError) {
        self.state.lock().unwrap().list_failures.push_back(error);
    }

    pub fn fail_all_lists(&self) {
        self.fail_all_lists.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_patches(&self, count: u32) {
        self.patch_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_patches(&self) {
        self.fail_all_patches.store(true, Ordering::SeqCst);
    }

    pub fn set_patch_delay(&self, delay: Duration) {
        *self.patch_delay.lock().unwrap() = delay;
    }

    /// Change the stored objects and notify active watches.
    pub fn apply(&self, kind: ChangeKind, object: Object) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let object = object.with_resource_version(state.version.to_string());
        let key = object.key().unwrap();
        match kind {
            ChangeKind::Added | ChangeKind::Modified => {
                state.objects.insert(key, object.clone());
            }
            ChangeKind::Deleted => {
                state.objects.remove(&key);
            }
        }
        broadcast(&mut state, Ok(WatchEvent::Changed(kind, object)));
    }

    /// Change the stored objects without notifying anyone.
    pub fn apply_silently(&self, kind: ChangeKind, object: Object) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let key = object.key().unwrap();
        match kind {
            ChangeKind::Added | ChangeKind::Modified => {
                state.objects.insert(key, object);
            }
            ChangeKind::Deleted => {
                state.objects.remove(&key);
            }
        }
    }

    /// Push a raw item to active watches.
    pub fn send(&self, item: Result<WatchEvent, StoreError>) {
        let mut state = self.state.lock().unwrap();
        broadcast(&mut state, item);
    }

    /// End every active watch stream.
    pub fn close_watches(&self) {
        self.state.lock().unwrap().watchers.clear();
    }

    // ---- observations -------------------------------------------------------

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_versions(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().watch_versions.clone()
    }

    /// Time between consecutive watch opens.
    pub fn watch_gaps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap()
            .watch_opened
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    pub fn active_watches(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .watchers
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    pub fn patches(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().patches.clone()
    }

    pub fn patched_keys(&self) -> Vec<String> {
        self.patches().into_iter().map(|(key, _, _)| key).collect()
    }

    pub fn patch_attempts(&self) -> u32 {
        self.patch_attempts.load(Ordering::SeqCst)
    }

    /// Whether two patches for the same key ever ran concurrently.
    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Object> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }
}

/// Deliver to the newest open watch; older streams have been abandoned.
fn broadcast(state: &mut State, item: Result<WatchEvent, StoreError>) {
    state.watchers.retain(|tx| !tx.is_closed());
    if let Some(tx) = state.watchers.last() {
        let _ = tx.send(item);
    }
}

#[async_trait]
impl RemoteStore for FakeStore {
    async fn list_all(&self) -> Result<ObjectList, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all_lists.load(Ordering::SeqCst) {
            return Err(StoreError::Stream("list unavailable".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }

        Ok(ObjectList {
            items: state.objects.values().cloned().collect(),
            resource_version: Some(state.version.to_string()),
        })
    }

    async fn watch(&self, resource_version: Option<&str>) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            state.watch_versions.push(resource_version.map(str::to_string));
            state.watch_opened.push(tokio::time::Instant::now());
            state.watchers.push(tx);
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn patch_label(&self, key: &str, label: &str, value: &str) -> Result<(), StoreError> {
        self.patch_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.state.lock().unwrap().in_flight.insert(key.to_string()) {
            self.overlap.store(true, Ordering::SeqCst);
        }

        let delay = *self.patch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(key);

        let scripted_failure = self
            .patch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.fail_all_patches.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 500,
                body: "internal error".to_string(),
            });
        }

        state.version += 1;
        let version = state.version.to_string();
        let updated = match state.objects.get_mut(key) {
            Some(object) => {
                object.labels.insert(label.to_string(), value.to_string());
                object.resource_version = Some(version);
                object.clone()
            }
            None => {
                return Err(StoreError::Status {
                    status: 404,
                    body: format!("{key} not found"),
                })
            }
        };
        state
            .patches
            .push((key.to_string(), label.to_string(), value.to_string()));
        broadcast(
            &mut state,
            Ok(WatchEvent::Changed(ChangeKind::Modified, updated)),
        );

        Ok(())
    }
}

/// Error handler recording dropped keys.
#[derive(Default)]
pub struct RecordingErrorHandler {
    dropped: Mutex<Vec<String>>,
}

impl RecordingErrorHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dropped(&self) -> Vec<String> {
        self.dropped.lock().unwrap().clone()
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn handle_error(&self, key: &str, _error: &ReconcileError) {
        self.dropped.lock().unwrap().push(key.to_string());
    }
}
