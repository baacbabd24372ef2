//! Deduplicating, rate-limited work queue.
//!
//! The queue tracks three sets of keys:
//!
//! - `queue`: keys waiting to be handed to a worker, in FIFO order
//! - `dirty`: keys that need processing (every queued key, plus keys re-added
//!   while they were being processed)
//! - `processing`: keys currently held by a worker
//!
//! A key is never in `queue` while it is in `processing`. Adding a key that is
//! being processed only marks it dirty; [`WorkQueue::done`] puts it back on the
//! queue. Together this gives at most one concurrent reconciliation per key
//! without losing a change that arrived mid-flight.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use crate::lock;
use crate::rate_limit::{default_controller_rate_limiter, RateLimiter};

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

/// Work queue shared between the producer of keys and a pool of workers.
///
/// Cloning is cheap; all clones share the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a queue using the given rate limiter for requeues.
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown,
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Create a queue with the default controller rate limiter.
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a key.
    ///
    /// No-op if the key is already queued. If the key is being processed it
    /// is queued again once the worker calls [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        let mut state = lock(&self.inner.state);
        if state.shutting_down {
            debug!(queue = %self.inner.name, key = ?key, "Queue shutting down, ignoring add");
            return;
        }

        if !state.dirty.insert(key.clone()) {
            return;
        }

        if state.processing.contains(&key) {
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue a key once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime. Pending delayed adds are
    /// discarded when the queue shuts down.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.shutting_down() {
            return;
        }

        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = shutdown.wait_for(|stopped| *stopped) => {}
            }
        });
    }

    /// Enqueue a key after the delay chosen by the rate limiter.
    ///
    /// Increments the key's retry counter.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        debug!(
            queue = %self.inner.name,
            key = ?key,
            delay_ms = delay.as_millis() as u64,
            "Requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Number of consecutive failures recorded for the key.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Reset the key's retry counter.
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down and drained. The returned
    /// guard marks the key as processing until it is dropped or
    /// [`Processing::done`] is called.
    pub async fn get(&self) -> Option<Processing<K>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.inner.state);
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(Processing {
                        key,
                        queue: self.clone(),
                        released: false,
                    });
                }

                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key as no longer being processed.
    ///
    /// If the key was added again while it was processing, it goes back on the
    /// queue. Calling this for a key that is not processing does nothing.
    pub fn done(&self, key: &K) {
        let mut state = lock(&self.inner.state);
        if !state.processing.remove(key) {
            return;
        }

        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting new keys and wake every blocked [`WorkQueue::get`].
    ///
    /// Keys already queued are still handed out; `get` returns `None` once
    /// they are gone.
    pub fn shut_down(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }

        info!(queue = %self.inner.name, "Shutting down work queue");
        self.inner.shutdown.send_replace(true);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Returns true if no key is waiting to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a worker currently holds the key.
    pub fn is_processing(&self, key: &K) -> bool {
        lock(&self.inner.state).processing.contains(key)
    }
}

/// A key handed out by [`WorkQueue::get`].
///
/// Dropping the guard marks the key done, so the processing exclusion is
/// released on every exit path, including early returns and panics.
pub struct Processing<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    key: K,
    queue: WorkQueue<K>,
    released: bool,
}

impl<K> Processing<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// The key being processed.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release the key explicitly.
    pub fn done(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.queue.done(&self.key);
        }
    }
}

impl<K> Drop for Processing<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.release();
    }
}

impl<K> Debug for Processing<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processing")
            .field("key", &self.key)
            .field("queue", &self.queue.name())
            .finish()
    }
}
