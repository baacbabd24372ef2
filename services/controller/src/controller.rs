//! Controller lifecycle.
//!
//! ```text
//! Created -> Syncing -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! - **Syncing**: the watcher lists and starts watching in the background; the
//!   controller waits (bounded) for the has-synced signal
//! - **Running**: the worker pool drains the work queue
//! - **ShuttingDown**: the queue is shut down, in-flight reconciliations finish
//!   and the watcher's subscription is dropped
//!
//! Workers never start before the cache has synced. A sync timeout is fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nodelabel_reconcile::{
    store, BackoffPolicy, RateLimiter, Store, WorkQueue, Writer, DEFAULT_MAX_RETRIES,
    DEFAULT_SYNC_TIMEOUT, DEFAULT_WORKER_RESTART_PERIOD,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::object::Object;
use crate::predicate::Predicate;
use crate::reconciler::{ErrorHandler, LogErrorHandler, Reconciler};
use crate::store::RemoteStore;
use crate::watcher::{wait_for_shutdown, Watcher};

/// Name of the controller's work queue.
const QUEUE_NAME: &str = "nodes";

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, nothing running yet.
    Created,
    /// Watcher running, waiting for the initial sync.
    Syncing,
    /// Workers processing the queue.
    Running,
    /// Draining workers and stopping the watcher.
    ShuttingDown,
    /// Everything stopped.
    Stopped,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of worker tasks.
    pub workers: usize,

    /// Maximum time to wait for the initial cache sync.
    pub sync_timeout: Duration,

    /// Retries before a failing key is dropped.
    pub max_retries: u32,

    /// Delay before a crashed worker is restarted.
    pub worker_restart_period: Duration,

    /// Backoff for watch reconnects and relists.
    pub watch_backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            worker_restart_period: DEFAULT_WORKER_RESTART_PERIOD,
            watch_backoff: BackoffPolicy::default(),
        }
    }
}

/// Level-triggered label controller.
pub struct Controller {
    remote: Arc<dyn RemoteStore>,
    predicate: Arc<dyn Predicate>,
    error_handler: Arc<dyn ErrorHandler>,
    queue: WorkQueue<String>,
    store: Store<Object>,
    writer: Writer<Object>,
    config: ControllerConfig,
    state: watch::Sender<LifecycleState>,
}

impl Controller {
    /// Create a controller using the default controller rate limiter.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        predicate: Arc<dyn Predicate>,
        config: ControllerConfig,
    ) -> Self {
        let (store, writer) = store();
        let (state, _) = watch::channel(LifecycleState::Created);

        Self {
            remote,
            predicate,
            error_handler: Arc::new(LogErrorHandler),
            queue: WorkQueue::with_default_rate_limiter(QUEUE_NAME),
            store,
            writer,
            config,
            state,
        }
    }

    /// Builder: set the handler for dropped keys.
    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = error_handler;
        self
    }

    /// Builder: replace the requeue rate limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: impl RateLimiter<String> + 'static) -> Self {
        self.queue = WorkQueue::new(QUEUE_NAME, rate_limiter);
        self
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Read-only view of the object cache.
    pub fn store(&self) -> Store<Object> {
        self.store.clone()
    }

    /// The controller's work queue.
    pub fn queue(&self) -> WorkQueue<String> {
        self.queue.clone()
    }

    /// Run until `shutdown` is signalled.
    ///
    /// Returns an error only if the initial cache sync fails; a stop signal
    /// during the sync wait shuts down cleanly without starting workers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let Controller {
            remote,
            predicate,
            error_handler,
            queue,
            store,
            writer,
            config,
            state,
        } = self;

        let (watcher_stop, watcher_stop_rx) = watch::channel(false);
        let watcher = Watcher::new(
            Arc::clone(&remote),
            writer,
            queue.clone(),
            config.watch_backoff.clone(),
        );

        transition(&state, LifecycleState::Syncing);
        let watcher_handle = tokio::spawn(watcher.run(watcher_stop_rx));

        info!(
            timeout_secs = config.sync_timeout.as_secs(),
            "Waiting for caches to sync"
        );
        let started = Instant::now();
        let synced = tokio::select! {
            result = tokio::time::timeout(config.sync_timeout, store.wait_until_synced()) => {
                match result {
                    Ok(true) => Ok(true),
                    Ok(false) => Err(ControllerError::WatcherExited),
                    Err(_) => Err(ControllerError::SyncTimeout {
                        elapsed: started.elapsed(),
                    }),
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => Ok(false),
        };

        match synced {
            Ok(true) => {
                let object_count = store.len().await;
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    object_count,
                    "Caches synced"
                );
            }
            Ok(false) => {
                info!("Shutdown requested before caches synced");
                transition(&state, LifecycleState::ShuttingDown);
                stop_watcher(&queue, &watcher_stop, watcher_handle).await;
                transition(&state, LifecycleState::Stopped);
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "Failed waiting for caches to sync");
                transition(&state, LifecycleState::ShuttingDown);
                stop_watcher(&queue, &watcher_stop, watcher_handle).await;
                transition(&state, LifecycleState::Stopped);
                return Err(e);
            }
        }

        let reconciler = Reconciler::new(store, queue.clone(), remote, predicate)
            .with_error_handler(error_handler)
            .with_max_retries(config.max_retries);

        let worker_count = config.workers.max(1);
        let workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                tokio::spawn(supervise_worker(
                    id,
                    reconciler.clone(),
                    queue.clone(),
                    config.worker_restart_period,
                ))
            })
            .collect();

        transition(&state, LifecycleState::Running);
        info!(workers = worker_count, "Controller running");

        wait_for_shutdown(&mut shutdown).await;
        info!("Stopping controller");
        transition(&state, LifecycleState::ShuttingDown);

        // Workers finish what they hold, drain the queue and exit.
        queue.shut_down();
        for (id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, error = %e, "Worker supervisor failed");
            }
        }

        stop_watcher(&queue, &watcher_stop, watcher_handle).await;
        transition(&state, LifecycleState::Stopped);
        info!("Controller stopped");
        Ok(())
    }
}

fn transition(state: &watch::Sender<LifecycleState>, next: LifecycleState) {
    let previous = state.send_replace(next);
    debug!(from = ?previous, to = ?next, "Lifecycle transition");
}

async fn stop_watcher(
    queue: &WorkQueue<String>,
    watcher_stop: &watch::Sender<bool>,
    watcher_handle: JoinHandle<()>,
) {
    queue.shut_down();
    watcher_stop.send_replace(true);
    if let Err(e) = watcher_handle.await {
        error!(error = %e, "Watcher task failed");
    }
}

/// Run one worker, restarting it after a panic until the queue shuts down.
async fn supervise_worker(
    id: usize,
    reconciler: Reconciler,
    queue: WorkQueue<String>,
    restart_period: Duration,
) {
    debug!(worker = id, "Worker started");

    loop {
        let worker = reconciler.clone();
        match tokio::spawn(async move { worker.run().await }).await {
            Ok(()) => {
                debug!(worker = id, "Worker exited");
                return;
            }
            Err(e) if e.is_panic() => {
                error!(worker = id, error = %e, "Worker panicked");
            }
            Err(e) => {
                warn!(worker = id, error = %e, "Worker cancelled");
                return;
            }
        }

        if queue.shutting_down() {
            return;
        }

        tokio::time::sleep(restart_period).await;
        info!(worker = id, "Restarting worker");
    }
}
