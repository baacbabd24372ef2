//! Worker loop converging objects toward their desired labels.
//!
//! Each worker:
//! - Takes the next key from the work queue
//! - Reads the object from the cache (never from the event that queued it)
//! - Asks the predicate whether a label patch is needed and applies it
//! - Reports the outcome back to the queue: forget on success, rate-limited
//!   requeue on failure, drop once the retry budget is spent

use std::sync::Arc;

use nodelabel_reconcile::{Store, WorkQueue, DEFAULT_MAX_RETRIES};
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::object::Object;
use crate::predicate::Predicate;
use crate::store::RemoteStore;

/// Process-wide sink for errors that are no longer retried.
pub trait ErrorHandler: Send + Sync {
    /// Called once when `key` is dropped after exhausting its retries.
    fn handle_error(&self, key: &str, error: &ReconcileError);
}

/// Logs dropped keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn handle_error(&self, key: &str, error: &ReconcileError) {
        error!(key = %key, error = %error, "Reconciliation abandoned");
    }
}

/// Result of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A label patch was applied.
    Patched,
    /// The object was already in the desired state or not subject to the rule.
    NoAction,
}

/// Reconciles keys taken from the work queue.
///
/// Cloning is cheap; each worker task runs its own clone.
#[derive(Clone)]
pub struct Reconciler {
    store: Store<Object>,
    queue: WorkQueue<String>,
    remote: Arc<dyn RemoteStore>,
    predicate: Arc<dyn Predicate>,
    error_handler: Arc<dyn ErrorHandler>,
    max_retries: u32,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        store: Store<Object>,
        queue: WorkQueue<String>,
        remote: Arc<dyn RemoteStore>,
        predicate: Arc<dyn Predicate>,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            predicate,
            error_handler: Arc::new(LogErrorHandler),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Builder: set the handler for dropped keys.
    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = error_handler;
        self
    }

    /// Builder: set how many times a failing key is retried before it is dropped.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Process keys until the queue shuts down.
    pub async fn run(&self) {
        while self.process_next_item().await {}
    }

    /// Process one key. Returns false once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };

        let result = self.reconcile(item.key()).await;
        self.handle_result(item.key().clone(), result);
        item.done();
        true
    }

    /// Bring the object behind `key` to its desired labels.
    pub async fn reconcile(&self, key: &str) -> Result<Outcome, ReconcileError> {
        let Some(object) = self.store.get(key).await else {
            return Err(ReconcileError::NotInCache(key.to_string()));
        };

        let Some(patch) = self.predicate.needs_patch(&object.state, &object.labels) else {
            return Ok(Outcome::NoAction);
        };

        info!(key = %key, label = %patch.label, value = %patch.value, "Updating object");
        self.remote
            .patch_label(key, &patch.label, &patch.value)
            .await
            .map_err(|source| ReconcileError::Patch {
                key: key.to_string(),
                source,
            })?;

        Ok(Outcome::Patched)
    }

    fn handle_result(&self, key: String, result: Result<Outcome, ReconcileError>) {
        let error = match result {
            Ok(outcome) => {
                self.queue.forget(&key);
                debug!(key = %key, outcome = ?outcome, "Reconciled");
                return;
            }
            Err(error) => error,
        };

        let requeues = self.queue.num_requeues(&key);
        if requeues < self.max_retries {
            self.queue.add_rate_limited(key.clone());
            info!(key = %key, error = %error, requeues, "Error reconciling object; requeued");
            return;
        }

        self.queue.forget(&key);
        warn!(key = %key, error = %error, requeues, "Dropping object out of the queue");
        self.error_handler.handle_error(&key, &error);
    }
}
