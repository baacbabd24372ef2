//! Controller errors.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Failure of a single reconciliation. Always retryable.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The key is queued but the cache has no object for it, usually because
    /// the object was deleted after the key was queued.
    #[error("cache does not contain object {0}")]
    NotInCache(String),

    /// The label patch was rejected or could not be sent.
    #[error("failed to patch {key}: {source}")]
    Patch {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// Errors that stop the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The cache did not finish its initial sync in time.
    #[error("timed out after {elapsed:?} waiting for caches to sync")]
    SyncTimeout { elapsed: Duration },

    /// The watcher stopped before the cache synced.
    #[error("watcher exited before caches synced")]
    WatcherExited,
}
