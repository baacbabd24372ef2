//! Reconciliation controller primitives.
//!
//! This library provides the building blocks for level-triggered
//! controllers that converge remote objects toward a desired state.
//! Key concepts:
//!
//! - **Object cache**: a local mirror of remote state, written by a single
//!   watcher and read by any number of workers ([`cache`]).
//! - **Work queue**: a deduplicating queue of keys with "currently processing"
//!   exclusion and rate-limited requeues ([`queue`]).
//! - **Rate limiting**: per-key exponential backoff combined with an overall
//!   token bucket ([`rate_limit`]).
//!
//! # Invariants
//!
//! - At most one in-flight reconciliation per key
//! - A key added while it is processing is reprocessed once afterwards
//! - Workers always re-read current state; event payloads are never trusted

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub mod cache;
pub mod queue;
pub mod rate_limit;

pub use cache::{store, Store, Writer};
pub use queue::{Processing, WorkQueue};
pub use rate_limit::{
    default_controller_rate_limiter, BackoffPolicy, BucketRateLimiter,
    ItemExponentialRateLimiter, MaxOfRateLimiter, RateLimiter,
};

/// Default number of retries before a key is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default time allowed for the initial cache sync.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay before a crashed worker is restarted.
pub const DEFAULT_WORKER_RESTART_PERIOD: Duration = Duration::from_secs(1);

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// None of the guarded structures can be left half-updated by a panic, so
/// the poisoned state carries no extra information.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
