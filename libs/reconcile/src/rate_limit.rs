//! Rate limiters deciding how long a failed key waits before it is retried.
//!
//! The per-key failure count kept by a limiter is the key's retry counter:
//! [`RateLimiter::when`] increments it, [`RateLimiter::forget`] resets it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::lock;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(800),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let delay = self.base.as_secs_f64() * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter > 0.0 && delay.is_finite() {
            let range = delay * jitter;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        saturating_duration((delay + jitter).max(0.0))
    }
}

/// Seconds to a `Duration`, saturating at `Duration::MAX` instead of panicking.
fn saturating_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

// =============================================================================
// Rate Limiters
// =============================================================================

/// Decides the requeue delay for a key and tracks its retry counter.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be processed again. Records one more failure.
    fn when(&self, key: &K) -> Duration;

    /// Stop tracking `key`, resetting its retry counter.
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialRateLimiter<K> {
    /// Create a new per-key exponential limiter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> RateLimiter<K> for ItemExponentialRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Overall token bucket shared by every key.
///
/// Each call to [`RateLimiter::when`] reserves one token; once the bucket is
/// empty the returned delay is the time until that reservation is covered.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second, holding at most `burst`.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            saturating_duration(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Combines limiters: the delay is the longest any of them asks for.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K>
where
    K: Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        // Every limiter has to observe the failure, so no short-circuiting.
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key base delay of the default controller limiter.
pub const DEFAULT_ITEM_BASE_DELAY: Duration = Duration::from_millis(5);

/// Per-key delay ceiling of the default controller limiter.
pub const DEFAULT_ITEM_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Overall requeue rate of the default controller limiter.
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;

/// Overall requeue burst of the default controller limiter.
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// Per-key exponential backoff (5ms..1000s) combined with a 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(
            DEFAULT_ITEM_BASE_DELAY,
            DEFAULT_ITEM_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(
            DEFAULT_BUCKET_QPS,
            DEFAULT_BUCKET_BURST,
        )),
    ])
}
