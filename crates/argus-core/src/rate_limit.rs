//! Token-bucket rate limiting for calls to the external content source.
//!
//! Refill is computed lazily from elapsed time on each call, so there is no
//! background timer to drift and no state beyond the stored counters.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::PipelineError;

/// Upper bound on the wait hint returned by [`TokenBucket::try_acquire`].
const MAX_WAIT_HINT: Duration = Duration::from_secs(86_400);

/// Token-bucket state: capacity, refill rate, current tokens, last refill.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared, thread-safe token bucket.
///
/// Cloning shares the same bucket. Mutations happen only under the internal
/// mutex; callers sleep outside it, so a blocked waiter never holds the lock.
#[derive(Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_per_sec: f64,
    inner: Arc<Mutex<Bucket>>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            inner: Arc::new(Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity as f64);
        bucket.last_refill = now;
    }

    /// Non-blocking check: grant `n` tokens now, or return how long to wait
    /// before they will be available.
    pub fn try_acquire(&self, n: u32) -> Result<Result<(), Duration>, PipelineError> {
        if n > self.capacity {
            return Err(PipelineError::ConfigError(format!(
                "Requested {n} tokens from a bucket of capacity {}",
                self.capacity
            )));
        }
        let mut bucket = self.lock_inner();
        self.refill(&mut bucket);
        if bucket.tokens >= n as f64 {
            bucket.tokens -= n as f64;
            Ok(Ok(()))
        } else {
            let deficit = n as f64 - bucket.tokens;
            let secs = deficit / self.refill_per_sec;
            // A zero refill rate makes the hint infinite; cap it so the
            // Duration conversion stays valid and waiters can still time out.
            let wait = if secs.is_finite() {
                Duration::from_secs_f64(secs.min(MAX_WAIT_HINT.as_secs_f64()))
            } else {
                MAX_WAIT_HINT
            };
            Ok(Err(wait))
        }
    }

    /// Blocking variant: suspend until `n` tokens are granted or `timeout`
    /// elapses, then fail with `RateLimitTimeout`.
    pub async fn acquire(&self, n: u32, timeout: Duration) -> Result<(), PipelineError> {
        let start = Instant::now();
        loop {
            let wait = match self.try_acquire(n)? {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let elapsed = start.elapsed();
            if elapsed + wait > timeout {
                return Err(PipelineError::RateLimitTimeout {
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            tracing::debug!(wait_ms = %wait.as_millis(), "Waiting for rate limiter tokens");
            tokio::time::sleep(wait).await;
        }
    }

    /// Currently available tokens (after lazy refill). For monitoring.
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock_inner();
        self.refill(&mut bucket);
        bucket.tokens
    }
}
