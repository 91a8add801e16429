//! Bucket-based rate limiting.
//!
//! Discord isolates rate limits per bucket: one window per (route template,
//! major parameters) pair, plus a client-wide global limit that can fire
//! independently of any bucket. State is server-authoritative, read from
//! response headers; this module only serializes requests and waits out the
//! windows the server reports.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::HttpError;

/// Serializes requests within one rate-limit bucket.
///
/// At most one request holds the bucket at any instant. When a response
/// reports the bucket exhausted, the holder defers the release so the next
/// request waits out the reset window locally instead of collecting a
/// guaranteed 429 from the API.
pub struct BucketLock {
    semaphore: Arc<Semaphore>,
}

impl BucketLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for exclusive use of the bucket.
    pub async fn acquire(&self) -> Result<BucketGuard, HttpError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HttpError::Internal("bucket semaphore closed".into()))?;

        Ok(BucketGuard {
            permit: Some(permit),
        })
    }
}

impl Default for BucketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped hold on a [`BucketLock`], released on drop unless deferred.
pub struct BucketGuard {
    permit: Option<OwnedSemaphorePermit>,
}

impl BucketGuard {
    /// Reschedule the release to `delay` from now.
    ///
    /// Called when the response reports no remaining capacity: the bucket
    /// stays locked past the end of the request, and the timer returns it
    /// once the window resets. After the timer fires the guard behaves as if
    /// it had been dropped.
    pub fn defer(&mut self, delay: Duration) {
        if let Some(permit) = self.permit.take() {
            debug!(delay_ms = delay.as_millis() as u64, "deferring bucket release");
            tokio::spawn(async move {
                sleep(delay).await;
                drop(permit);
            });
        }
    }
}

/// Owns the global gate and the bucket-key to lock map.
///
/// The bucket map grows on first reference and entries are never removed.
pub struct RateLimitManager {
    buckets: DashMap<String, Arc<BucketLock>>,
    /// Deadline until which the global gate is closed, if any.
    global_until: Mutex<Option<Instant>>,
}

impl RateLimitManager {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            global_until: Mutex::new(None),
        }
    }

    /// Wait for the global gate to open, then lock the request's bucket.
    ///
    /// Requests that have already passed the global check are unaffected by
    /// later closures. Fairness among waiters is best-effort.
    pub async fn acquire(&self, bucket: &str) -> Result<BucketGuard, HttpError> {
        loop {
            let deadline = { *self.global_until.lock() };
            match deadline {
                Some(until) if until > Instant::now() => sleep_until(until).await,
                _ => break,
            }
        }

        let lock = self
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .clone();
        lock.acquire().await
    }

    /// Close the global gate; it reopens `wait` from now.
    ///
    /// Repeated closures re-arm the same deadline; the latest call wins.
    pub fn close_global(&self, wait: Duration) {
        warn!(wait_ms = wait.as_millis() as u64, "global rate limit hit");
        *self.global_until.lock() = Some(Instant::now() + wait);
    }
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new()
    }
}
