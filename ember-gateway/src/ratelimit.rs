//! Gateway-side rate limiting.
//!
//! Two limits apply on the gateway: IDENTIFY concurrency across all shards
//! (`max_concurrency` per 5 seconds, declared by `/gateway/bot`) and each
//! shard's outbound frame budget (120 per 60 seconds).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::error::GatewayError;

/// A leaky gate: `rate` grants per rolling `window`.
///
/// Each grant consumes a permit; a timer returns the permit `window` after
/// the grant rather than at a fixed boundary, so bursts drain smoothly.
pub struct LeakyGate {
    semaphore: Arc<Semaphore>,
    window: Duration,
}

impl LeakyGate {
    pub fn new(rate: usize, window: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(rate)),
            window,
        }
    }

    /// Wait for a grant.
    pub async fn acquire(&self) -> Result<(), GatewayError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::ChannelClosed)?;

        let window = self.window;
        tokio::spawn(async move {
            sleep(window).await;
            drop(permit);
        });

        Ok(())
    }

    /// Grants currently available without waiting.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Exponential reconnect backoff, capped at `max`.
pub(crate) fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(millis.min(max.as_millis() as u64))
}

/// Add up to `factor` of random jitter to a duration.
pub(crate) fn with_jitter(duration: Duration, factor: f64) -> Duration {
    let range = (duration.as_millis() as f64 * factor) as u64;
    duration + Duration::from_millis(rand::rng().random_range(0..=range))
}
