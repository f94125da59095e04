//! Client-side request throttling for the completion service.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Caps in-flight requests and spaces out request starts.
#[derive(Debug)]
pub struct Throttle {
    permits: Arc<Semaphore>,
    min_interval: Duration,
    next_start: Mutex<Option<Instant>>,
}

/// Held for the duration of one request. Owned, so it can travel with a
/// request that outlives the caller waiting on it.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

impl Throttle {
    #[inline]
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_interval,
            next_start: Mutex::new(None),
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse all waiting and future requests.
    #[inline]
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait for a free slot and for the minimum spacing since the previous
    /// start. Fails only once the throttle is closed.
    #[inline]
    pub async fn acquire(&self) -> Result<ThrottlePermit, AcquireError> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;

        let wait = {
            let mut next_start = self.next_start.lock().await;
            let now = Instant::now();
            let start = next_start.map_or(now, |slot| slot.max(now));
            *next_start = Some(start + self.min_interval);
            start - now
        };

        if !wait.is_zero() {
            debug!("Throttling completion request for {:?}", wait);
            tokio::time::sleep(wait).await;
        }

        Ok(ThrottlePermit { _permit: permit })
    }
}
