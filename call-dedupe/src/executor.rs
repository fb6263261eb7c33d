use crate::error::ExecutorError;
use async_trait::async_trait;
use futures::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Decides when the next unit of work may be dispatched
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait until a dispatch slot is available
    async fn until_ready(&self);
}

/// Hands out dispatch slots at least `interval` apart
///
/// Concurrent callers each reserve the next free slot up front and then sleep
/// until it arrives, so no lock is held while waiting. Slot order follows
/// reservation order, which is not necessarily submission order.
pub struct IntervalThrottle {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl IntervalThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match *next_slot {
            Some(next) if next > now => next,
            _ => now,
        };
        *next_slot = Some(slot + self.interval);
        slot
    }
}

#[async_trait]
impl Throttle for IntervalThrottle {
    async fn until_ready(&self) {
        let slot = self.reserve();
        if slot > Instant::now() {
            tokio::time::sleep_until(slot).await;
        }
    }
}

/// Dispatches immediately
pub struct Unthrottled;

#[async_trait]
impl Throttle for Unthrottled {
    async fn until_ready(&self) {}
}

/// Runs work items at a bounded dispatch rate
///
/// Each item runs on its own task once its slot arrives, so a panic inside the
/// work is reported as [`ExecutorError::Panicked`] instead of unwinding into
/// the caller.
#[derive(Clone)]
pub struct RateLimitedExecutor {
    throttle: Arc<dyn Throttle>,
}

impl RateLimitedExecutor {
    /// Create an executor spacing dispatches `dispatch_interval` apart.
    /// A zero interval disables throttling.
    pub fn new(dispatch_interval: Duration) -> Self {
        if dispatch_interval.is_zero() {
            Self::unlimited()
        } else {
            Self::with_throttle(Arc::new(IntervalThrottle::new(dispatch_interval)))
        }
    }

    pub fn unlimited() -> Self {
        Self::with_throttle(Arc::new(Unthrottled))
    }

    pub fn with_throttle(throttle: Arc<dyn Throttle>) -> Self {
        Self { throttle }
    }

    /// Wait for a dispatch slot, then run `work` to completion
    pub async fn execute<Fut>(&self, work: Fut) -> Result<Fut::Output, ExecutorError>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.throttle.until_ready().await;
        tokio::spawn(work).await.map_err(|error| {
            let error = ExecutorError::from(error);
            log::warn!("Dispatched work did not complete: {}", error);
            error
        })
    }
}

/// Thread-safe wrapper for the executor
pub type SharedRateLimitedExecutor = Arc<RateLimitedExecutor>;

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn test_dispatches_are_spaced() {
        let executor = RateLimitedExecutor::new(Duration::from_millis(50));
        let start = StdInstant::now();

        let results = join_all((0..3).map(|i| executor.execute(async move { i * 2 }))).await;

        // Three slots at 0, 50 and 100ms
        assert!(start.elapsed() >= Duration::from_millis(95));
        let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_unlimited_does_not_wait() {
        let executor = RateLimitedExecutor::new(Duration::ZERO);
        let start = StdInstant::now();

        for _ in 0..10 {
            executor.execute(async {}).await.unwrap();
        }

        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_idle_throttle_dispatches_immediately() {
        let throttle = IntervalThrottle::new(Duration::from_millis(20));
        let first = throttle.reserve();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = throttle.reserve();
        assert!(second >= first + Duration::from_millis(40));
        assert!(second <= Instant::now());
    }

    #[tokio::test]
    async fn test_panicking_work_is_reported() {
        let executor = RateLimitedExecutor::unlimited();

        let result = executor
            .execute(async {
                let values: Vec<u32> = vec![];
                values[3]
            })
            .await;

        assert!(matches!(result, Err(ExecutorError::Panicked)));
    }
}
