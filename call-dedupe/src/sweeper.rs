use crate::store::SharedCallRecordStore;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Background task purging expired completed records on a fixed period
///
/// Must be started from within a tokio runtime. Stopping is idempotent and
/// also happens on drop.
pub struct ExpirySweeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    pub fn start<T, E>(store: SharedCallRecordStore<T, E>, period: Duration) -> Self
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        // A zero period would panic inside the task
        let period = period.max(Duration::from_millis(1));
        let (shutdown, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            // First sweep one full period after start
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = interval.tick() => {
                        let purged = store.purge_expired(Utc::now());
                        if purged > 0 {
                            log::debug!("Swept {} expired call records", purged);
                        }
                    }
                }
            }
            log::debug!("Expiry sweeper stopped");
        });

        Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop sweeping. No sweep starts after this returns.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        // Abort as well so a sweep cannot begin before the task observes shutdown
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CallKey;
    use crate::store::{Attach, CallRecordStore};
    use serde_json::json;
    use std::sync::Arc;

    fn complete_record(store: &CallRecordStore<u32, String>, id: u32, ttl: chrono::Duration) {
        let key = CallKey::from_params(&json!({ "id": id })).unwrap();
        match store.attach(&key, ttl) {
            Attach::Lead(ticket) => {
                store.complete(ticket, &Ok(Arc::new(id)));
            }
            _ => panic!("expected to lead"),
        }
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_records() {
        let store = Arc::new(CallRecordStore::<u32, String>::new());
        complete_record(&store, 1, chrono::Duration::milliseconds(20));
        complete_record(&store, 2, chrono::Duration::seconds(60));

        let mut sweeper = ExpirySweeper::start(store.clone(), Duration::from_millis(25));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(store.len(), 1);
        sweeper.stop();
    }

    #[tokio::test]
    async fn test_sweeper_leaves_in_flight_records() {
        let store = Arc::new(CallRecordStore::<u32, String>::new());
        let key = CallKey::from_params(&json!({ "id": 1 })).unwrap();
        let _ticket = store.attach(&key, chrono::Duration::milliseconds(1));

        let _sweeper = ExpirySweeper::start(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(store.contains(&key));
        assert_eq!(store.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_stopped_sweeper_no_longer_runs() {
        let store = Arc::new(CallRecordStore::<u32, String>::new());

        let mut sweeper = ExpirySweeper::start(store.clone(), Duration::from_millis(10));
        assert!(sweeper.is_running());
        sweeper.stop();
        assert!(!sweeper.is_running());

        complete_record(&store, 1, chrono::Duration::milliseconds(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.len(), 1);

        // Stopping twice is harmless
        sweeper.stop();
    }

    #[tokio::test]
    async fn test_zero_period_is_clamped() {
        let store = Arc::new(CallRecordStore::<u32, String>::new());
        complete_record(&store, 1, chrono::Duration::milliseconds(1));

        let mut sweeper = ExpirySweeper::start(store.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sweeper.is_running());
        assert!(store.is_empty());
        sweeper.stop();
    }
}
