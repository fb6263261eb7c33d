use crate::{
    config::{CallOptions, DedupeConfig},
    error::{DedupeError, ExecutorError},
    executor::{RateLimitedExecutor, SharedRateLimitedExecutor},
    key::CallKey,
    store::{Attach, CallRecordStore, LeaderTicket, Outcome, SharedCallRecordStore},
    sweeper::ExpirySweeper,
};
use futures::Future;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "graphql")]
use async_graphql::SimpleObject;

/// Call deduplication engine
///
/// When identical calls come in while one is in flight, only the first is
/// executed and its outcome is shared with every waiting caller. A successful
/// result keeps answering new callers until its record expires. Executions go
/// through a [`RateLimitedExecutor`].
///
/// Must be created inside a tokio runtime, since it starts its expiry sweeper.
pub struct Deduplicator<T, E> {
    store: SharedCallRecordStore<T, E>,
    executor: SharedRateLimitedExecutor,
    sweeper: Mutex<Option<ExpirySweeper>>,
    config: DedupeConfig,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    joins: AtomicU64,
    hits: AtomicU64,
}

impl<T, E> Deduplicator<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(config: DedupeConfig) -> Self {
        let executor = Arc::new(RateLimitedExecutor::new(config.dispatch_interval()));
        Self::with_executor(config, executor)
    }

    /// Create a deduplicator dispatching through a shared executor
    pub fn with_executor(config: DedupeConfig, executor: SharedRateLimitedExecutor) -> Self {
        let store: SharedCallRecordStore<T, E> = Arc::new(CallRecordStore::new());
        let sweeper = ExpirySweeper::start(store.clone(), config.sweep_interval());

        log::info!(
            "Initialized deduplicator (TTL: {}ms, sweep: {}ms, enabled: {})",
            config.expire_in_ms(),
            config.sweep_interval_ms(),
            config.enabled()
        );

        Self {
            store,
            executor,
            sweeper: Mutex::new(Some(sweeper)),
            config,
            counters: Counters::default(),
        }
    }

    /// Execute `operation(params)` with deduplication
    ///
    /// If an equal call is already in flight, wait for its outcome. If an
    /// equal call completed successfully and has not expired, return its
    /// result. Otherwise execute the operation and notify all waiting callers.
    pub async fn dedupe<P, F, Fut>(
        &self,
        operation: F,
        params: P,
        options: CallOptions,
    ) -> Result<Arc<T>, DedupeError<E>>
    where
        P: Serialize + Send + 'static,
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if self.store.is_closed() {
            return Err(DedupeError::Cleaned);
        }

        if !self.config.enabled() {
            self.counters.executions.fetch_add(1, Ordering::Relaxed);
            return settle(self.executor.execute(operation(params)).await);
        }

        let key = match &options.scope {
            Some(scope) => CallKey::scoped(scope, &params)?,
            None => CallKey::from_params(&params)?,
        };

        if options.force_call {
            self.store.evict(&key);
        }

        let expire_in = options.expire_in.unwrap_or_else(|| self.config.expire_in());

        match self.store.attach(&key, expire_in) {
            Attach::Hit(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Attach::Join(receiver) => {
                self.counters.joins.fetch_add(1, Ordering::Relaxed);
                // A dropped sender means the record was discarded by `clean`
                receiver.await.unwrap_or(Err(DedupeError::Cleaned))
            }
            Attach::Lead(ticket) => {
                self.counters.executions.fetch_add(1, Ordering::Relaxed);
                self.lead(ticket, operation, params).await
            }
            // `clean` ran after the check above
            Attach::Closed => Err(DedupeError::Cleaned),
        }
    }

    /// Execute the call for a freshly created record and complete it.
    ///
    /// Runs on its own task so that waiters are still notified if this caller
    /// stops waiting.
    async fn lead<P, F, Fut>(
        &self,
        ticket: LeaderTicket<T, E>,
        operation: F,
        params: P,
    ) -> Result<Arc<T>, DedupeError<E>>
    where
        P: Send + 'static,
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let store = self.store.clone();
        let executor = self.executor.clone();

        let handle = tokio::spawn(async move {
            log::debug!("Executing new call for key: {}", ticket.key());
            let outcome = settle(executor.execute(operation(params)).await);
            store.complete(ticket, &outcome);
            outcome
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(error) => Err(DedupeError::Executor(error.into())),
        }
    }

    /// Get statistics about records and calls
    pub fn stats(&self) -> DedupeStats {
        let store = self.store.stats();

        DedupeStats {
            records: store.records,
            in_flight: store.in_flight,
            completed: store.completed,
            waiters: store.waiters,
            detached: store.detached,
            executions: self.counters.executions.load(Ordering::Relaxed),
            joins: self.counters.joins.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
        }
    }

    /// Shut down: reject every pending waiter, clear all records and stop the sweeper.
    ///
    /// Calls made after this fail with [`DedupeError::Cleaned`].
    pub fn clean(&self) {
        // Closes the store first, so no record can be created or stored afterwards
        let rejected = self.store.reject_all(DedupeError::Cleaned);

        if let Some(mut sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.stop();
        }

        log::info!("Deduplicator cleaned up, rejected {} waiters", rejected);
    }

    pub fn is_cleaned(&self) -> bool {
        self.store.is_closed()
    }
}

fn settle<T, E>(result: Result<Result<T, E>, ExecutorError>) -> Outcome<T, E> {
    match result {
        Ok(Ok(value)) => Ok(Arc::new(value)),
        Ok(Err(error)) => Err(DedupeError::Failed(Arc::new(error))),
        Err(error) => Err(DedupeError::Executor(error)),
    }
}

/// Statistics for call deduplication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(SimpleObject))]
pub struct DedupeStats {
    /// Records currently in the store
    pub records: usize,
    pub in_flight: usize,
    pub completed: usize,
    /// Callers waiting on an in-flight call
    pub waiters: usize,
    /// Force-evicted calls still running
    pub detached: usize,
    pub executions: u64,
    pub joins: u64,
    pub hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    fn unthrottled() -> DedupeConfig {
        DedupeConfig::new(10_000, 30_000, 0)
    }

    #[tokio::test]
    async fn test_call_deduplication() {
        let deduplicator = Deduplicator::<usize, String>::new(unthrottled());
        let execution_count = Arc::new(AtomicUsize::new(0));

        // Execute multiple identical calls concurrently
        let calls = (0..5).map(|_| {
            let execution_count = execution_count.clone();
            deduplicator.dedupe(
                move |params: serde_json::Value| async move {
                    let n = execution_count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(50)).await;
                    Ok(params["id"].as_u64().unwrap() as usize * 100 + n)
                },
                json!({ "id": 1 }),
                CallOptions::new().expire_in_ms(1000),
            )
        });
        let results: Vec<_> = join_all(calls).await.into_iter().map(Result::unwrap).collect();

        // Should have executed only once due to deduplication
        assert_eq!(execution_count.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|result| Arc::ptr_eq(result, &results[0])));
        assert_eq!(*results[0], 100);

        let stats = deduplicator.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.joins, 4);
        assert_eq!(stats.waiters, 0);
    }

    #[tokio::test]
    async fn test_different_keys_not_deduplicated() {
        let deduplicator = Deduplicator::<u32, String>::new(unthrottled());
        let execution_count = Arc::new(AtomicUsize::new(0));

        let calls = [1, 2].map(|id| {
            let execution_count = execution_count.clone();
            deduplicator.dedupe(
                move |id: u32| async move {
                    execution_count.fetch_add(1, Ordering::SeqCst);
                    Ok(id)
                },
                id,
                CallOptions::new(),
            )
        });
        let results = join_all(calls).await;

        // Should have executed twice since keys are different
        assert_eq!(execution_count.load(Ordering::SeqCst), 2);
        assert_eq!(**results[0].as_ref().unwrap(), 1);
        assert_eq!(**results[1].as_ref().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disabled_config_executes_every_call() {
        let deduplicator = Deduplicator::<(), String>::new(unthrottled().with_enabled(false));
        let execution_count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let execution_count = execution_count.clone();
            deduplicator
                .dedupe(
                    move |_: u32| async move {
                        execution_count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    1,
                    CallOptions::new(),
                )
                .await
                .unwrap();
        }

        assert_eq!(execution_count.load(Ordering::SeqCst), 3);
        assert_eq!(deduplicator.stats().records, 0);
    }

    #[tokio::test]
    async fn test_serialization_failure_is_reported_immediately() {
        let deduplicator = Deduplicator::<(), String>::new(unthrottled());
        let mut params = std::collections::HashMap::new();
        params.insert(vec![1u8], 1u8);

        let result = deduplicator
            .dedupe(|_| async { Ok(()) }, params, CallOptions::new())
            .await;

        assert!(matches!(result, Err(DedupeError::Serialization(_))));
        assert_eq!(deduplicator.stats().records, 0);
    }

    #[tokio::test]
    async fn test_panicking_call_reaches_every_caller() {
        let deduplicator = Deduplicator::<u32, String>::new(unthrottled());

        let calls = (0..3).map(|_| {
            deduplicator.dedupe(
                |id: u32| async move {
                    tokio::time::sleep(StdDuration::from_millis(20)).await;
                    let ids: Vec<u32> = vec![];
                    Ok(ids[id as usize])
                },
                1u32,
                CallOptions::new(),
            )
        });

        for result in join_all(calls).await {
            assert!(matches!(
                result,
                Err(DedupeError::Executor(ExecutorError::Panicked))
            ));
        }
        assert_eq!(deduplicator.stats().records, 0);
    }
}
