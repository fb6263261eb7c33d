use crate::{error::DedupeError, key::CallKey};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// What every caller of one execution eventually receives
pub type Outcome<T, E> = Result<Arc<T>, DedupeError<E>>;

type Waiter<T, E> = oneshot::Sender<Outcome<T, E>>;

/// Pending listeners of one in-flight call, in attachment order.
/// Shared between the store and the call's leader.
type WaiterList<T, E> = Arc<Mutex<Vec<Waiter<T, E>>>>;

enum CallState<T, E> {
    InFlight(WaiterList<T, E>),
    Completed(Arc<T>),
}

/// A single logical call, in flight or recently completed
pub(crate) struct CallRecord<T, E> {
    id: u64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: CallState<T, E>,
}

impl<T, E> CallRecord<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self.state, CallState::Completed(_))
    }

    /// A record is stale once its own TTL has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn waiter_count(&self) -> usize {
        match &self.state {
            CallState::InFlight(waiters) => lock(waiters).len(),
            CallState::Completed(_) => 0,
        }
    }

    fn cached(&self, now: DateTime<Utc>) -> Option<Arc<T>> {
        match &self.state {
            CallState::Completed(value) if !self.is_expired(now) => Some(value.clone()),
            _ => None,
        }
    }

    fn join(&self) -> Option<oneshot::Receiver<Outcome<T, E>>> {
        match &self.state {
            CallState::InFlight(waiters) => {
                let (tx, rx) = oneshot::channel();
                lock(waiters).push(tx);
                Some(rx)
            }
            CallState::Completed(_) => None,
        }
    }
}

/// Result of consulting the store for a key
pub enum Attach<T, E> {
    /// Unexpired completed record, no execution needed
    Hit(Arc<T>),
    /// Another caller is executing; wait for its outcome
    Join(oneshot::Receiver<Outcome<T, E>>),
    /// This caller created the record and must execute the call
    Lead(LeaderTicket<T, E>),
    /// The store was shut down by `reject_all`
    Closed,
}

/// Handed to the caller that must execute a call and later complete it
pub struct LeaderTicket<T, E> {
    key: CallKey,
    id: u64,
    waiters: WaiterList<T, E>,
}

impl<T, E> LeaderTicket<T, E> {
    pub fn key(&self) -> &CallKey {
        &self.key
    }
}

/// Counts describing the store at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub waiters: usize,
    pub detached: usize,
}

/// Key to record mapping with atomic compound operations
///
/// Every operation runs under the key's shard lock and never blocks on
/// anything else, so callers and the sweeper can mutate it concurrently.
pub struct CallRecordStore<T, E> {
    records: DashMap<CallKey, CallRecord<T, E>>,
    /// Waiters of force-evicted in-flight records, by record id.
    /// Their leaders still drain them; `reject_all` reaches them here.
    detached: DashMap<u64, WaiterList<T, E>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T, E> Default for CallRecordStore<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> CallRecordStore<T, E> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            detached: DashMap::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Return a cached value, join an in-flight call, or start a new one
    pub fn attach(&self, key: &CallKey, expire_in: Duration) -> Attach<T, E> {
        self.attach_at(key, expire_in, Utc::now())
    }

    pub fn attach_at(&self, key: &CallKey, expire_in: Duration, now: DateTime<Utc>) -> Attach<T, E> {
        let entry = self.records.entry(key.clone());
        // Checked under the entry lock; `reject_all` sets it before clearing
        if self.is_closed() {
            return Attach::Closed;
        }

        match entry {
            Entry::Occupied(mut entry) => {
                if let Some(value) = entry.get().cached(now) {
                    log::debug!("Cache hit for key: {}", key);
                    return Attach::Hit(value);
                }
                // In-flight records are joined regardless of age
                if let Some(receiver) = entry.get().join() {
                    log::debug!("Call already pending for key: {}", key);
                    return Attach::Join(receiver);
                }

                log::debug!(
                    "Replacing expired record for key: {} (created at {})",
                    key,
                    entry.get().created_at
                );
                let (record, ticket) = self.start(key, expire_in, now);
                entry.insert(record);
                Attach::Lead(ticket)
            }
            Entry::Vacant(entry) => {
                log::debug!("Starting new call for key: {}", key);
                let (record, ticket) = self.start(key, expire_in, now);
                entry.insert(record);
                Attach::Lead(ticket)
            }
        }
    }

    fn start(&self, key: &CallKey, expire_in: Duration, now: DateTime<Utc>) -> (CallRecord<T, E>, LeaderTicket<T, E>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let waiters: WaiterList<T, E> = Arc::new(Mutex::new(Vec::new()));
        let expires_at = now.checked_add_signed(expire_in).unwrap_or(if expire_in < Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });

        let record = CallRecord {
            id,
            created_at: now,
            expires_at,
            state: CallState::InFlight(waiters.clone()),
        };
        let ticket = LeaderTicket {
            key: key.clone(),
            id,
            waiters,
        };
        (record, ticket)
    }

    /// Remove any record for `key`. Returns whether one existed.
    ///
    /// An evicted in-flight record keeps its waiters; its leader still
    /// delivers to them on completion.
    pub fn evict(&self, key: &CallKey) -> bool {
        match self.records.entry(key.clone()) {
            Entry::Occupied(entry) => {
                if let CallState::InFlight(waiters) = &entry.get().state {
                    self.detached.insert(entry.get().id, waiters.clone());
                }
                entry.remove();
                log::debug!("Evicted record for key: {}", key);
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Record a leader's outcome and deliver it to every queued waiter.
    ///
    /// A success is stored for later cache hits; a failure removes the record
    /// so the next caller executes again. Returns the number of waiters notified.
    pub fn complete(&self, ticket: LeaderTicket<T, E>, outcome: &Outcome<T, E>) -> usize {
        let LeaderTicket { key, id, waiters } = ticket;

        // Only touch the record this ticket created, never a newer one
        match outcome {
            Ok(value) => match self.records.entry(key.clone()) {
                Entry::Occupied(mut entry) if entry.get().id == id => {
                    // A closed store keeps nothing, even if `reject_all` already passed this key
                    if self.is_closed() {
                        entry.remove();
                    } else {
                        entry.get_mut().state = CallState::Completed(value.clone());
                    }
                }
                _ => {}
            },
            Err(_) => {
                self.records.remove_if(&key, |_, record| record.id == id);
            }
        }
        self.detached.remove(&id);

        // No new waiter can attach past this point
        let notified = drain(&waiters, outcome);
        log::debug!("Notified {} waiters for key: {}", notified, key);
        notified
    }

    /// Delete completed records whose TTL has elapsed. In-flight records are kept.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        self.records.retain(|_, record| {
            let stale = record.is_completed() && record.is_expired(now);
            if stale {
                purged += 1;
            }
            !stale
        });
        purged
    }

    /// Close the store, fail every pending waiter with `reason` and empty it.
    /// Returns the number of waiters rejected.
    ///
    /// After this, `attach` answers [`Attach::Closed`] and `complete` stores nothing.
    pub fn reject_all(&self, reason: DedupeError<E>) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let outcome: Outcome<T, E> = Err(reason);
        let mut rejected = 0;

        self.records.retain(|_, record| {
            if let CallState::InFlight(waiters) = &record.state {
                rejected += drain(waiters, &outcome);
            }
            false
        });
        self.detached.retain(|_, waiters| {
            rejected += drain(waiters, &outcome);
            false
        });

        rejected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();

        for entry in self.records.iter() {
            stats.records += 1;
            if entry.value().is_completed() {
                stats.completed += 1;
            } else {
                stats.in_flight += 1;
                stats.waiters += entry.value().waiter_count();
            }
        }
        for entry in self.detached.iter() {
            stats.detached += 1;
            stats.waiters += lock(entry.value()).len();
        }

        stats
    }
}

fn lock<T, E>(waiters: &WaiterList<T, E>) -> MutexGuard<'_, Vec<Waiter<T, E>>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deliver `outcome` to every waiter in attachment order, then clear the list
fn drain<T, E>(waiters: &WaiterList<T, E>, outcome: &Outcome<T, E>) -> usize {
    let waiters = std::mem::take(&mut *lock(waiters));
    let count = waiters.len();
    for waiter in waiters {
        // The receiver may have given up waiting
        let _ = waiter.send(outcome.clone());
    }
    count
}

/// Thread-safe wrapper for the store
pub type SharedCallRecordStore<T, E> = Arc<CallRecordStore<T, E>>;
