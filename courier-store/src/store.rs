//! The keyed cache store.
//!
//! Single source of truth for cached values and their subscribers. All
//! endpoint runtimes read and write through a shared [`CacheStore`] handle so
//! that updates are visible regardless of the entry point.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use courier_core::{CacheKey, ValueShape};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::entry::{Callback, Entry, EntrySnapshot, SubscriberId};
use crate::lock::mutex_lock;
use crate::stats::{CacheStats, Counters};
use crate::subscription::Subscription;

const SOURCE: &str = "courier_store::store";

pub(crate) struct Shared {
    state: Mutex<StoreState>,
    closed_tx: watch::Sender<bool>,
    next_subscriber: AtomicU64,
    /// Monotonic clock for entry epochs and invalidation stamps.
    sequence: AtomicU64,
    counters: Counters,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<CacheKey, Entry>,
    closed: bool,
}

impl Shared {
    pub(crate) fn remove_subscriber(&self, key: &CacheKey, id: SubscriberId) {
        let mut state = mutex_lock(&self.state, SOURCE, "remove_subscriber");
        let vacant = match state.entries.get_mut(key) {
            Some(entry) => {
                entry.subscribers.retain(|(sid, _)| *sid != id);
                entry.is_vacant()
            }
            None => false,
        };
        if vacant {
            state.entries.remove(key);
        }
        debug!(key = %key, subscriber_id = id, "Subscriber removed");
    }

    pub(crate) fn is_closed(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_closed").closed
    }

    fn tick(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Keyed cache store with per-key subscriptions.
///
/// Cloning the store is cheap and yields another handle to the same state.
///
/// # Guarantees
///
/// - Operations on a key without an entry never fail; they behave as if the
///   entry existed with no value.
/// - Subscribers are notified synchronously, in registration order, after the
///   store lock is released. A panicking subscriber is logged and counted and
///   never prevents delivery to the others.
/// - After [`CacheStore::close`], writes are ignored and nothing is
///   resurrected.
/// - Invalidations and resets are stamped with a store-wide sequence number
///   (see [`CacheStore::sequence`]), so a load can tell whether the entry was
///   invalidated after it started.
#[derive(Clone)]
pub struct CacheStore {
    shared: Arc<Shared>,
}

impl CacheStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::default()),
                closed_tx,
                next_subscriber: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Get the value stored under `key`.
    ///
    /// Pure lookup; never triggers fetching.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let value = {
            let state = mutex_lock(&self.shared.state, SOURCE, "get");
            state.entries.get(key).and_then(|entry| entry.value.clone())
        };

        let counter = if value.is_some() {
            &self.shared.counters.hits
        } else {
            &self.shared.counters.misses
        };
        Counters::bump(counter, 1);
        value
    }

    /// Get the value and metadata stored under `key`.
    pub fn entry(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        let state = mutex_lock(&self.shared.state, SOURCE, "entry");
        state.entries.get(key).map(|entry| entry.snapshot(key))
    }

    /// List every key currently held.
    pub fn keys(&self) -> Vec<CacheKey> {
        let state = mutex_lock(&self.shared.state, SOURCE, "keys");
        state.entries.keys().cloned().collect()
    }

    /// Current value of the store's sequence clock.
    ///
    /// Every invalidation or reset stamped after this call carries a larger
    /// number.
    pub fn sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        mutex_lock(&self.shared.state, SOURCE, "len").entries.len()
    }

    /// Check if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Replace the value under `key`, mark it fresh and notify its subscribers.
    ///
    /// Returns false if the store is closed.
    pub fn set(&self, key: CacheKey, value: Value) -> bool {
        self.write(key, "set", None, move |_| value)
    }

    /// Store a value produced by a load that started at store sequence
    /// `started`.
    ///
    /// Subscribers are notified as for [`CacheStore::set`]. If the entry was
    /// invalidated or reset after the load started, the value is kept but the
    /// entry stays stale.
    pub fn set_loaded(&self, key: CacheKey, value: Value, started: u64) -> bool {
        self.write(key, "set_loaded", Some(started), move |_| value)
    }

    /// Apply a partial update to the value under `key`.
    ///
    /// For a [`ValueShape::Record`] with an existing object value, object
    /// updates are shallow-merged. Anything else replaces the value.
    pub fn merge(&self, key: CacheKey, shape: ValueShape, update: Value) -> bool {
        self.write(key, "merge", None, move |existing| shape.apply(existing, update))
    }

    /// Like [`CacheStore::merge`], but computes the update from the current value.
    ///
    /// The updater runs without the store lock held.
    pub fn merge_with<F>(&self, key: CacheKey, shape: ValueShape, updater: F) -> bool
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let current = self.entry(&key).and_then(|snapshot| snapshot.value);
        let update = updater(current.as_ref());
        self.merge(key, shape, update)
    }

    fn write<F>(&self, key: CacheKey, op: &'static str, started: Option<u64>, compute: F) -> bool
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let (snapshot, callbacks) = {
            let mut state = mutex_lock(&self.shared.state, SOURCE, op);
            if state.closed {
                drop(state);
                warn!(key = %key, op, "Write after close ignored");
                return false;
            }
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(self.shared.tick()));
            let next = compute(entry.value.as_ref());
            entry.write(next);
            if started.is_some_and(|started| entry.invalidated_at > started) {
                entry.is_stale = true;
            }
            (entry.snapshot(&key), entry.callbacks())
        };

        debug!(key = %key, op, subscribers = callbacks.len(), "Entry written");
        self.notify(&snapshot, callbacks);
        true
    }

    /// Mark the value under `key` stale without clearing it.
    ///
    /// Returns true if there was a value to invalidate. Subscribers are not
    /// notified because the value did not change.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut state = mutex_lock(&self.shared.state, SOURCE, "invalidate");
        match state.entries.get_mut(key) {
            Some(entry) if entry.value.is_some() => {
                entry.is_stale = true;
                entry.mark_invalidated(self.shared.tick());
                debug!(key = %key, "Entry invalidated");
                true
            }
            _ => false,
        }
    }

    /// Mark every value of one endpoint stale.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate_endpoint(&self, namespace: Option<&str>, endpoint: &str) -> usize {
        let mut state = mutex_lock(&self.shared.state, SOURCE, "invalidate_endpoint");
        let seq = self.shared.tick();
        let mut count = 0;
        for (key, entry) in state.entries.iter_mut() {
            if key.belongs_to(namespace, endpoint) && entry.value.is_some() {
                entry.is_stale = true;
                entry.mark_invalidated(seq);
                count += 1;
            }
        }
        debug!(endpoint, count, "Endpoint invalidated");
        count
    }

    /// Remove the value under `key`.
    ///
    /// Entries without subscribers are dropped entirely. Entries with
    /// subscribers keep them and notify them of the now-empty value.
    pub fn reset(&self, key: &CacheKey) -> bool {
        let (snapshot, callbacks) = {
            let mut state = mutex_lock(&self.shared.state, SOURCE, "reset");
            if state.closed {
                return false;
            }
            let has_subscribers = match state.entries.get(key) {
                Some(entry) => !entry.subscribers.is_empty(),
                None => return false,
            };
            if !has_subscribers {
                state.entries.remove(key);
                debug!(key = %key, "Entry removed");
                return true;
            }
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.value = None;
                    entry.is_stale = false;
                    entry.updated_at = None;
                    entry.mark_invalidated(self.shared.tick());
                    (entry.snapshot(key), entry.callbacks())
                }
                None => return false,
            }
        };

        debug!(key = %key, subscribers = callbacks.len(), "Entry reset");
        self.notify(&snapshot, callbacks);
        true
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Subscribe to changes of the value under `key`.
    ///
    /// The callback is invoked once immediately with the current state, then
    /// on every change. Dropping the returned [`Subscription`] (or calling
    /// [`Subscription::unsubscribe`]) removes the callback. On a closed store
    /// the subscription is inert and the callback never runs.
    pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> Subscription
    where
        F: Fn(&EntrySnapshot) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let snapshot = {
            let mut state = mutex_lock(&self.shared.state, SOURCE, "subscribe");
            if state.closed {
                return Subscription::detached(key, id);
            }
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(self.shared.tick()));
            entry.subscribers.push((id, Arc::clone(&callback)));
            entry.snapshot(&key)
        };

        debug!(key = %key, subscriber_id = id, "Subscriber added");
        self.deliver(id, &callback, &snapshot);
        Subscription::new(key, id, Arc::downgrade(&self.shared))
    }

    /// Deliver the current state of `key` to its subscribers again.
    ///
    /// Used when something observers derive from the entry changed without
    /// the value changing. Returns false if the store is closed or the key
    /// has no entry.
    pub fn republish(&self, key: &CacheKey) -> bool {
        let (snapshot, callbacks) = {
            let state = mutex_lock(&self.shared.state, SOURCE, "republish");
            if state.closed {
                return false;
            }
            match state.entries.get(key) {
                Some(entry) => (entry.snapshot(key), entry.callbacks()),
                None => return false,
            }
        };
        self.notify(&snapshot, callbacks);
        true
    }

    fn notify(&self, snapshot: &EntrySnapshot, callbacks: Vec<(SubscriberId, Callback)>) {
        for (id, callback) in callbacks {
            self.deliver(id, &callback, snapshot);
        }
    }

    fn deliver(&self, id: SubscriberId, callback: &Callback, snapshot: &EntrySnapshot) {
        Counters::bump(&self.shared.counters.notifications, 1);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
            Counters::bump(&self.shared.counters.subscriber_panics, 1);
            error!(
                key = %snapshot.key,
                subscriber_id = id,
                panic = %panic_message(panic.as_ref()),
                "Subscriber panicked during notification"
            );
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Drop entries nobody watches whose last write is older than `gc_time`.
    ///
    /// Reads, invalidations and subscription changes do not extend retention.
    ///
    /// Returns the number of entries dropped.
    pub fn collect_garbage(&self, gc_time: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(gc_time) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };

        let evicted = {
            let mut state = mutex_lock(&self.shared.state, SOURCE, "collect_garbage");
            let before = state.entries.len();
            state
                .entries
                .retain(|_, entry| {
                    !entry.subscribers.is_empty()
                        || entry.updated_at.is_some_and(|at| at > cutoff)
                });
            before - state.entries.len()
        };

        if evicted > 0 {
            Counters::bump(&self.shared.counters.evictions, evicted as u64);
            debug!(evicted, "Garbage collected cache entries");
        }
        evicted
    }

    /// Tear the store down.
    ///
    /// Clears every entry, releases every subscription and signals
    /// [`CacheStore::closed`]. Calling it again is a no-op.
    pub fn close(&self) {
        let entries = {
            let mut state = mutex_lock(&self.shared.state, SOURCE, "close");
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.entries)
        };

        self.shared.closed_tx.send_replace(true);

        let subscribers: usize = entries.values().map(|entry| entry.subscribers.len()).sum();
        info!(
            entries = entries.len(),
            subscribers, "Cache store closed"
        );
        drop(entries);
    }

    /// Check if [`CacheStore::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Future that resolves once the store is closed.
    ///
    /// Runtimes race remote calls against it so teardown cancels them.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.closed_tx.subscribe();
        async move {
            loop {
                let closed = *rx.borrow_and_update();
                if closed {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// Get store statistics.
    pub fn stats(&self) -> CacheStats {
        let (entry_count, subscriber_count) = {
            let state = mutex_lock(&self.shared.state, SOURCE, "stats");
            let subscribers: usize = state
                .entries
                .values()
                .map(|entry| entry.subscribers.len())
                .sum();
            (state.entries.len() as u64, subscribers as u64)
        };

        let counters = &self.shared.counters;
        CacheStats {
            hits: Counters::read(&counters.hits),
            misses: Counters::read(&counters.misses),
            entry_count,
            subscriber_count,
            evictions: Counters::read(&counters.evictions),
            notifications: Counters::read(&counters.notifications),
            subscriber_panics: Counters::read(&counters.subscriber_panics),
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
