//! Query endpoints.
//!
//! A query wraps a caller-supplied async fetch function. Each distinct
//! argument value gets its own cache entry; reads, invalidation, resets and
//! partial updates all go through the shared store so they are visible to
//! every subscriber regardless of entry point.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use courier_core::{
    CacheKey, CourierError, CourierResult, EndpointError, RemoteError, StaleTime, Timestamp,
    ValueShape,
};
use courier_store::lock::mutex_lock;
use courier_store::{EntrySnapshot, Subscription};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::scope::{decode, encode, Scope};
use crate::{Args, Data};

const SOURCE: &str = "courier_api::query";

/// Remote read operation behind a query endpoint.
///
/// Any `Fn(A) -> impl Future<Output = CourierResult<T>>` closure is a fetcher.
#[async_trait]
pub trait QueryFetcher<A, T>: Send + Sync {
    async fn fetch(&self, args: A) -> CourierResult<T>;
}

#[async_trait]
impl<A, T, F, Fut> QueryFetcher<A, T> for F
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = CourierResult<T>> + Send,
{
    async fn fetch(&self, args: A) -> CourierResult<T> {
        (self)(args).await
    }
}

/// Per-endpoint query settings.
#[derive(Debug, Clone)]
pub struct QueryOptions<T> {
    /// Returned by reads while the entry holds no value.
    pub placeholder: Option<T>,
    /// Overrides the scope's default stale time.
    pub stale_time: Option<StaleTime>,
    /// Disabled endpoints are populated externally and refuse to fetch.
    pub enabled: bool,
    pub shape: ValueShape,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            placeholder: None,
            stale_time: None,
            enabled: true,
            shape: ValueShape::default(),
        }
    }
}

/// Declaration of a query endpoint, not yet bound to a store.
pub struct QueryDef<A, T> {
    name: String,
    fetcher: Arc<dyn QueryFetcher<A, T>>,
    options: QueryOptions<T>,
}

impl<A: Args, T: Data> QueryDef<A, T> {
    pub fn new<F>(name: impl Into<String>, fetcher: F) -> Self
    where
        F: QueryFetcher<A, T> + 'static,
    {
        Self {
            name: name.into(),
            fetcher: Arc::new(fetcher),
            options: QueryOptions::default(),
        }
    }

    /// Query whose entries are written only by updates and pushes.
    ///
    /// Fetching it is a programmer error and fails with
    /// [`EndpointError::Disabled`].
    pub fn external(name: impl Into<String>) -> Self {
        let name = name.into();
        let endpoint = name.clone();
        let mut def = Self::new(name, move |_: A| {
            let endpoint = endpoint.clone();
            async move { Err::<T, CourierError>(EndpointError::Disabled { endpoint }.into()) }
        });
        def.options.enabled = false;
        def
    }

    pub fn placeholder(mut self, data: T) -> Self {
        self.options.placeholder = Some(data);
        self
    }

    pub fn stale_time(mut self, stale_time: StaleTime) -> Self {
        self.options.stale_time = Some(stale_time);
        self
    }

    pub fn shape(mut self, shape: ValueShape) -> Self {
        self.options.shape = shape;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.options.enabled = false;
        self
    }

    pub fn options(mut self, options: QueryOptions<T>) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the declaration to a scope, producing a live endpoint.
    pub fn bind(self, scope: &Scope) -> QueryEndpoint<A, T> {
        let stale_time = self
            .options
            .stale_time
            .unwrap_or_else(|| scope.default_stale_time());
        QueryEndpoint {
            inner: Arc::new(QueryInner {
                name: self.name,
                scope: scope.clone(),
                fetcher: self.fetcher,
                stale_time,
                auto_fetch: scope.auto_fetch_on_subscribe(),
                options: self.options,
                in_flight: Mutex::new(HashMap::new()),
                loads: Mutex::new(HashMap::new()),
                next_load: AtomicU64::new(1),
            }),
        }
    }
}

/// Read-side view of one query entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Cached data, or the placeholder while nothing is cached.
    pub data: Option<T>,
    pub is_placeholder: bool,
    /// The entry was invalidated since its last write.
    pub is_stale: bool,
    pub updated_at: Option<Timestamp>,
    /// A fetch for this entry is in flight.
    pub is_fetching: bool,
    /// Error of the most recent failed load, cleared by the next success.
    pub last_error: Option<CourierError>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_placeholder: false,
            is_stale: false,
            updated_at: None,
            is_fetching: false,
            last_error: None,
        }
    }
}

impl<T> QueryState<T> {
    /// Returns true if real (non-placeholder) data is present.
    pub fn has_data(&self) -> bool {
        self.data.is_some() && !self.is_placeholder
    }

    /// First load still running.
    pub fn is_loading(&self) -> bool {
        self.is_fetching && !self.has_data()
    }
}

type InFlight = Shared<BoxFuture<'static, CourierResult<Value>>>;

/// One remote call for a key, shared by every fetch that joins it.
struct Load {
    id: u64,
    /// Store sequence when the call started. Invalidations stamped later are
    /// not covered by its result.
    started: u64,
    /// The result is in hand and being written; no longer reported as fetching.
    settled: bool,
    task: InFlight,
}

#[derive(Debug, Default)]
struct LoadMeta {
    /// Epoch of the entry that a load on subscribe was last started for.
    auto_fetched: Option<u64>,
    last_error: Option<CourierError>,
}

struct QueryInner<A, T> {
    name: String,
    scope: Scope,
    fetcher: Arc<dyn QueryFetcher<A, T>>,
    options: QueryOptions<T>,
    stale_time: StaleTime,
    auto_fetch: bool,
    in_flight: Mutex<HashMap<CacheKey, Load>>,
    loads: Mutex<HashMap<CacheKey, LoadMeta>>,
    next_load: AtomicU64,
}

/// A query endpoint bound to a store.
///
/// Cloning yields another handle to the same endpoint.
pub struct QueryEndpoint<A, T> {
    inner: Arc<QueryInner<A, T>>,
}

impl<A, T> Clone for QueryEndpoint<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> fmt::Debug for QueryEndpoint<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEndpoint")
            .field("name", &self.inner.name)
            .field("stale_time", &self.inner.stale_time)
            .field("enabled", &self.inner.options.enabled)
            .finish()
    }
}

impl<A: Args, T: Data> QueryEndpoint<A, T> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.options.enabled
    }

    pub fn stale_time(&self) -> StaleTime {
        self.inner.stale_time
    }

    pub fn shape(&self) -> ValueShape {
        self.inner.options.shape
    }

    /// Cache key for one argument value.
    pub fn key(&self, args: &A) -> CourierResult<CacheKey> {
        Ok(self.inner.scope.key(&self.inner.name, args)?)
    }

    /// Fetch the value for `args`.
    ///
    /// A fresh cached value that was not invalidated is returned without
    /// calling the fetcher. Concurrent fetches of the same key share one
    /// remote call, unless the entry was invalidated after that call started;
    /// a value loaded across an invalidation is cached but stays stale. On
    /// failure the cached value is left untouched and the
    /// error is returned. Closing the store cancels the remote call with
    /// [`RemoteError::Cancelled`].
    pub async fn fetch(&self, args: A) -> CourierResult<T> {
        let inner = &self.inner;
        if !inner.options.enabled {
            return Err(EndpointError::Disabled {
                endpoint: inner.name.clone(),
            }
            .into());
        }

        let key = self.key(&args)?;
        if let Some(value) = inner.fresh_value(&key) {
            debug!(endpoint = %inner.name, key = %key, "Query served from cache");
            return Ok(decode(&key, value)?);
        }

        let value = QueryInner::load(inner, key.clone(), args).await?;
        Ok(decode(&key, value)?)
    }

    /// Cached value for `args`, or the placeholder if nothing is cached.
    ///
    /// Never calls the fetcher.
    pub fn current(&self, args: &A) -> CourierResult<Option<T>> {
        let key = self.key(args)?;
        match self.inner.scope.store().get(&key) {
            Some(value) => Ok(Some(decode(&key, value)?)),
            None => Ok(self.inner.options.placeholder.clone()),
        }
    }

    /// Cached value plus load metadata for `args`.
    pub fn state(&self, args: &A) -> CourierResult<QueryState<T>> {
        let key = self.key(args)?;
        let snapshot = self
            .inner
            .scope
            .store()
            .entry(&key)
            .unwrap_or_else(|| EntrySnapshot::vacant(key));
        Ok(self.inner.state_from(&snapshot))
    }

    /// Force the next fetch of `args` to call the fetcher.
    pub fn invalidate(&self, args: &A) -> CourierResult<bool> {
        let key = self.key(args)?;
        Ok(self.inner.scope.store().invalidate(&key))
    }

    /// Invalidate every cached argument value of this endpoint.
    pub fn invalidate_all(&self) -> usize {
        self.inner
            .scope
            .store()
            .invalidate_endpoint(self.inner.scope.namespace(), &self.inner.name)
    }

    /// Drop the cached value for `args`; reads fall back to the placeholder.
    ///
    /// A fetch in flight for `args` still answers its callers but no longer
    /// writes the entry. The next subscription loads the entry again.
    pub fn reset(&self, args: &A) -> CourierResult<bool> {
        let key = self.key(args)?;
        mutex_lock(&self.inner.in_flight, SOURCE, "reset").remove(&key);
        mutex_lock(&self.inner.loads, SOURCE, "reset").remove(&key);
        Ok(self.inner.scope.store().reset(&key))
    }

    /// Apply a partial update to the cached value for `args`.
    ///
    /// Record endpoints shallow-merge object patches; anything else replaces.
    pub fn update<P: Serialize + ?Sized>(&self, args: &A, patch: &P) -> CourierResult<bool> {
        let key = self.key(args)?;
        let patch = encode(&key, patch)?;
        Ok(self
            .inner
            .scope
            .store()
            .merge(key, self.inner.options.shape, patch))
    }

    /// Like [`QueryEndpoint::update`], with the patch computed from the
    /// currently cached value.
    pub fn update_with<P, F>(&self, args: &A, updater: F) -> CourierResult<bool>
    where
        P: Serialize,
        F: FnOnce(Option<T>) -> P,
    {
        let key = self.key(args)?;
        let store = self.inner.scope.store();
        let current = match store.get(&key) {
            Some(value) => Some(decode::<T>(&key, value)?),
            None => None,
        };
        let patch = encode(&key, &updater(current))?;
        Ok(store.merge(key, self.inner.options.shape, patch))
    }

    /// Watch the entry for `args`.
    ///
    /// The callback runs immediately with the current state and again on
    /// every change, including when a load starts and when it fails. The
    /// first subscription to an empty entry of an enabled endpoint starts one
    /// background fetch on the ambient tokio runtime. An entry that was
    /// garbage collected and recreated counts as a new entry.
    pub fn subscribe<F>(&self, args: A, callback: F) -> CourierResult<Subscription>
    where
        F: Fn(&QueryState<T>) + Send + Sync + 'static,
    {
        let key = self.key(&args)?;
        let weak: Weak<QueryInner<A, T>> = Arc::downgrade(&self.inner);
        let subscription =
            self.inner
                .scope
                .store()
                .subscribe(key.clone(), move |snapshot: &EntrySnapshot| {
                    if let Some(inner) = weak.upgrade() {
                        callback(&inner.state_from(snapshot));
                    }
                });

        if subscription.is_active() {
            self.auto_fetch(key, args);
        }
        Ok(subscription)
    }

    fn auto_fetch(&self, key: CacheKey, args: A) {
        let inner = &self.inner;
        if !inner.options.enabled || !inner.auto_fetch {
            return;
        }
        let Some(snapshot) = inner.scope.store().entry(&key) else {
            return;
        };
        if snapshot.has_value() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(endpoint = %inner.name, key = %key, "No async runtime, skipping load on subscribe");
            return;
        };

        {
            let mut loads = mutex_lock(&inner.loads, SOURCE, "auto_fetch");
            let meta = loads.entry(key.clone()).or_default();
            if meta.auto_fetched == Some(snapshot.epoch) {
                return;
            }
            meta.auto_fetched = Some(snapshot.epoch);
        }

        let load = QueryInner::load(inner, key.clone(), args);
        let endpoint = inner.name.clone();
        runtime.spawn(async move {
            match load.await {
                Ok(_) => {}
                Err(err) if err.is_cancelled() => {
                    debug!(endpoint = %endpoint, key = %key, "Load on subscribe cancelled");
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, key = %key, error = %err, "Load on subscribe failed");
                }
            }
        });
    }
}

impl<A: Args, T: Data> QueryInner<A, T> {
    fn fresh_value(&self, key: &CacheKey) -> Option<Value> {
        let snapshot = self.scope.store().entry(key)?;
        if snapshot.is_stale || !self.stale_time.is_fresh(snapshot.age()?) {
            return None;
        }
        snapshot.value
    }

    /// Join the load in flight for `key`, or start one.
    ///
    /// A load that started before the entry's last invalidation is not
    /// joined. A load is dropped from the in-flight table only after its
    /// result is in the store, so a caller arriving in between either joins it
    /// or finds the fresh value.
    fn load(this: &Arc<Self>, key: CacheKey, args: A) -> InFlight {
        let store = this.scope.store();
        let task = {
            let mut in_flight = mutex_lock(&this.in_flight, SOURCE, "load");
            let invalidated_at = store.entry(&key).map_or(0, |snapshot| snapshot.invalidated_at);
            match in_flight.get(&key) {
                Some(pending) if pending.started >= invalidated_at => {
                    debug!(endpoint = %this.name, key = %key, "Joined in-flight fetch");
                    return pending.task.clone();
                }
                Some(pending) => {
                    debug!(
                        endpoint = %this.name,
                        key = %key,
                        load_id = pending.id,
                        "In-flight fetch predates invalidation, starting another"
                    );
                }
                None => {
                    if let Some(value) = this.fresh_value(&key) {
                        debug!(endpoint = %this.name, key = %key, "Query served from cache");
                        return futures_util::future::ready(Ok::<Value, CourierError>(value))
                            .boxed()
                            .shared();
                    }
                }
            }

            let id = this.next_load.fetch_add(1, Ordering::Relaxed);
            let started = store.sequence();
            let task = Self::run(Arc::clone(this), key.clone(), id, started, args)
                .boxed()
                .shared();
            in_flight.insert(
                key.clone(),
                Load {
                    id,
                    started,
                    settled: false,
                    task: task.clone(),
                },
            );
            task
        };

        this.prune_loads(&key);
        store.republish(&key);
        task
    }

    async fn run(
        this: Arc<Self>,
        key: CacheKey,
        id: u64,
        started: u64,
        args: A,
    ) -> CourierResult<Value> {
        debug!(endpoint = %this.name, key = %key, load_id = id, "Fetching");
        let store = this.scope.store();
        let closed = store.closed();
        let outcome = tokio::select! {
            biased;
            _ = closed => Err(RemoteError::Cancelled.into()),
            result = this.fetcher.fetch(args) => result,
        };
        let outcome = outcome.and_then(|data| encode(&key, &data).map_err(CourierError::from));

        if !this.settle(&key, id) {
            debug!(endpoint = %this.name, key = %key, load_id = id, "Fetch superseded, result not cached");
            return outcome;
        }
        match &outcome {
            Ok(value) => {
                this.record(&key, None);
                store.set_loaded(key.clone(), value.clone(), started);
                this.finish(&key, id);
            }
            Err(err) => {
                debug!(endpoint = %this.name, key = %key, error = %err, "Fetch failed");
                this.record(&key, Some(err.clone()));
                this.finish(&key, id);
                store.republish(&key);
            }
        }
        outcome
    }

    /// Mark load `id` settled. Returns false if another load or a reset took
    /// over the key.
    fn settle(&self, key: &CacheKey, id: u64) -> bool {
        let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "settle");
        match in_flight.get_mut(key) {
            Some(load) if load.id == id => {
                load.settled = true;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, key: &CacheKey, id: u64) {
        let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "finish");
        if in_flight.get(key).is_some_and(|load| load.id == id) {
            in_flight.remove(key);
        }
    }

    fn record(&self, key: &CacheKey, error: Option<CourierError>) {
        let mut loads = mutex_lock(&self.loads, SOURCE, "record");
        loads.entry(key.clone()).or_default().last_error = error;
    }

    /// Forget load metadata of keys the store no longer holds.
    fn prune_loads(&self, keep: &CacheKey) {
        let live: HashSet<CacheKey> = self.scope.store().keys().into_iter().collect();
        mutex_lock(&self.loads, SOURCE, "prune_loads")
            .retain(|key, _| key == keep || live.contains(key));
    }

    fn state_from(&self, snapshot: &EntrySnapshot) -> QueryState<T> {
        let is_fetching = mutex_lock(&self.in_flight, SOURCE, "state")
            .get(&snapshot.key)
            .is_some_and(|load| !load.settled);
        let mut last_error = mutex_lock(&self.loads, SOURCE, "state")
            .get(&snapshot.key)
            .and_then(|meta| meta.last_error.clone());

        let data = match snapshot.value.clone() {
            Some(value) => match decode::<T>(&snapshot.key, value) {
                Ok(data) => Some(data),
                Err(err) => {
                    warn!(endpoint = %self.name, key = %snapshot.key, error = %err, "Cached value does not match endpoint type");
                    last_error = Some(err.into());
                    None
                }
            },
            None => None,
        };

        let is_placeholder = data.is_none() && self.options.placeholder.is_some();
        QueryState {
            data: data.or_else(|| self.options.placeholder.clone()),
            is_placeholder,
            is_stale: snapshot.is_stale,
            updated_at: snapshot.updated_at,
            is_fetching,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use courier_core::CourierConfig;
    use courier_store::CacheStore;
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn get_data(calls: Arc<AtomicUsize>) -> QueryDef<String, Value> {
        QueryDef::new("getData", move |id: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CourierError>(json!({"id": id}))
            }
        })
    }

    fn slow_data(calls: Arc<AtomicUsize>, delay: Duration) -> QueryDef<String, Value> {
        QueryDef::new("getData", move |id: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok::<_, CourierError>(json!({"id": id}))
            }
        })
    }

    /// Fetcher that answers `{"call": n}` once the gate hands out a permit.
    fn gated_data(calls: Arc<AtomicUsize>, gate: Arc<Semaphore>) -> QueryDef<String, Value> {
        QueryDef::new("getData", move |_: String| {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let _permit = gate.acquire().await.expect("gate");
                Ok::<_, CourierError>(json!({"call": call}))
            }
        })
    }

    async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("fetcher was not called");
    }

    #[tokio::test]
    async fn test_fetch_caches_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = get_data(Arc::clone(&calls)).bind(&Scope::standalone());

        assert_eq!(query.fetch("1".into()).await.unwrap(), json!({"id": "1"}));
        assert_eq!(query.fetch("1".into()).await.unwrap(), json!({"id": "1"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_args_use_distinct_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = get_data(Arc::clone(&calls)).bind(&Scope::standalone());

        query.fetch("1".into()).await.unwrap();
        query.fetch("2".into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(
            query.key(&"1".to_string()).unwrap(),
            query.key(&"2".to_string()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_stale_time_always_refetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = get_data(Arc::clone(&calls))
            .stale_time(StaleTime::Always)
            .bind(&Scope::standalone());

        query.fetch("1".into()).await.unwrap();
        query.fetch("1".into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scope_default_stale_time_applies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new(
            CacheStore::new(),
            &CourierConfig::new().with_stale_time(StaleTime::Always),
        );
        let query = get_data(Arc::clone(&calls)).bind(&scope);

        assert_eq!(query.stale_time(), StaleTime::Always);
        query.fetch("1".into()).await.unwrap();
        query.fetch("1".into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_then_fetch_picks_up_new_value() {
        let answer = Arc::new(Mutex::new(json!({"id": "1"})));
        let remote = Arc::clone(&answer);
        let query: QueryEndpoint<String, Value> = QueryDef::new("getData", move |_: String| {
            let remote = Arc::clone(&remote);
            async move { Ok::<_, CourierError>(remote.lock().unwrap().clone()) }
        })
        .bind(&Scope::standalone());

        assert_eq!(query.fetch("1".into()).await.unwrap(), json!({"id": "1"}));

        *answer.lock().unwrap() = json!({"id": "3"});
        assert_eq!(query.fetch("1".into()).await.unwrap(), json!({"id": "1"}));

        assert!(query.invalidate(&"1".into()).unwrap());
        assert!(query.state(&"1".into()).unwrap().is_stale);
        assert_eq!(query.fetch("1".into()).await.unwrap(), json!({"id": "3"}));
        assert!(!query.state(&"1".into()).unwrap().is_stale);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_value() {
        let fail = Arc::new(Mutex::new(false));
        let remote = Arc::clone(&fail);
        let query: QueryEndpoint<String, Value> = QueryDef::new("getData", move |id: String| {
            let remote = Arc::clone(&remote);
            async move {
                if *remote.lock().unwrap() {
                    Err::<Value, CourierError>(RemoteError::failed("offline").into())
                } else {
                    Ok(json!({"id": id}))
                }
            }
        })
        .stale_time(StaleTime::Always)
        .bind(&Scope::standalone());

        query.fetch("1".into()).await.unwrap();
        *fail.lock().unwrap() = true;

        let err = query.fetch("1".into()).await.unwrap_err();
        assert_eq!(err, CourierError::Remote(RemoteError::failed("offline")));
        assert_eq!(query.current(&"1".into()).unwrap(), Some(json!({"id": "1"})));

        let state = query.state(&"1".into()).unwrap();
        assert_eq!(state.last_error, Some(err));
        assert!(state.has_data());
    }

    #[tokio::test]
    async fn test_disabled_fetch_fails_loudly() {
        let query: QueryEndpoint<String, Value> =
            QueryDef::external("walletChanged").bind(&Scope::standalone());

        let err = query.fetch("1".into()).await.unwrap_err();
        assert!(matches!(
            err,
            CourierError::Endpoint(EndpointError::Disabled { ref endpoint }) if endpoint == "walletChanged"
        ));
        assert!(!query.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_fetch_ignores_cached_value() {
        let query: QueryEndpoint<String, Value> =
            QueryDef::external("walletChanged").bind(&Scope::standalone());
        query.update(&"1".into(), &json!({"balance": 3})).unwrap();

        assert!(query.fetch("1".into()).await.is_err());
        assert_eq!(query.current(&"1".into()).unwrap(), Some(json!({"balance": 3})));
    }

    #[test]
    fn test_current_falls_back_to_placeholder() {
        let calls = Arc::new(AtomicUsize::new(0));
        let with_placeholder = get_data(Arc::clone(&calls))
            .placeholder(json!({"id": "loading"}))
            .bind(&Scope::standalone());
        let without = get_data(Arc::clone(&calls)).bind(&Scope::standalone());

        assert_eq!(
            with_placeholder.current(&"1".into()).unwrap(),
            Some(json!({"id": "loading"}))
        );
        assert!(with_placeholder.state(&"1".into()).unwrap().is_placeholder);
        assert_eq!(without.current(&"1".into()).unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reset_returns_to_placeholder() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = get_data(Arc::clone(&calls))
            .placeholder(json!({"id": "loading"}))
            .bind(&Scope::standalone());

        query.fetch("1".into()).await.unwrap();
        assert!(query.reset(&"1".into()).unwrap());
        assert_eq!(query.current(&"1".into()).unwrap(), Some(json!({"id": "loading"})));

        query.fetch("1".into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_update_merges_records() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = QueryDef::new("getUser", move |id: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CourierError>(json!({"id": id, "name": "alpha"}))
            }
        })
        .shape(ValueShape::Record)
        .bind(&Scope::standalone());

        query.fetch("1".into()).await.unwrap();
        query.update(&"1".into(), &json!({"id": "3"})).unwrap();
        assert_eq!(
            query.current(&"1".into()).unwrap(),
            Some(json!({"id": "3", "name": "alpha"}))
        );
    }

    #[tokio::test]
    async fn test_update_replaces_arrays() {
        let query: QueryEndpoint<(), Vec<u32>> =
            QueryDef::new("getIds", |_: ()| async { Ok::<_, CourierError>(vec![1u32, 2, 3]) })
                .shape(ValueShape::Record)
                .bind(&Scope::standalone());

        query.fetch(()).await.unwrap();
        query.update(&(), &vec![9]).unwrap();
        assert_eq!(query.current(&()).unwrap(), Some(vec![9]));
    }

    #[test]
    fn test_update_with_uses_cached_value() {
        let query: QueryEndpoint<(), u32> =
            QueryDef::external("getCount").bind(&Scope::standalone());

        query.update_with(&(), |current| current.unwrap_or(0) + 1).unwrap();
        query.update_with(&(), |current| current.unwrap_or(0) + 1).unwrap();
        assert_eq!(query.current(&()).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_mismatched_cached_value_is_an_error() {
        let query: QueryEndpoint<(), u32> =
            QueryDef::external("getCount").bind(&Scope::standalone());
        query.update(&(), &"many").unwrap();

        let err = query.current(&()).unwrap_err();
        assert!(matches!(err, CourierError::Store(_)));
        assert!(query.state(&()).unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = slow_data(Arc::clone(&calls), Duration::from_millis(20))
            .bind(&Scope::standalone());

        let (a, b) = tokio::join!(query.fetch("1".into()), query.fetch("1".into()));
        assert_eq!(a.unwrap(), json!({"id": "1"}));
        assert_eq!(b.unwrap(), json!({"id": "1"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scope = Scope::standalone();
        let query = slow_data(Arc::clone(&calls), Duration::from_secs(30)).bind(&scope);

        let pending = tokio::spawn({
            let query = query.clone();
            async move { query.fetch("1".into()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        scope.store().close();

        let result = pending.await.expect("task");
        assert!(result.unwrap_err().is_cancelled());
        assert!(scope.store().is_empty());
        assert_eq!(query.current(&"1".into()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_loads_once_per_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = get_data(Arc::clone(&calls)).bind(&Scope::standalone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _first = query
            .subscribe("1".into(), move |state: &QueryState<Value>| {
                let _ = tx.send(state.clone());
            })
            .unwrap();

        let initial = rx.recv().await.expect("initial state");
        assert!(!initial.has_data());
        let loading = rx.recv().await.expect("loading state");
        assert!(loading.is_loading());
        let loaded = rx.recv().await.expect("loaded state");
        assert_eq!(loaded.data, Some(json!({"id": "1"})));
        assert!(!loaded.is_fetching);

        let _second = query.subscribe("1".into(), |_: &QueryState<Value>| {}).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_to_disabled_endpoint_does_not_fetch() {
        let query: QueryEndpoint<String, Value> =
            QueryDef::external("walletChanged").bind(&Scope::standalone());
        let _sub = query.subscribe("1".into(), |_: &QueryState<Value>| {}).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(query.state(&"1".into()).unwrap().last_error, None);
    }

    #[test]
    fn test_subscribe_without_runtime_skips_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = get_data(Arc::clone(&calls)).bind(&Scope::standalone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = query
            .subscribe("1".into(), move |state: &QueryState<Value>| {
                sink.lock().unwrap().push(state.data.clone());
            })
            .unwrap();

        assert!(sub.is_active());
        assert_eq!(*seen.lock().unwrap(), vec![None]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscribers_see_updates() {
        let query: QueryEndpoint<String, Value> = QueryDef::external("getData")
            .shape(ValueShape::Record)
            .bind(&Scope::standalone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = query
            .subscribe("1".into(), move |state: &QueryState<Value>| {
                sink.lock().unwrap().push(state.data.clone());
            })
            .unwrap();

        query.update(&"1".into(), &json!({"id": "1"})).unwrap();
        query.update(&"1".into(), &json!({"name": "alpha"})).unwrap();
        query.reset(&"1".into()).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                None,
                Some(json!({"id": "1"})),
                Some(json!({"id": "1", "name": "alpha"})),
                None,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let calls = Arc::new(AtomicUsize::new(0));
        let query = get_data(Arc::clone(&calls)).bind(&Scope::standalone());
        query.fetch("1".into()).await.unwrap();
        query.fetch("2".into()).await.unwrap();

        assert_eq!(query.invalidate_all(), 2);
        query.fetch("1".into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_after_invalidation_starts_a_new_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated_data(Arc::clone(&calls), Arc::clone(&gate)).bind(&Scope::standalone());
        query.update(&"1".into(), &json!({"call": 0})).unwrap();

        query.invalidate(&"1".into()).unwrap();
        let older = tokio::spawn({
            let query = query.clone();
            async move { query.fetch("1".into()).await }
        });
        wait_for_calls(&calls, 1).await;

        // Invalidated again while the first call is still out.
        assert!(query.invalidate(&"1".into()).unwrap());
        let newer = tokio::spawn({
            let query = query.clone();
            async move { query.fetch("1".into()).await }
        });
        wait_for_calls(&calls, 2).await;

        gate.add_permits(1);
        assert_eq!(older.await.expect("task").unwrap(), json!({"call": 1}));
        assert_eq!(newer.await.expect("task").unwrap(), json!({"call": 2}));

        let state = query.state(&"1".into()).unwrap();
        assert_eq!(state.data, Some(json!({"call": 2})));
        assert!(!state.is_stale);
        assert!(!state.is_fetching);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_without_new_invalidation_joins_running_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated_data(Arc::clone(&calls), Arc::clone(&gate)).bind(&Scope::standalone());
        query.update(&"1".into(), &json!({"call": 0})).unwrap();
        query.invalidate(&"1".into()).unwrap();

        let first = tokio::spawn({
            let query = query.clone();
            async move { query.fetch("1".into()).await }
        });
        wait_for_calls(&calls, 1).await;
        let second = tokio::spawn({
            let query = query.clone();
            async move { query.fetch("1".into()).await }
        });
        tokio::task::yield_now().await;

        gate.add_permits(1);
        assert_eq!(first.await.expect("task").unwrap(), json!({"call": 1}));
        assert_eq!(second.await.expect("task").unwrap(), json!({"call": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_racing_completion_does_not_call_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated_data(Arc::clone(&calls), Arc::clone(&gate)).bind(&Scope::standalone());

        let first = tokio::spawn({
            let query = query.clone();
            async move { query.fetch("1".into()).await }
        });
        wait_for_calls(&calls, 1).await;

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let query = query.clone();
                tokio::spawn(async move {
                    for _ in 0..10_000 {
                        let _ = query.fetch("1".into()).now_or_never();
                        if query.current(&"1".into()).unwrap().is_some() {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        gate.add_permits(1);
        assert_eq!(first.await.expect("task").unwrap(), json!({"call": 1}));
        for racer in racers {
            racer.await.expect("racer");
        }
        assert_eq!(query.fetch("1".into()).await.unwrap(), json!({"call": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_load_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated_data(Arc::clone(&calls), Arc::clone(&gate))
            .placeholder(json!({"call": 0}))
            .bind(&Scope::standalone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = query
            .subscribe("1".into(), move |state: &QueryState<Value>| {
                let _ = tx.send(state.clone());
            })
            .unwrap();

        let initial = rx.recv().await.expect("initial state");
        assert!(initial.is_placeholder);
        assert!(!initial.is_fetching);

        let loading = rx.recv().await.expect("loading state");
        assert!(loading.is_loading());
        assert!(loading.is_placeholder);
        assert!(query.state(&"1".into()).unwrap().is_loading());

        gate.add_permits(1);
        let loaded = rx.recv().await.expect("loaded state");
        assert_eq!(loaded.data, Some(json!({"call": 1})));
        assert!(!loaded.is_loading());
    }

    #[tokio::test]
    async fn test_subscribers_see_failed_load() {
        let query: QueryEndpoint<String, Value> = QueryDef::new("getData", |_: String| async {
            Err::<Value, CourierError>(RemoteError::failed("offline").into())
        })
        .bind(&Scope::standalone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = query
            .subscribe("1".into(), move |state: &QueryState<Value>| {
                let _ = tx.send(state.clone());
            })
            .unwrap();

        assert_eq!(rx.recv().await.expect("initial state").last_error, None);
        assert!(rx.recv().await.expect("loading state").is_loading());
        let failed = rx.recv().await.expect("failed state");
        assert!(!failed.is_fetching);
        assert_eq!(
            failed.last_error,
            Some(CourierError::Remote(RemoteError::failed("offline")))
        );
    }

    #[tokio::test]
    async fn test_collected_entry_loads_again_on_subscribe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scope = Scope::standalone();
        let query = get_data(Arc::clone(&calls)).bind(&scope);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = query
            .subscribe("1".into(), move |state: &QueryState<Value>| {
                let _ = tx.send(state.clone());
            })
            .unwrap();
        while !rx.recv().await.expect("state").has_data() {}
        drop(sub);

        assert_eq!(scope.store().collect_garbage(Duration::ZERO), 1);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = query
            .subscribe("1".into(), move |state: &QueryState<Value>| {
                let _ = tx.send(state.clone());
            })
            .unwrap();
        while !rx.recv().await.expect("state").has_data() {}
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_metadata_follows_store_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scope = Scope::standalone();
        let query = get_data(Arc::clone(&calls)).bind(&scope);
        let one = query.key(&"1".to_string()).unwrap();

        query.fetch("1".into()).await.unwrap();
        assert!(mutex_lock(&query.inner.loads, SOURCE, "test").contains_key(&one));

        scope.store().collect_garbage(Duration::ZERO);
        query.fetch("2".into()).await.unwrap();

        let loads = mutex_lock(&query.inner.loads, SOURCE, "test");
        assert!(!loads.contains_key(&one));
        assert_eq!(loads.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let query = gated_data(Arc::clone(&calls), Arc::clone(&gate)).bind(&Scope::standalone());

        let pending = tokio::spawn({
            let query = query.clone();
            async move { query.fetch("1".into()).await }
        });
        wait_for_calls(&calls, 1).await;
        assert!(query.state(&"1".into()).unwrap().is_fetching);

        query.reset(&"1".into()).unwrap();
        assert!(!query.state(&"1".into()).unwrap().is_fetching);

        gate.add_permits(1);
        assert_eq!(pending.await.expect("task").unwrap(), json!({"call": 1}));
        assert_eq!(query.current(&"1".into()).unwrap(), None);
    }
}
