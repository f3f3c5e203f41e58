//! COURIER Test Utilities
//!
//! Shared test infrastructure for the COURIER workspace:
//! - Scripted remotes that stand in for caller-supplied fetch/execute functions
//! - A manual event source and a callback recorder
//! - Proptest generators for keys, policies and configuration
//! - Fixtures for common endpoint declarations
//! - Assertions for COURIER error variants
//! - Tracing setup for tests

pub use courier_api::{
    Api, ApiBuilder, CallOptions, Emitter, EventDef, EventEndpoint, EventRead, EventSource,
    MutationAction, MutationDef, MutationEndpoint, MutationState, MutationStatus, QueryDef,
    QueryEndpoint, QueryFetcher, QueryState, Scope, Subscription,
};
pub use courier_core::{
    CacheKey, ConfigError, CourierConfig, CourierError, CourierResult, EndpointError,
    RemoteError, StaleTime, StoreError, ValueShape,
};
pub use courier_store::{CacheStats, CacheStore, EntrySnapshot};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;

// ============================================================================
// SCRIPTED REMOTES
// ============================================================================

/// Holds remote calls until the test lets them through.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    /// Let `count` waiting or future calls proceed.
    pub fn open(&self, count: usize) {
        self.0.add_permits(count);
    }

    /// Let every call proceed from now on.
    pub fn open_all(&self) {
        self.0.close();
    }

    async fn pass(&self) {
        if let Ok(permit) = self.0.acquire().await {
            permit.forget();
        }
    }
}

struct RemoteState<T> {
    script: Mutex<VecDeque<CourierResult<T>>>,
    fallback: Option<CourierResult<T>>,
    calls: AtomicUsize,
    args: Mutex<Vec<Value>>,
    delay: Option<Duration>,
    gate: Option<Gate>,
}

/// Stand-in for a remote operation with scripted results.
///
/// Works as both a [`QueryFetcher`] and a [`MutationAction`]. Scripted
/// results are returned in order; once they run out, the fallback repeats.
/// Every call and its arguments are recorded.
pub struct ScriptedRemote<T> {
    inner: Arc<RemoteState<T>>,
}

impl<T> Clone for ScriptedRemote<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ScriptedRemote<T> {
    fn with_fallback(fallback: Option<CourierResult<T>>) -> Self {
        Self {
            inner: Arc::new(RemoteState {
                script: Mutex::new(VecDeque::new()),
                fallback,
                calls: AtomicUsize::new(0),
                args: Mutex::new(Vec::new()),
                delay: None,
                gate: None,
            }),
        }
    }

    /// Always succeeds with `value` once the script is exhausted.
    pub fn returning(value: T) -> Self {
        Self::with_fallback(Some(Ok(value)))
    }

    /// Always fails with `error` once the script is exhausted.
    pub fn failing(error: impl Into<CourierError>) -> Self {
        Self::with_fallback(Some(Err(error.into())))
    }

    /// Only the scripted results; further calls fail.
    pub fn scripted() -> Self {
        Self::with_fallback(None)
    }

    /// Queue one result ahead of the fallback.
    pub fn then(self, result: CourierResult<T>) -> Self {
        self.lock_script().push_back(result);
        self
    }

    /// Queue one successful result ahead of the fallback.
    pub fn then_ok(self, value: T) -> Self {
        self.then(Ok(value))
    }

    /// Sleep before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.rebuild(|state| state.delay = Some(delay))
    }

    /// Hold every call until the returned gate lets it through.
    pub fn gated(self) -> (Self, Gate) {
        let gate = Gate::new();
        let handle = gate.clone();
        (self.rebuild(|state| state.gate = Some(handle)), gate)
    }

    fn rebuild(self, apply: impl FnOnce(&mut RemoteState<T>)) -> Self {
        let mut state = RemoteState {
            script: Mutex::new(self.lock_script().drain(..).collect()),
            fallback: self.inner.fallback.clone(),
            calls: AtomicUsize::new(self.calls()),
            args: Mutex::new(self.args()),
            delay: self.inner.delay,
            gate: self.inner.gate.clone(),
        };
        apply(&mut state);
        Self {
            inner: Arc::new(state),
        }
    }

    /// Number of calls so far.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Arguments of every call so far, as JSON.
    pub fn args(&self) -> Vec<Value> {
        self.inner
            .args
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<CourierResult<T>>> {
        self.inner
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn answer<A: Serialize>(&self, args: &A) -> CourierResult<T> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .args
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(serde_json::to_value(args).unwrap_or(Value::Null));

        if let Some(gate) = &self.inner.gate {
            gate.pass().await;
        }
        if let Some(delay) = self.inner.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.lock_script().pop_front();
        scripted
            .or_else(|| self.inner.fallback.clone())
            .unwrap_or_else(|| Err(RemoteError::failed("script exhausted").into()))
    }
}

#[async_trait]
impl<A, T> QueryFetcher<A, T> for ScriptedRemote<T>
where
    A: Serialize + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn fetch(&self, args: A) -> CourierResult<T> {
        self.answer(&args).await
    }
}

#[async_trait]
impl<A, T> MutationAction<A, T> for ScriptedRemote<T>
where
    A: Serialize + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn execute(&self, args: A) -> CourierResult<T> {
        self.answer(&args).await
    }
}

// ============================================================================
// EVENT SOURCE AND RECORDER
// ============================================================================

/// Event source that keeps its emitter so tests can push on demand.
pub struct ManualSource<K, P> {
    emitter: Arc<Mutex<Option<Emitter<K, P>>>>,
    registrations: Arc<AtomicUsize>,
}

impl<K, P> Clone for ManualSource<K, P> {
    fn clone(&self) -> Self {
        Self {
            emitter: Arc::clone(&self.emitter),
            registrations: Arc::clone(&self.registrations),
        }
    }
}

impl<K, P> Default for ManualSource<K, P> {
    fn default() -> Self {
        Self {
            emitter: Arc::new(Mutex::new(None)),
            registrations: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K: Serialize, P: Serialize> ManualSource<K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a payload. Returns `Ok(false)` before registration or after close.
    pub fn emit(&self, key_args: &K, payload: &P) -> CourierResult<bool> {
        let emitter = self
            .emitter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match emitter {
            Some(emitter) => emitter.emit(key_args, payload),
            None => Ok(false),
        }
    }

    /// How many times the engine registered this source.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

impl<K: Send + 'static, P: Send + 'static> EventSource<K, P> for ManualSource<K, P> {
    fn register(&self, emitter: Emitter<K, P>) {
        *self
            .emitter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(emitter);
        self.registrations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects values handed to callbacks.
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: T) {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(value);
    }

    /// Everything recorded so far.
    pub fn snapshot(&self) -> Vec<T> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Everything recorded so far, clearing the recorder.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(
            &mut *self
                .seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callback that records a clone of every value it receives.
    pub fn callback(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let recorder = self.clone();
        move |value: &T| recorder.push(value.clone())
    }

    /// Callback that records `map(value)` for every value it receives.
    pub fn map_callback<U, F>(&self, map: F) -> impl Fn(&U) + Send + Sync + 'static
    where
        F: Fn(&U) -> T + Send + Sync + 'static,
    {
        let recorder = self.clone();
        move |value: &U| recorder.push(map(value))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for COURIER types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Number};

    /// Generate an endpoint name in lower camel case.
    pub fn arb_endpoint_name() -> impl Strategy<Value = String> {
        "[a-z][a-zA-Z]{0,15}"
    }

    /// Generate a JSON scalar.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(Number::from(n))),
            "[a-z0-9]{0,8}".prop_map(Value::String),
        ]
    }

    /// Generate a flat JSON object.
    pub fn arb_record() -> impl Strategy<Value = Map<String, Value>> {
        proptest::collection::btree_map("[a-h]{1,3}", arb_scalar(), 0..6)
            .prop_map(|fields| fields.into_iter().collect())
    }

    /// Generate call arguments: scalars, short arrays or flat objects.
    pub fn arb_args() -> impl Strategy<Value = Value> {
        prop_oneof![
            arb_scalar(),
            proptest::collection::vec(arb_scalar(), 0..4).prop_map(Value::Array),
            arb_record().prop_map(Value::Object),
        ]
    }

    /// Generate a staleness policy.
    pub fn arb_stale_time() -> impl Strategy<Value = StaleTime> {
        prop_oneof![
            Just(StaleTime::Always),
            Just(StaleTime::Infinite),
            (1u64..600_000).prop_map(|ms| StaleTime::After(Duration::from_millis(ms))),
        ]
    }

    /// Generate a value shape.
    pub fn arb_value_shape() -> impl Strategy<Value = ValueShape> {
        prop_oneof![Just(ValueShape::Record), Just(ValueShape::Atomic)]
    }

    /// Generate a valid configuration.
    pub fn arb_config() -> impl Strategy<Value = CourierConfig> {
        (
            proptest::option::of("[a-z]{1,10}"),
            arb_stale_time(),
            proptest::option::of(0u64..3_600_000),
            any::<bool>(),
        )
            .prop_map(|(namespace, stale_time, gc_ms, auto_fetch)| CourierConfig {
                namespace,
                default_stale_time: stale_time,
                gc_time: gc_ms.map(Duration::from_millis),
                auto_fetch_on_subscribe: auto_fetch,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built endpoint declarations for common scenarios.

    use super::*;
    use serde_json::json;

    /// `getData(id)` answering `{ "id": id }`, counting calls.
    pub fn get_data(calls: Arc<AtomicUsize>) -> QueryDef<String, Value> {
        QueryDef::new("getData", move |id: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CourierError>(json!({ "id": id }))
            }
        })
        .shape(ValueShape::Record)
    }

    /// Facade with the `getData` query and default configuration.
    pub fn get_data_api(calls: Arc<AtomicUsize>) -> Api {
        Api::builder(CourierConfig::default())
            .query(get_data(calls))
            .build()
            .expect("fixture api should build")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for COURIER error variants.

    use super::*;

    /// Assert that the result failed because the facade was closed.
    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &CourierResult<T>) {
        match result {
            Err(err) if err.is_cancelled() => {}
            other => panic!("Expected cancellation, got: {:?}", other),
        }
    }

    /// Assert that the result is a disabled-endpoint error.
    #[track_caller]
    pub fn assert_disabled<T: std::fmt::Debug>(result: &CourierResult<T>) {
        match result {
            Err(CourierError::Endpoint(EndpointError::Disabled { .. })) => {}
            other => panic!("Expected Disabled error, got: {:?}", other),
        }
    }

    /// Assert that the result is a remote failure.
    #[track_caller]
    pub fn assert_remote_failure<T: std::fmt::Debug>(result: &CourierResult<T>) {
        match result {
            Err(CourierError::Remote(RemoteError::Failed { .. }))
            | Err(CourierError::Remote(RemoteError::Rejected { .. })) => {}
            other => panic!("Expected remote failure, got: {:?}", other),
        }
    }

    /// Assert that the result is a lookup error for an undeclared endpoint.
    #[track_caller]
    pub fn assert_unknown_endpoint<T: std::fmt::Debug>(result: &CourierResult<T>) {
        match result {
            Err(CourierError::Endpoint(EndpointError::UnknownEndpoint { .. })) => {}
            other => panic!("Expected UnknownEndpoint error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// TESTS
// ============================================================================
