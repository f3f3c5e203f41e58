//! Mutation endpoints.
//!
//! A mutation runs a one-shot remote action. Invocations are not cached by
//! argument; instead the state of the most recent invocation is kept under
//! the endpoint's own key so reactive readers can follow it.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{CacheKey, CourierError, CourierResult, RemoteError, Timestamp};
use courier_store::{panic_message, EntrySnapshot, Subscription};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::scope::{decode, encode, Scope};
use crate::{Args, Data};

/// Remote write operation behind a mutation endpoint.
///
/// Any `Fn(A) -> impl Future<Output = CourierResult<T>>` closure is an action.
#[async_trait]
pub trait MutationAction<A, T>: Send + Sync {
    async fn execute(&self, args: A) -> CourierResult<T>;
}

#[async_trait]
impl<A, T, F, Fut> MutationAction<A, T> for F
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = CourierResult<T>> + Send,
{
    async fn execute(&self, args: A) -> CourierResult<T> {
        (self)(args).await
    }
}

/// Progress of the most recent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// State of the most recent invocation of a mutation.
///
/// Each `execute` replaces it; there is no history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationState<T> {
    pub status: MutationStatus,
    pub data: Option<T>,
    /// Display form of the failure when `status` is `Error`.
    pub error: Option<String>,
    /// Identifies the invocation this state belongs to.
    pub request_id: Option<Uuid>,
    pub updated_at: Option<Timestamp>,
}

impl<T> MutationState<T> {
    pub fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            request_id: None,
            updated_at: None,
        }
    }

    fn pending(request_id: Uuid) -> Self {
        Self {
            status: MutationStatus::Pending,
            request_id: Some(request_id),
            updated_at: Some(Utc::now()),
            ..Self::idle()
        }
    }

    fn succeeded(request_id: Uuid, data: T) -> Self {
        Self {
            status: MutationStatus::Success,
            data: Some(data),
            request_id: Some(request_id),
            updated_at: Some(Utc::now()),
            error: None,
        }
    }

    fn failed(request_id: Uuid, error: &CourierError) -> Self {
        Self {
            status: MutationStatus::Error,
            error: Some(error.to_string()),
            request_id: Some(request_id),
            updated_at: Some(Utc::now()),
            data: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

impl<T> Default for MutationState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

type MutateHook<A> = Arc<dyn Fn(&A) + Send + Sync>;
type SettledHook<A, T> = Arc<dyn Fn(Option<&T>, Option<&CourierError>, &A) + Send + Sync>;

type SuccessCallback<A, T> = Box<dyn FnOnce(&T, &A) + Send>;
type ErrorCallback<A> = Box<dyn FnOnce(&CourierError, &A) + Send>;
type SettledCallback<A, T> = Box<dyn FnOnce(Option<&T>, Option<&CourierError>, &A) + Send>;

/// Callbacks supplied by one call site.
///
/// They run after the endpoint-level hooks and cannot suppress them.
pub struct CallOptions<A, T> {
    on_success: Option<SuccessCallback<A, T>>,
    on_error: Option<ErrorCallback<A>>,
    on_settled: Option<SettledCallback<A, T>>,
}

impl<A, T> Default for CallOptions<A, T> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<A, T> CallOptions<A, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&T, &A) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CourierError, &A) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Option<&T>, Option<&CourierError>, &A) + Send + 'static,
    {
        self.on_settled = Some(Box::new(callback));
        self
    }
}

/// Declaration of a mutation endpoint, not yet bound to a store.
pub struct MutationDef<A, T> {
    name: String,
    action: Arc<dyn MutationAction<A, T>>,
    on_mutate: Option<MutateHook<A>>,
    on_settled: Option<SettledHook<A, T>>,
    invalidates: Vec<String>,
}

impl<A: Args + Clone, T: Data> MutationDef<A, T> {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: MutationAction<A, T> + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(action),
            on_mutate: None,
            on_settled: None,
            invalidates: Vec::new(),
        }
    }

    /// Hook run before the action is called.
    pub fn on_mutate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.on_mutate = Some(Arc::new(hook));
        self
    }

    /// Hook run after every invocation, successful or not.
    pub fn on_settled<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&T>, Option<&CourierError>, &A) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(hook));
        self
    }

    /// Query endpoints whose entries are invalidated after a success.
    pub fn invalidates<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates.extend(endpoints.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invalidated_endpoints(&self) -> &[String] {
        &self.invalidates
    }

    pub fn bind(self, scope: &Scope) -> MutationEndpoint<A, T> {
        let key = CacheKey::unit(scope.namespace(), &self.name);
        MutationEndpoint {
            inner: Arc::new(MutationInner {
                name: self.name,
                key,
                scope: scope.clone(),
                action: self.action,
                on_mutate: self.on_mutate,
                on_settled: self.on_settled,
                invalidates: self.invalidates,
                generation: AtomicU64::new(0),
            }),
        }
    }
}

struct MutationInner<A, T> {
    name: String,
    key: CacheKey,
    scope: Scope,
    action: Arc<dyn MutationAction<A, T>>,
    on_mutate: Option<MutateHook<A>>,
    on_settled: Option<SettledHook<A, T>>,
    invalidates: Vec<String>,
    /// Bumped by every execute and reset; only the newest invocation publishes.
    generation: AtomicU64,
}

/// A mutation endpoint bound to a store.
pub struct MutationEndpoint<A, T> {
    inner: Arc<MutationInner<A, T>>,
}

impl<A, T> Clone for MutationEndpoint<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> fmt::Debug for MutationEndpoint<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEndpoint")
            .field("name", &self.inner.name)
            .field("invalidates", &self.inner.invalidates)
            .finish()
    }
}

impl<A: Args + Clone, T: Data> MutationEndpoint<A, T> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Key under which the most recent state is stored.
    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    /// Run the action once.
    ///
    /// Order of effects: state becomes `Pending`, `on_mutate` runs, the action
    /// is awaited, listed query endpoints are invalidated on success, the
    /// state is published, the endpoint `on_settled` hook runs, then the
    /// call-site callbacks run. Hook panics are logged and never escape.
    /// The action's error is returned to the caller.
    pub async fn execute(&self, args: A, options: Option<CallOptions<A, T>>) -> CourierResult<T> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = Uuid::now_v7();

        inner.publish(generation, &MutationState::pending(request_id));
        if let Some(hook) = &inner.on_mutate {
            inner.run_hook("on_mutate", || hook(&args));
        }

        debug!(endpoint = %inner.name, %request_id, "Executing mutation");
        let closed = inner.scope.store().closed();
        let result = tokio::select! {
            biased;
            _ = closed => Err(RemoteError::Cancelled.into()),
            result = inner.action.execute(args.clone()) => result,
        };

        match &result {
            Ok(data) => {
                for endpoint in &inner.invalidates {
                    let count = inner
                        .scope
                        .store()
                        .invalidate_endpoint(inner.scope.namespace(), endpoint);
                    debug!(endpoint = %inner.name, target = %endpoint, count, "Invalidated after mutation");
                }
                inner.publish(generation, &MutationState::succeeded(request_id, data.clone()));
            }
            Err(err) => {
                debug!(endpoint = %inner.name, %request_id, error = %err, "Mutation failed");
                inner.publish(generation, &MutationState::failed(request_id, err));
            }
        }

        let (data, err) = (result.as_ref().ok(), result.as_ref().err());
        if let Some(hook) = &inner.on_settled {
            inner.run_hook("on_settled", || hook(data, err, &args));
        }

        if let Some(options) = options {
            match (data, err, options.on_success, options.on_error) {
                (Some(data), _, Some(callback), _) => {
                    inner.run_hook("call_on_success", || callback(data, &args))
                }
                (_, Some(err), _, Some(callback)) => {
                    inner.run_hook("call_on_error", || callback(err, &args))
                }
                _ => {}
            }
            if let Some(callback) = options.on_settled {
                inner.run_hook("call_on_settled", || callback(data, err, &args));
            }
        }

        result
    }

    /// State of the most recent invocation.
    pub fn state(&self) -> MutationState<T> {
        match self.inner.scope.store().entry(&self.inner.key) {
            Some(snapshot) => self.inner.state_from(&snapshot),
            None => MutationState::idle(),
        }
    }

    /// Follow the state of the most recent invocation.
    ///
    /// The callback runs immediately and again whenever the state changes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MutationState<T>) + Send + Sync + 'static,
    {
        let weak: Weak<MutationInner<A, T>> = Arc::downgrade(&self.inner);
        self.inner
            .scope
            .store()
            .subscribe(self.inner.key.clone(), move |snapshot: &EntrySnapshot| {
                if let Some(inner) = weak.upgrade() {
                    callback(&inner.state_from(snapshot));
                }
            })
    }

    /// Return to `Idle`. An invocation still in flight will not publish.
    pub fn reset(&self) -> bool {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.scope.store().reset(&self.inner.key)
    }
}

impl<A, T: Data> MutationInner<A, T> {
    fn publish(&self, generation: u64, state: &MutationState<T>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(endpoint = %self.name, status = ?state.status, "Superseded mutation state dropped");
            return;
        }
        match encode(&self.key, state) {
            Ok(value) => {
                self.scope.store().set(self.key.clone(), value);
            }
            Err(err) => {
                warn!(endpoint = %self.name, error = %err, "Failed to store mutation state");
            }
        }
    }

    fn state_from(&self, snapshot: &EntrySnapshot) -> MutationState<T> {
        let Some(value) = snapshot.value.clone() else {
            return MutationState::idle();
        };
        decode(&self.key, value).unwrap_or_else(|err| {
            warn!(endpoint = %self.name, error = %err, "Unreadable mutation state");
            MutationState::idle()
        })
    }

    fn run_hook(&self, hook: &'static str, f: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            error!(
                endpoint = %self.name,
                hook,
                panic = %panic_message(panic.as_ref()),
                "Mutation hook panicked"
            );
        }
    }
}
