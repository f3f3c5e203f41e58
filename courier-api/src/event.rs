//! Push events with latest-value replay.
//!
//! An external source receives an [`Emitter`] once, when the endpoint is
//! bound, and pushes payloads through it whenever it likes. Only the latest
//! payload per key is kept: there is no queue and no history.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use courier_core::{CourierResult, Timestamp};
use courier_store::{EntrySnapshot, Subscription};
use serde::Serialize;
use tracing::{debug, warn};

use crate::scope::{decode, encode, Scope};
use crate::{Args, Data};

/// External producer of event payloads.
///
/// Any `Fn(Emitter<K, P>)` closure is a source.
pub trait EventSource<K, P>: Send + Sync {
    /// Called once when the endpoint is bound.
    fn register(&self, emitter: Emitter<K, P>);
}

impl<K, P, F> EventSource<K, P> for F
where
    F: Fn(Emitter<K, P>) + Send + Sync,
{
    fn register(&self, emitter: Emitter<K, P>) {
        (self)(emitter)
    }
}

/// Handle an event source uses to push payloads.
///
/// After the store is closed every emit is a no-op.
pub struct Emitter<K, P> {
    scope: Scope,
    endpoint: Arc<str>,
    _marker: PhantomData<fn(&K, &P)>,
}

impl<K, P> Clone for Emitter<K, P> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            endpoint: Arc::clone(&self.endpoint),
            _marker: PhantomData,
        }
    }
}

impl<K, P> fmt::Debug for Emitter<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl<K: Serialize, P: Serialize> Emitter<K, P> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Store `payload` as the latest value for `key_args` and notify its
    /// subscribers.
    ///
    /// Returns `Ok(false)` if the store is closed.
    pub fn emit(&self, key_args: &K, payload: &P) -> CourierResult<bool> {
        let key = self.scope.key(&self.endpoint, key_args)?;
        let value = encode(&key, payload)?;
        let stored = self.scope.store().set(key.clone(), value);
        if stored {
            debug!(endpoint = %self.endpoint, key = %key, "Event emitted");
        }
        Ok(stored)
    }
}

/// Latest payload for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRead<P> {
    pub payload: Option<P>,
    /// Something was emitted since the key was last reset, even if the
    /// payload itself is empty or falsy.
    pub has_emitted: bool,
    pub emitted_at: Option<Timestamp>,
}

impl<P> Default for EventRead<P> {
    fn default() -> Self {
        Self {
            payload: None,
            has_emitted: false,
            emitted_at: None,
        }
    }
}

/// Declaration of an event endpoint, not yet bound to a store.
pub struct EventDef<K, P> {
    name: String,
    source: Option<Arc<dyn EventSource<K, P>>>,
}

impl<K: Args, P: Data> EventDef<K, P> {
    pub fn new<S>(name: impl Into<String>, source: S) -> Self
    where
        S: EventSource<K, P> + 'static,
    {
        Self {
            name: name.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Event fed only through [`EventEndpoint::emitter`].
    pub fn manual(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the declaration and hand the source its emitter.
    pub fn bind(self, scope: &Scope) -> EventEndpoint<K, P> {
        let endpoint = EventEndpoint {
            inner: Arc::new(EventInner {
                name: Arc::from(self.name.as_str()),
                scope: scope.clone(),
            }),
            _marker: PhantomData,
        };
        if let Some(source) = self.source {
            debug!(endpoint = %endpoint.inner.name, "Registering event source");
            source.register(endpoint.emitter());
        }
        endpoint
    }
}

struct EventInner {
    name: Arc<str>,
    scope: Scope,
}

/// An event endpoint bound to a store.
pub struct EventEndpoint<K, P> {
    inner: Arc<EventInner>,
    _marker: PhantomData<fn(&K, &P)>,
}

impl<K, P> Clone for EventEndpoint<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<K, P> fmt::Debug for EventEndpoint<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEndpoint")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl<K: Args, P: Data> EventEndpoint<K, P> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn emitter(&self) -> Emitter<K, P> {
        Emitter {
            scope: self.inner.scope.clone(),
            endpoint: Arc::clone(&self.inner.name),
            _marker: PhantomData,
        }
    }

    /// Shorthand for `self.emitter().emit(..)`.
    pub fn emit(&self, key_args: &K, payload: &P) -> CourierResult<bool> {
        self.emitter().emit(key_args, payload)
    }

    /// Call `handler` with every payload emitted for `key_args`.
    ///
    /// If a payload was already emitted, the handler receives it right away.
    /// Each handler has its own subscription.
    pub fn subscribe<F>(&self, key_args: &K, handler: F) -> CourierResult<Subscription>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let key = self.inner.scope.key(&self.inner.name, key_args)?;
        let endpoint = Arc::clone(&self.inner.name);
        Ok(self
            .inner
            .scope
            .store()
            .subscribe(key, move |snapshot: &EntrySnapshot| {
                let Some(value) = snapshot.value.clone() else {
                    return;
                };
                match decode::<P>(&snapshot.key, value) {
                    Ok(payload) => handler(&payload),
                    Err(err) => {
                        warn!(endpoint = %endpoint, key = %snapshot.key, error = %err, "Dropping undecodable event payload");
                    }
                }
            }))
    }

    /// Like [`EventEndpoint::subscribe`], but also reports resets.
    pub fn subscribe_reads<F>(&self, key_args: &K, callback: F) -> CourierResult<Subscription>
    where
        F: Fn(&EventRead<P>) + Send + Sync + 'static,
    {
        let key = self.inner.scope.key(&self.inner.name, key_args)?;
        let endpoint = Arc::clone(&self.inner.name);
        Ok(self
            .inner
            .scope
            .store()
            .subscribe(key, move |snapshot: &EntrySnapshot| {
                match read_from(snapshot) {
                    Ok(read) => callback(&read),
                    Err(err) => {
                        warn!(endpoint = %endpoint, key = %snapshot.key, error = %err, "Dropping undecodable event payload");
                    }
                }
            }))
    }

    /// Latest payload for `key_args`, without waiting.
    pub fn current(&self, key_args: &K) -> CourierResult<EventRead<P>> {
        let key = self.inner.scope.key(&self.inner.name, key_args)?;
        match self.inner.scope.store().entry(&key) {
            Some(snapshot) => Ok(read_from(&snapshot)?),
            None => Ok(EventRead::default()),
        }
    }

    /// Forget the latest payload so "not yet emitted" is observable again.
    pub fn reset(&self, key_args: &K) -> CourierResult<bool> {
        let key = self.inner.scope.key(&self.inner.name, key_args)?;
        Ok(self.inner.scope.store().reset(&key))
    }
}

fn read_from<P: Data>(snapshot: &EntrySnapshot) -> Result<EventRead<P>, courier_core::StoreError> {
    let payload = match snapshot.value.clone() {
        Some(value) => Some(decode::<P>(&snapshot.key, value)?),
        None => None,
    };
    Ok(EventRead {
        has_emitted: payload.is_some(),
        payload,
        emitted_at: snapshot.updated_at,
    })
}
