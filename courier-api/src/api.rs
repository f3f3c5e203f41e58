//! Root facade.
//!
//! [`ApiBuilder`] collects endpoint declarations, validates them, binds them
//! to one shared store and produces an [`Api`]: a table of endpoints keyed by
//! name, with typed lookups and a single [`Api::close`] lifecycle.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use courier_core::{ConfigError, CourierConfig, CourierResult, EndpointError, EndpointKind};
use courier_store::{CacheStats, CacheStore};
use tracing::{debug, info};

use crate::event::{EventDef, EventEndpoint};
use crate::mutation::{MutationDef, MutationEndpoint};
use crate::naming::{accessors, Accessor};
use crate::query::{QueryDef, QueryEndpoint};
use crate::scope::Scope;
use crate::{Args, Data};

type Erased = Arc<dyn Any + Send + Sync>;
type Binder = Box<dyn FnOnce(&Scope) -> Erased + Send>;
type DebugHook = Box<dyn FnOnce(&Api) + Send>;

struct Declared {
    name: String,
    kind: EndpointKind,
    invalidates: Vec<String>,
    bind: Binder,
}

/// Builder for [`Api`].
pub struct ApiBuilder {
    config: CourierConfig,
    declared: Vec<Declared>,
    debug_hook: Option<DebugHook>,
}

impl ApiBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            declared: Vec::new(),
            debug_hook: None,
        }
    }

    /// Declare a query endpoint.
    pub fn query<A: Args, T: Data>(mut self, def: QueryDef<A, T>) -> Self {
        self.declared.push(Declared {
            name: def.name().to_string(),
            kind: EndpointKind::Query,
            invalidates: Vec::new(),
            bind: Box::new(move |scope: &Scope| Arc::new(def.bind(scope)) as Erased),
        });
        self
    }

    /// Declare a mutation endpoint.
    pub fn mutation<A: Args + Clone, T: Data>(mut self, def: MutationDef<A, T>) -> Self {
        self.declared.push(Declared {
            name: def.name().to_string(),
            kind: EndpointKind::Mutation,
            invalidates: def.invalidated_endpoints().to_vec(),
            bind: Box::new(move |scope: &Scope| Arc::new(def.bind(scope)) as Erased),
        });
        self
    }

    /// Declare an event endpoint. Its source is registered during [`ApiBuilder::build`].
    pub fn event<K: Args, P: Data>(mut self, def: EventDef<K, P>) -> Self {
        self.declared.push(Declared {
            name: def.name().to_string(),
            kind: EndpointKind::Event,
            invalidates: Vec::new(),
            bind: Box::new(move |scope: &Scope| Arc::new(def.bind(scope)) as Erased),
        });
        self
    }

    /// Run `hook` once with the finished facade, e.g. to hand it to a debugger.
    pub fn debug_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Api) + Send + 'static,
    {
        self.debug_hook = Some(Box::new(hook));
        self
    }

    /// Validate declarations and bind every endpoint to a new store.
    ///
    /// # Errors
    ///
    /// - [`ConfigError`] for an invalid configuration or a blank endpoint name
    /// - [`EndpointError::DuplicateEndpoint`] when two endpoints share a name
    ///   or a derived accessor name
    /// - [`EndpointError::UnknownEndpoint`] when a mutation invalidates a
    ///   query that was not declared
    pub fn build(self) -> CourierResult<Api> {
        self.config.validate()?;

        let mut accessor_table: HashMap<String, Accessor> = HashMap::new();
        for declared in &self.declared {
            if declared.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "endpoint".to_string(),
                    value: declared.name.clone(),
                    reason: "endpoint names must not be blank".to_string(),
                }
                .into());
            }
            for accessor in accessors(declared.kind, &declared.name) {
                if accessor_table.contains_key(&accessor.name) {
                    return Err(EndpointError::DuplicateEndpoint {
                        endpoint: accessor.name,
                    }
                    .into());
                }
                accessor_table.insert(accessor.name.clone(), accessor);
            }
        }

        for declared in &self.declared {
            for target in &declared.invalidates {
                let is_query = self
                    .declared
                    .iter()
                    .any(|d| d.kind == EndpointKind::Query && &d.name == target);
                if !is_query {
                    return Err(EndpointError::UnknownEndpoint {
                        endpoint: target.clone(),
                    }
                    .into());
                }
            }
        }

        let store = CacheStore::new();
        let scope = Scope::new(store.clone(), &self.config);
        let mut endpoints = HashMap::with_capacity(self.declared.len());
        for declared in self.declared {
            debug!(endpoint = %declared.name, kind = %declared.kind, "Binding endpoint");
            let endpoint = (declared.bind)(&scope);
            endpoints.insert(
                declared.name,
                EndpointHandle {
                    kind: declared.kind,
                    endpoint,
                },
            );
        }

        info!(
            endpoints = endpoints.len(),
            namespace = ?self.config.namespace,
            "API facade built"
        );

        let api = Api {
            inner: Arc::new(ApiInner {
                store,
                config: self.config,
                endpoints,
                accessors: accessor_table,
            }),
        };
        if let Some(hook) = self.debug_hook {
            hook(&api);
        }
        Ok(api)
    }
}

struct EndpointHandle {
    kind: EndpointKind,
    endpoint: Erased,
}

struct ApiInner {
    store: CacheStore,
    config: CourierConfig,
    endpoints: HashMap<String, EndpointHandle>,
    accessors: HashMap<String, Accessor>,
}

/// The facade over every declared endpoint.
///
/// Cloning is cheap; all clones share one store.
#[derive(Clone)]
pub struct Api {
    inner: Arc<ApiInner>,
}

impl Api {
    pub fn builder(config: CourierConfig) -> ApiBuilder {
        ApiBuilder::new(config)
    }

    /// Look up a query endpoint by name.
    pub fn query<A: Args, T: Data>(&self, name: &str) -> CourierResult<QueryEndpoint<A, T>> {
        self.lookup(name, EndpointKind::Query)
    }

    /// Look up a mutation endpoint by name.
    pub fn mutation<A: Args + Clone, T: Data>(
        &self,
        name: &str,
    ) -> CourierResult<MutationEndpoint<A, T>> {
        self.lookup(name, EndpointKind::Mutation)
    }

    /// Look up an event endpoint by name.
    pub fn event<K: Args, P: Data>(&self, name: &str) -> CourierResult<EventEndpoint<K, P>> {
        self.lookup(name, EndpointKind::Event)
    }

    fn lookup<E: Clone + 'static>(&self, name: &str, expected: EndpointKind) -> CourierResult<E> {
        let handle = self
            .inner
            .endpoints
            .get(name)
            .ok_or_else(|| EndpointError::UnknownEndpoint {
                endpoint: name.to_string(),
            })?;
        if handle.kind != expected {
            return Err(EndpointError::KindMismatch {
                endpoint: name.to_string(),
                expected: expected.to_string(),
                actual: handle.kind.to_string(),
            }
            .into());
        }
        handle
            .endpoint
            .downcast_ref::<E>()
            .cloned()
            .ok_or_else(|| {
                EndpointError::TypeMismatch {
                    endpoint: name.to_string(),
                }
                .into()
            })
    }

    /// Resolve a discoverable accessor name (`useGetThings`,
    /// `subscribeToThingChanged`, ...) to its endpoint and role.
    pub fn resolve(&self, accessor: &str) -> CourierResult<Accessor> {
        self.inner
            .accessors
            .get(accessor)
            .cloned()
            .ok_or_else(|| {
                EndpointError::UnknownAccessor {
                    accessor: accessor.to_string(),
                }
                .into()
            })
    }

    /// Kind of a declared endpoint.
    pub fn kind(&self, name: &str) -> Option<EndpointKind> {
        self.inner.endpoints.get(name).map(|handle| handle.kind)
    }

    /// Declared endpoint names, sorted.
    pub fn endpoint_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.store.stats()
    }

    /// Drop unwatched entries older than the configured `gc_time`.
    ///
    /// Without a configured `gc_time` nothing is collected.
    pub fn collect_garbage(&self) -> usize {
        match self.inner.config.gc_time {
            Some(gc_time) => self.inner.store.collect_garbage(gc_time),
            None => 0,
        }
    }

    /// Cancel in-flight remote calls, clear the store and release every
    /// subscription. Safe to call any number of times.
    pub fn close(&self) {
        self.inner.store.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.store.is_closed()
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("endpoints", &self.endpoint_names())
            .field("namespace", &self.inner.config.namespace)
            .field("closed", &self.is_closed())
            .finish()
    }
}
