//! COURIER API - Endpoint Runtimes and Facade
//!
//! Turns caller-supplied async operations into a cached, subscribable API:
//!
//! - [`QueryEndpoint`]: cached reads keyed by endpoint and arguments, with
//!   staleness, invalidation, resets, partial updates and load-on-subscribe.
//! - [`MutationEndpoint`]: one-shot actions with lifecycle hooks and an
//!   observable most-recent state.
//! - [`EventEndpoint`]: push events that keep only the latest payload per key.
//! - [`Api`]: the facade that binds declarations to one shared store and
//!   tears everything down with [`Api::close`].
//!
//! # Example
//!
//! ```no_run
//! use courier_api::{Api, QueryDef};
//! use courier_core::{CourierConfig, CourierError};
//! use serde_json::{json, Value};
//!
//! # async fn demo() -> Result<(), CourierError> {
//! let api = Api::builder(CourierConfig::default())
//!     .query(QueryDef::<String, Value>::new("getData", |id: String| async move {
//!         Ok::<_, CourierError>(json!({ "id": id }))
//!     }))
//!     .build()?;
//!
//! let get_data = api.query::<String, Value>("getData")?;
//! assert_eq!(get_data.fetch("1".into()).await?, json!({ "id": "1" }));
//! api.close();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod event;
pub mod mutation;
pub mod naming;
pub mod query;
pub mod scope;
pub mod watch;

pub use api::{Api, ApiBuilder};
pub use courier_store::{CacheStats, CacheStore, Subscription};
pub use event::{Emitter, EventDef, EventEndpoint, EventRead, EventSource};
pub use mutation::{
    CallOptions, MutationAction, MutationDef, MutationEndpoint, MutationState, MutationStatus,
};
pub use naming::{Accessor, AccessorRole};
pub use query::{QueryDef, QueryEndpoint, QueryFetcher, QueryOptions, QueryState};
pub use scope::Scope;
pub use watch::{watch_event, watch_mutation, watch_query, Watched};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bound for endpoint argument types.
pub trait Args: Serialize + Send + Sync + 'static {}

impl<A: Serialize + Send + Sync + 'static> Args for A {}

/// Bound for cached results and event payloads.
pub trait Data: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> Data for T {}
