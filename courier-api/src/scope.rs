//! Binding scope shared by every endpoint of one facade.

use courier_core::{CacheKey, CourierConfig, StaleTime, StoreError};
use courier_store::CacheStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Store handle plus the settings endpoints inherit when they are bound.
///
/// The facade builds one scope from its [`CourierConfig`]; endpoints can also
/// be bound to a scope directly when no facade is needed.
#[derive(Debug, Clone)]
pub struct Scope {
    store: CacheStore,
    namespace: Option<String>,
    default_stale_time: StaleTime,
    auto_fetch_on_subscribe: bool,
}

impl Scope {
    pub fn new(store: CacheStore, config: &CourierConfig) -> Self {
        Self {
            store,
            namespace: config.namespace.clone(),
            default_stale_time: config.default_stale_time,
            auto_fetch_on_subscribe: config.auto_fetch_on_subscribe,
        }
    }

    /// Scope over a fresh store with default configuration.
    pub fn standalone() -> Self {
        Self::new(CacheStore::new(), &CourierConfig::default())
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn default_stale_time(&self) -> StaleTime {
        self.default_stale_time
    }

    pub fn auto_fetch_on_subscribe(&self) -> bool {
        self.auto_fetch_on_subscribe
    }

    /// Build the cache key for one call of `endpoint`.
    pub fn key<A: Serialize + ?Sized>(&self, endpoint: &str, args: &A) -> Result<CacheKey, StoreError> {
        CacheKey::new(self.namespace(), endpoint, args)
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(key: &CacheKey, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(key: &CacheKey, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Deserialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
