//! Cache key system.
//!
//! A `CacheKey` is the sole identity of a cache entry. It is built from an
//! optional namespace, the endpoint name and the call arguments. Arguments are
//! reduced to a canonical JSON string, so two calls with structurally equal
//! arguments always resolve to the same key.

use std::fmt;

use serde::Serialize;

use crate::error::StoreError;

/// A cache key scoped to one endpoint.
///
/// # Design
///
/// The private inner struct ensures that a `CacheKey` can ONLY be constructed
/// through [`CacheKey::new`] (or [`CacheKey::unit`]), which always canonicalizes
/// the arguments. Two keys are equal exactly when namespace, endpoint and
/// canonical arguments are equal.
///
/// # Canonical Form
///
/// Arguments are converted to a `serde_json::Value` first and then rendered.
/// serde_json's default object map is ordered by key, so the field order of
/// a struct or the iteration order of a `HashMap` never leaks into the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Private inner data - cannot be constructed externally
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct KeyInner {
    namespace: Option<String>,
    endpoint: String,
    args: String,
}

impl CacheKey {
    /// Create a key for `endpoint` called with `args`.
    pub fn new<A>(namespace: Option<&str>, endpoint: &str, args: &A) -> Result<Self, StoreError>
    where
        A: Serialize + ?Sized,
    {
        let args = canonical_args(args).map_err(|e| StoreError::Serialization {
            key: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            inner: KeyInner {
                namespace: namespace.map(str::to_string),
                endpoint: endpoint.to_string(),
                args,
            },
        })
    }

    /// Create the argument-less key of an endpoint.
    ///
    /// Mutations keep their most recent state under this key.
    pub fn unit(namespace: Option<&str>, endpoint: &str) -> Self {
        Self {
            inner: KeyInner {
                namespace: namespace.map(str::to_string),
                endpoint: endpoint.to_string(),
                args: "null".to_string(),
            },
        }
    }

    /// Namespace this key belongs to, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.inner.namespace.as_deref()
    }

    /// Endpoint name this key belongs to.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Canonical JSON form of the call arguments.
    pub fn args(&self) -> &str {
        &self.inner.args
    }

    /// Check if this key was built for the given endpoint.
    pub fn belongs_to(&self, namespace: Option<&str>, endpoint: &str) -> bool {
        self.inner.namespace.as_deref() == namespace && self.inner.endpoint == endpoint
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(namespace) = &self.inner.namespace {
            write!(f, "{}/", namespace)?;
        }
        write!(f, "{}({})", self.inner.endpoint, self.inner.args)
    }
}

fn canonical_args<A: Serialize + ?Sized>(args: &A) -> serde_json::Result<String> {
    let value = serde_json::to_value(args)?;
    serde_json::to_string(&value)
}
