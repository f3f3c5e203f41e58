//! Staleness and merge policies.
//!
//! Query endpoints declare how long a fetched value stays fresh and whether
//! their values are records that accept partial updates.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How long a fetched value is considered fresh.
///
/// A fresh value satisfies `fetch` without calling the remote operation.
/// Explicit invalidation always wins over freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleTime {
    /// Every `fetch` calls the remote operation.
    Always,
    /// Values stay fresh for the given duration (milliseconds in config files).
    After(#[serde(with = "crate::duration_ms")] Duration),
    /// Values never go stale on their own; only invalidation refetches.
    Infinite,
}

impl StaleTime {
    /// Create a StaleTime that expires after `duration`.
    ///
    /// A zero duration is the same as [`StaleTime::Always`].
    pub fn after(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::Always
        } else {
            Self::After(duration)
        }
    }

    /// Check whether a value of the given age is still fresh.
    pub fn is_fresh(&self, age: Duration) -> bool {
        match self {
            Self::Always => false,
            Self::After(max_age) => age < *max_age,
            Self::Infinite => true,
        }
    }
}

impl Default for StaleTime {
    fn default() -> Self {
        Self::Infinite
    }
}

/// Declared shape of an endpoint's values.
///
/// Decides whether a partial update is merged into the existing value or
/// replaces it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueShape {
    /// Object-like values. Object patches are shallow-merged into an existing
    /// object value.
    Record,
    /// Collections and scalars. Updates always replace the whole value.
    #[default]
    Atomic,
}

impl ValueShape {
    /// Apply `update` on top of `existing` according to this shape.
    ///
    /// Only a `Record` endpoint with an existing object value and an object
    /// update merges; every other combination replaces.
    pub fn apply(&self, existing: Option<&Value>, update: Value) -> Value {
        match (self, existing, update) {
            (Self::Record, Some(Value::Object(current)), Value::Object(patch)) => {
                let mut merged = current.clone();
                for (field, value) in patch {
                    merged.insert(field, value);
                }
                Value::Object(merged)
            }
            (_, _, update) => update,
        }
    }

    /// Returns true if partial updates may be merged.
    pub fn is_mergeable(&self) -> bool {
        matches!(self, Self::Record)
    }
}
