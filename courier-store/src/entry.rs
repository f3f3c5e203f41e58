//! Cache entries and the snapshots handed to readers and subscribers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_core::{CacheKey, Timestamp};
use serde_json::Value;

/// Identifier of one subscription within the store.
pub type SubscriberId = u64;

/// Callback invoked with the entry state whenever the entry's value changes.
pub type Callback = Arc<dyn Fn(&EntrySnapshot) + Send + Sync>;

/// Point-in-time view of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    /// Key of the entry.
    pub key: CacheKey,
    /// Current value, `None` if never written or reset.
    pub value: Option<Value>,
    /// Whether the entry was explicitly invalidated since its last write.
    pub is_stale: bool,
    /// When the value was last written.
    pub updated_at: Option<Timestamp>,
    /// Incarnation of the entry. A key that is dropped and later recreated
    /// gets a different epoch; 0 for a key without an entry.
    pub epoch: u64,
    /// Store sequence number of the last invalidation or reset, 0 if none.
    pub invalidated_at: u64,
}

impl EntrySnapshot {
    /// Snapshot of a key that has no entry.
    pub fn vacant(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            is_stale: false,
            updated_at: None,
            epoch: 0,
            invalidated_at: 0,
        }
    }

    /// Returns true if a value is present.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Time elapsed since the value was written.
    ///
    /// Returns `None` when there is no value.
    pub fn age(&self) -> Option<Duration> {
        self.updated_at.map(|at| {
            Utc::now()
                .signed_duration_since(at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

pub(crate) struct Entry {
    pub value: Option<Value>,
    pub is_stale: bool,
    /// Last write; drives garbage collection.
    pub updated_at: Option<Timestamp>,
    pub epoch: u64,
    pub invalidated_at: u64,
    /// Kept in registration order.
    pub subscribers: Vec<(SubscriberId, Callback)>,
}

impl Entry {
    pub fn new(epoch: u64) -> Self {
        Self {
            value: None,
            is_stale: false,
            updated_at: None,
            epoch,
            invalidated_at: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn snapshot(&self, key: &CacheKey) -> EntrySnapshot {
        EntrySnapshot {
            key: key.clone(),
            value: self.value.clone(),
            is_stale: self.is_stale,
            updated_at: self.updated_at,
            epoch: self.epoch,
            invalidated_at: self.invalidated_at,
        }
    }

    pub fn callbacks(&self) -> Vec<(SubscriberId, Callback)> {
        self.subscribers
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect()
    }

    pub fn write(&mut self, value: Value) {
        self.value = Some(value);
        self.is_stale = false;
        self.updated_at = Some(Utc::now());
    }

    /// Stamp an invalidation or reset with store sequence `seq`.
    pub fn mark_invalidated(&mut self, seq: u64) {
        self.invalidated_at = seq;
    }

    /// An entry holding nothing and watched by nobody carries no information.
    pub fn is_vacant(&self) -> bool {
        self.value.is_none() && self.subscribers.is_empty()
    }
}
