//! COURIER Store - Keyed Cache with Subscriptions
//!
//! The single shared cache behind every endpoint runtime. Values are held as
//! `serde_json::Value` so heterogeneous endpoints can share one store; typed
//! access lives in `courier-api`.
//!
//! # Example
//!
//! ```
//! use courier_core::CacheKey;
//! use courier_store::CacheStore;
//! use serde_json::json;
//!
//! let store = CacheStore::new();
//! let key = CacheKey::new(None, "getThing", &"1").unwrap();
//!
//! let sub = store.subscribe(key.clone(), |snapshot| {
//!     println!("{} -> {:?}", snapshot.key, snapshot.value);
//! });
//! store.set(key.clone(), json!({"id": "1"}));
//! assert_eq!(store.get(&key), Some(json!({"id": "1"})));
//!
//! sub.unsubscribe();
//! store.close();
//! ```

mod entry;
pub mod lock;
mod stats;
mod store;
mod subscription;

pub use entry::{Callback, EntrySnapshot, SubscriberId};
pub use stats::CacheStats;
pub use store::{panic_message, CacheStore};
pub use subscription::Subscription;
