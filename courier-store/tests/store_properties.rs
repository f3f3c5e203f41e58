//! Property tests for the cache store.

use std::sync::{Arc, Mutex};

use courier_core::{CacheKey, ValueShape};
use courier_store::{CacheStore, EntrySnapshot};
use proptest::prelude::*;
use serde_json::{json, Value};

fn key(id: u8) -> CacheKey {
    CacheKey::new(None, "getThing", &id).expect("key")
}

proptest! {
    /// Property: a subscriber sees every write to its key, in order, after the
    /// initial snapshot, and nothing written to other keys.
    #[test]
    fn prop_subscriber_sees_every_write_in_order(
        writes in proptest::collection::vec((0u8..3, any::<i64>()), 1..30)
    ) {
        let store = CacheStore::new();
        let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(key(0), move |snapshot: &EntrySnapshot| {
            sink.lock().unwrap().push(snapshot.value.clone());
        });

        let mut expected = vec![None];
        for (id, value) in &writes {
            store.set(key(*id), json!(value));
            if *id == 0 {
                expected.push(Some(json!(value)));
            }
        }

        prop_assert_eq!(&*seen.lock().unwrap(), &expected);
    }

    /// Property: the last write to a key is what `get` returns.
    #[test]
    fn prop_get_returns_last_write(values in proptest::collection::vec(any::<i32>(), 1..20)) {
        let store = CacheStore::new();
        for value in &values {
            store.set(key(1), json!(value));
        }
        prop_assert_eq!(store.get(&key(1)), values.last().map(|v| json!(v)));
    }

    /// Property: atomic merges always replace, so they behave like `set`.
    #[test]
    fn prop_atomic_merge_is_set(first in any::<i32>(), second in any::<i32>()) {
        let store = CacheStore::new();
        store.set(key(2), json!({"v": first}));
        store.merge(key(2), ValueShape::Atomic, json!({"w": second}));
        prop_assert_eq!(store.get(&key(2)), Some(json!({"w": second})));
    }

    /// Property: nothing written after close is readable.
    #[test]
    fn prop_closed_store_stays_empty(values in proptest::collection::vec(any::<i32>(), 0..10)) {
        let store = CacheStore::new();
        store.close();
        for (i, value) in values.iter().enumerate() {
            prop_assert!(!store.set(key(i as u8), json!(value)));
        }
        prop_assert!(store.is_empty());
    }
}

#[test]
fn concurrent_writers_and_subscribers() {
    let store = CacheStore::new();
    let count = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count);
    let sub = store.subscribe(key(9), move |snapshot: &EntrySnapshot| {
        if snapshot.has_value() {
            *sink.lock().unwrap() += 1;
        }
    });

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    store.set(key(9), json!(t * 100 + i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    assert_eq!(*count.lock().unwrap(), 100);
    sub.unsubscribe();
    assert_eq!(store.stats().subscriber_count, 0);
}
