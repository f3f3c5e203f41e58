//! Reactive adapter over `tokio::sync::watch`.
//!
//! The engine itself is a plain observer store. UI layers that re-render on
//! change can instead hold a [`Watched`] value: a watch receiver that always
//! carries the latest state, kept alive by the subscription it owns.

use courier_core::CourierResult;
use courier_store::Subscription;
use tokio::sync::watch;

use crate::event::{EventEndpoint, EventRead};
use crate::mutation::{MutationEndpoint, MutationState};
use crate::query::{QueryEndpoint, QueryState};
use crate::{Args, Data};

/// Latest state of one subscription, readable and awaitable.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Watched<T> {
    receiver: watch::Receiver<T>,
    subscription: Subscription,
}

impl<T> Watched<T> {
    fn new(mut receiver: watch::Receiver<T>, subscription: Subscription) -> Self {
        // The subscription already delivered the current state; only later
        // changes should wake `changed`.
        receiver.borrow_and_update();
        Self {
            receiver,
            subscription,
        }
    }

    /// Borrow the latest state.
    pub fn borrow(&self) -> watch::Ref<'_, T> {
        self.receiver.borrow()
    }

    /// Wait for the next change.
    ///
    /// Returns false once the store is closed and no further changes can
    /// arrive.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Another receiver of the same state.
    pub fn receiver(&self) -> watch::Receiver<T> {
        self.receiver.clone()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl<T: Clone> Watched<T> {
    /// Clone of the latest state.
    pub fn get(&self) -> T {
        self.receiver.borrow().clone()
    }
}

/// Watch the query entry for `args`. Loads it on first subscription like
/// [`QueryEndpoint::subscribe`].
pub fn watch_query<A: Args, T: Data>(
    endpoint: &QueryEndpoint<A, T>,
    args: A,
) -> CourierResult<Watched<QueryState<T>>> {
    let (tx, rx) = watch::channel(QueryState::default());
    let subscription = endpoint.subscribe(args, move |state: &QueryState<T>| {
        tx.send_replace(state.clone());
    })?;
    Ok(Watched::new(rx, subscription))
}

/// Watch the most recent invocation of a mutation.
pub fn watch_mutation<A: Args + Clone, T: Data>(
    endpoint: &MutationEndpoint<A, T>,
) -> Watched<MutationState<T>> {
    let (tx, rx) = watch::channel(MutationState::idle());
    let subscription = endpoint.subscribe(move |state: &MutationState<T>| {
        tx.send_replace(state.clone());
    });
    Watched::new(rx, subscription)
}

/// Watch the latest payload of an event key, resets included.
pub fn watch_event<K: Args, P: Data>(
    endpoint: &EventEndpoint<K, P>,
    key_args: &K,
) -> CourierResult<Watched<EventRead<P>>> {
    let (tx, rx) = watch::channel(EventRead::default());
    let subscription = endpoint.subscribe_reads(key_args, move |read: &EventRead<P>| {
        tx.send_replace(read.clone());
    })?;
    Ok(Watched::new(rx, subscription))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use courier_core::CourierError;
    use serde_json::{json, Value};

    use crate::event::EventDef;
    use crate::mutation::{MutationDef, MutationStatus};
    use crate::query::QueryDef;
    use crate::scope::Scope;

    #[tokio::test]
    async fn test_watch_query_follows_load() {
        let query: QueryEndpoint<String, Value> =
            QueryDef::new("getData", |id: String| async move {
                Ok::<_, CourierError>(json!({"id": id}))
            })
            .bind(&Scope::standalone());

        let mut watched = watch_query(&query, "1".to_string()).unwrap();
        assert!(watched.borrow().is_loading());

        tokio::time::timeout(Duration::from_secs(1), watched.changed())
            .await
            .expect("load should arrive");
        assert_eq!(watched.get().data, Some(json!({"id": "1"})));
    }

    #[tokio::test]
    async fn test_watch_mutation_tracks_status() {
        let mutation: MutationEndpoint<u32, u32> =
            MutationDef::new("double", |n: u32| async move { Ok::<_, CourierError>(n * 2) })
                .bind(&Scope::standalone());
        let watched = watch_mutation(&mutation);
        assert_eq!(watched.get().status, MutationStatus::Idle);

        mutation.execute(4, None).await.unwrap();
        let state = watched.get();
        assert_eq!(state.status, MutationStatus::Success);
        assert_eq!(state.data, Some(8));
    }

    #[tokio::test]
    async fn test_watch_event_sees_emit_and_reset() {
        let endpoint: EventEndpoint<(), String> =
            EventDef::manual("statusChanged").bind(&Scope::standalone());
        let mut watched = watch_event(&endpoint, &()).unwrap();

        endpoint.emit(&(), &"online".to_string()).unwrap();
        assert!(watched.changed().await);
        assert_eq!(watched.get().payload.as_deref(), Some("online"));

        endpoint.reset(&()).unwrap();
        assert!(!watched.get().has_emitted);
    }

    #[tokio::test]
    async fn test_closing_store_ends_watch() {
        let scope = Scope::standalone();
        let endpoint: EventEndpoint<(), u8> = EventDef::manual("tick").bind(&scope);
        let mut watched = watch_event(&endpoint, &()).unwrap();

        scope.store().close();
        assert!(!watched.changed().await);
        assert!(!watched.subscription().is_active());
    }
}
