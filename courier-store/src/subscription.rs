//! Subscription handles.

use std::fmt;
use std::sync::Weak;

use courier_core::CacheKey;

use crate::entry::SubscriberId;
use crate::store::Shared;

/// Handle to a registered subscriber.
///
/// The subscriber stays registered until the handle is dropped or
/// [`Subscription::unsubscribe`] is called. The handle holds only a weak
/// reference, so it never keeps a store alive.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: CacheKey,
    id: SubscriberId,
    store: Weak<Shared>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(key: CacheKey, id: SubscriberId, store: Weak<Shared>) -> Self {
        Self {
            key,
            id,
            store,
            active: true,
        }
    }

    /// Subscription that was never registered (store already closed).
    pub(crate) fn detached(key: CacheKey, id: SubscriberId) -> Self {
        Self {
            key,
            id,
            store: Weak::new(),
            active: false,
        }
    }

    /// Key this subscription watches.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns true while the callback can still be invoked.
    pub fn is_active(&self) -> bool {
        self.active
            && self
                .store
                .upgrade()
                .is_some_and(|shared| !shared.is_closed())
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(shared) = self.store.upgrade() {
            shared.remove_subscriber(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
