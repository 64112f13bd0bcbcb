//! Registry of active listeners.
//!
//! The mutex guards only map mutation and snapshotting. Callbacks are never
//! invoked while it is held, so a callback may cancel its own listener.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::EventsError;
use crate::listener::ListenerSlot;
use crate::sync::lock;
use crate::types::ListenerId;

pub struct ListenerRegistry<B> {
    slots: Mutex<BTreeMap<ListenerId, Arc<ListenerSlot<B>>>>,
    max_listeners: usize,
}

impl<B> ListenerRegistry<B> {
    pub fn new(max_listeners: usize) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            max_listeners,
        }
    }

    /// Insert a slot under the lowest unused id.
    ///
    /// `make` builds the slot for the allocated id while the lock is held.
    pub fn insert_with(
        &self,
        make: impl FnOnce(ListenerId) -> ListenerSlot<B>,
    ) -> Result<Arc<ListenerSlot<B>>, EventsError> {
        let mut slots = lock(&self.slots);
        let id = (0..self.max_listeners)
            .map(ListenerId)
            .find(|id| !slots.contains_key(id))
            .ok_or(EventsError::TooManyListeners {
                limit: self.max_listeners,
            })?;
        let slot = Arc::new(make(id));
        slots.insert(id, Arc::clone(&slot));
        Ok(slot)
    }

    /// Remove `slot` if it is still the one registered under its id.
    pub fn remove(&self, slot: &Arc<ListenerSlot<B>>) -> bool {
        let mut slots = lock(&self.slots);
        let id = slot.id();
        let registered = slots
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if registered {
            slots.remove(&id);
        }
        registered
    }

    /// Point-in-time copy of the active listeners, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<ListenerSlot<B>>> {
        lock(&self.slots).values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ListenerId> {
        lock(&self.slots).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
