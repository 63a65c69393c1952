//! Event registry
//!
//! The set of registered events, kept in registration order. All mutation
//! goes through one mutex; readers take a snapshot of `Arc`s and evaluate
//! outside the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use evt_core::EventId;
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::event::{Event, EventHandle};

/// Registered events keyed by identity
#[derive(Default)]
pub struct EventRegistry {
    events: Mutex<IndexMap<EventId, Arc<Event>>>,
    generation: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<EventId, Arc<Event>>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Generation for the next event built for registration
    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add an event
    ///
    /// With `replace`, an existing event of the same identity is swapped out
    /// and returned; otherwise it is a [`EngineError::DuplicateRegistration`].
    pub fn register(&self, event: Arc<Event>, replace: bool) -> EngineResult<Option<Arc<Event>>> {
        let mut events = self.lock();
        let id = event.id().clone();
        if !replace && events.contains_key(&id) {
            return Err(EngineError::DuplicateRegistration(id));
        }
        // shift_remove + insert keeps a replacement at the end, like a new registration
        let previous = events.shift_remove(&id);
        events.insert(id.clone(), event);
        debug!(event = %id, replaced = previous.is_some(), "Registered event");
        Ok(previous)
    }

    /// Remove the event a handle refers to
    ///
    /// Returns `None` if it is already gone or was replaced by a newer
    /// registration.
    pub fn unregister(&self, handle: &EventHandle) -> Option<Arc<Event>> {
        let mut events = self.lock();
        match events.get(handle.id()) {
            Some(event) if event.handle().generation() == handle.generation() => {
                trace!(event = %handle.id(), "Unregistered event");
                events.shift_remove(handle.id())
            }
            _ => None,
        }
    }

    /// Remove whatever event is registered under an identity
    pub fn remove(&self, id: &EventId) -> Option<Arc<Event>> {
        self.lock().shift_remove(id)
    }

    /// Remove every event of a namespace
    pub fn remove_namespace(&self, namespace: &str) -> Vec<Arc<Event>> {
        let mut events = self.lock();
        let mut removed = Vec::new();
        events.retain(|id, event| {
            if id.namespace() == namespace {
                removed.push(event.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn get(&self, id: &EventId) -> Option<Arc<Event>> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.lock().contains_key(id)
    }

    /// Events in registration order
    pub fn snapshot(&self) -> Vec<Arc<Event>> {
        self.lock().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
