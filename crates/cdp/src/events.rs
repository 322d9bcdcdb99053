//! Event Emitter - named publish/subscribe by composition
//!
//! Handlers run synchronously on the emitting task, inside the same
//! message-processing step that produced the event.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Event subscriber callback
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: AtomicU64,
    /// Key: event name (e.g. "Debugger.paused"), Value: (handler id, callback)
    handlers: DashMap<String, Vec<(u64, Handler<T>)>>,
}

/// Emits payloads of type `T` to handlers registered under an event name.
pub struct EventEmitter<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                handlers: DashMap::new(),
            }),
        }
    }

    /// Register a handler. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .handlers
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        let registry: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    if let Some(mut handlers) = registry.handlers.get_mut(&event) {
                        handlers.retain(|(handler_id, _)| *handler_id != id);
                    }
                    registry.handlers.remove_if(&event, |_, handlers| handlers.is_empty());
                }
            })),
        }
    }

    /// Deliver `payload` to every handler of `event`. Returns how many ran.
    pub fn emit(&self, event: &str, payload: &T) -> usize {
        // Snapshot first: handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Handler<T>> = self
            .registry
            .handlers
            .get(event)
            .map(|entry| entry.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .handlers
            .get(event)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}

impl<T: 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribe handle returned by [`EventEmitter::on`].
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
