//! # Subscriber Registry
//!
//! Thread-safe registration of message listeners, either for every message
//! or for one event name. Delivery iterates a snapshot taken under the lock,
//! so listeners may subscribe or unsubscribe from inside a callback, and a
//! panicking listener never prevents delivery to the ones after it.
//!
//! Listeners are owned by the registry until explicitly removed with
//! [`Handlers::remove`] or [`Handlers::clear`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::protocol::{Message, PresenceMessage};

/// Items that carry an event name listeners can filter on
pub trait EventName {
    fn event_name(&self) -> Option<&str>;
}

impl EventName for Message {
    fn event_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl EventName for PresenceMessage {
    fn event_name(&self) -> Option<&str> {
        Some(self.action.as_str())
    }
}

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A registered listener
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registration<T> {
    id: SubscriptionId,
    listener: Listener<T>,
}

impl<T> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: Arc::clone(&self.listener),
        }
    }
}

struct Inner<T> {
    next_id: u64,
    global: Vec<Registration<T>>,
    by_event: HashMap<String, Vec<Registration<T>>>,
}

/// Registry of listeners for one message type
pub struct Handlers<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Handlers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers").field("len", &self.len()).finish()
    }
}

impl<T> Handlers<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                global: Vec::new(),
                by_event: HashMap::new(),
            }),
        }
    }

    /// Register a listener for every item
    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        self.register(None, Arc::new(listener))
    }

    /// Register a listener for items with the given event name
    pub fn add_for_event(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.register(Some(event.into()), Arc::new(listener))
    }

    fn register(&self, event: Option<String>, listener: Listener<T>) -> SubscriptionId {
        let mut inner = lock(&self.inner);
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;

        let registration = Registration { id, listener };
        match event {
            Some(event) => inner.by_event.entry(event).or_default().push(registration),
            None => inner.global.push(registration),
        }
        id
    }

    /// Remove one listener. Returns false if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut inner = lock(&self.inner);

        let before = inner.global.len();
        inner.global.retain(|r| r.id != id);
        if inner.global.len() != before {
            return true;
        }

        let mut removed = false;
        inner.by_event.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            removed |= registrations.len() != before;
            !registrations.is_empty()
        });
        removed
    }

    /// Remove every listener
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.global.clear();
        inner.by_event.clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        let inner = lock(&self.inner);
        inner.global.len() + inner.by_event.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listeners interested in an item with this event name: global ones
    /// first, then event-specific ones, each in registration order.
    pub fn snapshot(&self, event: Option<&str>) -> Vec<Listener<T>> {
        let inner = lock(&self.inner);
        let mut listeners: Vec<Listener<T>> =
            inner.global.iter().map(|r| Arc::clone(&r.listener)).collect();
        if let Some(registrations) = event.and_then(|e| inner.by_event.get(e)) {
            listeners.extend(registrations.iter().map(|r| Arc::clone(&r.listener)));
        }
        listeners
    }
}

impl<T: EventName> Handlers<T> {
    /// Deliver an item to every interested listener. Returns how many
    /// listeners completed without panicking.
    pub fn dispatch(&self, item: &T) -> usize {
        let mut delivered = 0;
        for listener in self.snapshot(item.event_name()) {
            match catch_unwind(AssertUnwindSafe(|| listener(item))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(event = ?item.event_name(), "listener panicked during delivery");
                }
            }
        }
        delivered
    }
}

impl<T: Clone + Send + 'static> Handlers<T> {
    /// Register a listener that forwards every item into an unbounded
    /// stream. The subscription lives until removed, even if the receiver
    /// is dropped.
    pub fn add_stream(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add(move |item: &T| {
            let _ = tx.send(item.clone());
        });
        (id, rx)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking listener runs outside the lock, so poisoning only follows
    // a panic inside this module; the registry data stays consistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
