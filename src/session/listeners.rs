//! Per-session event listeners.
//!
//! Listeners are keyed by event name (`Page.loadEventFired`,
//! `sessionattached`, ...). Dispatch snapshots the list for a name and
//! calls each listener outside the lock, so a listener may subscribe or
//! unsubscribe while it runs. A panicking listener is logged and does not
//! stop the others.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::dispose::panic_message;
use crate::identifiers::SubscriptionId;
use crate::protocol::Event;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked with each matching event.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

type ListenerMap = FxHashMap<String, Vec<(SubscriptionId, Listener)>>;

// ============================================================================
// ListenerRegistry
// ============================================================================

/// Event name to listeners map of one session.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    map: Arc<RwLock<ListenerMap>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        self.map
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            id,
            event: event.to_string(),
            registry: Arc::downgrade(&self.map),
        }
    }

    /// Returns a stream of every `event` delivered after this call.
    ///
    /// The stream unsubscribes when dropped.
    pub fn subscribe(&self, event: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.on(event, move |event| {
            let _ = tx.send(event.clone());
        });
        EventStream {
            rx,
            subscription: Some(subscription),
        }
    }

    /// Removes one listener. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        remove(&self.map, id)
    }

    /// Calls every listener registered for the event's name.
    ///
    /// Returns the number of listeners called.
    pub fn emit(&self, event: &Event) -> usize {
        let snapshot: Vec<Listener> = match self.map.read().get(&event.method) {
            Some(list) => list.iter().map(|(_, listener)| Arc::clone(listener)).collect(),
            None => return 0,
        };

        for listener in &snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                warn!(
                    event = %event.method,
                    panic = %panic_message(payload.as_ref()),
                    "Event listener panicked"
                );
            }
        }
        snapshot.len()
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Returns the total number of listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.map.read().values().map(Vec::len).sum()
    }

    #[cfg(test)]
    fn listener_count_for(&self, event: &str) -> usize {
        self.map.read().get(event).map_or(0, Vec::len)
    }
}

fn remove(map: &RwLock<ListenerMap>, id: SubscriptionId) -> bool {
    let mut map = map.write();
    let mut removed = false;
    map.retain(|_, list| {
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        removed |= list.len() != before;
        !list.is_empty()
    });
    removed
}

// ============================================================================
// Subscription
// ============================================================================

/// Token for one registered listener.
///
/// Dropping the token keeps the listener; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    event: String,
    registry: Weak<RwLock<ListenerMap>>,
}

impl Subscription {
    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the event name.
    #[inline]
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|map| remove(&map, self.id))
    }
}

// ============================================================================
// EventStream
// ============================================================================

/// Async stream of events of one name.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
    subscription: Option<Subscription>,
}

impl EventStream {
    /// Waits for the next event.
    ///
    /// Returns `None` once the session's listeners were cleared and every
    /// buffered event was taken.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    fn event(method: &str) -> Event {
        Event::new(method, json!({}))
    }

    #[test]
    fn test_emit_calls_matching_listeners() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        registry.on("Page.loadEventFired", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.emit(&event("Page.loadEventFired")), 1);
        assert_eq!(registry.emit(&event("Page.frameNavigated")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.on("Runtime.consoleAPICalled", |_| panic!("listener bug"));
        let counter = Arc::clone(&hits);
        registry.on("Runtime.consoleAPICalled", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.emit(&event("Runtime.consoleAPICalled")), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_off() {
        let registry = ListenerRegistry::new();
        let first = registry.on("A.x", |_| {});
        let second = registry.on("A.x", |_| {});
        assert_eq!(registry.listener_count_for("A.x"), 2);

        assert!(first.unsubscribe());
        assert!(registry.off(second.id()));
        assert!(!registry.off(second.id()));
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_dispatch() {
        let registry = ListenerRegistry::new();
        let inner = registry.clone();
        let slot: Arc<parking_lot::Mutex<Option<SubscriptionId>>> = Arc::default();

        let own = Arc::clone(&slot);
        let subscription = registry.on("A.once", move |_| {
            if let Some(id) = own.lock().take() {
                inner.off(id);
            }
        });
        *slot.lock() = Some(subscription.id());

        assert_eq!(registry.emit(&event("A.once")), 1);
        assert_eq!(registry.emit(&event("A.once")), 0);
    }

    #[tokio::test]
    async fn test_event_stream_receives_and_unsubscribes_on_drop() {
        let registry = ListenerRegistry::new();
        let mut stream = registry.subscribe("Network.requestWillBeSent");

        registry.emit(&event("Network.requestWillBeSent"));
        let received = stream.recv().await.expect("event");
        assert_eq!(received.method, "Network.requestWillBeSent");

        drop(stream);
        assert_eq!(registry.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_ends_streams() {
        let registry = ListenerRegistry::new();
        let mut stream = registry.subscribe("A.x");
        registry.clear();
        assert!(stream.recv().await.is_none());
    }
}
