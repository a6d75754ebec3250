//! Listener tables for inbound frames and connection state changes.
//!
//! Handlers run synchronously on the connection driver, one after another in
//! registration order. A panicking handler is caught and logged so it cannot
//! suppress delivery to the others.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::{Value, json};

use super::codec::Frame;
use super::connection::ConnectionState;

/// Reserved message type whose handlers observe every inbound frame.
///
/// Wildcard handlers receive the whole `{"type", "data"}` envelope rather
/// than just the payload.
pub const WILDCARD: &str = "*";

/// A frame handler with reference identity.
///
/// Clones share identity, so the same `Handler` registered twice for a type
/// is stored once and can later be removed with any of its clones.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(&Value) + Send + Sync>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, value: &Value) {
        (self.0)(value);
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Maps message types to their handlers.
#[derive(Default)]
pub struct Dispatcher {
    // Lock recovery on poison is fine: every write leaves the map consistent.
    listeners: RwLock<HashMap<String, Vec<Handler>>>,
}

impl Dispatcher {
    /// Register `handler` for `frame_type`. Returns `false` if it was already
    /// registered for that type.
    pub fn on(&self, frame_type: &str, handler: Handler) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let handlers = listeners.entry(frame_type.to_owned()).or_default();

        if handlers.contains(&handler) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Remove `handler` from `frame_type`. Returns `false` if it was not registered.
    pub fn off(&self, frame_type: &str, handler: &Handler) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = listeners.get_mut(frame_type) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|h| h != handler);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(frame_type);
        }
        removed
    }

    #[must_use]
    pub fn listener_count(&self, frame_type: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(frame_type)
            .map_or(0, Vec::len)
    }

    /// Deliver `frame` to the handlers of its type, then to the wildcard handlers.
    pub fn dispatch(&self, frame: &Frame) {
        // Snapshot so handlers may call `on`/`off` without deadlocking.
        let (typed, wildcard) = {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            (
                listeners.get(&frame.frame_type).cloned().unwrap_or_default(),
                listeners.get(WILDCARD).cloned().unwrap_or_default(),
            )
        };

        for handler in &typed {
            invoke(&frame.frame_type, handler, &frame.data);
        }

        if !wildcard.is_empty() {
            let envelope = json!({ "type": frame.frame_type, "data": frame.data });
            for handler in &wildcard {
                invoke(WILDCARD, handler, &envelope);
            }
        }
    }
}

fn invoke(frame_type: &str, handler: &Handler, value: &Value) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.call(value))) {
        tracing::warn!(
            frame_type,
            panic = panic_message(panic.as_ref()),
            "Frame handler panicked"
        );
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

type StateFn = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Synchronous observers of connection state transitions.
#[derive(Default)]
pub(crate) struct StateListeners {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, StateFn)>>,
}

impl StateListeners {
    pub(crate) fn add<F>(&self, f: F) -> u64
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(f)));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub(crate) fn notify(&self, state: ConnectionState) {
        let snapshot: Vec<StateFn> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();

        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(state))) {
                tracing::warn!(
                    %state,
                    panic = panic_message(panic.as_ref()),
                    "State listener panicked"
                );
            }
        }
    }
}

/// Registration handle returned by [`crate::Client::on_state_change`].
///
/// Dropping the handle keeps the listener registered; call
/// [`StateListener::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe the listener"]
#[derive(Debug)]
pub struct StateListener {
    id: u64,
    registry: Weak<StateListeners>,
}

impl StateListener {
    pub(crate) fn new(id: u64, registry: &Arc<StateListeners>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

impl fmt::Debug for StateListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("StateListeners").field("count", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = Handler::new(move |value| sink.lock().unwrap().push(value.clone()));
        (seen, handler)
    }

    fn progress_frame() -> Frame {
        Frame::builder()
            .frame_type("progress_update")
            .data(json!({"current_quantity": 7}))
            .build()
    }

    #[test]
    fn same_handler_twice_is_delivered_once() {
        let dispatcher = Dispatcher::default();
        let (seen, handler) = recorder();

        assert!(dispatcher.on("progress_update", handler.clone()));
        assert!(!dispatcher.on("progress_update", handler));
        dispatcher.dispatch(&progress_frame());

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn typed_handlers_get_payload_and_wildcard_gets_envelope() {
        let dispatcher = Dispatcher::default();
        let (typed_seen, typed) = recorder();
        let (wild_seen, wild) = recorder();
        dispatcher.on("progress_update", typed);
        dispatcher.on(WILDCARD, wild);

        dispatcher.dispatch(&progress_frame());

        assert_eq!(*typed_seen.lock().unwrap(), vec![json!({"current_quantity": 7})]);
        assert_eq!(
            *wild_seen.lock().unwrap(),
            vec![json!({"type": "progress_update", "data": {"current_quantity": 7}})]
        );
    }

    #[test]
    fn other_types_are_not_delivered() {
        let dispatcher = Dispatcher::default();
        let (seen, handler) = recorder();
        dispatcher.on("status_change", handler);

        dispatcher.dispatch(&progress_frame());

        assert!(seen.lock().unwrap().is_empty(), "no delivery across types");
    }

    #[test]
    fn off_removes_by_identity() {
        let dispatcher = Dispatcher::default();
        let (seen, handler) = recorder();
        let (_, stranger) = recorder();
        dispatcher.on("progress_update", handler.clone());

        assert!(!dispatcher.off("progress_update", &stranger));
        assert!(dispatcher.off("progress_update", &handler));
        assert!(!dispatcher.off("progress_update", &handler));
        dispatcher.dispatch(&progress_frame());

        assert!(seen.lock().unwrap().is_empty(), "removed handler must not fire");
        assert_eq!(dispatcher.listener_count("progress_update"), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let dispatcher = Dispatcher::default();
        let (typed_seen, typed) = recorder();
        let (wild_seen, wild) = recorder();
        dispatcher.on("progress_update", Handler::new(|_| panic!("broken consumer")));
        dispatcher.on("progress_update", typed);
        dispatcher.on(WILDCARD, Handler::new(|_| panic!("broken observer")));
        dispatcher.on(WILDCARD, wild);

        dispatcher.dispatch(&progress_frame());

        assert_eq!(typed_seen.lock().unwrap().len(), 1);
        assert_eq!(wild_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn handler_may_unregister_itself_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::default());
        let calls = Arc::new(AtomicU64::new(0));

        let slot: Arc<Mutex<Option<Handler>>> = Arc::new(Mutex::new(None));
        let handler = {
            let dispatcher = Arc::clone(&dispatcher);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            Handler::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().unwrap().take() {
                    dispatcher.off("progress_update", &me);
                }
            })
        };
        *slot.lock().unwrap() = Some(handler.clone());
        dispatcher.on("progress_update", handler);

        dispatcher.dispatch(&progress_frame());
        dispatcher.dispatch(&progress_frame());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_listeners_run_in_registration_order() {
        let listeners = Arc::new(StateListeners::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            listeners.add(move |state| order.lock().unwrap().push((tag, state)));
        }
        listeners.notify(ConnectionState::Connecting);

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                ("first", ConnectionState::Connecting),
                ("second", ConnectionState::Connecting)
            ]
        );
    }

    #[test]
    fn unsubscribed_state_listener_stops_receiving() {
        let listeners = Arc::new(StateListeners::default());
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let handle = StateListener::new(
            listeners.add(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            &listeners,
        );

        listeners.add(|_| panic!("listener bug"));
        listeners.notify(ConnectionState::Connected);
        assert!(handle.unsubscribe());
        listeners.notify(ConnectionState::Disconnected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
