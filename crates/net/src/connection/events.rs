use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::Connection;
use crate::error::ConnError;
use crate::message::Message;

pub type ConnectedHandler = dyn Fn(&Connection) + Send + Sync;
pub type MessageHandler = dyn Fn(&Connection, &dyn Message) + Send + Sync;
pub type ExceptionHandler = dyn Fn(&Connection, &ConnError) + Send + Sync;
pub type ClosedHandler = dyn Fn(&Connection) + Send + Sync;

/// Handle returned by the `on_*` methods, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscribers<F: ?Sized> {
    entries: Mutex<Vec<(SubscriptionId, Arc<F>)>>,
}

impl<F: ?Sized> Default for Subscribers<F> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Subscribers<F> {
    fn add(&self, id: SubscriptionId, handler: Arc<F>) {
        self.entries.lock().push((id, handler));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Handlers are invoked from a copy so they can subscribe, unsubscribe,
    /// send or close without deadlocking.
    fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct Events {
    next_id: AtomicU64,
    connected: Subscribers<ConnectedHandler>,
    message: Subscribers<MessageHandler>,
    exception: Subscribers<ExceptionHandler>,
    closed: Subscribers<ClosedHandler>,
}

impl Events {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_connected(&self, handler: Arc<ConnectedHandler>) -> SubscriptionId {
        let id = self.next_id();
        self.connected.add(id, handler);
        id
    }

    pub fn add_message(&self, handler: Arc<MessageHandler>) -> SubscriptionId {
        let id = self.next_id();
        self.message.add(id, handler);
        id
    }

    pub fn add_exception(&self, handler: Arc<ExceptionHandler>) -> SubscriptionId {
        let id = self.next_id();
        self.exception.add(id, handler);
        id
    }

    pub fn add_closed(&self, handler: Arc<ClosedHandler>) -> SubscriptionId {
        let id = self.next_id();
        self.closed.add(id, handler);
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.connected.remove(id)
            || self.message.remove(id)
            || self.exception.remove(id)
            || self.closed.remove(id)
    }

    pub fn fire_connected(&self, conn: &Connection) {
        for handler in self.connected.snapshot() {
            guarded(conn, "on_connected", || handler(conn));
        }
    }

    pub fn fire_message(&self, conn: &Connection, msg: &dyn Message) {
        for handler in self.message.snapshot() {
            guarded(conn, "on_message", || handler(conn, msg));
        }
    }

    pub fn fire_exception(&self, conn: &Connection, err: &ConnError) {
        for handler in self.exception.snapshot() {
            guarded(conn, "on_exception", || handler(conn, err));
        }
    }

    pub fn fire_closed(&self, conn: &Connection) {
        for handler in self.closed.snapshot() {
            guarded(conn, "on_closed", || handler(conn));
        }
    }
}

fn guarded(conn: &Connection, hook: &str, call: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(call)) {
        log::error!(
            "connection {} {} handler panicked: {}",
            conn.id(),
            hook,
            panic_message(payload.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = catch_unwind(|| -> u32 { panic!("boom") }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = catch_unwind(|| -> u32 { panic!("code {}", 7) }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn test_subscribers_remove() {
        let subscribers: Subscribers<dyn Fn() + Send + Sync> = Subscribers::default();
        subscribers.add(SubscriptionId(1), Arc::new(|| {}));
        subscribers.add(SubscriptionId(2), Arc::new(|| {}));

        assert!(subscribers.remove(SubscriptionId(1)));
        assert!(!subscribers.remove(SubscriptionId(1)));
        assert_eq!(subscribers.snapshot().len(), 1);
    }
}
