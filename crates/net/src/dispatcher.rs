//! Routes decoded messages to handlers by message id.
//!
//! One dispatcher is normally built at startup, wrapped in an `Arc` and
//! handed to every connection's `on_message` hook:
//!
//! ```ignore
//! let dispatcher = Arc::new(MsgDispatcher::new());
//! let on_hello = MsgReceiver::new(|hello: &Hello| {
//!     log::info!("hello from {}", hello.name);
//!     Ok(())
//! });
//! dispatcher.register(&on_hello);
//!
//! let routes = dispatcher.clone();
//! conn.on_message(move |_, msg| {
//!     routes.dispatch(msg);
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::panic_message;
use crate::error::DispatchError;
use crate::message::{Message, MessageType, MsgId};

type TypedHandler<T> = dyn Fn(&T) -> anyhow::Result<()> + Send + Sync;
type ErasedHandler = dyn Fn(&dyn Message) -> anyhow::Result<()> + Send + Sync;
type DiagnosticHook = dyn Fn(&Diagnostic) + Send + Sync;

/// A typed handler. Registration identity is the handler allocation, so
/// clones of one receiver count as the same registration.
pub struct MsgReceiver<T> {
    handler: Arc<TypedHandler<T>>,
}

impl<T: MessageType> MsgReceiver<T> {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.handler) as *const () as usize
    }
}

impl<T> Clone for MsgReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<T: MessageType> fmt::Debug for MsgReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgReceiver")
            .field("msg", &T::NAME)
            .finish_non_exhaustive()
    }
}

/// Reported to the diagnostic hook instead of being raised to the caller.
#[derive(Debug)]
pub enum Diagnostic {
    Unhandled { id: MsgId, name: &'static str },
    HandlerFailed(DispatchError),
}

struct Entry {
    key: usize,
    call: Arc<ErasedHandler>,
}

#[derive(Default)]
pub struct MsgDispatcher {
    handlers: RwLock<HashMap<MsgId, Vec<Entry>>>,
    diagnostics: RwLock<Option<Arc<DiagnosticHook>>>,
}

impl MsgDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `receiver` to the handlers for `T`. Returns false, leaving the
    /// order unchanged, if it is already registered.
    pub fn register<T: MessageType>(&self, receiver: &MsgReceiver<T>) -> bool {
        let key = receiver.key();
        let mut handlers = self.handlers.write();
        let entries = handlers.entry(T::ID).or_default();
        if entries.iter().any(|entry| entry.key == key) {
            return false;
        }

        let handler = receiver.handler.clone();
        let call: Arc<ErasedHandler> = Arc::new(move |msg: &dyn Message| {
            let typed = msg.as_any().downcast_ref::<T>().ok_or_else(|| {
                anyhow::anyhow!(
                    "id {} is registered for {} but carried {}",
                    T::ID,
                    T::NAME,
                    msg.msg_name()
                )
            })?;
            handler(typed)
        });
        entries.push(Entry { key, call });
        log::debug!("Registered handler for {} (id {})", T::NAME, T::ID);
        true
    }

    pub fn unregister<T: MessageType>(&self, receiver: &MsgReceiver<T>) -> bool {
        let key = receiver.key();
        let mut handlers = self.handlers.write();
        let Some(entries) = handlers.get_mut(&T::ID) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.key != key);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(&T::ID);
        }
        removed
    }

    /// Invokes every handler registered for the message's id, in
    /// registration order, on the calling thread. Returns how many completed
    /// without error.
    pub fn dispatch(&self, msg: &dyn Message) -> usize {
        let id = msg.msg_id();
        let name = msg.msg_name();
        let calls: Vec<Arc<ErasedHandler>> = match self.handlers.read().get(&id) {
            Some(entries) => entries.iter().map(|entry| entry.call.clone()).collect(),
            None => Vec::new(),
        };

        if calls.is_empty() {
            log::debug!("No handler for {} (id {})", name, id);
            self.report(Diagnostic::Unhandled { id, name });
            return 0;
        }

        let mut completed = 0;
        for call in calls {
            let failure = match catch_unwind(AssertUnwindSafe(|| call(msg))) {
                Ok(Ok(())) => {
                    completed += 1;
                    continue;
                }
                Ok(Err(source)) => DispatchError::Handler { id, name, source },
                Err(payload) => DispatchError::Panicked {
                    id,
                    name,
                    message: panic_message(payload.as_ref()),
                },
            };
            log::warn!("{}", failure);
            self.report(Diagnostic::HandlerFailed(failure));
        }
        completed
    }

    pub fn set_diagnostic_hook<F>(&self, hook: F)
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        *self.diagnostics.write() = Some(Arc::new(hook));
    }

    pub fn handler_count<T: MessageType>(&self) -> usize {
        self.handlers.read().get(&T::ID).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    fn report(&self, diagnostic: Diagnostic) {
        let hook = self.diagnostics.read().clone();
        if let Some(hook) = hook {
            hook(&diagnostic);
        }
    }
}

impl fmt::Debug for MsgDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("MsgDispatcher")
            .field("types", &handlers.len())
            .field("handlers", &handlers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
