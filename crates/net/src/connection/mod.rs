//! Transport-agnostic connection with lifecycle events.
//!
//! A [`Connection`] is a cheap handle; the transport itself lives in a driver
//! task spawned by [`Connection::connect`]. Callers only ever `connect`,
//! `send` and `close`; everything else arrives through the hooks, invoked on
//! the driver task in the order it happened.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Closing -> Closed
//!            |              |           ^
//!            v              v           |
//!         Faulted        Faulted -------+
//! ```

mod driver;
mod events;
mod stats;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::error::{CodecError, ConnError};
use crate::message::Message;
use crate::option::ConnOption;
use crate::transport::{RudpTransport, TcpTransport, TransportKind, WsTransport};

pub use events::{
    ClosedHandler, ConnectedHandler, ExceptionHandler, MessageHandler, SubscriptionId,
};
pub(crate) use events::panic_message;
pub use stats::ConnStats;

use events::Events;
use stats::StatsCounter;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Faulted,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Idle => "idle",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
            ConnState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum Command {
    Send(Bytes),
    EncodeFailed(CodecError),
}

struct Shared {
    id: u64,
    kind: TransportKind,
    option: ConnOption,
    state: watch::Sender<ConnState>,
    commands: mpsc::UnboundedSender<Command>,
    pending_commands: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    overflow: Notify,
    driver_running: AtomicBool,
    cancel: CancellationToken,
    events: Events,
    stats: StatsCounter,
}

/// Handle to one connection. Clones share the same connection; dropping every
/// handle does not close it, call [`Connection::close`].
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(kind: TransportKind, option: ConnOption) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnState::Idle);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                option,
                state,
                commands,
                pending_commands: parking_lot::Mutex::new(Some(pending)),
                overflow: Notify::new(),
                driver_running: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                events: Events::default(),
                stats: StatsCounter::default(),
            }),
        }
    }

    pub fn tcp(option: ConnOption) -> Self {
        Self::new(TransportKind::Tcp, option)
    }

    pub fn ws(option: ConnOption) -> Self {
        Self::new(TransportKind::WebSocket, option)
    }

    pub fn rudp(option: ConnOption) -> Self {
        Self::new(TransportKind::Rudp, option)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    pub fn option(&self) -> &ConnOption {
        &self.shared.option
    }

    pub fn state(&self) -> ConnState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> ConnStats {
        self.shared.stats.snapshot()
    }

    /// Resolves with the first state, current or future, that satisfies
    /// `pred`.
    pub async fn wait_for_state(&self, mut pred: impl FnMut(ConnState) -> bool) -> ConnState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub fn on_connected<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared.events.add_connected(Arc::new(handler))
    }

    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection, &dyn Message) + Send + Sync + 'static,
    {
        self.shared.events.add_message(Arc::new(handler))
    }

    pub fn on_exception<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection, &ConnError) + Send + Sync + 'static,
    {
        self.shared.events.add_exception(Arc::new(handler))
    }

    pub fn on_closed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared.events.add_closed(Arc::new(handler))
    }

    /// Removes a handler added by any of the `on_*` methods. Returns false if
    /// it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.remove(id)
    }

    /// Starts the handshake in the background. Completion is reported through
    /// `on_connected` or `on_exception`.
    pub fn connect(&self) -> Result<(), ConnError> {
        let runtime = Handle::try_current().map_err(|_| ConnError::NoRuntime)?;

        let mut previous = ConnState::Idle;
        let started = self.shared.state.send_if_modified(|state| {
            previous = *state;
            if *state == ConnState::Idle {
                *state = ConnState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ConnError::InvalidState(previous));
        }

        let commands = self
            .shared
            .pending_commands
            .lock()
            .take()
            .ok_or(ConnError::InvalidState(ConnState::Connecting))?;

        log::debug!(
            "connection {} connecting to {} over {}",
            self.id(),
            self.shared.option.addr(),
            self.kind()
        );

        self.shared.driver_running.store(true, Ordering::SeqCst);
        let conn = self.clone();
        match self.kind() {
            TransportKind::Tcp => {
                runtime.spawn(driver::run::<TcpTransport>(conn, commands));
            }
            TransportKind::WebSocket => {
                runtime.spawn(driver::run::<WsTransport>(conn, commands));
            }
            TransportKind::Rudp => {
                runtime.spawn(driver::run::<RudpTransport>(conn, commands));
            }
        }
        Ok(())
    }

    /// Encodes `msg` on the caller and queues the frame for the driver.
    ///
    /// Never waits on the network. Encode failures are reported both here and
    /// through `on_exception`, and leave the connection open. Exceeding
    /// `send_queue_limit` reports `QueueFull` and closes the connection.
    pub fn send(&self, msg: &dyn Message) -> Result<(), ConnError> {
        let state = self.state();
        if state != ConnState::Connected {
            return Err(ConnError::NotConnected(state));
        }

        let frame = match self.shared.option.codec.encode(msg) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!(
                    "connection {} dropped {} (id {}): {}",
                    self.id(),
                    msg.msg_name(),
                    msg.msg_id(),
                    err
                );
                self.shared.stats.record_encode_failure();
                let _ = self
                    .shared
                    .commands
                    .send(Command::EncodeFailed(err.clone()));
                return Err(ConnError::Encode(err));
            }
        };

        let limit = self.shared.option.send_queue_limit;
        if !self.shared.stats.try_enqueue(limit) {
            self.shared.overflow.notify_one();
            return Err(ConnError::QueueFull { limit });
        }

        if self
            .shared
            .commands
            .send(Command::Send(Bytes::from(frame)))
            .is_err()
        {
            self.shared.stats.dequeue();
            return Err(ConnError::NotConnected(self.state()));
        }
        Ok(())
    }

    /// Shuts the connection down, discarding frames not yet written. Safe to
    /// call from any state and any number of times.
    pub fn close(&self) {
        // Cancel first: a driver that fails its handshake concurrently checks
        // the token under the state lock before settling on Faulted.
        self.shared.cancel.cancel();

        let mut previous = ConnState::Closed;
        self.shared.state.send_if_modified(|state| {
            previous = *state;
            let driver_running = self.shared.driver_running.load(Ordering::SeqCst);
            match *state {
                ConnState::Idle => *state = ConnState::Closed,
                ConnState::Faulted if !driver_running => *state = ConnState::Closed,
                ConnState::Connecting | ConnState::Connected => *state = ConnState::Closing,
                ConnState::Faulted | ConnState::Closing | ConnState::Closed => return false,
            }
            true
        });
        if previous != ConnState::Closed {
            log::debug!("connection {} closing from {}", self.id(), previous);
        }
    }

    fn codec(&self) -> &dyn Codec {
        self.shared.option.codec.as_ref()
    }

    /// Moves to `to` if the current state is one of `from`.
    fn transition(&self, from: &[ConnState], to: ConnState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("addr", &self.shared.option.addr())
            .finish()
    }
}
