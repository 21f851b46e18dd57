use std::future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant};

use super::{Command, ConnState, Connection, panic_message};
use crate::codec::Codec;
use crate::error::{CodecError, ConnError};
use crate::option::ConnOption;
use crate::transport::Transport;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

enum Exit {
    Cancelled,
    Failed(ConnError),
    Idle(ConnError),
}

/// Owns the transport for the whole life of a connection. A panic anywhere
/// below (a user codec, a transport) is reported and still ends in Closed.
pub(super) async fn run<T: Transport>(conn: Connection, commands: UnboundedReceiver<Command>) {
    let driven = AssertUnwindSafe(drive::<T>(conn.clone(), commands))
        .catch_unwind()
        .await;
    if let Err(payload) = driven {
        let err = ConnError::Panicked(panic_message(payload.as_ref()));
        log::error!("connection {} failed: {}", conn.id(), err);
        conn.shared.events.fire_exception(&conn, &err);
        conn.transition(
            &[ConnState::Connecting, ConnState::Connected, ConnState::Faulted],
            ConnState::Closing,
        );
        finish(&conn);
    }
}

async fn drive<T: Transport>(conn: Connection, mut commands: UnboundedReceiver<Command>) {
    let cancel = conn.shared.cancel.clone();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = open::<T>(conn.option()) => Some(result),
    };

    let mut transport = match opened {
        None => {
            finish(&conn);
            return;
        }
        Some(Err(err)) => {
            if cancel.is_cancelled() {
                finish(&conn);
                return;
            }
            log::warn!("connection {} failed to connect: {}", conn.id(), err);
            conn.shared.events.fire_exception(&conn, &err);
            fault_during_connect(&conn);
            return;
        }
        Some(Ok(transport)) => transport,
    };

    if !conn.transition(&[ConnState::Connecting], ConnState::Connected) {
        shutdown(&conn, &mut transport).await;
        finish(&conn);
        return;
    }
    log::info!(
        "connection {} connected to {} over {}",
        conn.id(),
        conn.option().addr(),
        T::KIND
    );
    conn.shared.events.fire_connected(&conn);

    let exit = pump(&conn, &mut transport, &mut commands).await;
    match exit {
        Exit::Cancelled => {}
        Exit::Failed(err) => {
            if !cancel.is_cancelled() {
                log::warn!("connection {} failed: {}", conn.id(), err);
                conn.shared.events.fire_exception(&conn, &err);
                conn.transition(&[ConnState::Connected], ConnState::Faulted);
            }
        }
        Exit::Idle(err) => {
            if !cancel.is_cancelled() {
                log::info!("connection {} idle: {}", conn.id(), err);
                conn.shared.events.fire_exception(&conn, &err);
            }
        }
    }

    conn.transition(&[ConnState::Connected, ConnState::Faulted], ConnState::Closing);
    shutdown(&conn, &mut transport).await;
    finish(&conn);
}

async fn open<T: Transport>(option: &ConnOption) -> Result<T, ConnError> {
    if option.connect_timeout.is_zero() {
        return T::open(option).await;
    }
    match time::timeout(option.connect_timeout, T::open(option)).await {
        Ok(result) => result,
        Err(_) => Err(ConnError::ConnectTimeout {
            addr: option.addr(),
            timeout: option.connect_timeout,
        }),
    }
}

async fn pump<T: Transport>(
    conn: &Connection,
    transport: &mut T,
    commands: &mut UnboundedReceiver<Command>,
) -> Exit {
    let cancel = &conn.shared.cancel;
    let idle_timeout = conn.option().timeout;
    let codec = conn.codec();
    let mut buffer = BytesMut::new();
    let mut last_activity = Instant::now();

    loop {
        let deadline = idle_deadline(last_activity, idle_timeout);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Exit::Cancelled,
            _ = conn.shared.overflow.notified() => return overflowed(conn),
            Some(command) = commands.recv() => match command {
                Command::Send(frame) => {
                    conn.shared.stats.dequeue();
                    let len = frame.len();
                    // Overflow and idle still apply while a stalled peer
                    // blocks the write.
                    let written = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Exit::Cancelled,
                        _ = conn.shared.overflow.notified() => return overflowed(conn),
                        written = transport.send(frame) => written,
                        _ = expired(deadline) => {
                            return Exit::Idle(ConnError::IdleTimeout(idle_timeout));
                        }
                    };
                    if let Err(e) = written {
                        return Exit::Failed(ConnError::Transport(e));
                    }
                    conn.shared.stats.record_sent(len);
                    last_activity = Instant::now();
                }
                Command::EncodeFailed(err) => {
                    conn.shared.events.fire_exception(conn, &ConnError::Encode(err));
                }
            },
            received = transport.recv() => match received {
                Ok(Some(chunk)) => {
                    last_activity = Instant::now();
                    conn.shared.stats.record_chunk(chunk.len());
                    buffer.extend_from_slice(&chunk);
                    if let Err(err) = decode_buffered(conn, codec, &mut buffer) {
                        return Exit::Failed(err);
                    }
                }
                Ok(None) => return Exit::Failed(ConnError::PeerClosed),
                Err(e) => return Exit::Failed(ConnError::Transport(e)),
            },
            _ = expired(deadline) => {
                return Exit::Idle(ConnError::IdleTimeout(idle_timeout));
            }
        }
    }
}

fn overflowed(conn: &Connection) -> Exit {
    Exit::Failed(ConnError::QueueFull {
        limit: conn.option().send_queue_limit,
    })
}

/// `None` when the idle timeout is disabled or too far out to represent.
fn idle_deadline(last_activity: Instant, idle_timeout: Duration) -> Option<Instant> {
    if idle_timeout.is_zero() {
        return None;
    }
    last_activity.checked_add(idle_timeout)
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Decodes every complete message in `buffer`, firing `on_message` for each
/// before looking at the next.
fn decode_buffered(
    conn: &Connection,
    codec: &dyn Codec,
    buffer: &mut BytesMut,
) -> Result<(), ConnError> {
    while !buffer.is_empty() && conn.state() == ConnState::Connected {
        let Some((msg, consumed)) = codec.decode(&buffer[..]).map_err(ConnError::Decode)? else {
            break;
        };
        if consumed == 0 || consumed > buffer.len() {
            return Err(ConnError::Decode(CodecError::Malformed(format!(
                "codec consumed {} of {} buffered bytes",
                consumed,
                buffer.len()
            ))));
        }
        buffer.advance(consumed);
        conn.shared.stats.record_message();
        conn.shared.events.fire_message(conn, msg.as_ref());
    }
    Ok(())
}

async fn shutdown<T: Transport>(conn: &Connection, transport: &mut T) {
    match time::timeout(CLOSE_TIMEOUT, transport.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("connection {} shutdown: {}", conn.id(), e),
        Err(_) => log::debug!("connection {} shutdown timed out", conn.id()),
    }
}

fn finish(conn: &Connection) {
    conn.shared.state.send_modify(|state| {
        conn.shared.driver_running.store(false, Ordering::SeqCst);
        *state = ConnState::Closed;
    });
    log::info!("connection {} closed", conn.id());
    conn.shared.events.fire_closed(conn);
}

/// Settles on Faulted unless `close` raced the failed handshake, in which
/// case the connection is already on its way to Closed.
fn fault_during_connect(conn: &Connection) {
    let cancel = &conn.shared.cancel;
    conn.shared.state.send_modify(|state| {
        conn.shared.driver_running.store(false, Ordering::SeqCst);
        *state = if cancel.is_cancelled() {
            ConnState::Closed
        } else {
            ConnState::Faulted
        };
    });
}
