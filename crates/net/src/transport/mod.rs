mod rudp;
mod tcp;
mod ws;

use std::fmt;
use std::future::Future;
use std::io;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::ConnError;
use crate::option::ConnOption;

pub use rudp::{
    DisconnectReason, EndpointEvent, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE, PeerInfo, RudpEndpoint,
    RudpError, RudpTransport, Segment, SegmentHeader, SegmentKind, Session, SessionStats,
    sequence_greater_than,
};
pub use tcp::TcpTransport;
pub use ws::WsTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    WebSocket,
    Rudp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "ws",
            TransportKind::Rudp => "rudp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "ws" | "websocket" => Ok(TransportKind::WebSocket),
            "rudp" | "kcp" | "udp" => Ok(TransportKind::Rudp),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Byte-level I/O engine underneath a connection.
///
/// A transport is owned by exactly one connection task. `recv` must be cancel
/// safe: the task races it against outbound frames and timers, and drops the
/// future whenever another branch wins.
pub trait Transport: Sized + Send + 'static {
    const KIND: TransportKind;

    /// Performs the transport-level handshake. The caller bounds it with the
    /// connect timeout.
    fn open(option: &ConnOption) -> impl Future<Output = Result<Self, ConnError>> + Send;

    fn send(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Next inbound chunk, or `None` once the peer has closed.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}
