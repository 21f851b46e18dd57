use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{Interval, MissedTickBehavior};

use super::protocol::{MAX_DATAGRAM_SIZE, Segment, SegmentKind};
use super::session::{Session, SessionStats};
use crate::error::ConnError;
use crate::option::{ConnOption, RudpConfig};
use crate::transport::{Transport, TransportKind};

/// Reliable-UDP session over a connected socket.
pub struct RudpTransport {
    socket: UdpSocket,
    session: Session,
    tick: Interval,
    recv_buffer: Vec<u8>,
}

impl RudpTransport {
    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    async fn flush(&mut self) -> io::Result<()> {
        let segments = self
            .session
            .poll_transmit(Instant::now())
            .map_err(io::Error::other)?;
        for segment in segments {
            let bytes = segment.serialize().map_err(io::Error::other)?;
            self.socket.send(&bytes).await?;
        }
        Ok(())
    }
}

async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))
}

/// Repeats the connection request until the endpoint accepts it. The caller
/// bounds the whole exchange with the connect timeout.
async fn handshake(socket: &UdpSocket, config: &RudpConfig) -> io::Result<u32> {
    let client_salt = rand::random::<u64>();
    let request = Segment::control(0, SegmentKind::ConnectionRequest { client_salt })
        .serialize()
        .map_err(io::Error::other)?;

    let mut retry = tokio::time::interval(config.handshake_retry());
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = retry.tick() => {
                socket.send(&request).await?;
            }
            received = socket.recv(&mut buf) => {
                let size = received?;
                match Segment::deserialize(&buf[..size]) {
                    Ok(Segment {
                        kind: SegmentKind::ConnectionAccepted { client_salt: salt, session_id },
                        ..
                    }) if salt == client_salt => return Ok(session_id),
                    Ok(other) => log::debug!("Ignoring {:?} during handshake", other.kind),
                    Err(e) => log::debug!("Ignoring datagram during handshake: {}", e),
                }
            }
        }
    }
}

impl Transport for RudpTransport {
    const KIND: TransportKind = TransportKind::Rudp;

    async fn open(option: &ConnOption) -> Result<Self, ConnError> {
        let addr = option.addr();
        let connect_err = |source: io::Error| ConnError::Connect {
            addr: addr.clone(),
            source,
        };

        let remote = resolve(&addr).await.map_err(connect_err)?;
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await.map_err(connect_err)?;
        socket.connect(remote).await.map_err(connect_err)?;

        let session_id = handshake(&socket, &option.rudp)
            .await
            .map_err(connect_err)?;
        log::debug!("rudp session {} established with {}", session_id, remote);

        let mut tick = tokio::time::interval(option.rudp.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            socket,
            session: Session::new(session_id, option.rudp.clone()),
            tick,
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.session.write(&frame);
        self.flush().await
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(payload) = self.session.read() {
                return Ok(Some(Bytes::from(payload)));
            }
            if self.session.is_peer_closed() {
                return Ok(None);
            }

            tokio::select! {
                received = self.socket.recv(&mut self.recv_buffer) => {
                    let size = received?;
                    match Segment::deserialize(&self.recv_buffer[..size]) {
                        Ok(segment) => {
                            self.session.input(segment, Instant::now());
                        }
                        Err(e) => log::debug!("Dropping malformed segment: {}", e),
                    }
                }
                _ = self.tick.tick() => {}
            }

            self.flush().await?;
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.session.is_peer_closed() {
            return Ok(());
        }
        let bytes = self
            .session
            .disconnect_segment()
            .serialize()
            .map_err(io::Error::other)?;
        // Best effort: the endpoint also expires silent peers.
        for _ in 0..2 {
            self.socket.send(&bytes).await?;
        }
        Ok(())
    }
}
