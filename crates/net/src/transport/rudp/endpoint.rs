use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::{Interval, MissedTickBehavior};

use super::protocol::{MAX_DATAGRAM_SIZE, Segment, SegmentKind};
use super::session::{Session, SessionStats};
use crate::option::RudpConfig;

const DEFAULT_MAX_PEERS: usize = 1024;
const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Unresponsive,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Unresponsive => "stopped acknowledging",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Connected {
        addr: SocketAddr,
        session_id: u32,
    },
    Data {
        addr: SocketAddr,
        payload: Vec<u8>,
    },
    Disconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub session_id: u32,
    pub idle_for: Duration,
    pub stats: SessionStats,
}

#[derive(Debug)]
struct Peer {
    client_salt: u64,
    session: Session,
    last_receive_time: Instant,
}

/// Accepting side of the reliable-UDP transport: one socket, one session per
/// remote address.
pub struct RudpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: RudpConfig,
    peers: HashMap<SocketAddr, Peer>,
    next_session_id: u32,
    max_peers: usize,
    timeout: Duration,
    tick: Interval,
    recv_buffer: Vec<u8>,
    outbox: Vec<(SocketAddr, Segment)>,
    events: Vec<EndpointEvent>,
}

impl RudpEndpoint {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: RudpConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        let mut tick = tokio::time::interval(config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            socket,
            local_addr,
            config,
            peers: HashMap::new(),
            next_session_id: 1,
            max_peers: DEFAULT_MAX_PEERS,
            timeout: DEFAULT_PEER_TIMEOUT,
            tick,
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            outbox: Vec::new(),
            events: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_max_peers(&mut self, max_peers: usize) {
        self.max_peers = max_peers;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(addr, peer)| PeerInfo {
                addr: *addr,
                session_id: peer.session.session_id(),
                idle_for: peer.last_receive_time.elapsed(),
                stats: peer.session.stats().clone(),
            })
            .collect()
    }

    /// Waits for the next datagram or timer tick, then runs handshakes,
    /// retransmissions and acks. Returns what happened since the last call.
    pub async fn poll(&mut self) -> io::Result<Vec<EndpointEvent>> {
        tokio::select! {
            received = self.socket.recv_from(&mut self.recv_buffer) => {
                let (size, addr) = received?;
                self.handle_datagram(size, addr);
                loop {
                    match self.socket.try_recv_from(&mut self.recv_buffer) {
                        Ok((size, addr)) => self.handle_datagram(size, addr),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            _ = self.tick.tick() => {}
        }

        self.cleanup_timed_out();
        self.flush().await?;
        Ok(std::mem::take(&mut self.events))
    }

    /// Queues `data` on the peer's session and transmits what the window
    /// allows. Unknown peers are reported as `NotConnected`.
    pub async fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        let peer = self
            .peers
            .get_mut(&addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown peer"))?;
        peer.session.write(data);
        self.flush().await
    }

    pub async fn disconnect(&mut self, addr: SocketAddr) -> io::Result<()> {
        if let Some(peer) = self.peers.remove(&addr) {
            let bytes = peer
                .session
                .disconnect_segment()
                .serialize()
                .map_err(io::Error::other)?;
            self.socket.send_to(&bytes, addr).await?;
            self.events.push(EndpointEvent::Disconnected {
                addr,
                reason: DisconnectReason::Graceful,
            });
        }
        Ok(())
    }

    fn handle_datagram(&mut self, size: usize, addr: SocketAddr) {
        let segment = match Segment::deserialize(&self.recv_buffer[..size]) {
            Ok(segment) => segment,
            Err(e) => {
                log::debug!("Dropping datagram from {}: {}", addr, e);
                return;
            }
        };
        let now = Instant::now();

        if let SegmentKind::ConnectionRequest { client_salt } = segment.kind {
            self.handle_connection_request(addr, client_salt, now);
            return;
        }

        let Some(peer) = self.peers.get_mut(&addr) else {
            log::debug!("Segment from unknown peer {}", addr);
            return;
        };
        if peer.session.input(segment, now) {
            peer.last_receive_time = now;
        }
        while let Some(payload) = peer.session.read() {
            self.events.push(EndpointEvent::Data { addr, payload });
        }
        if peer.session.is_peer_closed() {
            self.peers.remove(&addr);
            self.events.push(EndpointEvent::Disconnected {
                addr,
                reason: DisconnectReason::Graceful,
            });
        }
    }

    fn handle_connection_request(&mut self, addr: SocketAddr, client_salt: u64, now: Instant) {
        // Retried requests from a known client get the same answer.
        if let Some(peer) = self.peers.get(&addr) {
            if peer.client_salt == client_salt {
                let accepted = SegmentKind::ConnectionAccepted {
                    client_salt,
                    session_id: peer.session.session_id(),
                };
                self.outbox.push((addr, Segment::control(0, accepted)));
                return;
            }
            log::info!("Peer {} reconnected with a new session", addr);
            self.peers.remove(&addr);
        }

        if self.peers.len() >= self.max_peers {
            log::warn!("Rejecting {}: endpoint full ({} peers)", addr, self.max_peers);
            return;
        }

        let session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);

        self.peers.insert(
            addr,
            Peer {
                client_salt,
                session: Session::new(session_id, self.config.clone()),
                last_receive_time: now,
            },
        );
        self.outbox.push((
            addr,
            Segment::control(
                0,
                SegmentKind::ConnectionAccepted {
                    client_salt,
                    session_id,
                },
            ),
        ));
        self.events
            .push(EndpointEvent::Connected { addr, session_id });
        log::info!("Accepted rudp session {} from {}", session_id, addr);
    }

    fn cleanup_timed_out(&mut self) {
        let timeout = self.timeout;
        let timed_out: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_receive_time.elapsed() > timeout)
            .map(|(&addr, _)| addr)
            .collect();

        for addr in timed_out {
            self.peers.remove(&addr);
            self.events.push(EndpointEvent::Disconnected {
                addr,
                reason: DisconnectReason::Timeout,
            });
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        let now = Instant::now();
        let mut unresponsive = Vec::new();

        for (&addr, peer) in self.peers.iter_mut() {
            match peer.session.poll_transmit(now) {
                Ok(segments) => {
                    self.outbox
                        .extend(segments.into_iter().map(|segment| (addr, segment)));
                }
                Err(e) => {
                    log::warn!("Dropping peer {}: {}", addr, e);
                    unresponsive.push(addr);
                }
            }
        }

        for addr in unresponsive {
            self.peers.remove(&addr);
            self.events.push(EndpointEvent::Disconnected {
                addr,
                reason: DisconnectReason::Unresponsive,
            });
        }

        for (addr, segment) in std::mem::take(&mut self.outbox) {
            let bytes = segment.serialize().map_err(io::Error::other)?;
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                log::debug!("Send to {} failed: {}", addr, e);
            }
        }
        Ok(())
    }
}
