use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use polynet::{EndpointEvent, RudpEndpoint, TransportKind};

use crate::config::ServerConfig;
use crate::events::ServerEvent;

/// Echoes every byte it receives back to the sender, over any transport.
pub struct EchoServer {
    config: ServerConfig,
    events: UnboundedSender<ServerEvent>,
    stream_peers: Arc<AtomicUsize>,
}

/// Holds one of the `max_peers` stream slots until dropped.
struct PeerSlot(Arc<AtomicUsize>);

impl Drop for PeerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EchoServer {
    pub fn new(config: ServerConfig, events: UnboundedSender<ServerEvent>) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            stream_peers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.emit(ServerEvent::Listening {
            transport: TransportKind::Tcp,
            addr: listener.local_addr()?,
        });
        loop {
            let (stream, addr) = listener.accept().await.context("TCP accept failed")?;
            let Some(slot) = self.acquire_slot() else {
                self.emit(ServerEvent::PeerRejected {
                    transport: TransportKind::Tcp,
                    addr,
                });
                continue;
            };
            let server = self.clone();
            tokio::spawn(async move {
                let _slot = slot;
                server.emit(ServerEvent::PeerConnected {
                    transport: TransportKind::Tcp,
                    addr,
                });
                let outcome = server.echo_tcp(stream).await;
                server.disconnected(TransportKind::Tcp, addr, outcome);
            });
        }
    }

    pub async fn serve_ws(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.emit(ServerEvent::Listening {
            transport: TransportKind::WebSocket,
            addr: listener.local_addr()?,
        });
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .context("WebSocket accept failed")?;
            let Some(slot) = self.acquire_slot() else {
                self.emit(ServerEvent::PeerRejected {
                    transport: TransportKind::WebSocket,
                    addr,
                });
                continue;
            };
            let server = self.clone();
            tokio::spawn(async move {
                let _slot = slot;
                let outcome = server.echo_ws(stream, addr).await;
                server.disconnected(TransportKind::WebSocket, addr, outcome);
            });
        }
    }

    pub async fn serve_rudp(self: Arc<Self>, mut endpoint: RudpEndpoint) -> Result<()> {
        endpoint.set_max_peers(self.config.max_peers);
        endpoint.set_timeout(self.config.peer_timeout);
        self.emit(ServerEvent::Listening {
            transport: TransportKind::Rudp,
            addr: endpoint.local_addr(),
        });

        loop {
            let events = endpoint.poll().await.context("reliable-UDP poll failed")?;
            for event in events {
                match event {
                    EndpointEvent::Connected { addr, .. } => {
                        self.emit(ServerEvent::PeerConnected {
                            transport: TransportKind::Rudp,
                            addr,
                        });
                    }
                    EndpointEvent::Data { addr, payload } => {
                        if let Err(e) = endpoint.send_to(addr, &payload).await {
                            self.emit(ServerEvent::Error {
                                message: format!("Echo to {} failed: {}", addr, e),
                            });
                        }
                    }
                    EndpointEvent::Disconnected { addr, reason } => {
                        self.emit(ServerEvent::PeerDisconnected {
                            transport: TransportKind::Rudp,
                            addr,
                            reason: reason.as_str().to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn echo_tcp(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut buf = vec![0u8; self.config.read_buffer];
        loop {
            let n = time::timeout(self.config.peer_timeout, stream.read(&mut buf))
                .await
                .context("timed out")??;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n]).await?;
        }
    }

    async fn echo_ws(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("upgrade failed")?;
        self.emit(ServerEvent::PeerConnected {
            transport: TransportKind::WebSocket,
            addr,
        });

        loop {
            let next = time::timeout(self.config.peer_timeout, ws.next()).await;
            let msg = match next {
                Ok(Some(msg)) => msg?,
                Ok(None) => return Ok(()),
                Err(_) => {
                    let _ = ws.close(None).await;
                    anyhow::bail!("timed out");
                }
            };
            match msg {
                Message::Binary(_) | Message::Text(_) => ws.send(msg).await?,
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    fn acquire_slot(&self) -> Option<PeerSlot> {
        let max = self.config.max_peers;
        self.stream_peers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |peers| {
                (peers < max).then_some(peers + 1)
            })
            .ok()
            .map(|_| PeerSlot(self.stream_peers.clone()))
    }

    fn disconnected(&self, transport: TransportKind, addr: SocketAddr, outcome: Result<()>) {
        let reason = match outcome {
            Ok(()) => "disconnected".to_string(),
            Err(e) => format!("dropped: {:#}", e),
        };
        self.emit(ServerEvent::PeerDisconnected {
            transport,
            addr,
            reason,
        });
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}
