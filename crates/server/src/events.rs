use std::net::SocketAddr;

use polynet::TransportKind;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening {
        transport: TransportKind,
        addr: SocketAddr,
    },
    PeerConnected {
        transport: TransportKind,
        addr: SocketAddr,
    },
    PeerDisconnected {
        transport: TransportKind,
        addr: SocketAddr,
        reason: String,
    },
    PeerRejected {
        transport: TransportKind,
        addr: SocketAddr,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn log(&self) {
        match self {
            ServerEvent::Listening { transport, addr } => {
                log::info!("Echoing {} on {}", transport, addr);
            }
            ServerEvent::PeerConnected { transport, addr } => {
                log::info!("{} peer {} connected", transport, addr);
            }
            ServerEvent::PeerDisconnected {
                transport,
                addr,
                reason,
            } => {
                log::info!("{} peer {} {}", transport, addr, reason);
            }
            ServerEvent::PeerRejected { transport, addr } => {
                log::warn!("{} peer {} rejected: server full", transport, addr);
            }
            ServerEvent::Error { message } => log::error!("{}", message),
        }
    }
}
