//! Reliable, ordered byte stream over UDP.
//!
//! ```text
//! client.rs    RudpTransport   connected socket + one Session
//! endpoint.rs  RudpEndpoint    listening socket + Session per peer
//! session.rs   Session         sans-IO ARQ: windowing, retransmit, reorder
//! tracking.rs                  ack / RTT bookkeeping
//! protocol.rs                  rkyv segments
//! ```

mod client;
mod endpoint;
mod protocol;
mod session;
mod tracking;

pub use client::RudpTransport;
pub use endpoint::{DisconnectReason, EndpointEvent, PeerInfo, RudpEndpoint};
pub use protocol::{
    MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE, RudpError, Segment, SegmentHeader, SegmentKind,
    sequence_greater_than,
};
pub use session::{Session, SessionStats};
