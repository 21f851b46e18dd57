pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod option;
pub mod transport;

pub use codec::{BinaryCodec, Codec, JsonCodec, MAX_FRAME_SIZE};
pub use connection::{ConnState, ConnStats, Connection, SubscriptionId};
pub use dispatcher::{Diagnostic, MsgDispatcher, MsgReceiver};
pub use error::{CodecError, ConnError, DispatchError};
pub use message::{Message, MessageType, MsgId};
pub use option::{
    ConnOption, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SEND_QUEUE_LIMIT,
    DEFAULT_TIMEOUT, MIN_RUDP_INTERVAL, RudpConfig,
};
pub use transport::{
    DisconnectReason, EndpointEvent, PeerInfo, RudpEndpoint, RudpError, Transport, TransportKind,
};
