use std::io;
use std::time::Duration;

use crate::connection::ConnState;
use crate::message::MsgId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("no message registered under id {0}")]
    UnknownMessage(MsgId),
    #[error("message id {id} already registered for {existing}")]
    DuplicateId { id: MsgId, existing: &'static str },
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("encode failed: {0}")]
    Encode(#[source] CodecError),
    #[error("decode failed: {0}")]
    Decode(#[source] CodecError),
    #[error("no activity for {0:?}")]
    IdleTimeout(Duration),
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("send queue exceeded {limit} frames")]
    QueueFull { limit: usize },
    #[error("operation not valid in state {0:?}")]
    InvalidState(ConnState),
    #[error("connection is not connected (state {0:?})")]
    NotConnected(ConnState),
    #[error("no tokio runtime available to drive the connection")]
    NoRuntime,
    #[error("connection driver panicked: {0}")]
    Panicked(String),
}

impl ConnError {
    /// Fatal errors force the connection towards Closed; encode failures
    /// only drop the offending message.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConnError::Encode(_) | ConnError::InvalidState(_) | ConnError::NotConnected(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handler for {name} (id {id}) failed: {source}")]
    Handler {
        id: MsgId,
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler for {name} (id {id}) panicked: {message}")]
    Panicked {
        id: MsgId,
        name: &'static str,
        message: String,
    },
}
