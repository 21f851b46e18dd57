mod binary;
mod frame;
mod json;
mod table;

pub use binary::BinaryCodec;
pub use frame::{MAX_FRAME_SIZE, encode_frame, split_frame};
pub use json::JsonCodec;

use crate::error::CodecError;
use crate::message::Message;

/// Converts between application messages and framed wire bytes.
///
/// `decode` is handed everything buffered so far. It returns `Ok(None)` until
/// a full frame is available, then the message and how many bytes it
/// consumed. Errors are fatal for the connection that produced the bytes.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &dyn Message) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, buf: &[u8]) -> Result<Option<(Box<dyn Message>, usize)>, CodecError>;
}
