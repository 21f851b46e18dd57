//! Length-prefixed framing shared by the stock codecs.
//!
//! ```text
//! | len: u32 LE | msg id: u32 LE | body ... |
//!   len = 4 + body.len()
//! ```

use crate::error::CodecError;
use crate::message::MsgId;

pub const LEN_SIZE: usize = 4;
pub const ID_SIZE: usize = 4;
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub fn encode_frame(id: MsgId, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = ID_SIZE + body.len();
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LEN_SIZE + len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Splits the first complete frame off `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered; otherwise the message
/// id, the body, and the number of bytes the frame occupies.
pub fn split_frame(buf: &[u8]) -> Result<Option<(MsgId, &[u8], usize)>, CodecError> {
    if buf.len() < LEN_SIZE {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if len < ID_SIZE {
        return Err(CodecError::Malformed(format!(
            "frame length {len} is shorter than the message id"
        )));
    }

    let total = LEN_SIZE + len;
    if buf.len() < total {
        return Ok(None);
    }

    let id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(Some((id, &buf[LEN_SIZE + ID_SIZE..total], total)))
}
