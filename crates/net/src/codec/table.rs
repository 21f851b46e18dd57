use std::any::Any;
use std::collections::HashMap;

use super::frame::{encode_frame, split_frame};
use crate::error::CodecError;
use crate::message::{Message, MsgId};

pub(crate) type EncodeFn = Box<dyn Fn(&dyn Any) -> Result<Vec<u8>, CodecError> + Send + Sync>;
pub(crate) type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Message>, CodecError> + Send + Sync>;

struct MsgEntry {
    name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Per-codec mapping from message id to typed body encoders/decoders.
#[derive(Default)]
pub(crate) struct MsgTable {
    entries: HashMap<MsgId, MsgEntry>,
}

impl MsgTable {
    pub fn insert(
        &mut self,
        id: MsgId,
        name: &'static str,
        encode: EncodeFn,
        decode: DecodeFn,
    ) -> Result<(), CodecError> {
        if let Some(existing) = self.entries.get(&id) {
            return Err(CodecError::DuplicateId {
                id,
                existing: existing.name,
            });
        }
        self.entries.insert(
            id,
            MsgEntry {
                name,
                encode,
                decode,
            },
        );
        Ok(())
    }

    pub fn contains(&self, id: MsgId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn encode(&self, msg: &dyn Message) -> Result<Vec<u8>, CodecError> {
        let id = msg.msg_id();
        let entry = self
            .entries
            .get(&id)
            .ok_or(CodecError::UnknownMessage(id))?;
        let body = (entry.encode)(msg.as_any())?;
        encode_frame(id, &body)
    }

    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Box<dyn Message>, usize)>, CodecError> {
        let Some((id, body, used)) = split_frame(buf)? else {
            return Ok(None);
        };
        let entry = self
            .entries
            .get(&id)
            .ok_or(CodecError::UnknownMessage(id))?;
        let msg = (entry.decode)(body)?;
        Ok(Some((msg, used)))
    }
}

/// Downcasts an erased message to the type an entry was registered for.
pub(crate) fn expect_type<T: 'static>(value: &dyn Any, id: MsgId) -> Result<&T, CodecError> {
    value.downcast_ref::<T>().ok_or_else(|| {
        CodecError::Serialize(format!(
            "message id {id} does not belong to {}",
            std::any::type_name::<T>()
        ))
    })
}
