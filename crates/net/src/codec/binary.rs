use std::any::Any;

use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;

use super::Codec;
use super::table::{MsgTable, expect_type};
use crate::error::CodecError;
use crate::message::{Message, MessageType};

/// rkyv message bodies inside the shared length-prefixed frame.
#[derive(Default)]
pub struct BinaryCodec {
    table: MsgTable,
}

impl BinaryCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self) -> Result<&mut Self, CodecError>
    where
        T: MessageType
            + rkyv::Archive
            + for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, rancor::Error>>
            + rkyv::Deserialize<T, HighDeserializer<rancor::Error>>,
    {
        self.table.insert(
            T::ID,
            T::NAME,
            Box::new(|value: &dyn Any| {
                let msg = expect_type::<T>(value, T::ID)?;
                rkyv::to_bytes::<rancor::Error>(msg)
                    .map(|aligned| aligned.into_vec())
                    .map_err(|e| CodecError::Serialize(e.to_string()))
            }),
            Box::new(|body: &[u8]| {
                // Frame bodies sit at arbitrary offsets in the receive buffer.
                let mut aligned: AlignedVec = AlignedVec::with_capacity(body.len());
                aligned.extend_from_slice(body);
                let msg = rkyv::from_bytes::<T, rancor::Error>(&aligned)
                    .map_err(|e| CodecError::Deserialize(e.to_string()))?;
                Ok(Box::new(msg) as Box<dyn Message>)
            }),
        )?;
        Ok(self)
    }

    pub fn with<T>(mut self) -> Result<Self, CodecError>
    where
        T: MessageType
            + rkyv::Archive
            + for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, rancor::Error>>
            + rkyv::Deserialize<T, HighDeserializer<rancor::Error>>,
    {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn is_registered<T: MessageType>(&self) -> bool {
        self.table.contains(T::ID)
    }
}

impl Codec for BinaryCodec {
    fn encode(&self, msg: &dyn Message) -> Result<Vec<u8>, CodecError> {
        self.table.encode(msg)
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<(Box<dyn Message>, usize)>, CodecError> {
        self.table.decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::fixtures::{Ping, Pong};

    #[test]
    fn test_round_trip_at_unaligned_offset() {
        let codec = BinaryCodec::new().with::<Ping>().unwrap().with::<Pong>().unwrap();
        let ping = Ping {
            seq: 7,
            note: "binary".into(),
        };

        let mut buf = vec![0xAA];
        buf.extend(codec.encode(&ping).unwrap());

        let (decoded, used) = codec.decode(&buf[1..]).unwrap().unwrap();
        assert_eq!(used, buf.len() - 1);
        assert_eq!(decoded.as_any().downcast_ref::<Ping>(), Some(&ping));
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let codec = BinaryCodec::new().with::<Ping>().unwrap();
        let ping = Ping {
            seq: 1,
            note: "truncate me".into(),
        };
        let frame = codec.encode(&ping).unwrap();

        // Rewrite the length so the frame ends one byte early.
        let mut short = frame[..frame.len() - 1].to_vec();
        let len = (short.len() - 4) as u32;
        short[..4].copy_from_slice(&len.to_le_bytes());

        assert!(codec.decode(&short).is_err());
    }
}
