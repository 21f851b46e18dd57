use std::any::Any;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Codec;
use super::table::{MsgTable, expect_type};
use crate::error::CodecError;
use crate::message::{Message, MessageType};

/// JSON message bodies inside the shared length-prefixed frame.
#[derive(Default)]
pub struct JsonCodec {
    table: MsgTable,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self) -> Result<&mut Self, CodecError>
    where
        T: MessageType + Serialize + DeserializeOwned,
    {
        self.table.insert(
            T::ID,
            T::NAME,
            Box::new(|value: &dyn Any| {
                let msg = expect_type::<T>(value, T::ID)?;
                serde_json::to_vec(msg).map_err(|e| CodecError::Serialize(e.to_string()))
            }),
            Box::new(|body: &[u8]| {
                let msg: T = serde_json::from_slice(body)
                    .map_err(|e| CodecError::Deserialize(e.to_string()))?;
                Ok(Box::new(msg) as Box<dyn Message>)
            }),
        )?;
        Ok(self)
    }

    pub fn with<T>(mut self) -> Result<Self, CodecError>
    where
        T: MessageType + Serialize + DeserializeOwned,
    {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn is_registered<T: MessageType>(&self) -> bool {
        self.table.contains(T::ID)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }
}

impl Codec for JsonCodec {
    fn encode(&self, msg: &dyn Message) -> Result<Vec<u8>, CodecError> {
        self.table.encode(msg)
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<(Box<dyn Message>, usize)>, CodecError> {
        self.table.decode(buf)
    }
}
