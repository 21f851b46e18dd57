use std::any::Any;
use std::fmt;

/// Wire identity of a message type. Shared by codecs (frame header) and the
/// dispatcher (routing key).
pub type MsgId = u32;

pub trait Message: Any + Send + Sync + fmt::Debug {
    fn msg_id(&self) -> MsgId;

    fn msg_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// Statically known identity, required for typed registration with codecs and
/// the dispatcher.
pub trait MessageType: Message + Sized {
    const ID: MsgId;
    const NAME: &'static str;
}

/// Implements [`Message`] and [`MessageType`] for a type under a fixed id.
///
/// ```ignore
/// polynet::message!(Hello = 1);
/// ```
#[macro_export]
macro_rules! message {
    ($ty:ident = $id:expr) => {
        impl $crate::MessageType for $ty {
            const ID: $crate::MsgId = $id;
            const NAME: &'static str = stringify!($ty);
        }

        impl $crate::Message for $ty {
            fn msg_id(&self) -> $crate::MsgId {
                <$ty as $crate::MessageType>::ID
            }

            fn msg_name(&self) -> &'static str {
                <$ty as $crate::MessageType>::NAME
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }
    };
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde::{Deserialize, Serialize};

    #[derive(
        Debug,
        Clone,
        PartialEq,
        Serialize,
        Deserialize,
        rkyv::Archive,
        rkyv::Serialize,
        rkyv::Deserialize,
    )]
    pub struct Ping {
        pub seq: u32,
        pub note: String,
    }

    #[derive(
        Debug,
        Clone,
        PartialEq,
        Serialize,
        Deserialize,
        rkyv::Archive,
        rkyv::Serialize,
        rkyv::Deserialize,
    )]
    pub struct Pong {
        pub seq: u32,
    }

    crate::message!(Ping = 1);
    crate::message!(Pong = 2);
}
