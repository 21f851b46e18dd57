use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_DATAGRAM_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x504E_4554;

/// Room left for archive metadata around a data payload.
const SEGMENT_OVERHEAD: usize = 96;
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - SEGMENT_OVERHEAD;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Successor of a data sequence number. Zero is reserved for control and
/// ack segments, so the count wraps from `u32::MAX` to 1.
pub fn next_sequence(sequence: u32) -> u32 {
    match sequence.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub session_id: u32,
    pub sequence: u32,
    /// Next in-order sequence the sender of this segment expects; everything
    /// before it has been received.
    pub una: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl SegmentHeader {
    pub fn new(session_id: u32, sequence: u32, una: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            session_id,
            sequence,
            una,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum SegmentKind {
    ConnectionRequest { client_salt: u64 },
    ConnectionAccepted { client_salt: u64, session_id: u32 },
    Data(Vec<u8>),
    Ack,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Segment {
    pub header: SegmentHeader,
    pub kind: SegmentKind,
}

#[derive(Debug, thiserror::Error)]
pub enum RudpError {
    #[error("segment serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("segment deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("segment header has wrong magic or version")]
    InvalidHeader,
    #[error("segment {sequence} unacknowledged after {attempts} transmissions")]
    RetransmitLimit { sequence: u32, attempts: u32 },
}

impl Segment {
    pub fn new(header: SegmentHeader, kind: SegmentKind) -> Self {
        Self { header, kind }
    }

    /// Handshake segments carry no sequencing information.
    pub fn control(session_id: u32, kind: SegmentKind) -> Self {
        Self::new(SegmentHeader::new(session_id, 0, 0, 0, 0), kind)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, RudpError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(RudpError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, RudpError> {
        // Receive buffers carry no alignment guarantee.
        let mut aligned: AlignedVec = AlignedVec::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let segment =
            rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(RudpError::Deserialize)?;
        if !segment.header.is_valid() {
            return Err(RudpError::InvalidHeader);
        }
        Ok(segment)
    }
}
