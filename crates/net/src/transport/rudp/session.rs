use std::collections::VecDeque;
use std::time::Instant;

use super::protocol::{
    MAX_PAYLOAD_SIZE, RudpError, Segment, SegmentHeader, SegmentKind, next_sequence,
};
use super::tracking::{AckTracker, ReceiveTracker};
use crate::option::RudpConfig;

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub segments_sent: u64,
    pub segments_received: u64,
    pub retransmissions: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

/// One end of a reliable, ordered byte stream over datagrams.
///
/// The session does no I/O: callers feed it received segments with
/// [`Session::input`], collect segments to put on the wire with
/// [`Session::poll_transmit`], and read reassembled payloads with
/// [`Session::read`].
#[derive(Debug)]
pub struct Session {
    session_id: u32,
    config: RudpConfig,
    next_sequence: u32,
    pending: VecDeque<Vec<u8>>,
    acks: AckTracker,
    receive: ReceiveTracker,
    ready: VecDeque<Vec<u8>>,
    ack_due: bool,
    peer_closed: bool,
    stats: SessionStats,
}

impl Session {
    pub fn new(session_id: u32, config: RudpConfig) -> Self {
        let window = config.send_window;
        Self {
            session_id,
            config,
            next_sequence: 1,
            pending: VecDeque::new(),
            acks: AckTracker::new(),
            receive: ReceiveTracker::new(window),
            ready: VecDeque::new(),
            ack_due: false,
            peer_closed: false,
            stats: SessionStats::default(),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// True once every written byte has been acknowledged.
    pub fn is_flushed(&self) -> bool {
        self.pending.is_empty() && self.acks.is_empty()
    }

    /// Queues bytes for reliable delivery, split into datagram-sized chunks.
    pub fn write(&mut self, data: &[u8]) {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            self.pending.push_back(chunk.to_vec());
        }
    }

    /// Next in-order payload from the peer.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    /// Applies a segment from the peer. Segments for another session are
    /// ignored and reported as `false`.
    pub fn input(&mut self, segment: Segment, now: Instant) -> bool {
        let header = segment.header;
        if header.session_id != self.session_id {
            return false;
        }

        self.stats.segments_received += 1;
        if !matches!(
            segment.kind,
            SegmentKind::ConnectionRequest { .. } | SegmentKind::ConnectionAccepted { .. }
        ) {
            self.acks
                .process_ack(header.una, header.ack, header.ack_bitfield, now);
            self.stats.rtt_ms = self.acks.srtt();
            self.stats.rtt_variance = self.acks.rtt_var();
        }

        match segment.kind {
            SegmentKind::Data(payload) => {
                self.ack_due = true;
                self.stats.bytes_received += payload.len() as u64;
                self.receive.record_received(header.sequence, payload);
                while let Some(payload) = self.receive.pop_ready() {
                    self.ready.push_back(payload);
                }
            }
            SegmentKind::Disconnect => self.peer_closed = true,
            SegmentKind::Ack
            | SegmentKind::ConnectionRequest { .. }
            | SegmentKind::ConnectionAccepted { .. } => {}
        }
        true
    }

    /// Segments that should be sent now: expired retransmissions, new data
    /// that fits in the window, and a bare ack if data arrived since the last
    /// call and nothing else would carry it.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Vec<Segment>, RudpError> {
        let (una, ack, ack_bitfield) = self.receive.ack_data();
        let session_id = self.session_id;
        let header = |sequence| SegmentHeader::new(session_id, sequence, una, ack, ack_bitfield);

        let mut out = Vec::new();
        let rto = self.acks.rto(self.config.min_rto, self.config.max_rto);
        for pending in self.acks.due(now, rto, self.config.max_rto) {
            if pending.transmissions >= self.config.max_retransmits {
                return Err(RudpError::RetransmitLimit {
                    sequence: pending.sequence,
                    attempts: pending.transmissions,
                });
            }
            pending.transmissions += 1;
            pending.last_sent = now;
            self.stats.retransmissions += 1;
            out.push(Segment::new(
                header(pending.sequence),
                SegmentKind::Data(pending.payload.clone()),
            ));
        }

        while self.acks.len() < self.config.send_window {
            let Some(payload) = self.pending.pop_front() else {
                break;
            };
            let sequence = self.next_sequence;
            self.next_sequence = next_sequence(sequence);
            self.stats.bytes_sent += payload.len() as u64;
            out.push(Segment::new(
                header(sequence),
                SegmentKind::Data(payload.clone()),
            ));
            self.acks.track(sequence, payload, now);
        }

        if out.is_empty() && self.ack_due {
            out.push(Segment::new(header(0), SegmentKind::Ack));
        }
        self.ack_due = false;
        self.stats.segments_sent += out.len() as u64;

        Ok(out)
    }

    pub fn disconnect_segment(&self) -> Segment {
        let (una, ack, ack_bitfield) = self.receive.ack_data();
        Segment::new(
            SegmentHeader::new(self.session_id, 0, una, ack, ack_bitfield),
            SegmentKind::Disconnect,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pair() -> (Session, Session) {
        let config = RudpConfig::default();
        (Session::new(9, config.clone()), Session::new(9, config))
    }

    fn deliver(segments: Vec<Segment>, to: &mut Session, now: Instant) {
        for segment in segments {
            to.input(segment, now);
        }
    }

    fn drain(session: &mut Session) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(payload) = session.read() {
            out.extend(payload);
        }
        out
    }

    #[test]
    fn test_ordered_delivery_and_ack() {
        let now = Instant::now();
        let (mut a, mut b) = pair();

        a.write(b"hello ");
        a.write(b"world");
        let segments = a.poll_transmit(now).unwrap();
        assert_eq!(segments.len(), 2);

        deliver(segments, &mut b, now);
        assert_eq!(drain(&mut b), b"hello world");

        let acks = b.poll_transmit(now).unwrap();
        assert!(matches!(acks.as_slice(), [Segment { kind: SegmentKind::Ack, .. }]));
        deliver(acks, &mut a, now + Duration::from_millis(5));
        assert!(a.is_flushed());
    }

    #[test]
    fn test_reordered_and_duplicated_segments() {
        let now = Instant::now();
        let (mut a, mut b) = pair();

        for word in ["one ", "two ", "three"] {
            a.write(word.as_bytes());
        }
        let mut segments = a.poll_transmit(now).unwrap();
        segments.reverse();
        let duplicate = segments[0].clone();
        segments.push(duplicate);

        deliver(segments, &mut b, now);
        assert_eq!(drain(&mut b), b"one two three");
    }

    #[test]
    fn test_lost_segment_is_retransmitted() {
        let start = Instant::now();
        let (mut a, mut b) = pair();

        a.write(b"lost");
        let lost = a.poll_transmit(start).unwrap();
        assert_eq!(lost.len(), 1);

        assert!(a.poll_transmit(start + Duration::from_millis(10)).unwrap().is_empty());

        let resent = a.poll_transmit(start + Duration::from_secs(1)).unwrap();
        assert_eq!(resent.len(), 1);
        assert_eq!(a.stats().retransmissions, 1);

        deliver(resent, &mut b, start + Duration::from_secs(1));
        assert_eq!(drain(&mut b), b"lost");
    }

    #[test]
    fn test_large_write_is_split() {
        let now = Instant::now();
        let (mut a, mut b) = pair();

        let data: Vec<u8> = (0..MAX_PAYLOAD_SIZE * 3 + 10).map(|i| i as u8).collect();
        a.write(&data);
        let segments = a.poll_transmit(now).unwrap();
        assert_eq!(segments.len(), 4);

        deliver(segments, &mut b, now);
        assert_eq!(drain(&mut b), data);
    }

    #[test]
    fn test_window_limits_in_flight() {
        let now = Instant::now();
        let config = RudpConfig {
            send_window: 2,
            ..Default::default()
        };
        let mut a = Session::new(1, config.clone());
        let mut b = Session::new(1, config);

        for i in 0..5u8 {
            a.write(&[i]);
        }
        let first = a.poll_transmit(now).unwrap();
        assert_eq!(first.len(), 2);

        deliver(first, &mut b, now);
        deliver(b.poll_transmit(now).unwrap(), &mut a, now);
        assert_eq!(a.poll_transmit(now).unwrap().len(), 2);
    }

    #[test]
    fn test_retransmit_limit_fails_session() {
        let config = RudpConfig {
            max_retransmits: 3,
            ..Default::default()
        };
        let mut a = Session::new(1, config);
        a.write(b"nobody home");

        let mut now = Instant::now();
        a.poll_transmit(now).unwrap();
        let mut failed = false;
        for _ in 0..10 {
            now += Duration::from_secs(5);
            if let Err(RudpError::RetransmitLimit { attempts, .. }) = a.poll_transmit(now) {
                assert_eq!(attempts, 3);
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_foreign_session_ignored() {
        let now = Instant::now();
        let mut a = Session::new(1, RudpConfig::default());
        let mut b = Session::new(2, RudpConfig::default());

        a.write(b"x");
        for segment in a.poll_transmit(now).unwrap() {
            assert!(!b.input(segment, now));
        }
        assert!(b.read().is_none());
    }

    #[test]
    fn test_stream_survives_sequence_wrap() {
        let now = Instant::now();
        let (mut a, mut b) = pair();
        a.next_sequence = u32::MAX - 1;
        b.receive = ReceiveTracker::starting_at(u32::MAX - 1, 128);

        for word in ["before ", "at ", "after ", "wrap"] {
            a.write(word.as_bytes());
        }
        let segments = a.poll_transmit(now).unwrap();
        let sequences: Vec<u32> = segments.iter().map(|s| s.header.sequence).collect();
        assert_eq!(sequences, vec![u32::MAX - 1, u32::MAX, 1, 2]);

        deliver(segments, &mut b, now);
        assert_eq!(drain(&mut b), b"before at after wrap");

        deliver(b.poll_transmit(now).unwrap(), &mut a, now + Duration::from_millis(5));
        assert!(a.is_flushed());
    }

    #[test]
    fn test_disconnect_marks_peer_closed() {
        let now = Instant::now();
        let (a, mut b) = pair();
        b.input(a.disconnect_segment(), now);
        assert!(b.is_peer_closed());
    }
}
