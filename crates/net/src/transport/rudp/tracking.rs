use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::protocol::{next_sequence, sequence_greater_than};

#[derive(Debug, Clone)]
pub struct InFlight {
    pub sequence: u32,
    pub payload: Vec<u8>,
    pub last_sent: Instant,
    pub transmissions: u32,
}

/// Sender side: segments awaiting acknowledgement plus the RTT estimate
/// derived from them.
#[derive(Debug)]
pub struct AckTracker {
    in_flight: VecDeque<InFlight>,
    srtt: f32,
    rtt_var: f32,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            in_flight: VecDeque::new(),
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track(&mut self, sequence: u32, payload: Vec<u8>, now: Instant) {
        self.in_flight.push_back(InFlight {
            sequence,
            payload,
            last_sent: now,
            transmissions: 1,
        });
    }

    /// Drops everything below `una` and everything named by `ack` and its
    /// bitfield. Returns how many segments were acknowledged.
    pub fn process_ack(&mut self, una: u32, ack: u32, ack_bitfield: u32, now: Instant) -> usize {
        let mut rtt_samples = Vec::new();
        let before = self.in_flight.len();

        self.in_flight.retain(|pending| {
            let seq = pending.sequence;
            let is_acked = if sequence_greater_than(una, seq) || seq == ack {
                true
            } else if sequence_greater_than(ack, seq) {
                let diff = ack.wrapping_sub(seq);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            // Samples from retransmitted segments are ambiguous.
            if is_acked && pending.transmissions == 1 {
                rtt_samples.push(now.duration_since(pending.last_sent).as_secs_f32() * 1000.0);
            }
            !is_acked
        });

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        before - self.in_flight.len()
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn rto(&self, min: Duration, max: Duration) -> Duration {
        let ms = self.srtt + 4.0 * self.rtt_var;
        Duration::from_secs_f32(ms.max(0.0) / 1000.0).clamp(min, max)
    }

    /// Segments whose backed-off retransmission timer has expired.
    pub fn due(
        &mut self,
        now: Instant,
        rto: Duration,
        max_rto: Duration,
    ) -> impl Iterator<Item = &mut InFlight> {
        self.in_flight.iter_mut().filter(move |pending| {
            let backoff = 1u32 << pending.transmissions.saturating_sub(1).min(16);
            let timeout = rto.saturating_mul(backoff).min(max_rto);
            now.duration_since(pending.last_sent) >= timeout
        })
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// Receiver side: in-order reassembly plus the ack state sent back to the
/// peer.
#[derive(Debug)]
pub struct ReceiveTracker {
    una: u32,
    last_received: u32,
    received_bitfield: u32,
    out_of_order: HashMap<u32, Vec<u8>>,
    window: u32,
}

impl ReceiveTracker {
    pub fn new(window: usize) -> Self {
        Self::starting_at(1, window)
    }

    /// Tracker whose first expected sequence is `una`.
    pub fn starting_at(una: u32, window: usize) -> Self {
        Self {
            una,
            last_received: 0,
            received_bitfield: 0,
            out_of_order: HashMap::new(),
            window: window.max(1) as u32,
        }
    }

    /// Buffers a data segment. Returns false for duplicates and for segments
    /// beyond the receive window.
    pub fn record_received(&mut self, sequence: u32, payload: Vec<u8>) -> bool {
        if sequence_greater_than(self.una, sequence) {
            return false;
        }
        if sequence.wrapping_sub(self.una) >= self.window {
            return false;
        }
        if self.out_of_order.contains_key(&sequence) {
            return false;
        }

        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            let mut bits = if diff < 32 {
                self.received_bitfield << diff
            } else {
                0
            };
            // Sequence 0 is never sent, so it marks "nothing received yet".
            if self.last_received != 0 && diff <= 32 {
                bits |= 1 << (diff - 1);
            }
            self.received_bitfield = bits;
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }

        self.out_of_order.insert(sequence, payload);
        true
    }

    /// Next payload in sequence order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<Vec<u8>> {
        let payload = self.out_of_order.remove(&self.una)?;
        self.una = next_sequence(self.una);
        Some(payload)
    }

    pub fn ack_data(&self) -> (u32, u32, u32) {
        (self.una, self.last_received, self.received_bitfield)
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }
}
