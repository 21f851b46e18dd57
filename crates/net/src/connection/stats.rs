use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time traffic counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub encode_failures: u64,
    pub queued_frames: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    encode_failures: AtomicU64,
    queued_frames: AtomicUsize,
}

impl StatsCounter {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Reserves a slot in the outbound queue. Fails, leaving the count
    /// untouched, when `limit` is non-zero and already reached.
    pub fn try_enqueue(&self, limit: usize) -> bool {
        if limit == 0 {
            self.queued_frames.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.queued_frames
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < limit).then_some(queued + 1)
            })
            .is_ok()
    }

    pub fn dequeue(&self) {
        let _ = self
            .queued_frames
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                queued.checked_sub(1)
            });
    }

    pub fn snapshot(&self) -> ConnStats {
        ConnStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            queued_frames: self.queued_frames.load(Ordering::Acquire),
        }
    }
}
