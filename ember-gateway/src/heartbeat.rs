//! Heartbeat bookkeeping for a shard.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// The pacemaker's view of one shard's heartbeat cycle.
///
/// At most one heartbeat awaits acknowledgement at a time: the pacemaker
/// checks [`awaiting_ack`](Self::awaiting_ack) before sending and treats a
/// still-set flag as a dead connection.
#[derive(Debug)]
pub(crate) struct HeartbeatState {
    last_sent_at: RwLock<Option<Instant>>,
    awaiting_ack: AtomicBool,
    /// Round-trip of the last acknowledged heartbeat, in microseconds.
    /// `u64::MAX` means not yet measured.
    latency_us: AtomicU64,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self {
            last_sent_at: RwLock::new(None),
            awaiting_ack: AtomicBool::new(false),
            latency_us: AtomicU64::new(u64::MAX),
        }
    }

    /// Forget any outstanding heartbeat, e.g. across reconnects.
    pub fn reset(&self) {
        self.awaiting_ack.store(false, Ordering::SeqCst);
        *self.last_sent_at.write() = None;
    }

    pub fn mark_sent(&self) {
        *self.last_sent_at.write() = Some(Instant::now());
        self.awaiting_ack.store(true, Ordering::SeqCst);
    }

    pub fn mark_acked(&self) {
        if let Some(sent) = *self.last_sent_at.read() {
            self.latency_us
                .store(sent.elapsed().as_micros() as u64, Ordering::Release);
        }
        self.awaiting_ack.store(false, Ordering::SeqCst);
    }

    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack.load(Ordering::SeqCst)
    }

    /// Round-trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        match self.latency_us.load(Ordering::Acquire) {
            u64::MAX => None,
            us => Some(Duration::from_micros(us)),
        }
    }
}
