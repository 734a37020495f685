// src/stats.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters, created once at startup and shared by `Arc`.
///
/// `live_conns` is incremented on accept and decremented exactly once per
/// connection, by whichever close path (I/O error, completed response, idle
/// timer) gets there first.
#[repr(C, align(64))]
pub struct ServerStats {
    live_conns: AtomicUsize,
    requests: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_conn(&self) {
        self.live_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn live_conns(&self) -> usize {
        self.live_conns.load(Ordering::Acquire)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
