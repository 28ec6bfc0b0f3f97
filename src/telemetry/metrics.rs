//! Stack statistics
//!
//! Counters for packet processing, readable while the stack is borrowed
//! elsewhere. The stack itself is single-threaded; relaxed atomics are only
//! here so counters can tick behind a shared reference.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters kept by the protocol engine
#[derive(Debug, Default)]
pub struct StackStats {
    /// Frames read from the device
    pub frames_rx: Counter,
    /// Frames handed to the device
    pub frames_tx: Counter,
    /// ARP packets received
    pub arp_rx: Counter,
    /// IPv4 packets received
    pub ipv4_rx: Counter,
    /// UDP datagrams received
    pub udp_rx: Counter,
    /// UDP datagrams with no matching socket
    pub udp_unmatched: Counter,
    /// Echo requests answered
    pub icmp_echoes: Counter,
    /// Outbound packets dropped for a missing ARP entry
    pub arp_misses: Counter,
    /// Inbound traffic dropped as expected-but-unhandled
    pub dropped: Counter,
}

impl StackStats {
    pub fn new() -> Self {
        Self::default()
    }
}
