//! ARP cache (IP to MAC mapping)
//!
//! A flat list scanned linearly; entries are merged in place and never
//! expire. The expected population is a handful of hosts on one segment.

use crate::protocol::MacAddr;
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
}

/// Address-translation cache keyed by protocol address
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: Vec<ArpEntry>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the hardware address for an IP
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries.iter().find(|e| e.ip == ip).map(|e| e.mac)
    }

    /// Insert a binding, or update the existing entry for this IP in place
    pub fn update(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        match self.entries.iter_mut().find(|e| e.ip == ip) {
            Some(entry) => entry.mac = mac,
            None => self.entries.push(ArpEntry { ip, mac }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
