//! ARP packet processor
//!
//! Cache-merge semantics per classic ARP: learn from the sender when we
//! already know them or when the packet targets our address, answer
//! requests for our address, and stay inert until the interface has one.

use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::MacAddr;
use crate::stack::arp_cache::ArpCache;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tracing::debug;

/// Process an incoming ARP packet.
///
/// `local` is the configured (IP, MAC) pair, or `None` while the interface
/// has no address yet. Returns the reply to transmit, if any.
pub fn process_arp(
    packet: &ArpPacket,
    cache: &mut ArpCache,
    local: Option<(Ipv4Addr, MacAddr)>,
) -> Result<Option<ArpPacket>> {
    if packet.sender_mac.is_broadcast() {
        return Err(Error::Protocol(
            "ARP sender hardware address is broadcast".into(),
        ));
    }

    let Some((local_ip, local_mac)) = local else {
        // No address configured yet; no cache mutation, no reply
        debug!(sender = %packet.sender_ip, "dropping ARP, interface unconfigured");
        return Ok(None);
    };

    let known = cache.lookup(packet.sender_ip);
    if let Some(mac) = known {
        if mac != packet.sender_mac {
            debug!(ip = %packet.sender_ip, old = %mac, new = %packet.sender_mac,
                   "ARP binding changed");
            cache.update(packet.sender_ip, packet.sender_mac);
        }
    }

    if packet.target_ip != local_ip {
        return Ok(None);
    }

    if known.is_none() {
        cache.update(packet.sender_ip, packet.sender_mac);
    }

    if packet.operation == ArpOp::Request {
        debug!(requester = %packet.sender_ip, "answering ARP request");
        return Ok(Some(ArpPacket::reply(
            local_mac,
            local_ip,
            packet.sender_mac,
            packet.sender_ip,
        )));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const LOCAL_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const PEER_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn local() -> Option<(Ipv4Addr, MacAddr)> {
        Some((LOCAL_IP, LOCAL_MAC))
    }

    #[test]
    fn test_request_for_us_gets_reply_and_cache_entry() {
        let mut cache = ArpCache::new();
        let request = ArpPacket::request(PEER_MAC, Ipv4Addr::new(10, 0, 0, 5), LOCAL_IP);

        let reply = process_arp(&request, &mut cache, local()).unwrap().unwrap();

        assert_eq!(reply.operation, ArpOp::Reply);
        assert_eq!(reply.sender_mac, LOCAL_MAC);
        assert_eq!(reply.sender_ip, LOCAL_IP);
        assert_eq!(reply.target_mac, PEER_MAC);
        assert_eq!(reply.target_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 5)), Some(PEER_MAC));
    }

    #[test]
    fn test_request_for_other_host_no_reply() {
        let mut cache = ArpCache::new();
        let request = ArpPacket::request(
            PEER_MAC,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 9),
        );

        let reply = process_arp(&request, &mut cache, local()).unwrap();

        assert!(reply.is_none());
        // Sender was unknown and the packet was not for us; nothing learned
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reply_for_us_populates_cache() {
        let mut cache = ArpCache::new();
        let reply = ArpPacket::reply(PEER_MAC, Ipv4Addr::new(10, 0, 0, 5), LOCAL_MAC, LOCAL_IP);

        let out = process_arp(&reply, &mut cache, local()).unwrap();

        assert!(out.is_none());
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 5)), Some(PEER_MAC));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut cache = ArpCache::new();
        let reply = ArpPacket::reply(PEER_MAC, Ipv4Addr::new(10, 0, 0, 5), LOCAL_MAC, LOCAL_IP);

        process_arp(&reply, &mut cache, local()).unwrap();
        process_arp(&reply, &mut cache, local()).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 5)), Some(PEER_MAC));
    }

    #[test]
    fn test_known_sender_updated_even_when_not_for_us() {
        let mut cache = ArpCache::new();
        let sender_ip = Ipv4Addr::new(10, 0, 0, 5);
        cache.update(sender_ip, MacAddr([0x01, 0x01, 0x01, 0x01, 0x01, 0x01]));

        let request = ArpPacket::request(PEER_MAC, sender_ip, Ipv4Addr::new(10, 0, 0, 9));
        process_arp(&request, &mut cache, local()).unwrap();

        assert_eq!(cache.lookup(sender_ip), Some(PEER_MAC));
    }

    #[test]
    fn test_broadcast_sender_rejected() {
        let mut cache = ArpCache::new();
        let request = ArpPacket::request(MacAddr::BROADCAST, Ipv4Addr::new(10, 0, 0, 5), LOCAL_IP);

        assert!(process_arp(&request, &mut cache, local()).is_err());
    }

    #[test]
    fn test_inert_while_unconfigured() {
        let mut cache = ArpCache::new();
        let request = ArpPacket::request(PEER_MAC, Ipv4Addr::new(10, 0, 0, 5), LOCAL_IP);

        let reply = process_arp(&request, &mut cache, None).unwrap();

        assert!(reply.is_none());
        assert!(cache.is_empty());
    }
}
