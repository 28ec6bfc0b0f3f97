//! ARP codec - RFC 826
//!
//! Only the Ethernet/IPv4 flavor exists on this segment; any other
//! htype/ptype/length combination is malformed by definition.

use super::MacAddr;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Packet size for the Ethernet/IPv4 flavor
pub const ARP_PACKET_SIZE: usize = 28;

/// htype=1 (Ethernet), ptype=0x0800 (IPv4), hlen=6, plen=4
const FIXED_PREAMBLE: [u8; 6] = [0x00, 0x01, 0x08, 0x00, 6, 4];

/// ARP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }
}

/// Decoded ARP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ARP_PACKET_SIZE {
            return Err(Error::Parse("ARP packet too short".into()));
        }
        if buffer[..6] != FIXED_PREAMBLE {
            return Err(Error::Parse(
                "ARP packet is not the Ethernet/IPv4 flavor".into(),
            ));
        }

        let operation = u16::from_be_bytes([buffer[6], buffer[7]]);
        let operation = ArpOp::from_u16(operation).ok_or_else(|| {
            Error::Parse(format!("ARP operation {} is neither request nor reply", operation))
        })?;

        Ok(Self {
            operation,
            sender_mac: mac_at(buffer, 8),
            sender_ip: addr_at(buffer, 14),
            target_mac: mac_at(buffer, 18),
            target_ip: addr_at(buffer, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut buf = [0u8; ARP_PACKET_SIZE];
        buf[..6].copy_from_slice(&FIXED_PREAMBLE);
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_mac.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());
        buf
    }

    /// Request for `target_ip`; the target hardware address is unknown and
    /// stays zero
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    pub fn reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }
}

fn mac_at(buffer: &[u8], offset: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&buffer[offset..offset + 6]);
    MacAddr(mac)
}

fn addr_at(buffer: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    )
}
