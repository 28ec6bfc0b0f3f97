//! Ethernet II frame codec
//!
//! Untagged frames only; the segment this stack serves carries no VLANs.

use super::MacAddr;
use crate::{Error, Result};

/// Header size: two addresses plus the ethertype
pub const HEADER_SIZE: usize = 14;
/// Largest frame handed to the device (header + payload, no FCS)
pub const MAX_FRAME_SIZE: usize = 1514;

/// Received frame, borrowed from the device buffer
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
}

impl<'a> Frame<'a> {
    /// The length gate here covers every accessor below
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse(format!(
                "Ethernet frame of {} bytes is below the {} byte header",
                buffer.len(),
                HEADER_SIZE
            )));
        }
        Ok(Self { buffer })
    }

    pub fn dst_mac(&self) -> MacAddr {
        mac_at(self.buffer, 0)
    }

    pub fn src_mac(&self) -> MacAddr {
        mac_at(self.buffer, 6)
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.buffer[12], self.buffer[13]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

fn mac_at(buffer: &[u8], offset: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&buffer[offset..offset + 6]);
    MacAddr(mac)
}

/// Assembles an outbound frame from its parts
#[derive(Debug, Default)]
pub struct FrameBuilder {
    dst: MacAddr,
    src: MacAddr,
    ethertype: u16,
    payload: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dst_mac(mut self, mac: MacAddr) -> Self {
        self.dst = mac;
        self
    }

    pub fn src_mac(mut self, mac: MacAddr) -> Self {
        self.src = mac;
        self
    }

    pub fn ethertype(mut self, ethertype: u16) -> Self {
        self.ethertype = ethertype;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        frame.extend_from_slice(&self.dst.0);
        frame.extend_from_slice(&self.src.0);
        frame.extend_from_slice(&self.ethertype.to_be_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }
}
