//! UDP datagram codec - RFC 768
//!
//! The checksum field is transmitted as zero (not computed) and never
//! verified on receipt; integrity rests on the IPv4 header checksum and
//! the trusted segment.

use crate::{Error, Result};

/// Fixed header size
pub const HEADER_SIZE: usize = 8;

/// Decoded header, borrowed from the datagram buffer
#[derive(Debug)]
pub struct UdpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    /// The declared length is checked against the buffer here so that
    /// `payload()` can slice unchecked
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }
        let declared = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
        if declared < HEADER_SIZE || declared > buffer.len() {
            return Err(Error::Parse(format!(
                "UDP length {} outside header..buffer range",
                declared
            )));
        }
        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Declared length of header plus payload
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// Payload up to the declared length; Ethernet padding beyond it is
    /// not part of the datagram
    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..self.length() as usize]
    }
}

/// Assembles an outbound datagram
#[derive(Debug, Clone, Default)]
pub struct UdpBuilder {
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
}

impl UdpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let length = (HEADER_SIZE + self.payload.len()) as u16;
        let mut datagram = Vec::with_capacity(length as usize);
        datagram.extend_from_slice(&self.src_port.to_be_bytes());
        datagram.extend_from_slice(&self.dst_port.to_be_bytes());
        datagram.extend_from_slice(&length.to_be_bytes());
        datagram.extend_from_slice(&[0, 0]); // checksum not computed
        datagram.extend_from_slice(&self.payload);
        datagram
    }
}
