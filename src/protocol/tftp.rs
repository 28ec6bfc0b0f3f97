//! TFTP packets - RFC 1350
//!
//! Octet-mode transfers with fixed 512-byte blocks; the final block of a
//! transfer is always shorter than a full block.

use crate::{Error, Result};

/// Well-known TFTP server port
pub const TFTP_PORT: u16 = 69;

/// Transfer block size
pub const BLOCK_SIZE: usize = 512;

/// The only transfer mode this stack speaks
pub const MODE_OCTET: &str = "octet";

/// TFTP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            _ => None,
        }
    }
}

/// TFTP error codes (RFC 1350)
pub mod error_code {
    pub const NOT_DEFINED: u16 = 0;
    pub const FILE_NOT_FOUND: u16 = 1;
    pub const ACCESS_VIOLATION: u16 = 2;
    pub const DISK_FULL: u16 = 3;
    pub const ILLEGAL_OPERATION: u16 = 4;
    pub const UNKNOWN_TID: u16 = 5;
    pub const FILE_EXISTS: u16 = 6;
    pub const NO_SUCH_USER: u16 = 7;
}

/// A parsed TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket<'a> {
    Rrq { filename: &'a str, mode: &'a str },
    Wrq { filename: &'a str, mode: &'a str },
    Data { block: u16, data: &'a [u8] },
    Ack { block: u16 },
    Error { code: u16, message: &'a str },
}

impl<'a> TftpPacket<'a> {
    /// Parse a TFTP packet from buffer
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < 4 {
            return Err(Error::Parse("TFTP packet too short".into()));
        }

        let opcode = u16::from_be_bytes([buffer[0], buffer[1]]);
        let opcode =
            Opcode::from_u16(opcode).ok_or_else(|| Error::Parse("invalid TFTP opcode".into()))?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let (filename, rest) = take_string(&buffer[2..])?;
                let (mode, _) = take_string(rest)?;
                match opcode {
                    Opcode::Rrq => Ok(TftpPacket::Rrq { filename, mode }),
                    _ => Ok(TftpPacket::Wrq { filename, mode }),
                }
            }
            Opcode::Data => {
                let block = u16::from_be_bytes([buffer[2], buffer[3]]);
                let data = &buffer[4..];
                if data.len() > BLOCK_SIZE {
                    return Err(Error::Parse("TFTP data block oversized".into()));
                }
                Ok(TftpPacket::Data { block, data })
            }
            Opcode::Ack => {
                let block = u16::from_be_bytes([buffer[2], buffer[3]]);
                Ok(TftpPacket::Ack { block })
            }
            Opcode::Error => {
                let code = u16::from_be_bytes([buffer[2], buffer[3]]);
                let (message, _) = take_string(&buffer[4..])?;
                Ok(TftpPacket::Error { code, message })
            }
        }
    }
}

/// Consume a NUL-terminated string from the front of a buffer
fn take_string(buffer: &[u8]) -> Result<(&str, &[u8])> {
    let nul = buffer
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Parse("unterminated TFTP string".into()))?;
    let s = std::str::from_utf8(&buffer[..nul])
        .map_err(|_| Error::Parse("TFTP string is not UTF-8".into()))?;
    Ok((s, &buffer[nul + 1..]))
}

/// Build a read request (octet mode)
pub fn build_rrq(filename: &str) -> Vec<u8> {
    build_request(Opcode::Rrq, filename)
}

/// Build a write request (octet mode)
pub fn build_wrq(filename: &str) -> Vec<u8> {
    build_request(Opcode::Wrq, filename)
}

fn build_request(opcode: Opcode, filename: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(2 + filename.len() + 1 + MODE_OCTET.len() + 1);
    buffer.extend_from_slice(&(opcode as u16).to_be_bytes());
    buffer.extend_from_slice(filename.as_bytes());
    buffer.push(0);
    buffer.extend_from_slice(MODE_OCTET.as_bytes());
    buffer.push(0);
    buffer
}

/// Build a data packet
pub fn build_data(block: u16, data: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4 + data.len());
    buffer.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
    buffer.extend_from_slice(&block.to_be_bytes());
    buffer.extend_from_slice(data);
    buffer
}

/// Build an acknowledgement
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4);
    buffer.extend_from_slice(&(Opcode::Ack as u16).to_be_bytes());
    buffer.extend_from_slice(&block.to_be_bytes());
    buffer
}

/// Build an error packet
pub fn build_error(code: u16, message: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4 + message.len() + 1);
    buffer.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
    buffer.extend_from_slice(&code.to_be_bytes());
    buffer.extend_from_slice(message.as_bytes());
    buffer.push(0);
    buffer
}
