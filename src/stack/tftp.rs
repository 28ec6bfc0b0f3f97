//! TFTP transfer engine
//!
//! Block-oriented file transfer over UDP: a reader and writer for the
//! client side and a session table for the serve side. Sessions are driven
//! by an external `tick()` per poll cycle; a countdown reaching zero either
//! retransmits or kills the exchange, depending on how far it got.

use crate::protocol::tftp::{
    self, build_ack, build_data, build_error, build_rrq, build_wrq, error_code, TftpPacket,
    BLOCK_SIZE, TFTP_PORT,
};
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Poll cycles before a session retransmits
pub const RETRANSMIT_TIMEOUT: u32 = 50;

/// Number of blocks needed to carry `size` bytes.
///
/// Exact multiples of the block size get a trailing short (empty) block, so
/// the final transmitted block is always shorter than a full one and the
/// receiver can detect the end of the transfer.
pub fn block_count(size: usize) -> u16 {
    ((size + BLOCK_SIZE) / BLOCK_SIZE) as u16
}

/// Payload of 1-based block `block` within `data`
fn block_payload(data: &[u8], block: u16) -> &[u8] {
    let start = (block as usize - 1) * BLOCK_SIZE;
    let end = (start + BLOCK_SIZE).min(data.len());
    &data[start.min(data.len())..end]
}

/// An outbound datagram a session wants transmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub packet: Vec<u8>,
}

/// Client-side read (GET) of one file
#[derive(Debug)]
pub struct TftpReader {
    filename: String,
    server: Ipv4Addr,
    /// Transfer port learned from the server's first DATA packet
    peer_port: Option<u16>,
    last_block: u16,
    data: Vec<u8>,
    countdown: u32,
    done: bool,
}

impl TftpReader {
    pub fn new(server: Ipv4Addr, filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            server,
            peer_port: None,
            last_block: 0,
            data: Vec::new(),
            countdown: RETRANSMIT_TIMEOUT,
            done: false,
        }
    }

    /// Build the RRQ, addressed to the server's well-known port
    pub fn request(&mut self) -> Outgoing {
        debug!(file = %self.filename, server = %self.server, "sending RRQ");
        self.countdown = RETRANSMIT_TIMEOUT;
        Outgoing {
            dst_addr: self.server,
            dst_port: TFTP_PORT,
            packet: build_rrq(&self.filename),
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// The received file, once done
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Feed one datagram received on the transfer socket
    pub fn on_datagram(
        &mut self,
        src_addr: Ipv4Addr,
        src_port: u16,
        payload: &[u8],
    ) -> Result<Option<Outgoing>> {
        if self.done {
            return Ok(None);
        }
        if src_addr != self.server {
            debug!(src = %src_addr, "dropping TFTP datagram from unexpected host");
            return Ok(None);
        }

        match TftpPacket::parse(payload)? {
            TftpPacket::Data { block, data } => {
                match self.peer_port {
                    Some(port) if port != src_port => {
                        debug!(src_port, "dropping TFTP data from foreign transfer port");
                        return Ok(None);
                    }
                    _ => self.peer_port = Some(src_port),
                }

                if block != self.last_block + 1 {
                    return Err(Error::Protocol(format!(
                        "TFTP block {} received, expected {}",
                        block,
                        self.last_block + 1
                    )));
                }

                self.data.extend_from_slice(data);
                self.last_block = block;
                self.countdown = RETRANSMIT_TIMEOUT;
                if data.len() < BLOCK_SIZE {
                    info!(file = %self.filename, bytes = self.data.len(), "read complete");
                    self.done = true;
                }

                Ok(Some(Outgoing {
                    dst_addr: self.server,
                    dst_port: src_port,
                    packet: build_ack(block),
                }))
            }
            TftpPacket::Error { code, message } => Err(Error::Protocol(format!(
                "TFTP server error {}: {}",
                code, message
            ))),
            _ => Err(Error::Protocol("unexpected TFTP opcode during read".into())),
        }
    }

    /// Count down one poll cycle. Before any data has arrived the RRQ is
    /// retransmitted; a stall mid-transfer is fatal.
    pub fn tick(&mut self) -> Result<Option<Outgoing>> {
        if self.done {
            return Ok(None);
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return Ok(None);
        }
        if self.last_block == 0 {
            warn!(file = %self.filename, "no answer to RRQ, retransmitting");
            return Ok(Some(self.request()));
        }
        Err(Error::Protocol("TFTP read stalled mid-transfer".into()))
    }
}

/// Client-side write (PUT) of one buffer
#[derive(Debug)]
pub struct TftpWriter {
    filename: String,
    server: Ipv4Addr,
    peer_port: Option<u16>,
    data: Vec<u8>,
    block_count: u16,
    last_acked: u16,
    got_ack: bool,
    countdown: u32,
    done: bool,
}

impl TftpWriter {
    pub fn new(server: Ipv4Addr, filename: &str, data: Vec<u8>) -> Self {
        let block_count = block_count(data.len());
        Self {
            filename: filename.to_string(),
            server,
            peer_port: None,
            data,
            block_count,
            last_acked: 0,
            got_ack: false,
            countdown: RETRANSMIT_TIMEOUT,
            done: false,
        }
    }

    /// Build the WRQ, addressed to the server's well-known port
    pub fn request(&mut self) -> Outgoing {
        debug!(file = %self.filename, server = %self.server, blocks = self.block_count,
               "sending WRQ");
        self.countdown = RETRANSMIT_TIMEOUT;
        Outgoing {
            dst_addr: self.server,
            dst_port: TFTP_PORT,
            packet: build_wrq(&self.filename),
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    fn data_packet(&mut self, block: u16) -> Outgoing {
        self.countdown = RETRANSMIT_TIMEOUT;
        Outgoing {
            dst_addr: self.server,
            // request() is the only sender before the first ACK locks the port
            dst_port: self.peer_port.unwrap_or(TFTP_PORT),
            packet: build_data(block, block_payload(&self.data, block)),
        }
    }

    /// Feed one datagram received on the transfer socket
    pub fn on_datagram(
        &mut self,
        src_addr: Ipv4Addr,
        src_port: u16,
        payload: &[u8],
    ) -> Result<Option<Outgoing>> {
        if self.done {
            return Ok(None);
        }
        if src_addr != self.server {
            debug!(src = %src_addr, "dropping TFTP datagram from unexpected host");
            return Ok(None);
        }

        match TftpPacket::parse(payload)? {
            TftpPacket::Ack { block } => {
                match self.peer_port {
                    Some(port) if port != src_port => {
                        debug!(src_port, "dropping TFTP ack from foreign transfer port");
                        return Ok(None);
                    }
                    _ => self.peer_port = Some(src_port),
                }

                if block > self.block_count {
                    return Err(Error::Protocol(format!(
                        "TFTP ack for block {} of {}",
                        block, self.block_count
                    )));
                }

                self.got_ack = true;
                self.last_acked = block;
                if block == self.block_count {
                    info!(file = %self.filename, bytes = self.data.len(), "write complete");
                    self.done = true;
                    return Ok(None);
                }
                Ok(Some(self.data_packet(block + 1)))
            }
            TftpPacket::Error { code, message } => Err(Error::Protocol(format!(
                "TFTP server error {}: {}",
                code, message
            ))),
            _ => Err(Error::Protocol(
                "unexpected TFTP opcode during write".into(),
            )),
        }
    }

    /// Count down one poll cycle; retransmit the WRQ or the block after the
    /// last acknowledged one
    pub fn tick(&mut self) -> Result<Option<Outgoing>> {
        if self.done {
            return Ok(None);
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return Ok(None);
        }
        if !self.got_ack {
            warn!(file = %self.filename, "no answer to WRQ, retransmitting");
            return Ok(Some(self.request()));
        }
        warn!(file = %self.filename, block = self.last_acked + 1, "retransmitting block");
        Ok(Some(self.data_packet(self.last_acked + 1)))
    }
}

/// Read access to the files the serve loop may hand out
pub trait FileStore {
    fn read(&self, name: &str) -> std::io::Result<Vec<u8>>;
}

/// FileStore backed by a single host directory
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileStore for DirStore {
    fn read(&self, name: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.root.join(name))
    }
}

/// One in-flight transfer on the serve side
#[derive(Debug)]
struct ServerSession {
    peer_addr: Ipv4Addr,
    peer_port: u16,
    data: Vec<u8>,
    block_count: u16,
    outstanding: u16,
    countdown: u32,
}

impl ServerSession {
    fn data_packet(&mut self, block: u16) -> Outgoing {
        self.outstanding = block;
        self.countdown = RETRANSMIT_TIMEOUT;
        Outgoing {
            dst_addr: self.peer_addr,
            dst_port: self.peer_port,
            packet: build_data(block, block_payload(&self.data, block)),
        }
    }
}

/// What the serve loop should do with the reply
#[derive(Debug, PartialEq, Eq)]
pub enum ServerAction {
    /// Nothing to send
    Ignore,
    /// Send and keep serving
    Reply(Outgoing),
    /// Send and shut the serve loop down
    Stop(Outgoing),
}

/// TFTP server: one listening port, one session per remote endpoint
pub struct TftpServer<S: FileStore> {
    store: S,
    sessions: Vec<ServerSession>,
}

impl<S: FileStore> TftpServer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            sessions: Vec::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Feed one datagram received on the listening port
    pub fn on_datagram(
        &mut self,
        src_addr: Ipv4Addr,
        src_port: u16,
        payload: &[u8],
    ) -> Result<ServerAction> {
        match TftpPacket::parse(payload)? {
            TftpPacket::Rrq { filename, mode } => Ok(self.handle_rrq(src_addr, src_port, filename, mode)),
            TftpPacket::Ack { block } => self.handle_ack(src_addr, src_port, block),
            other => {
                warn!(?other, "unsupported TFTP request, shutting down server");
                Ok(ServerAction::Stop(Outgoing {
                    dst_addr: src_addr,
                    dst_port: src_port,
                    packet: build_error(error_code::ILLEGAL_OPERATION, "unsupported operation"),
                }))
            }
        }
    }

    fn handle_rrq(
        &mut self,
        src_addr: Ipv4Addr,
        src_port: u16,
        filename: &str,
        mode: &str,
    ) -> ServerAction {
        let reply_error = |code, message: &str| {
            warn!(file = filename, message, "rejecting RRQ");
            ServerAction::Reply(Outgoing {
                dst_addr: src_addr,
                dst_port: src_port,
                packet: build_error(code, message),
            })
        };

        if !mode.eq_ignore_ascii_case(tftp::MODE_OCTET) {
            return reply_error(error_code::ILLEGAL_OPERATION, "only octet mode is supported");
        }
        if !filename_allowed(filename) {
            return reply_error(error_code::ILLEGAL_OPERATION, "illegal filename");
        }

        let data = match self.store.read(filename) {
            Ok(data) => data,
            Err(err) => {
                return reply_error(error_code::FILE_NOT_FOUND, &err.to_string());
            }
        };

        info!(file = filename, peer = %src_addr, port = src_port, bytes = data.len(),
              "starting transfer");

        // A new RRQ from the same endpoint supersedes its old session
        self.sessions
            .retain(|s| !(s.peer_addr == src_addr && s.peer_port == src_port));

        let mut session = ServerSession {
            peer_addr: src_addr,
            peer_port: src_port,
            block_count: block_count(data.len()),
            data,
            outstanding: 0,
            countdown: RETRANSMIT_TIMEOUT,
        };
        let first = session.data_packet(1);
        self.sessions.push(session);
        ServerAction::Reply(first)
    }

    fn handle_ack(&mut self, src_addr: Ipv4Addr, src_port: u16, block: u16) -> Result<ServerAction> {
        let index = self
            .sessions
            .iter()
            .position(|s| s.peer_addr == src_addr && s.peer_port == src_port);
        let Some(index) = index else {
            debug!(peer = %src_addr, port = src_port, "ack without a session");
            return Ok(ServerAction::Ignore);
        };

        let session = &mut self.sessions[index];
        if block < 1 || block > session.block_count {
            return Err(Error::Protocol(format!(
                "TFTP ack for block {} of {}",
                block, session.block_count
            )));
        }

        if block == session.block_count {
            info!(peer = %src_addr, port = src_port, "transfer complete");
            self.sessions.remove(index);
            return Ok(ServerAction::Ignore);
        }

        Ok(ServerAction::Reply(session.data_packet(block + 1)))
    }

    /// Count down one poll cycle for every session; returns the blocks to
    /// retransmit
    pub fn tick(&mut self) -> Vec<Outgoing> {
        let mut retransmit = Vec::new();
        for session in &mut self.sessions {
            session.countdown = session.countdown.saturating_sub(1);
            if session.countdown == 0 {
                debug!(peer = %session.peer_addr, block = session.outstanding,
                       "retransmitting block");
                let block = session.outstanding;
                retransmit.push(session.data_packet(block));
            }
        }
        retransmit
    }
}

/// Served filenames are a single path component: ASCII alphanumerics plus
/// `.` anywhere but the front
fn filename_allowed(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_ascii_alphanumeric() || (c == '.' && i > 0))
}
