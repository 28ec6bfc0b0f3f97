//! UDP socket table
//!
//! Logical sockets keyed by (local address, local port); inbound datagrams
//! are matched by a linear scan, first match wins. Received payloads queue
//! on the socket until its owner drains them.

use crate::{Error, Result};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use tracing::debug;

/// First port considered for ephemeral allocation
pub const EPHEMERAL_FIRST: u16 = 49152;
/// One past the last port considered for ephemeral allocation
pub const EPHEMERAL_LAST: u16 = 65534;

/// Opaque handle to an open socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(usize);

/// A received datagram as handed to the socket owner
#[derive(Debug, Clone)]
pub struct Datagram {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct SocketEntry {
    id: usize,
    /// Concrete local address, or `UNSPECIFIED` for the wildcard
    local_addr: Ipv4Addr,
    local_port: u16,
    rx: VecDeque<Datagram>,
}

/// The set of open sockets
#[derive(Debug, Default)]
pub struct SocketTable {
    sockets: Vec<SocketEntry>,
    next_id: usize,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a socket. `local_addr` must be the configured interface address
    /// or the wildcard; `local_port` 0 requests ephemeral allocation.
    pub fn open(
        &mut self,
        local_addr: Ipv4Addr,
        local_port: u16,
        configured: Option<Ipv4Addr>,
    ) -> Result<SocketHandle> {
        if local_addr != Ipv4Addr::UNSPECIFIED && Some(local_addr) != configured {
            return Err(Error::Config(format!(
                "{} is not the configured local address",
                local_addr
            )));
        }

        let local_port = if local_port == 0 {
            self.allocate_ephemeral(local_addr)?
        } else {
            if self.conflicts(local_addr, local_port) {
                return Err(Error::Config(format!(
                    "UDP port {} already open",
                    local_port
                )));
            }
            local_port
        };

        let id = self.next_id;
        self.next_id += 1;
        self.sockets.push(SocketEntry {
            id,
            local_addr,
            local_port,
            rx: VecDeque::new(),
        });

        debug!(addr = %local_addr, port = local_port, "UDP socket opened");
        Ok(SocketHandle(id))
    }

    /// Close a socket; closing one that is not registered is a caller bug
    pub fn close(&mut self, handle: SocketHandle) -> Result<()> {
        let index = self
            .sockets
            .iter()
            .position(|s| s.id == handle.0)
            .ok_or_else(|| Error::Config("closing unregistered UDP socket".into()))?;
        let entry = self.sockets.remove(index);
        debug!(addr = %entry.local_addr, port = entry.local_port, "UDP socket closed");
        Ok(())
    }

    pub fn local_addr(&self, handle: SocketHandle) -> Result<Ipv4Addr> {
        Ok(self.entry(handle)?.local_addr)
    }

    pub fn local_port(&self, handle: SocketHandle) -> Result<u16> {
        Ok(self.entry(handle)?.local_port)
    }

    /// Route an inbound datagram to the first socket whose port matches and
    /// whose local address is the wildcard or the datagram's destination.
    /// Returns false when no socket matched.
    pub fn dispatch(&mut self, dst_addr: Ipv4Addr, dst_port: u16, datagram: Datagram) -> bool {
        let socket = self.sockets.iter_mut().find(|s| {
            s.local_port == dst_port
                && (s.local_addr == Ipv4Addr::UNSPECIFIED || s.local_addr == dst_addr)
        });

        match socket {
            Some(entry) => {
                entry.rx.push_back(datagram);
                true
            }
            None => false,
        }
    }

    /// Take the next queued datagram for a socket
    pub fn recv(&mut self, handle: SocketHandle) -> Result<Option<Datagram>> {
        Ok(self.entry_mut(handle)?.rx.pop_front())
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn entry(&self, handle: SocketHandle) -> Result<&SocketEntry> {
        self.sockets
            .iter()
            .find(|s| s.id == handle.0)
            .ok_or_else(|| Error::Config("unregistered UDP socket".into()))
    }

    fn entry_mut(&mut self, handle: SocketHandle) -> Result<&mut SocketEntry> {
        self.sockets
            .iter_mut()
            .find(|s| s.id == handle.0)
            .ok_or_else(|| Error::Config("unregistered UDP socket".into()))
    }

    /// First unused (address, port) pair in the ephemeral range
    fn allocate_ephemeral(&self, local_addr: Ipv4Addr) -> Result<u16> {
        (EPHEMERAL_FIRST..EPHEMERAL_LAST)
            .find(|&port| !self.conflicts(local_addr, port))
            .ok_or_else(|| Error::Config("ephemeral UDP ports exhausted".into()))
    }

    /// The wildcard address conflicts with everything on the same port
    fn conflicts(&self, local_addr: Ipv4Addr, local_port: u16) -> bool {
        self.sockets.iter().any(|s| {
            s.local_port == local_port
                && (s.local_addr == Ipv4Addr::UNSPECIFIED
                    || local_addr == Ipv4Addr::UNSPECIFIED
                    || s.local_addr == local_addr)
        })
    }
}
