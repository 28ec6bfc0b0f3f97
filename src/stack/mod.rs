//! The protocol engine
//!
//! `NetStack` owns every piece of layer state (device handle, interface
//! configuration, ARP cache, socket table) and is driven from the host's
//! poll loop. Everything runs to completion on the caller's stack: at most
//! one packet is in flight at a time, so no locking exists anywhere.

mod arp;
mod arp_cache;
mod device;
mod dhcp;
mod tftp;
mod udp;

pub use arp_cache::ArpCache;
pub use device::{DriveControl, Netif};
pub use dhcp::{DhcpClient, DhcpState};
pub use tftp::{
    block_count, DirStore, FileStore, Outgoing, ServerAction, TftpReader, TftpServer, TftpWriter,
};
pub use udp::{Datagram, SocketHandle, SocketTable};

use crate::protocol::arp::ArpPacket;
use crate::protocol::dhcp as dhcp_proto;
use crate::protocol::ethernet::{Frame, FrameBuilder};
use crate::protocol::icmp::{self, IcmpMessage, IcmpType};
use crate::protocol::ipv4::{Ipv4Builder, Ipv4Header, Protocol};
use crate::protocol::tftp::TFTP_PORT;
use crate::protocol::udp::{self as udp_proto, UdpBuilder, UdpHeader};
use crate::protocol::{EtherType, MacAddr};
use crate::telemetry::StackStats;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Frames drained from the device per poll
pub const MAX_FRAMES_PER_POLL: usize = 32;

/// Largest UDP payload that still fits one Ethernet frame; there is no
/// fragmentation to fall back on
pub const MAX_UDP_PAYLOAD: usize = crate::protocol::ethernet::MAX_FRAME_SIZE
    - crate::protocol::ethernet::HEADER_SIZE
    - crate::protocol::ipv4::MIN_HEADER_SIZE
    - udp_proto::HEADER_SIZE;

/// Interface configuration, set exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct Ipv4NetConfig {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

/// What became of an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the device
    Sent,
    /// Dropped; an ARP request for the next hop went out instead and the
    /// caller is expected to retry
    AwaitingArp,
}

/// The single context owning all network state for one interface
pub struct NetStack<D: Netif> {
    device: D,
    mac: MacAddr,
    config: Option<Ipv4NetConfig>,
    arp_cache: ArpCache,
    sockets: SocketTable,
    stats: StackStats,
}

impl<D: Netif> NetStack<D> {
    pub fn new(device: D) -> Self {
        let mac = device.hardware_address();
        info!(%mac, "network stack up");
        Self {
            device,
            mac,
            config: None,
            arp_cache: ArpCache::new(),
            sockets: SocketTable::new(),
            stats: StackStats::new(),
        }
    }

    pub fn hardware_address(&self) -> MacAddr {
        self.mac
    }

    /// Direct access to the device, for host shims and tests
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn stats(&self) -> &StackStats {
        &self.stats
    }

    /// Set the interface configuration. Allowed exactly once; the address
    /// must be a real host address.
    pub fn configure(&mut self, config: Ipv4NetConfig) -> Result<()> {
        if self.config.is_some() {
            return Err(Error::Config("interface is already configured".into()));
        }
        if config.address == Ipv4Addr::UNSPECIFIED || config.address.is_broadcast() {
            return Err(Error::Config(format!(
                "{} is not a valid interface address",
                config.address
            )));
        }
        info!(address = %config.address, netmask = %config.netmask,
              gateway = ?config.gateway, "interface configured");
        self.config = Some(config);
        Ok(())
    }

    pub fn current_config(&self) -> Option<&Ipv4NetConfig> {
        self.config.as_ref()
    }

    /// ARP cache lookup; never blocks, never sends
    pub fn resolve(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp_cache.lookup(ip)
    }

    /// Broadcast an ARP request for `ip`
    pub fn arp_request(&mut self, ip: Ipv4Addr) -> Result<()> {
        let sender_ip = self
            .config
            .map(|c| c.address)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let request = ArpPacket::request(self.mac, sender_ip, ip);
        let frame = FrameBuilder::new()
            .dst_mac(MacAddr::BROADCAST)
            .src_mac(self.mac)
            .ethertype(EtherType::Arp as u16)
            .payload(&request.to_bytes())
            .build();
        self.transmit(&frame)
    }

    /// The drain entry point: read up to [`MAX_FRAMES_PER_POLL`] frames
    /// from the device and run each through the demultiplexer. Returns the
    /// number of frames processed.
    pub fn poll(&mut self) -> Result<usize> {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        self.device
            .process_received(MAX_FRAMES_PER_POLL, &mut |bytes| {
                frames.push(bytes.to_vec());
                Ok(())
            })?;

        let count = frames.len();
        for frame in frames {
            self.stats.frames_rx.inc();
            self.handle_frame(&frame)?;
        }
        Ok(count)
    }

    /// Ethernet demultiplexer
    fn handle_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = Frame::parse(bytes)?;
        match EtherType::from_u16(frame.ethertype()) {
            Some(EtherType::Arp) => self.handle_arp(frame.payload()),
            Some(EtherType::Ipv4) => self.handle_ipv4(frame.payload()),
            Some(EtherType::Ipv6) => {
                debug!("dropping IPv6 frame");
                self.stats.dropped.inc();
                Ok(())
            }
            None => Err(Error::Protocol(format!(
                "unhandled ethertype {:#06x}",
                frame.ethertype()
            ))),
        }
    }

    fn handle_arp(&mut self, payload: &[u8]) -> Result<()> {
        self.stats.arp_rx.inc();
        let packet = ArpPacket::parse(payload)?;
        let local = self.config.map(|c| (c.address, self.mac));
        if let Some(reply) = arp::process_arp(&packet, &mut self.arp_cache, local)? {
            let frame = FrameBuilder::new()
                .dst_mac(reply.target_mac)
                .src_mac(self.mac)
                .ethertype(EtherType::Arp as u16)
                .payload(&reply.to_bytes())
                .build();
            self.transmit(&frame)?;
        }
        Ok(())
    }

    fn handle_ipv4(&mut self, payload: &[u8]) -> Result<()> {
        self.stats.ipv4_rx.inc();
        let header = Ipv4Header::parse(payload)?;

        let total = header.total_length() as usize;
        if total < header.header_len() || total > payload.len() {
            return Err(Error::Parse("IPv4 total length out of range".into()));
        }
        if !header.validate_checksum() {
            return Err(Error::Protocol("IPv4 header checksum mismatch".into()));
        }

        let src = header.src_addr();
        let dst = header.dst_addr();
        // Ethernet padding may trail the datagram; trust the declared length
        let datagram = &payload[header.header_len()..total];

        match Protocol::from_u8(header.protocol()) {
            Some(Protocol::Icmp) => self.handle_icmp(src, dst, datagram),
            Some(Protocol::Udp) => self.handle_udp(src, dst, datagram),
            other => {
                debug!(protocol = header.protocol(), ?other, "dropping IPv4 protocol");
                self.stats.dropped.inc();
                Ok(())
            }
        }
    }

    /// Echo responder; only speaks for the configured address
    fn handle_icmp(&mut self, src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> Result<()> {
        let Some(config) = self.config else {
            debug!("dropping ICMP, interface unconfigured");
            self.stats.dropped.inc();
            return Ok(());
        };
        if dst != config.address {
            debug!(%dst, "dropping ICMP for foreign address");
            self.stats.dropped.inc();
            return Ok(());
        }

        let message = IcmpMessage::parse(datagram)?;
        if !message.validate_checksum() {
            return Err(Error::Protocol("ICMP checksum mismatch".into()));
        }

        if message.icmp_type() != IcmpType::EchoRequest as u8 || message.code() != 0 {
            debug!(
                icmp_type = message.icmp_type(),
                code = message.code(),
                "ignoring unhandled ICMP message"
            );
            self.stats.dropped.inc();
            return Ok(());
        }

        self.stats.icmp_echoes.inc();
        let reply = icmp::build_echo_reply(message.rest_of_header(), message.payload());
        self.send_ipv4(src, Protocol::Icmp, &reply)?;
        Ok(())
    }

    fn handle_udp(&mut self, src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> Result<()> {
        let header = UdpHeader::parse(datagram)?;
        self.stats.udp_rx.inc();

        let delivered = self.sockets.dispatch(
            dst,
            header.dst_port(),
            Datagram {
                src_addr: src,
                src_port: header.src_port(),
                payload: header.payload().to_vec(),
            },
        );
        if !delivered {
            debug!(port = header.dst_port(), "dropping UDP datagram for closed port");
            self.stats.udp_unmatched.inc();
        }
        Ok(())
    }

    /// Open a UDP socket bound to `local_addr` (the configured address or
    /// the wildcard) and `local_port` (0 picks an ephemeral port)
    pub fn open_udp(&mut self, local_addr: Ipv4Addr, local_port: u16) -> Result<SocketHandle> {
        self.sockets
            .open(local_addr, local_port, self.config.map(|c| c.address))
    }

    pub fn close_udp(&mut self, socket: SocketHandle) -> Result<()> {
        self.sockets.close(socket)
    }

    /// Take the next datagram queued on a socket
    pub fn recv_udp(&mut self, socket: SocketHandle) -> Result<Option<Datagram>> {
        self.sockets.recv(socket)
    }

    /// Build and send a UDP datagram from `socket` to the remote endpoint
    pub fn send_udp(
        &mut self,
        socket: SocketHandle,
        dst_addr: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<SendOutcome> {
        if payload.len() > MAX_UDP_PAYLOAD {
            return Err(Error::Config(format!(
                "UDP payload of {} bytes does not fit one frame",
                payload.len()
            )));
        }

        let src_port = self.sockets.local_port(socket)?;
        let datagram = UdpBuilder::new()
            .src_port(src_port)
            .dst_port(dst_port)
            .payload(payload)
            .build();
        self.send_ipv4(dst_addr, Protocol::Udp, &datagram)
    }

    /// Wrap `payload` in an IPv4 packet and transmit it, resolving the
    /// destination MAC first. A cache miss broadcasts an ARP request and
    /// drops the packet: there is no outbound queue, retry is the caller's
    /// job.
    pub fn send_ipv4(
        &mut self,
        dst: Ipv4Addr,
        protocol: Protocol,
        payload: &[u8],
    ) -> Result<SendOutcome> {
        if dst == Ipv4Addr::UNSPECIFIED {
            return Err(Error::Config(
                "cannot send to the unspecified address".into(),
            ));
        }

        let src = self
            .config
            .map(|c| c.address)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let dst_mac = if dst.is_broadcast() {
            MacAddr::BROADCAST
        } else {
            let next_hop = self.next_hop(dst)?;
            match self.arp_cache.lookup(next_hop) {
                Some(mac) => mac,
                None => {
                    debug!(%next_hop, "no ARP entry, dropping packet and resolving");
                    self.stats.arp_misses.inc();
                    self.arp_request(next_hop)?;
                    return Ok(SendOutcome::AwaitingArp);
                }
            }
        };

        let packet = Ipv4Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .protocol(protocol as u8)
            .payload(payload)
            .build();
        let frame = FrameBuilder::new()
            .dst_mac(dst_mac)
            .src_mac(self.mac)
            .ethertype(EtherType::Ipv4 as u16)
            .payload(&packet)
            .build();
        self.transmit(&frame)?;
        Ok(SendOutcome::Sent)
    }

    /// Next-hop selection: on-subnet destinations are reached directly,
    /// everything else goes through the gateway
    fn next_hop(&self, dst: Ipv4Addr) -> Result<Ipv4Addr> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("interface is not configured".into()))?;
        let mask = u32::from(config.netmask);
        if u32::from(dst) & mask == u32::from(config.address) & mask {
            Ok(dst)
        } else {
            config
                .gateway
                .ok_or_else(|| Error::Config("no gateway for off-subnet destination".into()))
        }
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        self.stats.frames_tx.inc();
        self.device.send(frame)
    }

    /// Negotiate a lease over UDP broadcast. Returns `None` when the host
    /// asked to quit before the handshake finished; the caller decides
    /// whether to `configure` with the result.
    pub fn negotiate_dhcp(&mut self, ctrl: &mut dyn DriveControl) -> Result<Option<Ipv4NetConfig>> {
        let socket = self.open_udp(Ipv4Addr::UNSPECIFIED, dhcp_proto::CLIENT_PORT)?;
        let mut client = DhcpClient::new(self.mac);

        let result = self.drive_dhcp(ctrl, &mut client, socket);
        self.close_udp(socket)?;
        result?;
        Ok(client.config())
    }

    fn drive_dhcp(
        &mut self,
        ctrl: &mut dyn DriveControl,
        client: &mut DhcpClient,
        socket: SocketHandle,
    ) -> Result<()> {
        let discover = client.discover();
        self.broadcast_dhcp(socket, &discover)?;

        while !client.finished() {
            if ctrl.should_quit() {
                info!("DHCP negotiation abandoned by host");
                return Ok(());
            }
            self.poll()?;
            while let Some(datagram) = self.recv_udp(socket)? {
                if let Some(reply) = client.on_datagram(&datagram.payload)? {
                    self.broadcast_dhcp(socket, &reply)?;
                }
                if client.finished() {
                    break;
                }
            }
            if let Some(retry) = client.tick() {
                self.broadcast_dhcp(socket, &retry)?;
            }
            ctrl.relax();
        }
        Ok(())
    }

    fn broadcast_dhcp(&mut self, socket: SocketHandle, message: &[u8]) -> Result<()> {
        self.send_udp(
            socket,
            Ipv4Addr::BROADCAST,
            dhcp_proto::SERVER_PORT,
            message,
        )?;
        Ok(())
    }

    /// Fetch `filename` from the TFTP server at `server`. Returns `None`
    /// when the host asked to quit before the transfer finished.
    pub fn tftp_read(
        &mut self,
        ctrl: &mut dyn DriveControl,
        server: Ipv4Addr,
        filename: &str,
    ) -> Result<Option<Vec<u8>>> {
        let socket = self.open_udp(Ipv4Addr::UNSPECIFIED, 0)?;
        let mut reader = TftpReader::new(server, filename);

        let finished = (|| -> Result<bool> {
            let rrq = reader.request();
            self.send_session_packet(socket, &rrq)?;

            while !reader.done() {
                if ctrl.should_quit() {
                    info!("TFTP read abandoned by host");
                    return Ok(false);
                }
                self.poll()?;
                while let Some(datagram) = self.recv_udp(socket)? {
                    let reply =
                        reader.on_datagram(datagram.src_addr, datagram.src_port, &datagram.payload)?;
                    if let Some(out) = reply {
                        self.send_session_packet(socket, &out)?;
                    }
                    if reader.done() {
                        break;
                    }
                }
                if !reader.done() {
                    if let Some(out) = reader.tick()? {
                        self.send_session_packet(socket, &out)?;
                    }
                }
                ctrl.relax();
            }
            Ok(true)
        })();

        self.close_udp(socket)?;
        if finished? {
            Ok(Some(reader.into_data()))
        } else {
            Ok(None)
        }
    }

    /// Store `data` as `filename` on the TFTP server at `server`. Returns
    /// false when the host asked to quit before the transfer finished.
    pub fn tftp_write(
        &mut self,
        ctrl: &mut dyn DriveControl,
        server: Ipv4Addr,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<bool> {
        let socket = self.open_udp(Ipv4Addr::UNSPECIFIED, 0)?;
        let mut writer = TftpWriter::new(server, filename, data);

        let finished = (|| -> Result<bool> {
            let wrq = writer.request();
            self.send_session_packet(socket, &wrq)?;

            while !writer.done() {
                if ctrl.should_quit() {
                    info!("TFTP write abandoned by host");
                    return Ok(false);
                }
                self.poll()?;
                while let Some(datagram) = self.recv_udp(socket)? {
                    let reply =
                        writer.on_datagram(datagram.src_addr, datagram.src_port, &datagram.payload)?;
                    if let Some(out) = reply {
                        self.send_session_packet(socket, &out)?;
                    }
                    if writer.done() {
                        break;
                    }
                }
                if !writer.done() {
                    if let Some(out) = writer.tick()? {
                        self.send_session_packet(socket, &out)?;
                    }
                }
                ctrl.relax();
            }
            Ok(true)
        })();

        self.close_udp(socket)?;
        finished
    }

    /// Serve files from `store` to TFTP clients until the host asks to
    /// quit or a client sends an unsupported request
    pub fn tftp_serve<S: FileStore>(
        &mut self,
        ctrl: &mut dyn DriveControl,
        store: S,
    ) -> Result<()> {
        let socket = self.open_udp(Ipv4Addr::UNSPECIFIED, TFTP_PORT)?;
        let mut server = TftpServer::new(store);

        let result = (|| -> Result<()> {
            loop {
                if ctrl.should_quit() {
                    info!("TFTP server shutting down");
                    return Ok(());
                }
                self.poll()?;
                while let Some(datagram) = self.recv_udp(socket)? {
                    let action =
                        server.on_datagram(datagram.src_addr, datagram.src_port, &datagram.payload)?;
                    match action {
                        ServerAction::Ignore => {}
                        ServerAction::Reply(out) => {
                            self.send_session_packet(socket, &out)?;
                        }
                        ServerAction::Stop(out) => {
                            self.send_session_packet(socket, &out)?;
                            return Ok(());
                        }
                    }
                }
                for out in server.tick() {
                    self.send_session_packet(socket, &out)?;
                }
                ctrl.relax();
            }
        })();

        self.close_udp(socket)?;
        result
    }

    fn send_session_packet(&mut self, socket: SocketHandle, out: &Outgoing) -> Result<()> {
        // AwaitingArp is fine here: the session countdown retransmits
        self.send_udp(socket, out.dst_addr, out.dst_port, &out.packet)?;
        Ok(())
    }
}
