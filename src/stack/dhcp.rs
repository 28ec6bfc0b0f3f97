//! DHCP client state machine
//!
//! Drives the three-step lease negotiation over UDP broadcast. A stall at
//! any point restarts the whole handshake from DISCOVER; replies that do
//! not structurally match the negotiation are treated as protocol
//! violations, since the server is required to sit on the same segment.

use crate::protocol::dhcp::{
    options, BootpOp, DhcpBuilder, DhcpHeader, DhcpMessageType, FLAG_BROADCAST,
};
use crate::protocol::MacAddr;
use crate::stack::Ipv4NetConfig;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Poll cycles to wait for a reply before restarting the handshake
pub const RETRANSMIT_TIMEOUT: u32 = 50;

/// Subnet mask assumed when the server does not send option 1
const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Negotiation states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    WaitForOffer,
    WaitForAck,
    Finished,
}

/// One lease negotiation
#[derive(Debug)]
pub struct DhcpClient {
    /// Fixed for the lifetime of the negotiation, restarts included
    xid: u32,
    mac: MacAddr,
    state: DhcpState,
    offered_addr: Option<Ipv4Addr>,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
    server_id: Option<Ipv4Addr>,
    countdown: u32,
}

impl DhcpClient {
    pub fn new(mac: MacAddr) -> Self {
        Self {
            xid: generate_xid(),
            mac,
            state: DhcpState::WaitForOffer,
            offered_addr: None,
            netmask: DEFAULT_NETMASK,
            gateway: None,
            server_id: None,
            countdown: RETRANSMIT_TIMEOUT,
        }
    }

    pub fn state(&self) -> DhcpState {
        self.state
    }

    pub fn finished(&self) -> bool {
        self.state == DhcpState::Finished
    }

    /// The negotiated configuration, available once finished
    pub fn config(&self) -> Option<Ipv4NetConfig> {
        if self.state != DhcpState::Finished {
            return None;
        }
        self.offered_addr.map(|address| Ipv4NetConfig {
            address,
            netmask: self.netmask,
            gateway: self.gateway,
        })
    }

    /// Build the DISCOVER message and (re)enter `WaitForOffer`
    pub fn discover(&mut self) -> Vec<u8> {
        debug!(xid = self.xid, "sending DHCPDISCOVER");
        self.state = DhcpState::WaitForOffer;
        self.offered_addr = None;
        self.netmask = DEFAULT_NETMASK;
        self.gateway = None;
        self.server_id = None;
        self.countdown = RETRANSMIT_TIMEOUT;

        DhcpBuilder::new()
            .op(BootpOp::Request)
            .xid(self.xid)
            .flags(FLAG_BROADCAST)
            .chaddr(self.mac)
            .message_type(DhcpMessageType::Discover)
            .parameter_request_list(&[options::SUBNET_MASK, options::ROUTER])
            .build()
    }

    /// Count down one poll cycle. Reaching zero restarts the whole
    /// handshake, whatever state it was in; the returned message must be
    /// rebroadcast by the caller.
    pub fn tick(&mut self) -> Option<Vec<u8>> {
        if self.state == DhcpState::Finished {
            return None;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return None;
        }
        warn!(state = ?self.state, "DHCP negotiation stalled, restarting from DISCOVER");
        Some(self.discover())
    }

    /// Feed one datagram received on the client port. Returns the next
    /// message to broadcast, if the state machine advanced to one.
    pub fn on_datagram(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.state == DhcpState::Finished {
            return Ok(None);
        }

        let msg = DhcpHeader::parse(payload)?;
        self.check_reply_shape(&msg)?;

        match self.state {
            DhcpState::WaitForOffer => self.handle_offer(&msg).map(Some),
            DhcpState::WaitForAck => self.handle_ack(&msg).map(|_| None),
            DhcpState::Finished => Ok(None),
        }
    }

    /// Structural checks common to every reply in this negotiation
    fn check_reply_shape(&self, msg: &DhcpHeader) -> Result<()> {
        if BootpOp::from_u8(msg.op()) != Some(BootpOp::Reply) {
            return Err(Error::Protocol("DHCP reply has wrong BOOTP op".into()));
        }
        if msg.xid() != self.xid {
            return Err(Error::Protocol(format!(
                "DHCP reply for transaction {:#010x}, ours is {:#010x}",
                msg.xid(),
                self.xid
            )));
        }
        if msg.client_mac() != self.mac {
            return Err(Error::Protocol("DHCP reply for another client".into()));
        }
        if msg.giaddr() != Ipv4Addr::UNSPECIFIED {
            // A relayed reply means the server is not on our segment
            return Err(Error::Protocol("DHCP reply came through a relay".into()));
        }
        Ok(())
    }

    fn handle_offer(&mut self, msg: &DhcpHeader) -> Result<Vec<u8>> {
        match msg.message_type()? {
            Some(DhcpMessageType::Offer) => {}
            other => {
                return Err(Error::Protocol(format!(
                    "expected DHCPOFFER, got {:?}",
                    other
                )))
            }
        }

        for opt in msg.iter_options() {
            match opt.code {
                options::MESSAGE_TYPE
                | options::SUBNET_MASK
                | options::ROUTER
                | options::SERVER_ID
                | options::DNS_SERVER
                | options::LEASE_TIME
                | options::BROADCAST_ADDR => {}
                code => debug!(code, "ignoring unknown DHCP option"),
            }
        }

        let offered = msg.yiaddr();
        self.offered_addr = Some(offered);
        self.netmask = msg
            .ip_option(options::SUBNET_MASK)?
            .unwrap_or(DEFAULT_NETMASK);
        self.gateway = msg
            .ip_list_option(options::ROUTER)?
            .and_then(|routers| routers.first().copied());
        self.server_id = msg.ip_option(options::SERVER_ID)?;
        // Validated for well-formedness, values unused
        msg.ip_list_option(options::DNS_SERVER)?;
        msg.u32_option(options::LEASE_TIME)?;
        msg.ip_option(options::BROADCAST_ADDR)?;

        info!(address = %offered, netmask = %self.netmask, gateway = ?self.gateway,
              "received DHCPOFFER");

        self.state = DhcpState::WaitForAck;
        self.countdown = RETRANSMIT_TIMEOUT;

        let mut builder = DhcpBuilder::new()
            .op(BootpOp::Request)
            .xid(self.xid)
            .flags(FLAG_BROADCAST)
            .chaddr(self.mac)
            .message_type(DhcpMessageType::Request)
            .requested_ip(offered);
        if let Some(server) = self.server_id {
            builder = builder.server_id(server);
        }
        Ok(builder.build())
    }

    fn handle_ack(&mut self, msg: &DhcpHeader) -> Result<()> {
        match msg.message_type()? {
            Some(DhcpMessageType::Ack) => {}
            other => {
                return Err(Error::Protocol(format!(
                    "expected DHCPACK, got {:?}",
                    other
                )))
            }
        }

        if Some(msg.yiaddr()) != self.offered_addr {
            return Err(Error::Protocol(format!(
                "DHCPACK confirms {} instead of the offered address",
                msg.yiaddr()
            )));
        }

        info!(address = %msg.yiaddr(), "lease acknowledged");
        self.state = DhcpState::Finished;
        Ok(())
    }
}

/// Transaction IDs only need to distinguish concurrent negotiations on the
/// segment; a time-seeded LCG step is plenty
fn generate_xid() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    seed.wrapping_mul(1103515245).wrapping_add(12345)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::dhcp::MAGIC_COOKIE;

    const MAC: MacAddr = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

    struct ReplyParams {
        msg_type: u8,
        xid: u32,
        yiaddr: Ipv4Addr,
        mask: Option<Ipv4Addr>,
        router: Option<Ipv4Addr>,
        server: Option<Ipv4Addr>,
        giaddr: Ipv4Addr,
    }

    impl ReplyParams {
        fn offer(xid: u32) -> Self {
            Self {
                msg_type: 2,
                xid,
                yiaddr: Ipv4Addr::new(192, 168, 1, 50),
                mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
                router: Some(Ipv4Addr::new(192, 168, 1, 1)),
                server: Some(Ipv4Addr::new(192, 168, 1, 1)),
                giaddr: Ipv4Addr::UNSPECIFIED,
            }
        }

        fn ack(xid: u32) -> Self {
            Self {
                msg_type: 5,
                ..Self::offer(xid)
            }
        }
    }

    fn make_reply(params: &ReplyParams) -> Vec<u8> {
        let mut msg = vec![0u8; 300];
        msg[0] = 2; // BOOTREPLY
        msg[1] = 1;
        msg[2] = 6;
        msg[4..8].copy_from_slice(&params.xid.to_be_bytes());
        msg[16..20].copy_from_slice(&params.yiaddr.octets());
        msg[24..28].copy_from_slice(&params.giaddr.octets());
        msg[28..34].copy_from_slice(&MAC.0);
        msg[236..240].copy_from_slice(&MAGIC_COOKIE);

        let mut pos = 240;
        msg[pos] = options::MESSAGE_TYPE;
        msg[pos + 1] = 1;
        msg[pos + 2] = params.msg_type;
        pos += 3;
        if let Some(mask) = params.mask {
            msg[pos] = options::SUBNET_MASK;
            msg[pos + 1] = 4;
            msg[pos + 2..pos + 6].copy_from_slice(&mask.octets());
            pos += 6;
        }
        if let Some(router) = params.router {
            msg[pos] = options::ROUTER;
            msg[pos + 1] = 4;
            msg[pos + 2..pos + 6].copy_from_slice(&router.octets());
            pos += 6;
        }
        if let Some(server) = params.server {
            msg[pos] = options::SERVER_ID;
            msg[pos + 1] = 4;
            msg[pos + 2..pos + 6].copy_from_slice(&server.octets());
            pos += 6;
        }
        msg[pos] = options::END;
        msg
    }

    fn started_client() -> (DhcpClient, u32) {
        let mut client = DhcpClient::new(MAC);
        let discover = client.discover();
        let xid = DhcpHeader::parse(&discover).unwrap().xid();
        (client, xid)
    }

    #[test]
    fn test_full_handshake() {
        let (mut client, xid) = started_client();
        assert_eq!(client.state(), DhcpState::WaitForOffer);

        let request = client
            .on_datagram(&make_reply(&ReplyParams::offer(xid)))
            .unwrap()
            .expect("OFFER must produce a REQUEST");
        assert_eq!(client.state(), DhcpState::WaitForAck);

        let parsed = DhcpHeader::parse(&request).unwrap();
        assert_eq!(
            parsed.message_type().unwrap(),
            Some(DhcpMessageType::Request)
        );
        assert!(parsed.is_broadcast());
        assert_eq!(
            parsed.ip_option(options::REQUESTED_IP).unwrap(),
            Some(Ipv4Addr::new(192, 168, 1, 50))
        );
        assert_eq!(
            parsed.ip_option(options::SERVER_ID).unwrap(),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );

        let out = client
            .on_datagram(&make_reply(&ReplyParams::ack(xid)))
            .unwrap();
        assert!(out.is_none());
        assert!(client.finished());

        let config = client.config().unwrap();
        assert_eq!(config.address, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_offer_without_mask_defaults_to_slash_24() {
        let (mut client, xid) = started_client();
        let mut params = ReplyParams::offer(xid);
        params.mask = None;
        params.router = None;
        client.on_datagram(&make_reply(&params)).unwrap();

        let mut ack = ReplyParams::ack(xid);
        ack.mask = None;
        ack.router = None;
        client.on_datagram(&make_reply(&ack)).unwrap();

        let config = client.config().unwrap();
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.gateway, None);
    }

    #[test]
    fn test_wrong_xid_is_fatal() {
        let (mut client, xid) = started_client();
        let reply = make_reply(&ReplyParams::offer(xid.wrapping_add(1)));
        assert!(client.on_datagram(&reply).is_err());
    }

    #[test]
    fn test_wrong_mac_is_fatal() {
        let (mut client, xid) = started_client();
        let mut reply = make_reply(&ReplyParams::offer(xid));
        reply[28] ^= 0xFF;
        assert!(client.on_datagram(&reply).is_err());
    }

    #[test]
    fn test_relayed_reply_is_fatal() {
        let (mut client, xid) = started_client();
        let mut params = ReplyParams::offer(xid);
        params.giaddr = Ipv4Addr::new(10, 9, 9, 9);
        assert!(client.on_datagram(&make_reply(&params)).is_err());
    }

    #[test]
    fn test_wrong_message_type_is_fatal() {
        let (mut client, xid) = started_client();
        let mut params = ReplyParams::offer(xid);
        params.msg_type = 5; // ACK while waiting for OFFER
        assert!(client.on_datagram(&make_reply(&params)).is_err());
    }

    #[test]
    fn test_ack_for_other_address_is_fatal() {
        let (mut client, xid) = started_client();
        client
            .on_datagram(&make_reply(&ReplyParams::offer(xid)))
            .unwrap();

        let mut params = ReplyParams::ack(xid);
        params.yiaddr = Ipv4Addr::new(192, 168, 1, 99);
        assert!(client.on_datagram(&make_reply(&params)).is_err());
    }

    #[test]
    fn test_timeout_restarts_from_discover() {
        let (mut client, xid) = started_client();
        client
            .on_datagram(&make_reply(&ReplyParams::offer(xid)))
            .unwrap();
        assert_eq!(client.state(), DhcpState::WaitForAck);

        // A stall while waiting for the ACK restarts the whole handshake
        let mut resent = None;
        for _ in 0..RETRANSMIT_TIMEOUT {
            resent = client.tick();
        }
        let resent = resent.expect("countdown expiry must rebroadcast DISCOVER");
        let parsed = DhcpHeader::parse(&resent).unwrap();
        assert_eq!(
            parsed.message_type().unwrap(),
            Some(DhcpMessageType::Discover)
        );
        assert_eq!(parsed.xid(), xid);
        assert_eq!(client.state(), DhcpState::WaitForOffer);
        assert_eq!(client.config(), None);
    }

    #[test]
    fn test_tick_before_timeout_stays_quiet() {
        let (mut client, _) = started_client();
        for _ in 0..RETRANSMIT_TIMEOUT - 1 {
            assert!(client.tick().is_none());
        }
    }

    #[test]
    fn test_finished_ignores_traffic_and_ticks() {
        let (mut client, xid) = started_client();
        client
            .on_datagram(&make_reply(&ReplyParams::offer(xid)))
            .unwrap();
        client
            .on_datagram(&make_reply(&ReplyParams::ack(xid)))
            .unwrap();
        assert!(client.finished());

        assert!(client.tick().is_none());
        let out = client
            .on_datagram(&make_reply(&ReplyParams::ack(xid)))
            .unwrap();
        assert!(out.is_none());
    }
}
