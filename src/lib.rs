//! Netpoll - Polling-driven IPv4 network stack
//!
//! A synchronous network stack for hosts without a scheduler: Ethernet
//! demultiplexing, ARP, IPv4, ICMP echo, UDP sockets, a DHCP client and a
//! TFTP client/server, all driven by a single poll entry point. Protocols
//! are implemented from scratch; waiting is tick-counted busy-polling, never
//! a blocking call.

pub mod config;
pub mod error;
pub mod protocol;
pub mod stack;
pub mod telemetry;

pub use error::{Error, Result};
