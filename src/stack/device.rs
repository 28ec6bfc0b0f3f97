//! Seams to the host environment
//!
//! The stack never touches hardware or the scheduler directly; it consumes
//! these two traits and nothing else.

use crate::protocol::MacAddr;
use crate::Result;

/// Network interface contract
///
/// Implementations wrap the actual NIC driver. `process_received` must hand
/// over at most `max` pending frames and return how many were delivered;
/// it must not block waiting for traffic.
pub trait Netif {
    fn hardware_address(&self) -> MacAddr;

    /// Transmit one Ethernet frame
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Drain up to `max` received frames into `sink`
    fn process_received(
        &mut self,
        max: usize,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<usize>;
}

/// Host control over a drive loop
///
/// `should_quit` is re-checked every round; `relax` is the cooperative
/// yield between rounds. The stack itself never yields.
pub trait DriveControl {
    fn should_quit(&mut self) -> bool;
    fn relax(&mut self);
}
