//! A userspace TCP/IP stack on top of a Linux TAP device
//!
//! This library provides a self-contained networking core:
//! - A single event thread dispatching device IRQs, deferred protocol
//!   work (softirqs), periodic timers and subscribed events
//! - ARP neighbor resolution with a bounded cache
//! - IPv4 datagram processing with ICMP echo handling
//! - UDP and TCP with a blocking, cancellable socket surface
//! - Device abstraction with TAP and loopback backends
//!
//! Applications build a [`NetStack`], attach devices and interfaces,
//! call [`NetStack::run`], and talk through [`UdpSocket`] /
//! [`TcpSocket`]. All protocol work runs serialized on the event thread;
//! user threads block only inside cancellable waits.

pub mod config;
pub mod error;
pub mod event;
pub mod iface;
pub mod logging;
pub mod network;
pub mod sched;
pub mod stack;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::StackConfig;
pub use error::{Error, Result};
pub use event::{IrqTrigger, IRQ_BASE};
pub use iface::device::{DeviceHandle, DeviceKind, Family, NetDriver};
pub use iface::ethernet::MacAddr;
pub use iface::ip::IpInterface;
pub use iface::loopback::LoopbackDevice;
pub use iface::tap::TapDevice;
pub use network::arp::{ArpResolver, Resolution};
pub use network::icmp::IcmpHeader;
pub use network::ipv4::Ipv4Header;
pub use stack::NetStack;
pub use transport::tcp::{TcpSocket, TcpState};
pub use transport::udp::{UdpDatagram, UdpSocket};
