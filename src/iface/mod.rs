//! Device and interface layer
//!
//! This module holds everything between the wire and the network layer:
//! - Device abstraction and driver contract
//! - Ethernet II framing
//! - The TAP and loopback device backends
//! - IPv4 logical interfaces

pub mod device;
pub mod ethernet;
pub mod ip;
pub mod loopback;
pub mod tap;

// Re-export commonly used items
pub use device::{DeviceHandle, DeviceKind, Family, NetDriver};
pub use ethernet::MacAddr;
pub use ip::IpInterface;
pub use loopback::LoopbackDevice;
pub use tap::TapDevice;
