//! IPv4 logical interface
//!
//! An [`IpInterface`] binds an IPv4 unicast address, netmask and broadcast
//! address to a device. A device carries at most one interface per
//! family; the pairing is enforced at attach time by
//! [`crate::NetStack::attach_interface`].

use crate::iface::device::{DeviceHandle, Family};
use std::net::Ipv4Addr;

/// IPv4 interface attached to a device.
#[derive(Debug)]
pub struct IpInterface {
    unicast: Ipv4Addr,
    netmask: Ipv4Addr,
    broadcast: Ipv4Addr,
    device: DeviceHandle,
}

impl IpInterface {
    pub(crate) fn new(device: DeviceHandle, unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let unicast_bits = u32::from(unicast);
        let netmask_bits = u32::from(netmask);
        let broadcast = Ipv4Addr::from((unicast_bits & netmask_bits) | !netmask_bits);
        IpInterface {
            unicast,
            netmask,
            broadcast,
            device,
        }
    }

    pub fn family(&self) -> Family {
        Family::Ipv4
    }

    pub fn unicast(&self) -> Ipv4Addr {
        self.unicast
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.broadcast
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// True if `addr` is the directed broadcast for this network or the
    /// limited broadcast.
    pub fn is_broadcast(&self, addr: Ipv4Addr) -> bool {
        addr == self.broadcast || addr.is_broadcast()
    }

    /// True if `addr` falls inside this interface's network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let netmask_bits = u32::from(self.netmask);
        (u32::from(addr) & netmask_bits) == (u32::from(self.unicast) & netmask_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::iface::device::{DeviceKind, NetDriver};
    use crate::iface::ethernet::MacAddr;

    struct NullDriver;

    impl NetDriver for NullDriver {
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
        fn transmit(&self, _ethertype: u16, _payload: &[u8], _dst: MacAddr) -> Result<()> {
            Ok(())
        }
    }

    fn test_iface() -> IpInterface {
        let dev = DeviceHandle::new(
            0,
            DeviceKind::Ethernet,
            1500,
            MacAddr([0x02, 0, 0, 0, 0, 1]),
            MacAddr::BROADCAST,
            Box::new(NullDriver),
        );
        IpInterface::new(
            dev,
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
    }

    #[test]
    fn test_broadcast_derivation() {
        let iface = test_iface();
        assert_eq!(iface.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_broadcast_detection() {
        let iface = test_iface();
        assert!(iface.is_broadcast(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(iface.is_broadcast(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!iface.is_broadcast(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[test]
    fn test_network_membership() {
        let iface = test_iface();
        assert!(iface.contains(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(!iface.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }
}
