//! Network device abstraction
//!
//! A device couples a driver (the thing that actually moves frames) with
//! the bookkeeping the stack needs: a name, a kind tag, MTU, hardware
//! addresses, an UP flag, and the per-family logical interfaces attached
//! to it. [`DeviceHandle`] is the cheap-clone handle passed around the
//! stack — into IRQ entries, ingress queue entries, and protocol
//! handlers.

use crate::error::{Error, Result};
use crate::iface::ethernet::MacAddr;
use crate::iface::ip::IpInterface;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, trace};

/// What sort of hardware a device emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ethernet,
    Loopback,
}

/// Address family of a logical interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
}

/// Driver contract implemented by each device backend.
///
/// `transmit` receives the raw payload plus EtherType and destination; how
/// (and whether) those become framing is the driver's business. All three
/// calls happen with the stack's device bookkeeping already done: `open`
/// before the UP flag is set, `transmit` only while UP, `close` after the
/// flag clears.
pub trait NetDriver: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn transmit(&self, ethertype: u16, payload: &[u8], dst: MacAddr) -> Result<()>;
}

struct DeviceInner {
    index: usize,
    name: String,
    kind: DeviceKind,
    mtu: usize,
    hw_addr: MacAddr,
    broadcast: MacAddr,
    up: AtomicBool,
    interfaces: RwLock<Vec<Arc<IpInterface>>>,
    driver: Box<dyn NetDriver>,
}

/// Shared handle to a registered device.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<DeviceInner>,
}

impl DeviceHandle {
    pub(crate) fn new(
        index: usize,
        kind: DeviceKind,
        mtu: usize,
        hw_addr: MacAddr,
        broadcast: MacAddr,
        driver: Box<dyn NetDriver>,
    ) -> Self {
        DeviceHandle {
            inner: Arc::new(DeviceInner {
                index,
                name: format!("net{}", index),
                kind,
                mtu,
                hw_addr,
                broadcast,
                up: AtomicBool::new(false),
                interfaces: RwLock::new(Vec::new()),
                driver,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.inner.kind
    }

    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    pub fn hw_addr(&self) -> MacAddr {
        self.inner.hw_addr
    }

    pub fn broadcast(&self) -> MacAddr {
        self.inner.broadcast
    }

    pub fn is_up(&self) -> bool {
        self.inner.up.load(Ordering::Acquire)
    }

    /// Open the underlying driver and mark the device UP.
    pub(crate) fn open(&self) -> Result<()> {
        if self.is_up() {
            return Err(Error::AlreadyUp(self.inner.name.clone()));
        }
        self.inner.driver.open()?;
        self.inner.up.store(true, Ordering::Release);
        info!(dev = %self.inner.name, "device up");
        Ok(())
    }

    /// Mark the device DOWN and close the underlying driver.
    pub(crate) fn close(&self) -> Result<()> {
        if !self.is_up() {
            return Err(Error::DeviceDown(self.inner.name.clone()));
        }
        self.inner.up.store(false, Ordering::Release);
        self.inner.driver.close()?;
        info!(dev = %self.inner.name, "device down");
        Ok(())
    }

    /// Transmit a payload through the device.
    ///
    /// Enforces the device contract: the device must be UP and the payload
    /// must fit the MTU, otherwise nothing reaches the driver.
    pub fn output(&self, ethertype: u16, payload: &[u8], dst: MacAddr) -> Result<()> {
        if !self.is_up() {
            return Err(Error::DeviceDown(self.inner.name.clone()));
        }
        if payload.len() > self.inner.mtu {
            return Err(Error::TooLong {
                dev: self.inner.name.clone(),
                mtu: self.inner.mtu,
                len: payload.len(),
            });
        }
        trace!(
            dev = %self.inner.name,
            ethertype = format_args!("0x{:04x}", ethertype),
            len = payload.len(),
            "device output"
        );
        self.inner.driver.transmit(ethertype, payload, dst)
    }

    /// Attach a logical interface. At most one interface per family may
    /// exist on a device.
    pub(crate) fn attach_interface(&self, iface: Arc<IpInterface>) -> Result<()> {
        let mut interfaces = self.inner.interfaces.write();
        if interfaces.iter().any(|i| i.family() == iface.family()) {
            return Err(Error::InterfaceExists(self.inner.name.clone()));
        }
        interfaces.push(iface);
        Ok(())
    }

    /// Look up the interface attached for `family`, if any.
    pub fn interface(&self, family: Family) -> Option<Arc<IpInterface>> {
        self.inner
            .interfaces
            .read()
            .iter()
            .find(|i| i.family() == family)
            .cloned()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("mtu", &self.inner.mtu)
            .field("hw_addr", &self.inner.hw_addr)
            .field("up", &self.is_up())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn null_device(mtu: usize) -> DeviceHandle {
        DeviceHandle::new(
            0,
            DeviceKind::Ethernet,
            mtu,
            MacAddr([0x02, 0, 0, 0, 0, 1]),
            MacAddr::BROADCAST,
            Box::new(NullDriver),
        )
    }

    #[test]
    fn test_transmit_requires_up() {
        let dev = null_device(1500);
        let err = dev.output(0x0800, &[0u8; 64], MacAddr::BROADCAST).unwrap_err();
        assert!(matches!(err, Error::DeviceDown(_)));

        dev.open().unwrap();
        dev.output(0x0800, &[0u8; 64], MacAddr::BROADCAST).unwrap();
    }

    #[test]
    fn test_transmit_rejects_oversize() {
        let dev = null_device(1500);
        dev.open().unwrap();
        let err = dev
            .output(0x0800, &vec![0u8; 1600], MacAddr::BROADCAST)
            .unwrap_err();
        assert!(matches!(err, Error::TooLong { len: 1600, mtu: 1500, .. }));
    }

    #[test]
    fn test_double_open_rejected() {
        let dev = null_device(1500);
        dev.open().unwrap();
        assert!(matches!(dev.open(), Err(Error::AlreadyUp(_))));
        dev.close().unwrap();
        assert!(matches!(dev.close(), Err(Error::DeviceDown(_))));
    }
}
