//! Shared test harness: a recording Ethernet device and stack builders.

mod scenarios;

use crate::config::StackConfig;
use crate::error::Result;
use crate::iface::device::{DeviceHandle, DeviceKind, NetDriver};
use crate::iface::ethernet::MacAddr;
use crate::iface::ip::IpInterface;
use crate::network::arp::{ArpMessage, ARP_OP_REPLY, ARP_OP_REQUEST};
use crate::stack::NetStack;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const OUR_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub(crate) const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
pub(crate) const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Frames captured from a mock device: (ethertype, payload, destination).
pub(crate) type Frames = Arc<Mutex<Vec<(u16, Vec<u8>, MacAddr)>>>;

pub(crate) struct MockDriver {
    pub frames: Frames,
}

impl NetDriver for MockDriver {
    fn open(&self) -> Result<()> {
        Ok(())
    }
    fn close(&self) -> Result<()> {
        Ok(())
    }
    fn transmit(&self, ethertype: u16, payload: &[u8], dst: MacAddr) -> Result<()> {
        self.frames.lock().push((ethertype, payload.to_vec(), dst));
        Ok(())
    }
}

/// Stack with one mock Ethernet device, opened directly (no event
/// thread). Suited to tests that drive handlers by direct call.
pub(crate) fn mock_stack_with(
    config: StackConfig,
) -> (NetStack, DeviceHandle, Arc<IpInterface>, Frames) {
    let (stack, dev, iface, frames) = build(config);
    dev.open().unwrap();
    (stack, dev, iface, frames)
}

pub(crate) fn mock_stack() -> (NetStack, DeviceHandle, Arc<IpInterface>, Frames) {
    mock_stack_with(StackConfig::default())
}

/// Stack with one mock Ethernet device, left closed so that `run()` can
/// open it. Suited to tests that exercise the event thread.
pub(crate) fn unopened_stack() -> (NetStack, DeviceHandle, Arc<IpInterface>, Frames) {
    build(StackConfig::default())
}

fn build(config: StackConfig) -> (NetStack, DeviceHandle, Arc<IpInterface>, Frames) {
    let stack = NetStack::new(config).unwrap();
    let frames: Frames = Arc::new(Mutex::new(Vec::new()));
    let dev = stack
        .register_device(
            DeviceKind::Ethernet,
            1500,
            OUR_MAC,
            MacAddr::BROADCAST,
            Box::new(MockDriver {
                frames: frames.clone(),
            }),
        )
        .unwrap();
    let iface = stack.attach_interface(&dev, OUR_IP, NETMASK).unwrap();
    (stack, dev, iface, frames)
}

/// A free-standing interface on an unregistered, closed device. Segment
/// emissions through it fail, which state-machine tests tolerate.
pub(crate) fn loose_iface(addr: Ipv4Addr) -> Arc<IpInterface> {
    let dev = DeviceHandle::new(
        0,
        DeviceKind::Ethernet,
        1500,
        OUR_MAC,
        MacAddr::BROADCAST,
        Box::new(MockDriver {
            frames: Arc::new(Mutex::new(Vec::new())),
        }),
    );
    Arc::new(IpInterface::new(dev, addr, NETMASK))
}

pub(crate) fn arp_reply(sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) -> Vec<u8> {
    ArpMessage {
        op: ARP_OP_REPLY,
        sha,
        spa,
        tha,
        tpa,
    }
    .to_bytes()
    .to_vec()
}

pub(crate) fn arp_request(sha: MacAddr, spa: Ipv4Addr, tpa: Ipv4Addr) -> Vec<u8> {
    ArpMessage {
        op: ARP_OP_REQUEST,
        sha,
        spa,
        tha: MacAddr::ZERO,
        tpa,
    }
    .to_bytes()
    .to_vec()
}

/// Poll `predicate` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
