//! Linux TAP device backend
//!
//! Frames move through a `/dev/net/tun` file descriptor in TAP mode. A
//! per-device watcher thread stands in for the hardware interrupt line:
//! it polls the descriptor, raises the device IRQ when frames are
//! waiting, then parks until the ISR — running on the event thread — has
//! drained the descriptor with non-blocking reads. All protocol-visible
//! work therefore happens on the event thread, as for every other
//! device.
//!
//! The hardware address is supplied by the caller; the kernel side of the
//! TAP pair keeps its own.

use crate::error::{Error, Result};
use crate::event::{IrqTrigger, IRQ_BASE};
use crate::iface::device::{DeviceHandle, DeviceKind, NetDriver};
use crate::iface::ethernet::{self, MacAddr, ETHER_FRAME_MAX, ETHER_PAYLOAD_MAX};
use crate::sched::SchedCtx;
use crate::stack::NetStack;
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace};
use tun_tap::{Iface, Mode};

/// How long one watcher poll may block; bounds close() latency.
const WATCH_POLL_TIMEOUT_MS: i32 = 100;

/// Readiness check on a raw descriptor via poll(2).
fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    match ret {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(false),
        _ => Ok(pfd.revents & libc::POLLIN != 0),
    }
}

struct TapShared {
    ifname: String,
    mac: MacAddr,
    irq: u32,
    trigger: IrqTrigger,
    iface: Mutex<Option<Iface>>,
    up: AtomicBool,
    /// True from IRQ raise until the ISR has drained the descriptor.
    pending: Mutex<bool>,
    gate: SchedCtx,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct TapDriver {
    shared: Arc<TapShared>,
}

/// TAP device constructor; see [`TapDevice::attach`].
pub struct TapDevice;

impl TapDevice {
    /// Create the TAP interface `ifname`, register it as an Ethernet
    /// device on `stack`, and hook up its IRQ. Call before
    /// [`NetStack::run`]; the descriptor is opened when `run` opens the
    /// devices.
    pub fn attach(stack: &NetStack, ifname: &str, mac: MacAddr) -> Result<DeviceHandle> {
        let irq = IRQ_BASE + stack.next_device_index() as u32;
        let shared = Arc::new(TapShared {
            ifname: ifname.to_string(),
            mac,
            irq,
            trigger: stack.irq_trigger(),
            iface: Mutex::new(None),
            up: AtomicBool::new(false),
            pending: Mutex::new(false),
            gate: SchedCtx::new(),
            watcher: Mutex::new(None),
        });
        let dev = stack.register_device(
            DeviceKind::Ethernet,
            ETHER_PAYLOAD_MAX,
            mac,
            MacAddr::BROADCAST,
            Box::new(TapDriver {
                shared: shared.clone(),
            }),
        )?;
        let isr_shared = shared.clone();
        stack.request_irq(
            irq,
            &format!("tap:{}", ifname),
            true,
            dev.clone(),
            Box::new(move |stack: &NetStack, _irq: u32, dev: &DeviceHandle| {
                isr(&isr_shared, stack, dev);
            }),
        )?;
        info!(dev = %dev.name(), ifname, %mac, irq, "tap device attached");
        Ok(dev)
    }
}

/// Drain the descriptor on the event thread, then release the watcher.
fn isr(shared: &TapShared, stack: &NetStack, dev: &DeviceHandle) {
    loop {
        let guard = shared.iface.lock();
        let Some(iface) = guard.as_ref() else {
            break;
        };
        match poll_readable(iface.as_raw_fd(), 0) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!(ifname = %shared.ifname, %err, "tap poll failed");
                break;
            }
        }
        let mut buf = vec![0u8; ETHER_FRAME_MAX];
        let len = match iface.recv(&mut buf) {
            Ok(len) => len,
            Err(err) => {
                if err.kind() != io::ErrorKind::Interrupted
                    && err.kind() != io::ErrorKind::WouldBlock
                {
                    error!(ifname = %shared.ifname, %err, "tap read failed");
                }
                break;
            }
        };
        drop(guard);
        trace!(dev = %dev.name(), len, "tap frame received");
        ethernet::input_helper(stack, dev, &buf[..len]);
    }

    let mut pending = shared.pending.lock();
    *pending = false;
    shared.gate.wakeup();
}

/// Watcher thread body: poll for readiness, raise the IRQ, wait until
/// serviced.
fn watcher_loop(shared: Arc<TapShared>) {
    debug!(ifname = %shared.ifname, "tap watcher start");
    loop {
        if !shared.up.load(Ordering::Acquire) {
            break;
        }
        let fd = {
            let guard = shared.iface.lock();
            match guard.as_ref() {
                Some(iface) => iface.as_raw_fd(),
                None => break,
            }
        };
        match poll_readable(fd, WATCH_POLL_TIMEOUT_MS) {
            Ok(true) => {
                *shared.pending.lock() = true;
                shared.trigger.raise(shared.irq);
                let mut pending = shared.pending.lock();
                while *pending {
                    if shared.gate.sleep(&mut pending, None).is_err() {
                        debug!(ifname = %shared.ifname, "tap watcher interrupted");
                        return;
                    }
                }
            }
            Ok(false) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!(ifname = %shared.ifname, %err, "tap watcher poll failed");
                break;
            }
        }
    }
    debug!(ifname = %shared.ifname, "tap watcher terminated");
}

impl NetDriver for TapDriver {
    fn open(&self) -> Result<()> {
        let iface = Iface::without_packet_info(&self.shared.ifname, Mode::Tap)?;
        *self.shared.iface.lock() = Some(iface);
        self.shared.up.store(true, Ordering::Release);
        let watcher = {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name(format!("tapstack-{}", self.shared.ifname))
                .spawn(move || watcher_loop(shared))?
        };
        *self.shared.watcher.lock() = Some(watcher);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.up.store(false, Ordering::Release);
        {
            // Interrupt under the gate mutex so a watcher between its
            // pending-check and the park cannot miss the broadcast.
            let _pending = self.shared.pending.lock();
            self.shared.gate.interrupt();
        }
        if let Some(watcher) = self.shared.watcher.lock().take() {
            if watcher.join().is_err() {
                error!(ifname = %self.shared.ifname, "tap watcher panicked");
            }
        }
        self.shared.iface.lock().take();
        Ok(())
    }

    fn transmit(&self, ethertype: u16, payload: &[u8], dst: MacAddr) -> Result<()> {
        let guard = self.shared.iface.lock();
        let Some(iface) = guard.as_ref() else {
            return Err(Error::DeviceDown(self.shared.ifname.clone()));
        };
        ethernet::transmit_helper(self.shared.mac, ethertype, payload, dst, |frame| {
            iface.send(frame)
        })
    }
}
