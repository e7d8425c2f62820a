//! Loopback device backend
//!
//! Transmitted payloads go onto an internal queue and come straight back
//! through the ingress path: `transmit` pushes and raises the device IRQ,
//! and the ISR re-injects each queued payload on the event thread. No
//! Ethernet framing is involved.

use crate::error::Result;
use crate::event::{IrqTrigger, IRQ_BASE};
use crate::iface::device::{DeviceHandle, DeviceKind, NetDriver};
use crate::iface::ethernet::MacAddr;
use crate::stack::NetStack;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, trace};

const LOOPBACK_MTU: usize = 65535;

struct LoopbackShared {
    queue: Mutex<VecDeque<(u16, Vec<u8>)>>,
    irq: u32,
    trigger: IrqTrigger,
}

struct LoopbackDriver {
    shared: Arc<LoopbackShared>,
}

/// Loopback device constructor; see [`LoopbackDevice::attach`].
pub struct LoopbackDevice;

impl LoopbackDevice {
    /// Register a loopback device on `stack`. Call before
    /// [`NetStack::run`].
    pub fn attach(stack: &NetStack) -> Result<DeviceHandle> {
        let irq = IRQ_BASE + stack.next_device_index() as u32;
        let shared = Arc::new(LoopbackShared {
            queue: Mutex::new(VecDeque::new()),
            irq,
            trigger: stack.irq_trigger(),
        });
        let dev = stack.register_device(
            DeviceKind::Loopback,
            LOOPBACK_MTU,
            MacAddr::ZERO,
            MacAddr::ZERO,
            Box::new(LoopbackDriver {
                shared: shared.clone(),
            }),
        )?;
        let isr_shared = shared.clone();
        stack.request_irq(
            irq,
            "loopback",
            true,
            dev.clone(),
            Box::new(move |stack: &NetStack, _irq: u32, dev: &DeviceHandle| {
                loop {
                    let entry = isr_shared.queue.lock().pop_front();
                    let Some((ethertype, data)) = entry else {
                        break;
                    };
                    if let Err(err) = stack.input(ethertype, &data, dev) {
                        trace!(dev = %dev.name(), %err, "loopback input dropped");
                    }
                }
            }),
        )?;
        info!(dev = %dev.name(), irq, "loopback device attached");
        Ok(dev)
    }
}

impl NetDriver for LoopbackDriver {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.queue.lock().clear();
        Ok(())
    }

    fn transmit(&self, ethertype: u16, payload: &[u8], _dst: MacAddr) -> Result<()> {
        self.shared
            .queue
            .lock()
            .push_back((ethertype, payload.to_vec()));
        self.shared.trigger.raise(self.shared.irq);
        Ok(())
    }
}
