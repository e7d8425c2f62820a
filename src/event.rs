//! Event thread and interrupt emulation
//!
//! One OS thread — the event thread — executes every protocol handler,
//! timer callback, event subscription and IRQ handler in the stack. It
//! waits on a FIFO notification channel carrying small integer tags:
//! the reserved tags below, or a device IRQ number at [`IRQ_BASE`] and
//! above. Device backends raise IRQs through an [`IrqTrigger`], the
//! portable stand-in for signal delivery.
//!
//! Within one notification, work runs to completion before the next
//! notification is accepted. No ordering is guaranteed between different
//! IRQ numbers beyond the channel's arrival order.

use crate::iface::device::DeviceHandle;
use crate::stack::NetStack;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Terminate the event thread.
pub(crate) const IRQ_SHUTDOWN: u32 = 0;
/// Drain the protocol ingress FIFOs.
pub(crate) const IRQ_SOFTIRQ: u32 = 1;
/// Run the subscribed event callbacks.
pub(crate) const IRQ_EVENT: u32 = 2;
/// Walk the timer list.
pub(crate) const IRQ_TIMER: u32 = 3;
/// First tag available to devices.
pub const IRQ_BASE: u32 = 4;

/// Handle for raising notifications toward the event thread.
///
/// Cloneable and cheap; device backends keep one around and raise their
/// IRQ from whatever thread detects readiness. Raising after shutdown is
/// a harmless no-op.
#[derive(Clone)]
pub struct IrqTrigger {
    tx: Sender<u32>,
}

impl IrqTrigger {
    pub(crate) fn new(tx: Sender<u32>) -> Self {
        IrqTrigger { tx }
    }

    pub fn raise(&self, irq: u32) {
        let _ = self.tx.send(irq);
    }
}

/// Handler invoked on the event thread when its IRQ number fires.
pub(crate) type IrqHandler = Box<dyn Fn(&NetStack, u32, &DeviceHandle) + Send + Sync>;

/// One registered IRQ.
pub(crate) struct IrqEntry {
    pub irq: u32,
    pub name: String,
    pub shared: bool,
    pub dev: DeviceHandle,
    pub handler: IrqHandler,
}

/// Body of the event thread.
///
/// Releases the startup barrier once the loop is reachable, then
/// dispatches notifications until the shutdown tag arrives. Pending
/// notifications behind the shutdown tag are discarded.
pub(crate) fn event_loop(stack: NetStack, notifications: Receiver<u32>, barrier: Arc<Barrier>) {
    debug!("event thread start");
    barrier.wait();
    while let Ok(irq) = notifications.recv() {
        match irq {
            IRQ_SHUTDOWN => break,
            IRQ_SOFTIRQ => stack.softirq_handler(),
            IRQ_EVENT => stack.event_handler(),
            IRQ_TIMER => stack.timer_handler(),
            irq => stack.irq_handler(irq),
        }
    }
    debug!("event thread terminated");
}

/// Body of the interval-timer thread: raise the timer tag every tick
/// until told to stop.
pub(crate) fn ticker_loop(trigger: IrqTrigger, period: Duration, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        thread::sleep(period);
        trigger.raise(IRQ_TIMER);
    }
    debug!("ticker terminated");
}
