//! The stack context
//!
//! [`NetStack`] concentrates everything that was once process-global:
//! the device list, the protocol registry with its ingress FIFOs, the
//! timer list, event subscriptions, and IRQ registrations, plus the
//! protocol modules themselves (ARP, IPv4, ICMP, UDP, TCP). Handles are
//! cheap clones of one shared context, so tests can run as many isolated
//! stacks as they like.
//!
//! Lifecycle: [`NetStack::new`] wires the protocol modules in dependency
//! order; the `register_*`/`attach_*`/`subscribe_*` calls populate the
//! registries; [`NetStack::run`] starts the event thread and opens every
//! device; [`NetStack::shutdown`] closes devices and joins. Registration
//! is forbidden once `run` has been called — afterwards the registries
//! are read-only and the event thread walks them without contention.

use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::event::{
    self, IrqEntry, IrqHandler, IrqTrigger, IRQ_BASE, IRQ_EVENT, IRQ_SHUTDOWN, IRQ_SOFTIRQ,
};
use crate::iface::device::{DeviceHandle, DeviceKind, NetDriver};
use crate::iface::ethernet::{MacAddr, ETHER_TYPE_ARP, ETHER_TYPE_IP};
use crate::iface::ip::IpInterface;
use crate::network::arp::{self, ArpResolver};
use crate::network::icmp;
use crate::network::ipv4::{
    Ipv4Module, IP_PROTOCOL_ICMP, IP_PROTOCOL_TCP, IP_PROTOCOL_UDP,
};
use crate::transport::tcp::TcpModule;
use crate::transport::udp::UdpModule;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Handler invoked on the event thread for each ingress queue entry of a
/// registered EtherType.
pub type ProtocolHandler = Box<dyn Fn(&NetStack, &[u8], &DeviceHandle) + Send + Sync>;

/// Periodic callback run on the event thread.
pub type TimerCallback = Box<dyn Fn(&NetStack) + Send + Sync>;

/// Event subscription callback run on the event thread.
pub type EventCallback = Box<dyn Fn(&NetStack) + Send + Sync>;

struct QueueEntry {
    dev: DeviceHandle,
    data: Vec<u8>,
}

struct ProtocolEntry {
    ethertype: u16,
    name: String,
    queue: Mutex<VecDeque<QueueEntry>>,
    handler: ProtocolHandler,
}

struct TimerEntry {
    interval: Duration,
    last: Mutex<Instant>,
    handler: TimerCallback,
}

struct EventEntry {
    handler: EventCallback,
}

struct StackInner {
    config: StackConfig,
    devices: RwLock<Vec<DeviceHandle>>,
    protocols: RwLock<Vec<Arc<ProtocolEntry>>>,
    timers: RwLock<Vec<Arc<TimerEntry>>>,
    events: RwLock<Vec<Arc<EventEntry>>>,
    irqs: RwLock<Vec<Arc<IrqEntry>>>,
    /// Set by `run()`, never cleared; gates the registration surface.
    started: AtomicBool,
    /// Set by `run()`, cleared by `shutdown()`.
    running: AtomicBool,
    trigger: IrqTrigger,
    notifications: Mutex<Option<Receiver<u32>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    ticker_thread: Mutex<Option<JoinHandle<()>>>,
    ticker_running: Arc<AtomicBool>,
    arp: ArpResolver,
    ip: Ipv4Module,
    udp: UdpModule,
    tcp: TcpModule,
}

/// Handle to one protocol stack instance.
#[derive(Clone)]
pub struct NetStack {
    inner: Arc<StackInner>,
}

impl NetStack {
    /// Build a stack and wire the built-in protocols in dependency order:
    /// ARP and IPv4 at the Ethernet level, then ICMP, TCP and UDP above
    /// IPv4, the ARP and TCP timers, and the shutdown-cancellation event
    /// subscriptions.
    pub fn new(config: StackConfig) -> Result<NetStack> {
        let (tx, rx) = mpsc::channel();
        let arp = ArpResolver::new(config.arp_cache_size, config.arp_incomplete_timeout);
        let udp = UdpModule::new(config.udp_pcb_count);
        let tcp = TcpModule::new(&config);
        let inner = Arc::new(StackInner {
            devices: RwLock::new(Vec::new()),
            protocols: RwLock::new(Vec::new()),
            timers: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            irqs: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            trigger: IrqTrigger::new(tx),
            notifications: Mutex::new(Some(rx)),
            event_thread: Mutex::new(None),
            ticker_thread: Mutex::new(None),
            ticker_running: Arc::new(AtomicBool::new(false)),
            arp,
            ip: Ipv4Module::new(),
            udp,
            tcp,
            config,
        });
        let stack = NetStack { inner };

        stack.register_protocol(
            ETHER_TYPE_ARP,
            "arp",
            Box::new(|stack: &NetStack, data: &[u8], dev: &DeviceHandle| {
                stack.arp().input(data, dev);
            }),
        )?;
        stack.register_protocol(
            ETHER_TYPE_IP,
            "ip",
            Box::new(|stack: &NetStack, data: &[u8], dev: &DeviceHandle| {
                stack.ip().input(stack, data, dev);
            }),
        )?;

        stack.ip().register_protocol(IP_PROTOCOL_ICMP, "icmp", Box::new(icmp::input))?;
        stack.ip().register_protocol(
            IP_PROTOCOL_TCP,
            "tcp",
            Box::new(
                |stack: &NetStack,
                 payload: &[u8],
                 _datagram: &[u8],
                 src: Ipv4Addr,
                 dst: Ipv4Addr,
                 iface: &Arc<IpInterface>| {
                    stack.tcp().input(stack, payload, src, dst, iface);
                },
            ),
        )?;
        stack.ip().register_protocol(
            IP_PROTOCOL_UDP,
            "udp",
            Box::new(
                |stack: &NetStack,
                 payload: &[u8],
                 datagram: &[u8],
                 src: Ipv4Addr,
                 dst: Ipv4Addr,
                 iface: &Arc<IpInterface>| {
                    stack.udp().input(stack, payload, datagram, src, dst, iface);
                },
            ),
        )?;

        stack.register_timer(
            arp::ARP_TIMER_INTERVAL,
            Box::new(|stack: &NetStack| stack.arp().timer_handler()),
        )?;
        stack.register_timer(
            stack.config().tcp_retransmit_interval,
            Box::new(|stack: &NetStack| stack.tcp().timer_handler(stack)),
        )?;

        stack.subscribe_event(Box::new(|stack: &NetStack| stack.udp().event_handler()))?;
        stack.subscribe_event(Box::new(|stack: &NetStack| stack.tcp().event_handler()))?;

        info!("stack initialized");
        Ok(stack)
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.config
    }

    /// Handle for raising device IRQs toward the event thread.
    pub fn irq_trigger(&self) -> IrqTrigger {
        self.inner.trigger.clone()
    }

    pub fn arp(&self) -> &ArpResolver {
        &self.inner.arp
    }

    pub fn ip(&self) -> &Ipv4Module {
        &self.inner.ip
    }

    pub(crate) fn udp(&self) -> &UdpModule {
        &self.inner.udp
    }

    pub(crate) fn tcp(&self) -> &TcpModule {
        &self.inner.tcp
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    pub(crate) fn next_device_index(&self) -> usize {
        self.inner.devices.read().len()
    }

    /// Register a device backend. Legal only before `run()`.
    pub fn register_device(
        &self,
        kind: DeviceKind,
        mtu: usize,
        hw_addr: MacAddr,
        broadcast: MacAddr,
        driver: Box<dyn NetDriver>,
    ) -> Result<DeviceHandle> {
        self.ensure_not_started()?;
        let mut devices = self.inner.devices.write();
        let dev = DeviceHandle::new(devices.len(), kind, mtu, hw_addr, broadcast, driver);
        devices.push(dev.clone());
        info!(dev = %dev.name(), kind = ?kind, mtu, "device registered");
        Ok(dev)
    }

    /// Attach an IPv4 interface to a device. Legal only before `run()`;
    /// at most one interface per `(device, family)` pair.
    pub fn attach_interface(
        &self,
        dev: &DeviceHandle,
        unicast: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> Result<Arc<IpInterface>> {
        self.ensure_not_started()?;
        let iface = Arc::new(IpInterface::new(dev.clone(), unicast, netmask));
        dev.attach_interface(iface.clone())?;
        self.ip().register_interface(iface.clone());
        info!(dev = %dev.name(), unicast = %unicast, netmask = %netmask, "interface attached");
        Ok(iface)
    }

    /// Register an EtherType handler. Legal only before `run()`.
    pub fn register_protocol(
        &self,
        ethertype: u16,
        name: &str,
        handler: ProtocolHandler,
    ) -> Result<()> {
        self.ensure_not_started()?;
        let mut protocols = self.inner.protocols.write();
        if protocols.iter().any(|p| p.ethertype == ethertype) {
            return Err(Error::ProtocolExists(ethertype));
        }
        protocols.push(Arc::new(ProtocolEntry {
            ethertype,
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            handler,
        }));
        info!(
            name,
            ethertype = format_args!("0x{:04x}", ethertype),
            "protocol registered"
        );
        Ok(())
    }

    /// Register a periodic timer. Legal only before `run()`.
    pub fn register_timer(&self, interval: Duration, handler: TimerCallback) -> Result<()> {
        self.ensure_not_started()?;
        self.inner.timers.write().push(Arc::new(TimerEntry {
            interval,
            last: Mutex::new(Instant::now()),
            handler,
        }));
        info!(?interval, "timer registered");
        Ok(())
    }

    /// Subscribe to stack events. Legal only before `run()`.
    pub fn subscribe_event(&self, handler: EventCallback) -> Result<()> {
        self.ensure_not_started()?;
        self.inner.events.write().push(Arc::new(EventEntry { handler }));
        Ok(())
    }

    /// Register an IRQ handler. Legal only before `run()`. Handlers may
    /// share a number only when every registration on that number asks
    /// for sharing.
    pub fn request_irq(
        &self,
        irq: u32,
        name: &str,
        shared: bool,
        dev: DeviceHandle,
        handler: IrqHandler,
    ) -> Result<()> {
        self.ensure_not_started()?;
        if irq < IRQ_BASE {
            return Err(Error::IrqReserved(irq));
        }
        let mut irqs = self.inner.irqs.write();
        for entry in irqs.iter() {
            if entry.irq == irq && !(entry.shared && shared) {
                return Err(Error::IrqConflict(irq));
            }
        }
        irqs.push(Arc::new(IrqEntry {
            irq,
            name: name.to_string(),
            shared,
            dev,
            handler,
        }));
        info!(irq, name, shared, "irq registered");
        Ok(())
    }

    /// Ask the event thread to run the subscribed event callbacks.
    pub fn raise_event(&self) {
        self.inner.trigger.raise(IRQ_EVENT);
    }

    /// Hand a received payload to the protocol registered for `ethertype`.
    ///
    /// Called from device ISRs. Unknown EtherTypes are dropped without an
    /// error; a full FIFO drops the frame and reports it.
    pub fn input(&self, ethertype: u16, data: &[u8], dev: &DeviceHandle) -> Result<()> {
        let proto = self
            .inner
            .protocols
            .read_recursive()
            .iter()
            .find(|p| p.ethertype == ethertype)
            .cloned();
        let Some(proto) = proto else {
            trace!(
                dev = %dev.name(),
                ethertype = format_args!("0x{:04x}", ethertype),
                "unsupported protocol, dropped"
            );
            return Ok(());
        };
        {
            let mut queue = proto.queue.lock();
            if queue.len() >= self.inner.config.ingress_queue_depth {
                warn!(proto = %proto.name, "ingress queue full, frame dropped");
                return Err(Error::QueueFull(ethertype));
            }
            queue.push_back(QueueEntry {
                dev: dev.clone(),
                data: data.to_vec(),
            });
            trace!(
                proto = %proto.name,
                dev = %dev.name(),
                len = data.len(),
                depth = queue.len(),
                "queue pushed"
            );
        }
        self.inner.trigger.raise(IRQ_SOFTIRQ);
        Ok(())
    }

    /// Drain every protocol FIFO in registration order.
    ///
    /// Runs on the event thread. No stack locks are held while a handler
    /// executes.
    pub(crate) fn softirq_handler(&self) {
        let protocols: Vec<_> = self.inner.protocols.read_recursive().clone();
        for proto in protocols {
            loop {
                let entry = proto.queue.lock().pop_front();
                let Some(entry) = entry else {
                    break;
                };
                trace!(
                    proto = %proto.name,
                    dev = %entry.dev.name(),
                    len = entry.data.len(),
                    "queue popped"
                );
                (proto.handler)(self, &entry.data, &entry.dev);
            }
        }
    }

    /// Run every event subscription in registration order.
    pub(crate) fn event_handler(&self) {
        let events: Vec<_> = self.inner.events.read_recursive().clone();
        for event in events {
            (event.handler)(self);
        }
    }

    /// Walk the timer list, firing every timer whose interval has elapsed
    /// since it last fired. An overrun tick fires a timer once, not twice.
    pub(crate) fn timer_handler(&self) {
        let timers: Vec<_> = self.inner.timers.read_recursive().clone();
        for timer in timers {
            let now = Instant::now();
            let due = {
                let mut last = timer.last.lock();
                if now.duration_since(*last) >= timer.interval {
                    *last = now;
                    true
                } else {
                    false
                }
            };
            if due {
                (timer.handler)(self);
            }
        }
    }

    /// Dispatch a device IRQ to every handler registered on that number.
    pub(crate) fn irq_handler(&self, irq: u32) {
        let irqs: Vec<_> = self.inner.irqs.read_recursive().clone();
        for entry in irqs.iter().filter(|e| e.irq == irq) {
            trace!(irq, name = %entry.name, "irq dispatch");
            (entry.handler)(self, irq, &entry.dev);
        }
    }

    /// Start the event thread and the interval timer, then open every
    /// registered device. Returns once the event thread has reached its
    /// notification loop.
    pub fn run(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        self.inner.running.store(true, Ordering::Release);

        let notifications = self
            .inner
            .notifications
            .lock()
            .take()
            .ok_or(Error::InvalidState)?;
        let barrier = Arc::new(Barrier::new(2));
        let handle = {
            let stack = self.clone();
            let barrier = barrier.clone();
            thread::Builder::new()
                .name("tapstack-event".to_string())
                .spawn(move || event::event_loop(stack, notifications, barrier))?
        };
        barrier.wait();
        *self.inner.event_thread.lock() = Some(handle);

        self.inner.ticker_running.store(true, Ordering::Release);
        let ticker = {
            let trigger = self.inner.trigger.clone();
            let period = self.inner.config.timer_tick;
            let running = self.inner.ticker_running.clone();
            thread::Builder::new()
                .name("tapstack-timer".to_string())
                .spawn(move || event::ticker_loop(trigger, period, running))?
        };
        *self.inner.ticker_thread.lock() = Some(ticker);

        debug!("open all devices...");
        let devices: Vec<_> = self.inner.devices.read().clone();
        for dev in devices {
            dev.open()?;
        }
        debug!("running...");
        Ok(())
    }

    /// Close every device, stop the event thread and the interval timer.
    ///
    /// In-flight handlers run to completion before the event thread
    /// exits; no handler runs after this returns.
    pub fn shutdown(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Err(Error::NotRunning);
        }

        debug!("close all devices...");
        let devices: Vec<_> = self.inner.devices.read().clone();
        for dev in devices {
            if dev.is_up() {
                if let Err(err) = dev.close() {
                    error!(dev = %dev.name(), %err, "close failed");
                }
            }
        }

        self.inner.trigger.raise(IRQ_SHUTDOWN);
        if let Some(handle) = self.inner.event_thread.lock().take() {
            if handle.join().is_err() {
                error!("event thread panicked");
            }
        }

        self.inner.ticker_running.store(false, Ordering::Release);
        if let Some(handle) = self.inner.ticker_thread.lock().take() {
            if handle.join().is_err() {
                error!("ticker thread panicked");
            }
        }

        info!("shutdown complete");
        Ok(())
    }
}
