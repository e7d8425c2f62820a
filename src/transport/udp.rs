//! UDP (User Datagram Protocol) implementation
//!
//! Codec plus a small protocol-control-block table. Each open PCB owns a
//! receive queue and a scheduler context; `recv_from` blocks on that
//! context until the event thread queues a datagram, the optional timeout
//! expires, or the wait is interrupted (socket closed, stack shutting
//! down). Datagrams for ports nobody listens on are answered with an
//! ICMP port-unreachable.

use crate::error::{Error, Result};
use crate::iface::ip::IpInterface;
use crate::network::icmp::{self, ICMP_CODE_PORT_UNREACH};
use crate::network::ipv4::{IPV4_HEADER_MIN, IP_PROTOCOL_UDP};
use crate::sched::SchedCtx;
use crate::stack::NetStack;
use crate::transport::pseudo_header_checksum;
use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// Largest payload a single datagram can carry.
const UDP_PAYLOAD_MAX: usize = u16::MAX as usize - IPV4_HEADER_MIN - UDP_HEADER_LEN;

/// Per-socket receive backlog cap.
const UDP_RX_QUEUE_MAX: usize = 64;

const EPHEMERAL_PORT_MIN: u16 = 49152;

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse a UDP header from a byte slice
    ///
    /// Returns None if the data is too short to contain a valid UDP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }

        Some(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    /// Convert the UDP header to bytes
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

/// A received datagram, as handed to the application.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub remote: (Ipv4Addr, u16),
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcbState {
    Free,
    Open,
}

struct UdpPcb {
    state: PcbState,
    local_addr: Ipv4Addr,
    local_port: u16,
    queue: VecDeque<UdpDatagram>,
    ctx: Arc<SchedCtx>,
}

impl UdpPcb {
    fn free() -> Self {
        UdpPcb {
            state: PcbState::Free,
            local_addr: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            queue: VecDeque::new(),
            ctx: Arc::new(SchedCtx::new()),
        }
    }
}

/// The UDP protocol module: PCB table plus demux.
pub(crate) struct UdpModule {
    pcbs: Mutex<Vec<UdpPcb>>,
}

impl UdpModule {
    pub(crate) fn new(pcb_count: usize) -> Self {
        UdpModule {
            pcbs: Mutex::new((0..pcb_count).map(|_| UdpPcb::free()).collect()),
        }
    }

    pub(crate) fn open(&self) -> Result<usize> {
        let mut pcbs = self.pcbs.lock();
        let index = pcbs
            .iter()
            .position(|p| p.state == PcbState::Free)
            .ok_or(Error::PcbExhausted)?;
        pcbs[index].state = PcbState::Open;
        Ok(index)
    }

    pub(crate) fn bind(&self, id: usize, addr: Ipv4Addr, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidAddress(format!("{}:{}", addr, port)));
        }
        let mut pcbs = self.pcbs.lock();
        if pcbs[id].state != PcbState::Open {
            return Err(Error::InvalidState);
        }
        let conflict = pcbs.iter().enumerate().any(|(i, p)| {
            i != id
                && p.state == PcbState::Open
                && p.local_port == port
                && (p.local_addr.is_unspecified()
                    || addr.is_unspecified()
                    || p.local_addr == addr)
        });
        if conflict {
            return Err(Error::AddrInUse(addr, port));
        }
        pcbs[id].local_addr = addr;
        pcbs[id].local_port = port;
        debug!(addr = %addr, port, "udp bind");
        Ok(())
    }

    /// Pick an unused port for an unbound sender.
    fn ephemeral_port(pcbs: &[UdpPcb], id: usize) -> Result<u16> {
        for port in EPHEMERAL_PORT_MIN..=u16::MAX {
            let taken = pcbs
                .iter()
                .enumerate()
                .any(|(i, p)| i != id && p.state == PcbState::Open && p.local_port == port);
            if !taken {
                return Ok(port);
            }
        }
        Err(Error::AddrInUse(Ipv4Addr::UNSPECIFIED, 0))
    }

    pub(crate) fn send_to(
        &self,
        stack: &NetStack,
        id: usize,
        data: &[u8],
        remote: (Ipv4Addr, u16),
    ) -> Result<()> {
        if data.len() > UDP_PAYLOAD_MAX {
            return Err(Error::TooLong {
                dev: "udp".to_string(),
                mtu: UDP_PAYLOAD_MAX,
                len: data.len(),
            });
        }
        let (local_addr, local_port) = {
            let mut pcbs = self.pcbs.lock();
            if pcbs[id].state != PcbState::Open {
                return Err(Error::InvalidState);
            }
            if pcbs[id].local_port == 0 {
                pcbs[id].local_port = Self::ephemeral_port(&pcbs, id)?;
            }
            (pcbs[id].local_addr, pcbs[id].local_port)
        };

        let src = if local_addr.is_unspecified() {
            stack
                .ip()
                .route_lookup(remote.0)
                .ok_or(Error::NoRoute(remote.0))?
                .unicast()
        } else {
            local_addr
        };

        let header = UdpHeader {
            src_port: local_port,
            dst_port: remote.1,
            length: (UDP_HEADER_LEN + data.len()) as u16,
            checksum: 0,
        };
        let mut packet = Vec::with_capacity(UDP_HEADER_LEN + data.len());
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(data);
        let mut sum = pseudo_header_checksum(src, remote.0, IP_PROTOCOL_UDP, &packet);
        if sum == 0 {
            // Zero means "no checksum" on the wire.
            sum = 0xFFFF;
        }
        BigEndian::write_u16(&mut packet[6..8], sum);

        trace!(src = %src, src_port = local_port, dst = %remote.0, dst_port = remote.1, len = data.len(), "udp output");
        stack
            .ip()
            .output(stack, IP_PROTOCOL_UDP, &packet, src, remote.0)
    }

    pub(crate) fn recv_from(
        &self,
        id: usize,
        timeout: Option<Duration>,
    ) -> Result<UdpDatagram> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pcbs = self.pcbs.lock();
        let ctx = pcbs[id].ctx.clone();
        loop {
            if pcbs[id].state != PcbState::Open {
                return Err(Error::InvalidState);
            }
            if let Some(datagram) = pcbs[id].queue.pop_front() {
                return Ok(datagram);
            }
            ctx.sleep(&mut pcbs, deadline)?;
        }
    }

    pub(crate) fn close(&self, id: usize) -> Result<()> {
        let mut pcbs = self.pcbs.lock();
        if pcbs[id].state != PcbState::Open {
            return Err(Error::InvalidState);
        }
        pcbs[id].ctx.interrupt();
        pcbs[id].state = PcbState::Free;
        pcbs[id].local_addr = Ipv4Addr::UNSPECIFIED;
        pcbs[id].local_port = 0;
        pcbs[id].queue.clear();
        Ok(())
    }

    /// Protocol handler for received datagrams. Runs on the event thread.
    pub(crate) fn input(
        &self,
        stack: &NetStack,
        payload: &[u8],
        datagram: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        iface: &Arc<IpInterface>,
    ) {
        let Some(header) = UdpHeader::from_bytes(payload) else {
            warn!(len = payload.len(), "udp: dropped short datagram");
            return;
        };
        if header.length as usize != payload.len() {
            warn!(
                length = header.length,
                actual = payload.len(),
                "udp: length mismatch, dropped"
            );
            return;
        }
        if header.checksum != 0
            && pseudo_header_checksum(src, dst, IP_PROTOCOL_UDP, payload) != 0
        {
            warn!(src = %src, "udp: bad checksum, dropped");
            return;
        }
        trace!(
            src = %src,
            src_port = header.src_port,
            dst_port = header.dst_port,
            len = payload.len() - UDP_HEADER_LEN,
            "udp input"
        );

        let mut pcbs = self.pcbs.lock();
        let index = pcbs.iter().position(|p| {
            p.state == PcbState::Open
                && p.local_port == header.dst_port
                && (p.local_addr.is_unspecified() || p.local_addr == dst)
        });
        match index {
            Some(index) => {
                let pcb = &mut pcbs[index];
                if pcb.queue.len() >= UDP_RX_QUEUE_MAX {
                    warn!(port = header.dst_port, "udp: receive queue full, dropped");
                    return;
                }
                pcb.queue.push_back(UdpDatagram {
                    remote: (src, header.src_port),
                    data: payload[UDP_HEADER_LEN..].to_vec(),
                });
                pcb.ctx.wakeup();
            }
            None => {
                drop(pcbs);
                debug!(port = header.dst_port, "udp: no socket");
                // Closed port: say so, unless the datagram was broadcast.
                if dst == iface.unicast() {
                    if let Err(err) = icmp::destination_unreachable(
                        stack,
                        ICMP_CODE_PORT_UNREACH,
                        datagram,
                        iface.unicast(),
                        src,
                    ) {
                        debug!(%err, "udp: port unreachable not sent");
                    }
                }
            }
        }
    }

    /// Shutdown cancellation: kick every blocked receiver.
    pub(crate) fn event_handler(&self) {
        let pcbs = self.pcbs.lock();
        for pcb in pcbs.iter().filter(|p| p.state == PcbState::Open) {
            pcb.ctx.interrupt();
        }
    }
}

/// A UDP socket bound to one stack instance.
///
/// Dropping the socket closes it and interrupts any thread blocked in
/// [`UdpSocket::recv_from`].
pub struct UdpSocket {
    stack: NetStack,
    id: usize,
}

impl UdpSocket {
    pub fn open(stack: &NetStack) -> Result<UdpSocket> {
        let id = stack.udp().open()?;
        Ok(UdpSocket {
            stack: stack.clone(),
            id,
        })
    }

    /// Bind to a local address and port. An unspecified address matches
    /// every interface.
    pub fn bind(&self, addr: Ipv4Addr, port: u16) -> Result<()> {
        self.stack.udp().bind(self.id, addr, port)
    }

    pub fn send_to(&self, data: &[u8], remote: (Ipv4Addr, u16)) -> Result<()> {
        self.stack.udp().send_to(&self.stack, self.id, data, remote)
    }

    /// Receive the next datagram, blocking up to `timeout` (forever when
    /// `None`). Cancellable: returns [`Error::Interrupted`] if the socket
    /// is closed or the stack raises the cancellation event.
    pub fn recv_from(&self, timeout: Option<Duration>) -> Result<UdpDatagram> {
        self.stack.udp().recv_from(self.id, timeout)
    }

    /// Close the socket. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let _ = self.stack.udp().close(self.id);
    }
}
