//! TCP (Transmission Control Protocol) implementation
//!
//! RFC 793 simplified: passive and active opens, in-order data transfer
//! with a fixed receive buffer, FIN teardown, and RST handling. Unacked
//! segments sit on a per-connection retransmission queue that a periodic
//! timer re-emits with exponential backoff; a segment outstanding past
//! the configured deadline resets the connection. No congestion control,
//! no TCP options (received options are skipped via the data offset).
//!
//! Blocking calls (`open`, `send`, `recv`) park the calling thread on the
//! connection's scheduler context; the event thread wakes it as segments
//! arrive.

use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::iface::ip::IpInterface;
use crate::network::ipv4::{IPV4_HEADER_MIN, IP_PROTOCOL_TCP};
use crate::sched::SchedCtx;
use crate::stack::NetStack;
use crate::transport::pseudo_header_checksum;
use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// TCP header length without options
pub const TCP_HEADER_MIN: usize = 20;

/// Receive buffer size per connection; also the advertised window.
const TCP_RX_BUF_MAX: usize = 65535;

/// How long a TIME-WAIT connection lingers before its slot is reclaimed.
const TCP_TIME_WAIT: Duration = Duration::from_secs(30);

/// Retransmission timeout ceiling.
const TCP_RTO_MAX: Duration = Duration::from_secs(60);

/// Fallback MSS when the route is unknown at send time.
const TCP_DEFAULT_MSS: usize = 536;

const EPHEMERAL_PORT_MIN: u16 = 49152;

const FLG_FIN: u16 = 0x0001;
const FLG_SYN: u16 = 0x0002;
const FLG_RST: u16 = 0x0004;
const FLG_PSH: u16 = 0x0008;
const FLG_ACK: u16 = 0x0010;

/// TCP connection states as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

/// TCP packet header structure
///
/// Represents the standard 20-byte TCP header as defined in RFC 793
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset_and_flags: u16, // Data offset (4 bits) + Reserved (3 bits) + Flags (9 bits)
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Parse a TCP header from a byte slice
    ///
    /// Returns None if the data is too short to contain a valid TCP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_MIN {
            return None;
        }

        Some(TcpHeader {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset_and_flags: u16::from_be_bytes([data[12], data[13]]),
            window_size: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
        })
    }

    /// Convert the TCP header to bytes
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_MIN] {
        let mut bytes = [0u8; TCP_HEADER_MIN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        bytes[12..14].copy_from_slice(&self.data_offset_and_flags.to_be_bytes());
        bytes[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }

    pub fn is_syn(&self) -> bool {
        (self.data_offset_and_flags & FLG_SYN) != 0
    }

    pub fn is_ack(&self) -> bool {
        (self.data_offset_and_flags & FLG_ACK) != 0
    }

    pub fn is_fin(&self) -> bool {
        (self.data_offset_and_flags & FLG_FIN) != 0
    }

    pub fn is_rst(&self) -> bool {
        (self.data_offset_and_flags & FLG_RST) != 0
    }

    pub fn is_psh(&self) -> bool {
        (self.data_offset_and_flags & FLG_PSH) != 0
    }

    /// Get the data offset (header length) in bytes
    pub fn data_offset(&self) -> usize {
        ((self.data_offset_and_flags >> 12) as usize) * 4
    }
}

/// `a < b` in sequence space.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `base <= seq < base + wnd` in sequence space.
fn wnd_contains(base: u32, wnd: u16, seq: u32) -> bool {
    seq.wrapping_sub(base) < wnd as u32
}

fn initial_sequence() -> u32 {
    // Clock-derived ISS; good enough without an RFC 6528 offset.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() >> 6) as u32)
        .unwrap_or(1)
}

#[derive(Debug, Default, Clone, Copy)]
struct SendVars {
    una: u32,
    nxt: u32,
    wnd: u16,
    wl1: u32,
    wl2: u32,
    iss: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct RecvVars {
    nxt: u32,
    wnd: u16,
    irs: u32,
}

struct RetransmitEntry {
    seq: u32,
    flags: u16,
    data: Vec<u8>,
    first: Instant,
    last: Instant,
    rto: Duration,
}

impl RetransmitEntry {
    /// Sequence space consumed by this segment.
    fn consumed(&self) -> u32 {
        self.data.len() as u32 + ((self.flags & (FLG_SYN | FLG_FIN) != 0) as u32)
    }
}

struct TcpPcb {
    state: TcpState,
    local: (Ipv4Addr, u16),
    foreign: (Ipv4Addr, u16),
    snd: SendVars,
    rcv: RecvVars,
    rx_buf: VecDeque<u8>,
    retransmit_queue: VecDeque<RetransmitEntry>,
    time_wait_since: Option<Instant>,
    /// Set when the owning socket is gone; a detached PCB in CLOSED is
    /// reclaimed by the timer walk.
    detached: bool,
    ctx: Arc<SchedCtx>,
}

impl TcpPcb {
    fn new(local: (Ipv4Addr, u16)) -> Self {
        TcpPcb {
            state: TcpState::Closed,
            local,
            foreign: (Ipv4Addr::UNSPECIFIED, 0),
            snd: SendVars::default(),
            rcv: RecvVars {
                nxt: 0,
                wnd: TCP_RX_BUF_MAX as u16,
                irs: 0,
            },
            rx_buf: VecDeque::new(),
            retransmit_queue: VecDeque::new(),
            time_wait_since: None,
            detached: false,
            ctx: Arc::new(SchedCtx::new()),
        }
    }

    /// True once every seq-consuming segment (including our FIN) is acked.
    fn all_acked(&self) -> bool {
        self.retransmit_queue.is_empty() && self.snd.una == self.snd.nxt
    }
}

/// Emit one segment. The checksum covers the pseudo-header.
fn output_segment(
    stack: &NetStack,
    local: (Ipv4Addr, u16),
    foreign: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u16,
    wnd: u16,
    payload: &[u8],
) -> Result<()> {
    let header = TcpHeader {
        src_port: local.1,
        dst_port: foreign.1,
        seq_number: seq,
        ack_number: ack,
        data_offset_and_flags: (((TCP_HEADER_MIN / 4) as u16) << 12) | flags,
        window_size: wnd,
        checksum: 0,
        urgent_ptr: 0,
    };
    let mut segment = Vec::with_capacity(TCP_HEADER_MIN + payload.len());
    segment.extend_from_slice(&header.to_bytes());
    segment.extend_from_slice(payload);
    let sum = pseudo_header_checksum(local.0, foreign.0, IP_PROTOCOL_TCP, &segment);
    BigEndian::write_u16(&mut segment[16..18], sum);
    trace!(
        src_port = local.1,
        dst = %foreign.0,
        dst_port = foreign.1,
        seq,
        ack,
        flags = format_args!("0x{:03x}", flags),
        len = payload.len(),
        "tcp output"
    );
    stack
        .ip()
        .output(stack, IP_PROTOCOL_TCP, &segment, local.0, foreign.0)
}

/// The TCP protocol module: PCB table, demux, state machine,
/// retransmission.
pub(crate) struct TcpModule {
    pcbs: Mutex<Vec<Option<TcpPcb>>>,
    initial_rto: Duration,
    retransmit_deadline: Duration,
}

impl TcpModule {
    pub(crate) fn new(config: &StackConfig) -> Self {
        TcpModule {
            pcbs: Mutex::new((0..config.tcp_pcb_count).map(|_| None).collect()),
            initial_rto: config.tcp_initial_rto,
            retransmit_deadline: config.tcp_retransmit_deadline,
        }
    }

    /// Send a segment from `pcb` and, if it consumes sequence space,
    /// queue it for retransmission. Emission failures (a next hop still
    /// resolving, say) are deferred to the retransmission timer rather
    /// than surfaced: the segment is already queued.
    fn pcb_output(&self, stack: &NetStack, pcb: &mut TcpPcb, flags: u16, payload: Vec<u8>) {
        let seq = pcb.snd.nxt;
        let ack = if flags & FLG_ACK != 0 { pcb.rcv.nxt } else { 0 };
        let result = output_segment(
            stack,
            pcb.local,
            pcb.foreign,
            seq,
            ack,
            flags,
            pcb.rcv.wnd,
            &payload,
        );
        if let Err(err) = result {
            debug!(%err, "tcp segment deferred to retransmission");
        }
        let consumed = payload.len() as u32 + ((flags & (FLG_SYN | FLG_FIN) != 0) as u32);
        if consumed > 0 {
            let now = Instant::now();
            pcb.retransmit_queue.push_back(RetransmitEntry {
                seq,
                flags,
                data: payload,
                first: now,
                last: now,
                rto: self.initial_rto,
            });
            pcb.snd.nxt = seq.wrapping_add(consumed);
        }
    }

    /// Send a pure ACK for the current receive state.
    fn send_ack(&self, stack: &NetStack, pcb: &TcpPcb) {
        if let Err(err) = output_segment(
            stack,
            pcb.local,
            pcb.foreign,
            pcb.snd.nxt,
            pcb.rcv.nxt,
            FLG_ACK,
            pcb.rcv.wnd,
            &[],
        ) {
            debug!(%err, "tcp ack not sent");
        }
    }

    fn ephemeral_port(pcbs: &[Option<TcpPcb>]) -> Result<u16> {
        for port in EPHEMERAL_PORT_MIN..=u16::MAX {
            let taken = pcbs
                .iter()
                .flatten()
                .any(|p| p.local.1 == port);
            if !taken {
                return Ok(port);
            }
        }
        Err(Error::AddrInUse(Ipv4Addr::UNSPECIFIED, 0))
    }

    /// RFC 793 OPEN: passive when `foreign` is None, active otherwise.
    /// Blocks until the connection is established or fails.
    pub(crate) fn open(
        &self,
        stack: &NetStack,
        local: (Ipv4Addr, u16),
        foreign: Option<(Ipv4Addr, u16)>,
    ) -> Result<usize> {
        let mut pcbs = self.pcbs.lock();
        let index = pcbs
            .iter()
            .position(|p| p.is_none())
            .ok_or(Error::PcbExhausted)?;

        let mut pcb = TcpPcb::new(local);
        match foreign {
            None => {
                if local.1 == 0 {
                    return Err(Error::InvalidAddress(format!("{}:{}", local.0, local.1)));
                }
                let conflict = pcbs.iter().flatten().any(|p| {
                    p.state == TcpState::Listen
                        && p.local.1 == local.1
                        && (p.local.0.is_unspecified()
                            || local.0.is_unspecified()
                            || p.local.0 == local.0)
                });
                if conflict {
                    return Err(Error::AddrInUse(local.0, local.1));
                }
                pcb.state = TcpState::Listen;
                debug!(addr = %local.0, port = local.1, "tcp listen");
            }
            Some(remote) => {
                let src = if local.0.is_unspecified() {
                    stack
                        .ip()
                        .route_lookup(remote.0)
                        .ok_or(Error::NoRoute(remote.0))?
                        .unicast()
                } else {
                    local.0
                };
                let port = if local.1 == 0 {
                    Self::ephemeral_port(&pcbs)?
                } else {
                    local.1
                };
                pcb.local = (src, port);
                pcb.foreign = remote;
                let iss = initial_sequence();
                pcb.snd.iss = iss;
                pcb.snd.una = iss;
                pcb.snd.nxt = iss;
                pcb.state = TcpState::SynSent;
                debug!(dst = %remote.0, port = remote.1, "tcp connect");
            }
        }
        let ctx = pcb.ctx.clone();
        pcbs[index] = Some(pcb);
        if foreign.is_some() {
            if let Some(pcb) = pcbs[index].as_mut() {
                self.pcb_output(stack, pcb, FLG_SYN, Vec::new());
            }
        }

        // Wait for the handshake to finish.
        loop {
            match pcbs[index].as_ref().map(|p| p.state) {
                Some(TcpState::Established) => return Ok(index),
                Some(TcpState::Closed) | None => {
                    pcbs[index] = None;
                    return Err(Error::ConnectionReset);
                }
                Some(_) => {}
            }
            if let Err(err) = ctx.sleep(&mut pcbs, None) {
                pcbs[index] = None;
                return Err(err);
            }
        }
    }

    /// Queue application data for transmission, segmenting to the MSS and
    /// respecting the peer's window. Blocks while the window is full.
    pub(crate) fn send(&self, stack: &NetStack, id: usize, data: &[u8]) -> Result<()> {
        let mut pcbs = self.pcbs.lock();
        let ctx = pcbs[id]
            .as_ref()
            .ok_or(Error::InvalidState)?
            .ctx
            .clone();
        let mss = {
            let pcb = pcbs[id].as_ref().ok_or(Error::InvalidState)?;
            stack
                .ip()
                .route_lookup(pcb.foreign.0)
                .map(|iface| iface.device().mtu() - IPV4_HEADER_MIN - TCP_HEADER_MIN)
                .unwrap_or(TCP_DEFAULT_MSS)
        };

        let mut offset = 0;
        while offset < data.len() {
            let Some(pcb) = pcbs[id].as_mut() else {
                return Err(Error::ConnectionReset);
            };
            match pcb.state {
                TcpState::Established | TcpState::CloseWait => {}
                TcpState::Closed => return Err(Error::ConnectionReset),
                _ => return Err(Error::InvalidState),
            }
            let in_flight = pcb.snd.nxt.wrapping_sub(pcb.snd.una) as usize;
            let wnd = pcb.snd.wnd as usize;
            if in_flight >= wnd {
                ctx.sleep(&mut pcbs, None)?;
                continue;
            }
            let len = (data.len() - offset).min(mss).min(wnd - in_flight);
            let last = offset + len == data.len();
            let flags = FLG_ACK | if last { FLG_PSH } else { 0 };
            let chunk = data[offset..offset + len].to_vec();
            self.pcb_output(stack, pcb, flags, chunk);
            offset += len;
        }
        Ok(())
    }

    /// Receive buffered data, blocking until something arrives, the peer
    /// closes (empty result), or the timeout passes.
    pub(crate) fn recv(&self, id: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pcbs = self.pcbs.lock();
        let ctx = pcbs[id]
            .as_ref()
            .ok_or(Error::InvalidState)?
            .ctx
            .clone();
        loop {
            let Some(pcb) = pcbs[id].as_mut() else {
                return Err(Error::ConnectionReset);
            };
            if !pcb.rx_buf.is_empty() {
                let out: Vec<u8> = pcb.rx_buf.drain(..).collect();
                pcb.rcv.wnd = (TCP_RX_BUF_MAX - pcb.rx_buf.len()) as u16;
                return Ok(out);
            }
            match pcb.state {
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
                TcpState::CloseWait
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait => return Ok(Vec::new()), // EOF
                TcpState::Closed => return Err(Error::ConnectionReset),
                _ => return Err(Error::InvalidState),
            }
            ctx.sleep(&mut pcbs, deadline)?;
        }
    }

    /// RFC 793 CLOSE: send a FIN where the state calls for one.
    pub(crate) fn close(&self, stack: &NetStack, id: usize) -> Result<()> {
        let mut pcbs = self.pcbs.lock();
        let Some(pcb) = pcbs[id].as_mut() else {
            return Err(Error::InvalidState);
        };
        match pcb.state {
            TcpState::Listen | TcpState::SynSent => {
                pcb.ctx.interrupt();
                pcbs[id] = None;
            }
            TcpState::SynRcvd | TcpState::Established => {
                self.pcb_output(stack, pcb, FLG_FIN | FLG_ACK, Vec::new());
                pcb.state = TcpState::FinWait1;
            }
            TcpState::CloseWait => {
                self.pcb_output(stack, pcb, FLG_FIN | FLG_ACK, Vec::new());
                pcb.state = TcpState::LastAck;
            }
            _ => {}
        }
        Ok(())
    }

    /// Protocol handler for received segments. Runs on the event thread.
    pub(crate) fn input(
        &self,
        stack: &NetStack,
        payload: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        _iface: &Arc<IpInterface>,
    ) {
        let Some(header) = TcpHeader::from_bytes(payload) else {
            warn!(len = payload.len(), "tcp: dropped short segment");
            return;
        };
        let offset = header.data_offset();
        if offset < TCP_HEADER_MIN || offset > payload.len() {
            warn!("tcp: bad data offset, dropped");
            return;
        }
        if pseudo_header_checksum(src, dst, IP_PROTOCOL_TCP, payload) != 0 {
            warn!(src = %src, "tcp: bad checksum, dropped");
            return;
        }
        let data = &payload[offset..];
        trace!(
            src = %src,
            src_port = header.src_port,
            dst_port = header.dst_port,
            seq = header.seq_number,
            ack = header.ack_number,
            len = data.len(),
            "tcp input"
        );

        let mut pcbs = self.pcbs.lock();
        // Exact connection match first, then a listener.
        let index = pcbs
            .iter()
            .position(|p| {
                p.as_ref().is_some_and(|p| {
                    p.local.1 == header.dst_port
                        && p.foreign == (src, header.src_port)
                        && (p.local.0 == dst || p.local.0.is_unspecified())
                })
            })
            .or_else(|| {
                pcbs.iter().position(|p| {
                    p.as_ref().is_some_and(|p| {
                        p.state == TcpState::Listen
                            && p.local.1 == header.dst_port
                            && (p.local.0.is_unspecified() || p.local.0 == dst)
                    })
                })
            });

        let Some(index) = index else {
            drop(pcbs);
            self.reset_for_closed(stack, &header, data.len(), src, dst);
            return;
        };
        if let Some(pcb) = pcbs[index].as_mut() {
            self.segment_arrives(stack, pcb, &header, data, src, dst);
        }
    }

    /// RFC 793 CLOSED-state handling: answer anything but an RST with an
    /// RST so the peer gives up quickly.
    fn reset_for_closed(
        &self,
        stack: &NetStack,
        header: &TcpHeader,
        data_len: usize,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) {
        if header.is_rst() {
            return;
        }
        let local = (dst, header.dst_port);
        let foreign = (src, header.src_port);
        let result = if header.is_ack() {
            output_segment(stack, local, foreign, header.ack_number, 0, FLG_RST, 0, &[])
        } else {
            let seg_len =
                data_len as u32 + header.is_syn() as u32 + header.is_fin() as u32;
            output_segment(
                stack,
                local,
                foreign,
                0,
                header.seq_number.wrapping_add(seg_len),
                FLG_RST | FLG_ACK,
                0,
                &[],
            )
        };
        if let Err(err) = result {
            debug!(%err, "tcp: rst not sent");
        }
    }

    /// The RFC 793 SEGMENT ARRIVES event, simplified to in-order delivery.
    fn segment_arrives(
        &self,
        stack: &NetStack,
        pcb: &mut TcpPcb,
        header: &TcpHeader,
        data: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) {
        let seg_len = data.len() as u32 + header.is_syn() as u32 + header.is_fin() as u32;

        match pcb.state {
            TcpState::Listen => {
                if header.is_rst() {
                    return;
                }
                if header.is_ack() {
                    self.reset_for_closed(stack, header, data.len(), src, dst);
                    return;
                }
                if header.is_syn() {
                    pcb.local.0 = dst;
                    pcb.foreign = (src, header.src_port);
                    pcb.rcv.irs = header.seq_number;
                    pcb.rcv.nxt = header.seq_number.wrapping_add(1);
                    let iss = initial_sequence();
                    pcb.snd.iss = iss;
                    pcb.snd.una = iss;
                    pcb.snd.nxt = iss;
                    pcb.snd.wnd = header.window_size;
                    pcb.snd.wl1 = header.seq_number;
                    pcb.snd.wl2 = 0;
                    self.pcb_output(stack, pcb, FLG_SYN | FLG_ACK, Vec::new());
                    pcb.state = TcpState::SynRcvd;
                    debug!(peer = %src, port = header.src_port, "tcp: LISTEN -> SYN_RCVD");
                }
                return;
            }
            TcpState::SynSent => {
                if header.is_ack()
                    && (seq_le(header.ack_number, pcb.snd.iss)
                        || seq_lt(pcb.snd.nxt, header.ack_number))
                {
                    if !header.is_rst() {
                        self.reset_for_closed(stack, header, data.len(), src, dst);
                    }
                    return;
                }
                if header.is_rst() {
                    if header.is_ack() {
                        debug!(peer = %src, "tcp: connection refused");
                        pcb.state = TcpState::Closed;
                        pcb.retransmit_queue.clear();
                        pcb.ctx.wakeup();
                    }
                    return;
                }
                if header.is_syn() {
                    pcb.rcv.irs = header.seq_number;
                    pcb.rcv.nxt = header.seq_number.wrapping_add(1);
                    if header.is_ack() {
                        pcb.snd.una = header.ack_number;
                        let una = pcb.snd.una;
                        pcb.retransmit_queue
                            .retain(|e| seq_lt(una, e.seq.wrapping_add(e.consumed())));
                    }
                    if seq_lt(pcb.snd.iss, pcb.snd.una) {
                        pcb.state = TcpState::Established;
                        pcb.snd.wnd = header.window_size;
                        pcb.snd.wl1 = header.seq_number;
                        pcb.snd.wl2 = header.ack_number;
                        self.send_ack(stack, pcb);
                        pcb.ctx.wakeup();
                        debug!(peer = %src, "tcp: SYN_SENT -> ESTABLISHED");
                    } else {
                        // Simultaneous open.
                        pcb.state = TcpState::SynRcvd;
                        self.send_ack(stack, pcb);
                    }
                }
                return;
            }
            _ => {}
        }

        // First: is the segment acceptable in our receive window?
        let acceptable = match (seg_len, pcb.rcv.wnd) {
            (0, 0) => header.seq_number == pcb.rcv.nxt,
            (0, _) => wnd_contains(pcb.rcv.nxt, pcb.rcv.wnd, header.seq_number),
            (_, 0) => false,
            (_, _) => {
                wnd_contains(pcb.rcv.nxt, pcb.rcv.wnd, header.seq_number)
                    || wnd_contains(
                        pcb.rcv.nxt,
                        pcb.rcv.wnd,
                        header.seq_number.wrapping_add(seg_len - 1),
                    )
            }
        };
        if !acceptable {
            if !header.is_rst() {
                self.send_ack(stack, pcb);
            }
            return;
        }

        if header.is_rst() {
            debug!(peer = %src, state = ?pcb.state, "tcp: reset");
            pcb.state = TcpState::Closed;
            pcb.retransmit_queue.clear();
            pcb.ctx.wakeup();
            return;
        }
        if header.is_syn() {
            // SYN in the window is an error.
            pcb.state = TcpState::Closed;
            pcb.retransmit_queue.clear();
            pcb.ctx.wakeup();
            return;
        }
        if !header.is_ack() {
            return;
        }

        // ACK processing.
        if pcb.state == TcpState::SynRcvd {
            if seq_le(pcb.snd.una, header.ack_number) && seq_le(header.ack_number, pcb.snd.nxt) {
                pcb.state = TcpState::Established;
                pcb.snd.wnd = header.window_size;
                pcb.snd.wl1 = header.seq_number;
                pcb.snd.wl2 = header.ack_number;
                pcb.ctx.wakeup();
                debug!(peer = %src, "tcp: SYN_RCVD -> ESTABLISHED");
            } else {
                self.reset_for_closed(stack, header, data.len(), src, dst);
                return;
            }
        }

        if seq_lt(pcb.snd.una, header.ack_number) && seq_le(header.ack_number, pcb.snd.nxt) {
            pcb.snd.una = header.ack_number;
            let una = pcb.snd.una;
            pcb.retransmit_queue
                .retain(|e| seq_lt(una, e.seq.wrapping_add(e.consumed())));
            if seq_lt(pcb.snd.wl1, header.seq_number)
                || (pcb.snd.wl1 == header.seq_number && seq_le(pcb.snd.wl2, header.ack_number))
            {
                pcb.snd.wnd = header.window_size;
                pcb.snd.wl1 = header.seq_number;
                pcb.snd.wl2 = header.ack_number;
            }
            pcb.ctx.wakeup();
        } else if seq_lt(pcb.snd.nxt, header.ack_number) {
            // Ack for data we never sent.
            self.send_ack(stack, pcb);
            return;
        }

        match pcb.state {
            TcpState::FinWait1 => {
                if pcb.all_acked() {
                    pcb.state = TcpState::FinWait2;
                }
            }
            TcpState::Closing => {
                if pcb.all_acked() {
                    pcb.state = TcpState::TimeWait;
                    pcb.time_wait_since = Some(Instant::now());
                    pcb.ctx.wakeup();
                }
            }
            TcpState::LastAck => {
                if pcb.all_acked() {
                    pcb.state = TcpState::Closed;
                    pcb.ctx.wakeup();
                }
                return;
            }
            _ => {}
        }

        // Payload processing: in-order only; anything else provokes a
        // duplicate ACK that tells the peer where we are.
        if !data.is_empty()
            && matches!(
                pcb.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            )
        {
            if header.seq_number == pcb.rcv.nxt {
                let space = TCP_RX_BUF_MAX - pcb.rx_buf.len();
                let take = data.len().min(space);
                pcb.rx_buf.extend(&data[..take]);
                pcb.rcv.nxt = header.seq_number.wrapping_add(take as u32);
                pcb.rcv.wnd = (TCP_RX_BUF_MAX - pcb.rx_buf.len()) as u16;
                pcb.ctx.wakeup();
            }
            self.send_ack(stack, pcb);
        }

        // FIN processing, again in-order only.
        if header.is_fin() {
            let fin_seq = header.seq_number.wrapping_add(data.len() as u32);
            if fin_seq == pcb.rcv.nxt {
                pcb.rcv.nxt = fin_seq.wrapping_add(1);
                self.send_ack(stack, pcb);
                match pcb.state {
                    TcpState::Established => {
                        pcb.state = TcpState::CloseWait;
                        pcb.ctx.wakeup();
                        debug!(peer = %src, "tcp: ESTABLISHED -> CLOSE_WAIT");
                    }
                    TcpState::FinWait1 => {
                        if pcb.all_acked() {
                            pcb.state = TcpState::TimeWait;
                            pcb.time_wait_since = Some(Instant::now());
                        } else {
                            pcb.state = TcpState::Closing;
                        }
                        pcb.ctx.wakeup();
                    }
                    TcpState::FinWait2 => {
                        pcb.state = TcpState::TimeWait;
                        pcb.time_wait_since = Some(Instant::now());
                        pcb.ctx.wakeup();
                    }
                    _ => {}
                }
            }
        }
    }

    /// Retransmission walk, run off the stack's timer subsystem:
    /// re-emit overdue segments with doubled RTOs, reset connections that
    /// blew the deadline, reap finished PCBs.
    pub(crate) fn timer_handler(&self, stack: &NetStack) {
        let now = Instant::now();
        let mut pcbs = self.pcbs.lock();
        for slot in pcbs.iter_mut() {
            let Some(pcb) = slot.as_mut() else { continue };

            match pcb.state {
                TcpState::Closed => {
                    // Reclaim only once the socket is gone and nobody is
                    // parked on the context.
                    if pcb.detached && !pcb.ctx.has_waiters() {
                        *slot = None;
                    }
                    continue;
                }
                TcpState::TimeWait => {
                    if pcb
                        .time_wait_since
                        .is_some_and(|since| now.duration_since(since) >= TCP_TIME_WAIT)
                    {
                        pcb.state = TcpState::Closed;
                    }
                    continue;
                }
                _ => {}
            }

            let mut expired = false;
            for entry in pcb.retransmit_queue.iter_mut() {
                if now.duration_since(entry.first) >= self.retransmit_deadline {
                    expired = true;
                    break;
                }
                if now.duration_since(entry.last) >= entry.rto {
                    trace!(seq = entry.seq, rto = ?entry.rto, "tcp retransmit");
                    if let Err(err) = output_segment(
                        stack,
                        pcb.local,
                        pcb.foreign,
                        entry.seq,
                        pcb.rcv.nxt,
                        entry.flags,
                        pcb.rcv.wnd,
                        &entry.data,
                    ) {
                        debug!(%err, "tcp retransmit failed");
                    }
                    entry.last = now;
                    entry.rto = (entry.rto * 2).min(TCP_RTO_MAX);
                }
            }
            if expired {
                warn!(peer = %pcb.foreign.0, "tcp: retransmission deadline, connection aborted");
                pcb.state = TcpState::Closed;
                pcb.retransmit_queue.clear();
                pcb.ctx.wakeup();
            }
        }
    }

    /// Shutdown cancellation: kick every blocked caller.
    pub(crate) fn event_handler(&self) {
        let pcbs = self.pcbs.lock();
        for pcb in pcbs.iter().flatten() {
            pcb.ctx.interrupt();
        }
    }

    /// Release a PCB slot outright, waking anyone parked on it.
    pub(crate) fn release(&self, id: usize) {
        let mut pcbs = self.pcbs.lock();
        if let Some(pcb) = pcbs[id].as_ref() {
            pcb.ctx.interrupt();
        }
        pcbs[id] = None;
    }

    #[cfg(test)]
    pub(crate) fn pcb_state(&self, id: usize) -> Option<TcpState> {
        self.pcbs.lock()[id].as_ref().map(|p| p.state)
    }

    #[cfg(test)]
    pub(crate) fn pcb_vars(&self, id: usize) -> Option<(u32, u32)> {
        self.pcbs.lock()[id].as_ref().map(|p| (p.snd.nxt, p.rcv.nxt))
    }
}

/// A TCP connection bound to one stack instance.
///
/// Both constructors block until the three-way handshake completes:
/// [`TcpSocket::listen`] for a passive open, [`TcpSocket::connect`] for
/// an active one. Dropping the socket sends a FIN where the state calls
/// for one and releases the connection.
pub struct TcpSocket {
    stack: NetStack,
    id: usize,
}

impl TcpSocket {
    /// Passive open: wait for a peer to connect to `local`.
    pub fn listen(stack: &NetStack, local: (Ipv4Addr, u16)) -> Result<TcpSocket> {
        let id = stack.tcp().open(stack, local, None)?;
        Ok(TcpSocket {
            stack: stack.clone(),
            id,
        })
    }

    /// Active open: connect to `remote`.
    pub fn connect(stack: &NetStack, remote: (Ipv4Addr, u16)) -> Result<TcpSocket> {
        let id = stack
            .tcp()
            .open(stack, (Ipv4Addr::UNSPECIFIED, 0), Some(remote))?;
        Ok(TcpSocket {
            stack: stack.clone(),
            id,
        })
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.stack.tcp().send(&self.stack, self.id, data)
    }

    /// Receive available data. An empty result means the peer closed its
    /// side.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.stack.tcp().recv(self.id, timeout)
    }

    /// Close the connection. Equivalent to dropping the socket.
    pub fn close(self) {}
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        // Graceful close; the PCB lingers until the FIN handshake (or the
        // retransmission deadline) moves it to CLOSED, then the timer
        // walk reclaims the slot.
        let _ = self.stack.tcp().close(&self.stack, self.id);
        let mut pcbs = self.stack.tcp().pcbs.lock();
        if let Some(pcb) = pcbs.get_mut(self.id).and_then(|p| p.as_mut()) {
            pcb.detached = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use std::thread;

    #[test]
    fn test_header_roundtrip_and_flags() {
        let header = TcpHeader {
            src_port: 80,
            dst_port: 45000,
            seq_number: 0x01020304,
            ack_number: 0x05060708,
            data_offset_and_flags: (5 << 12) | FLG_SYN | FLG_ACK,
            window_size: 65535,
            checksum: 0,
            urgent_ptr: 0,
        };
        let parsed = TcpHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.src_port, 80);
        assert_eq!(parsed.seq_number, 0x01020304);
        assert!(parsed.is_syn());
        assert!(parsed.is_ack());
        assert!(!parsed.is_fin());
        assert!(!parsed.is_rst());
        assert_eq!(parsed.data_offset(), 20);
    }

    #[test]
    fn test_sequence_comparisons_wrap() {
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(!seq_lt(0x10, 0xffff_fff0));
        assert!(seq_le(5, 5));
        assert!(wnd_contains(0xffff_fff0, 0x100, 0x10));
        assert!(!wnd_contains(100, 10, 110));
    }

    fn segment(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u16,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = TcpHeader {
            src_port,
            dst_port,
            seq_number: seq,
            ack_number: ack,
            data_offset_and_flags: (5 << 12) | flags,
            window_size: 65535,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        let sum = pseudo_header_checksum(src, dst, IP_PROTOCOL_TCP, &bytes);
        BigEndian::write_u16(&mut bytes[16..18], sum);
        bytes
    }

    /// Walk a listener through SYN -> ACK -> data -> FIN entirely via the
    /// protocol handler. Segment emissions fail (there is no route), which
    /// the state machine must tolerate.
    #[test]
    fn test_passive_handshake_and_data() {
        let stack = NetStack::new(StackConfig::default()).unwrap();
        let local = Ipv4Addr::new(10, 0, 0, 1);
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let iface = crate::tests::loose_iface(local);

        let opener = {
            let stack = stack.clone();
            thread::spawn(move || stack.tcp().open(&stack, (local, 80), None))
        };
        // Wait for the listener PCB to appear.
        while stack.tcp().pcb_state(0) != Some(TcpState::Listen) {
            thread::sleep(Duration::from_millis(1));
        }

        // SYN from the peer.
        let syn = segment(45000, 80, 1000, 0, FLG_SYN, peer, local, &[]);
        stack.tcp().input(&stack, &syn, peer, local, &iface);
        assert_eq!(stack.tcp().pcb_state(0), Some(TcpState::SynRcvd));

        // ACK of our SYN|ACK completes the handshake.
        let (snd_nxt, rcv_nxt) = stack.tcp().pcb_vars(0).unwrap();
        assert_eq!(rcv_nxt, 1001);
        let ack = segment(45000, 80, 1001, snd_nxt, FLG_ACK, peer, local, &[]);
        stack.tcp().input(&stack, &ack, peer, local, &iface);

        let id = opener.join().unwrap().unwrap();
        assert_eq!(stack.tcp().pcb_state(id), Some(TcpState::Established));

        // In-order data lands in the receive buffer.
        let data = segment(45000, 80, 1001, snd_nxt, FLG_ACK | FLG_PSH, peer, local, b"hello");
        stack.tcp().input(&stack, &data, peer, local, &iface);
        let received = stack.tcp().recv(id, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(received, b"hello");

        // FIN moves us to CLOSE_WAIT and recv reports EOF.
        let fin = segment(45000, 80, 1006, snd_nxt, FLG_ACK | FLG_FIN, peer, local, &[]);
        stack.tcp().input(&stack, &fin, peer, local, &iface);
        assert_eq!(stack.tcp().pcb_state(id), Some(TcpState::CloseWait));
        let eof = stack.tcp().recv(id, Some(Duration::from_millis(100))).unwrap();
        assert!(eof.is_empty());
    }

    #[test]
    fn test_rst_aborts_connection() {
        let stack = NetStack::new(StackConfig::default()).unwrap();
        let local = Ipv4Addr::new(10, 0, 0, 1);
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let iface = crate::tests::loose_iface(local);

        let opener = {
            let stack = stack.clone();
            thread::spawn(move || stack.tcp().open(&stack, (local, 80), None))
        };
        while stack.tcp().pcb_state(0) != Some(TcpState::Listen) {
            thread::sleep(Duration::from_millis(1));
        }
        let syn = segment(45000, 80, 1000, 0, FLG_SYN, peer, local, &[]);
        stack.tcp().input(&stack, &syn, peer, local, &iface);

        let rst = segment(45000, 80, 1001, 0, FLG_RST, peer, local, &[]);
        stack.tcp().input(&stack, &rst, peer, local, &iface);

        let result = opener.join().unwrap();
        assert!(matches!(result, Err(Error::ConnectionReset)));
    }

    #[test]
    fn test_listen_conflict_rejected() {
        let stack = NetStack::new(StackConfig::default()).unwrap();
        let local = Ipv4Addr::new(10, 0, 0, 1);

        let _listener = {
            let stack = stack.clone();
            thread::spawn(move || stack.tcp().open(&stack, (local, 80), None))
        };
        while stack.tcp().pcb_state(0) != Some(TcpState::Listen) {
            thread::sleep(Duration::from_millis(1));
        }

        let second = {
            let stack = stack.clone();
            thread::spawn(move || stack.tcp().open(&stack, (local, 80), None))
        };
        let result = second.join().unwrap();
        assert!(matches!(result, Err(Error::AddrInUse(_, 80))));

        // Unblock the parked listener so the test exits cleanly.
        stack.tcp().release(0);
    }
}
