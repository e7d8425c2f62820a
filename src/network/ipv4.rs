//! IPv4 protocol implementation
//!
//! Header codec plus the datagram engine: ingress validation and
//! dispatch to the registered IP protocols, and egress with on-link
//! routing over the attached interfaces, ARP resolution for the next
//! hop, and MTU enforcement. Datagrams never span fragments here —
//! anything fragmented on ingress is dropped, anything that would need
//! fragmenting on egress is rejected.

use crate::error::{Error, Result};
use crate::iface::device::{DeviceHandle, DeviceKind, Family};
use crate::iface::ethernet::{MacAddr, ETHER_TYPE_IP};
use crate::iface::ip::IpInterface;
use crate::network::arp::Resolution;
use crate::network::checksum;
use crate::stack::NetStack;
use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Minimum (and, on egress, only) IPv4 header length
pub const IPV4_HEADER_MIN: usize = 20;

/// IP protocol number: ICMP
pub const IP_PROTOCOL_ICMP: u8 = 1;
/// IP protocol number: TCP
pub const IP_PROTOCOL_TCP: u8 = 6;
/// IP protocol number: UDP
pub const IP_PROTOCOL_UDP: u8 = 17;

const IP_DEFAULT_TTL: u8 = 255;

/// IPv4 packet header structure
///
/// Represents the standard IPv4 header as defined in RFC 791
#[derive(Debug, Clone)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse an IPv4 header from a byte slice
    ///
    /// Returns None if the data is too short or the version field is not 4
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_MIN {
            return None;
        }

        let version = (data[0] & 0xF0) >> 4;
        if version != 4 {
            return None;
        }

        Some(Ipv4Header {
            version,
            ihl: data[0] & 0x0F,
            tos: data[1],
            total_len: BigEndian::read_u16(&data[2..4]),
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src: Ipv4Addr::from(u32::from_be_bytes(data[12..16].try_into().unwrap())),
            dst: Ipv4Addr::from(u32::from_be_bytes(data[16..20].try_into().unwrap())),
        })
    }

    /// Build an option-less header for an outgoing datagram. The checksum
    /// field is left zero; the egress path fills it in.
    pub fn new(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize, id: u16) -> Self {
        Ipv4Header {
            version: 4,
            ihl: (IPV4_HEADER_MIN / 4) as u8,
            tos: 0,
            total_len: (IPV4_HEADER_MIN + payload_len) as u16,
            id,
            flags_frag_offset: 0,
            ttl: IP_DEFAULT_TTL,
            protocol,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Convert the header to bytes (no options)
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_MIN] {
        let mut bytes = [0u8; IPV4_HEADER_MIN];
        bytes[0] = (self.version << 4) | self.ihl;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], self.total_len);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset);
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        BigEndian::write_u16(&mut bytes[10..12], self.checksum);
        bytes[12..16].copy_from_slice(&self.src.octets());
        bytes[16..20].copy_from_slice(&self.dst.octets());
        bytes
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Check if this datagram is a fragment
    pub fn is_fragment(&self) -> bool {
        (self.flags_frag_offset & 0x1FFF) != 0 || (self.flags_frag_offset & 0x2000) != 0
    }
}

/// Handler for one IP protocol number.
///
/// Receives the protocol payload, the whole datagram (for handlers that
/// need to quote it back, like ICMP errors), the addresses, and the
/// receiving interface.
pub type IpProtocolHandler = Box<
    dyn Fn(&NetStack, &[u8], &[u8], Ipv4Addr, Ipv4Addr, &Arc<IpInterface>) + Send + Sync,
>;

struct IpProtocolEntry {
    protocol: u8,
    name: String,
    handler: IpProtocolHandler,
}

/// The IPv4 datagram engine.
pub struct Ipv4Module {
    protocols: RwLock<Vec<Arc<IpProtocolEntry>>>,
    interfaces: RwLock<Vec<Arc<IpInterface>>>,
    id_counter: AtomicU16,
}

impl Ipv4Module {
    pub(crate) fn new() -> Self {
        Ipv4Module {
            protocols: RwLock::new(Vec::new()),
            interfaces: RwLock::new(Vec::new()),
            id_counter: AtomicU16::new(0),
        }
    }

    pub(crate) fn register_protocol(
        &self,
        protocol: u8,
        name: &str,
        handler: IpProtocolHandler,
    ) -> Result<()> {
        let mut protocols = self.protocols.write();
        if protocols.iter().any(|p| p.protocol == protocol) {
            return Err(Error::ProtocolExists(protocol as u16));
        }
        protocols.push(Arc::new(IpProtocolEntry {
            protocol,
            name: name.to_string(),
            handler,
        }));
        debug!(name, protocol, "ip protocol registered");
        Ok(())
    }

    pub(crate) fn register_interface(&self, iface: Arc<IpInterface>) {
        self.interfaces.write().push(iface);
    }

    /// Find the interface whose network contains `dst`. Single-family,
    /// on-link only; there are no gateways here.
    pub fn route_lookup(&self, dst: Ipv4Addr) -> Option<Arc<IpInterface>> {
        let interfaces = self.interfaces.read_recursive();
        if dst.is_broadcast() {
            return interfaces.first().cloned();
        }
        interfaces.iter().find(|i| i.contains(dst)).cloned()
    }

    fn next_id(&self) -> u16 {
        self.id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Protocol handler for received datagrams. Runs on the event thread.
    pub(crate) fn input(&self, stack: &NetStack, data: &[u8], dev: &DeviceHandle) {
        let Some(header) = Ipv4Header::from_bytes(data) else {
            warn!(dev = %dev.name(), len = data.len(), "ip: dropped malformed datagram");
            return;
        };
        let header_len = header.header_len();
        let total_len = header.total_len as usize;
        if header_len < IPV4_HEADER_MIN || header_len > data.len() || total_len < header_len
            || total_len > data.len()
        {
            warn!(dev = %dev.name(), "ip: inconsistent lengths, dropped");
            return;
        }
        if checksum(&data[..header_len]) != 0 {
            warn!(dev = %dev.name(), "ip: bad header checksum, dropped");
            return;
        }
        if header.is_fragment() {
            // Reassembly is out of scope; single-fragment datagrams only.
            warn!(dev = %dev.name(), src = %header.src, "ip: fragment dropped");
            return;
        }

        let Some(iface) = dev.interface(Family::Ipv4) else {
            trace!(dev = %dev.name(), "ip: no interface, dropped");
            return;
        };
        if header.dst != iface.unicast() && !iface.is_broadcast(header.dst) {
            trace!(dst = %header.dst, "ip: not for us");
            return;
        }

        trace!(
            dev = %dev.name(),
            src = %header.src,
            dst = %header.dst,
            protocol = header.protocol,
            len = total_len,
            "ip input"
        );

        let entry = self
            .protocols
            .read_recursive()
            .iter()
            .find(|p| p.protocol == header.protocol)
            .cloned();
        match entry {
            Some(entry) => {
                trace!(proto = %entry.name, "ip dispatch");
                (entry.handler)(
                    stack,
                    &data[header_len..total_len],
                    &data[..total_len],
                    header.src,
                    header.dst,
                    &iface,
                );
            }
            None => {
                debug!(protocol = header.protocol, "ip: unsupported protocol");
            }
        }
    }

    /// Send a payload as a single IPv4 datagram.
    ///
    /// `src` may be [`Ipv4Addr::UNSPECIFIED`] to use the selected
    /// interface's address. A destination that resolves to an in-flight
    /// ARP query yields [`Error::ArpIncomplete`]; the caller retries or
    /// drops.
    pub fn output(
        &self,
        stack: &NetStack,
        protocol: u8,
        payload: &[u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Result<()> {
        let iface = self.route_lookup(dst).ok_or(Error::NoRoute(dst))?;
        if !src.is_unspecified() && src != iface.unicast() {
            return Err(Error::InvalidAddress(src.to_string()));
        }
        let src = iface.unicast();
        let dev = iface.device();

        let total_len = IPV4_HEADER_MIN + payload.len();
        if total_len > dev.mtu() {
            return Err(Error::TooLong {
                dev: dev.name().to_string(),
                mtu: dev.mtu(),
                len: total_len,
            });
        }

        let header = Ipv4Header::new(protocol, src, dst, payload.len(), self.next_id());
        let mut datagram = Vec::with_capacity(total_len);
        datagram.extend_from_slice(&header.to_bytes());
        datagram.extend_from_slice(payload);
        let header_checksum = checksum(&datagram[..IPV4_HEADER_MIN]);
        BigEndian::write_u16(&mut datagram[10..12], header_checksum);

        let hw_dst = if dev.kind() == DeviceKind::Loopback {
            MacAddr::ZERO
        } else if iface.is_broadcast(dst) {
            dev.broadcast()
        } else {
            match stack.arp().resolve(&iface, dst)? {
                Resolution::Found(ha) => ha,
                Resolution::Incomplete => return Err(Error::ArpIncomplete),
            }
        };

        trace!(
            dev = %dev.name(),
            src = %src,
            dst = %dst,
            protocol,
            len = total_len,
            "ip output"
        );
        dev.output(ETHER_TYPE_IP, &datagram, hw_dst)
    }
}
