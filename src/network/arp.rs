//! ARP (Address Resolution Protocol) implementation
//!
//! Maps on-link IPv4 addresses to Ethernet hardware addresses, per
//! RFC 826 for the Ethernet/IPv4 pairing. The resolver owns a bounded
//! neighbor cache shared between IP egress (user threads calling
//! [`ArpResolver::resolve`]) and the protocol handler
//! ([`ArpResolver::input`], invoked on the event thread); a single mutex
//! protects it.
//!
//! `resolve` never waits: a miss installs an INCOMPLETE entry, broadcasts
//! a request and returns [`Resolution::Incomplete`] so the caller can
//! retry or drop. The matching reply is merged into the cache by the
//! ingress path, and a later `resolve` finds it.

use crate::error::{Error, Result};
use crate::iface::device::{DeviceHandle, DeviceKind, Family};
use crate::iface::ethernet::{MacAddr, ETHER_ADDR_LEN, ETHER_TYPE_ARP, ETHER_TYPE_IP};
use crate::iface::ip::IpInterface;
use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Hardware type: Ethernet
const ARP_HRD_ETHER: u16 = 0x0001;
/// Protocol type: IPv4 (same namespace as EtherTypes)
const ARP_PRO_IP: u16 = ETHER_TYPE_IP;
/// IPv4 address length
const IP_ADDR_LEN: usize = 4;

/// ARP operation: request
pub const ARP_OP_REQUEST: u16 = 1;
/// ARP operation: reply
pub const ARP_OP_REPLY: u16 = 2;

/// Size of an ARP message for the Ethernet/IPv4 pairing
pub const ARP_MESSAGE_SIZE: usize = 28;

/// Interval at which the cache maintenance timer runs.
pub(crate) const ARP_TIMER_INTERVAL: Duration = Duration::from_secs(1);

/// Neighbor cache slot states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Free,
    Incomplete,
    Resolved,
    Static,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    state: CacheState,
    pa: Ipv4Addr,
    ha: MacAddr,
    timestamp: Instant,
}

impl CacheEntry {
    fn free(now: Instant) -> Self {
        CacheEntry {
            state: CacheState::Free,
            pa: Ipv4Addr::UNSPECIFIED,
            ha: MacAddr::ZERO,
            timestamp: now,
        }
    }
}

/// Outcome of a resolve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The hardware address is known.
    Found(MacAddr),
    /// A request is in flight; retry later.
    Incomplete,
}

/// ARP message for the Ethernet/IPv4 pairing
///
/// Fixed 28-byte layout: 8-byte header (hrd/pro/hln/pln/op) followed by
/// sender and target hardware/protocol addresses.
#[derive(Debug, Clone, Copy)]
pub struct ArpMessage {
    pub op: u16,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

impl ArpMessage {
    /// Parse an ARP message from a byte slice.
    ///
    /// Returns None if the data is too short or does not describe the
    /// Ethernet/IPv4 pairing.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_MESSAGE_SIZE {
            return None;
        }
        if BigEndian::read_u16(&data[0..2]) != ARP_HRD_ETHER
            || data[4] as usize != ETHER_ADDR_LEN
        {
            return None;
        }
        if BigEndian::read_u16(&data[2..4]) != ARP_PRO_IP || data[5] as usize != IP_ADDR_LEN {
            return None;
        }
        Some(ArpMessage {
            op: BigEndian::read_u16(&data[6..8]),
            sha: MacAddr(data[8..14].try_into().unwrap()),
            spa: Ipv4Addr::from(u32::from_be_bytes(data[14..18].try_into().unwrap())),
            tha: MacAddr(data[18..24].try_into().unwrap()),
            tpa: Ipv4Addr::from(u32::from_be_bytes(data[24..28].try_into().unwrap())),
        })
    }

    /// Convert the message to bytes
    pub fn to_bytes(&self) -> [u8; ARP_MESSAGE_SIZE] {
        let mut bytes = [0u8; ARP_MESSAGE_SIZE];
        BigEndian::write_u16(&mut bytes[0..2], ARP_HRD_ETHER);
        BigEndian::write_u16(&mut bytes[2..4], ARP_PRO_IP);
        bytes[4] = ETHER_ADDR_LEN as u8;
        bytes[5] = IP_ADDR_LEN as u8;
        BigEndian::write_u16(&mut bytes[6..8], self.op);
        bytes[8..14].copy_from_slice(&self.sha.0);
        bytes[14..18].copy_from_slice(&self.spa.octets());
        bytes[18..24].copy_from_slice(&self.tha.0);
        bytes[24..28].copy_from_slice(&self.tpa.octets());
        bytes
    }
}

/// The neighbor resolver.
pub struct ArpResolver {
    cache: Mutex<Vec<CacheEntry>>,
    incomplete_timeout: Duration,
}

/*
 * Cache helpers. All of them expect the cache mutex to be held.
 */

fn cache_find(cache: &[CacheEntry], pa: Ipv4Addr) -> Option<usize> {
    cache
        .iter()
        .position(|e| e.state != CacheState::Free && e.pa == pa)
}

fn cache_delete(entry: &mut CacheEntry) {
    debug!(pa = %entry.pa, ha = %entry.ha, "arp cache delete");
    *entry = CacheEntry::free(Instant::now());
}

/// Pick a slot for a new entry: the first free one, else evict the
/// oldest non-static entry. Returns None only when every slot is static.
fn cache_alloc(cache: &mut [CacheEntry]) -> Option<usize> {
    if let Some(index) = cache.iter().position(|e| e.state == CacheState::Free) {
        return Some(index);
    }
    let mut oldest: Option<usize> = None;
    for (index, entry) in cache.iter().enumerate() {
        if entry.state == CacheState::Static {
            continue;
        }
        match oldest {
            Some(o) if cache[o].timestamp <= entry.timestamp => {}
            _ => oldest = Some(index),
        }
    }
    let index = oldest?;
    cache_delete(&mut cache[index]);
    Some(index)
}

impl ArpResolver {
    pub(crate) fn new(cache_size: usize, incomplete_timeout: Duration) -> Self {
        let now = Instant::now();
        ArpResolver {
            cache: Mutex::new(vec![CacheEntry::free(now); cache_size]),
            incomplete_timeout,
        }
    }

    /// Update the entry for `pa` in place, if one exists.
    ///
    /// Returns true when an entry was already cached (the "merge" flag).
    /// Static entries count as merged but are never rewritten.
    fn cache_update(&self, cache: &mut [CacheEntry], pa: Ipv4Addr, ha: MacAddr) -> bool {
        let Some(index) = cache_find(cache, pa) else {
            return false;
        };
        let entry = &mut cache[index];
        if entry.state == CacheState::Static {
            return true;
        }
        entry.state = CacheState::Resolved;
        entry.ha = ha;
        entry.timestamp = Instant::now();
        debug!(pa = %pa, ha = %ha, "arp cache update");
        true
    }

    /// Insert a fresh resolved entry for `pa`.
    fn cache_insert(&self, cache: &mut [CacheEntry], pa: Ipv4Addr, ha: MacAddr) -> Result<()> {
        let index = cache_alloc(cache).ok_or(Error::CacheExhausted)?;
        let entry = &mut cache[index];
        entry.state = CacheState::Resolved;
        entry.pa = pa;
        entry.ha = ha;
        entry.timestamp = Instant::now();
        debug!(pa = %pa, ha = %ha, "arp cache insert");
        Ok(())
    }

    /// Install an administrator-provisioned entry that the protocol path
    /// will never rewrite or evict.
    pub fn add_static(&self, pa: Ipv4Addr, ha: MacAddr) -> Result<()> {
        let mut cache = self.cache.lock();
        if cache_find(&cache, pa).is_some() {
            return Err(Error::NeighborExists(pa));
        }
        let index = cache_alloc(&mut cache).ok_or(Error::CacheExhausted)?;
        let entry = &mut cache[index];
        entry.state = CacheState::Static;
        entry.pa = pa;
        entry.ha = ha;
        entry.timestamp = Instant::now();
        debug!(pa = %pa, ha = %ha, "arp cache insert (static)");
        Ok(())
    }

    /// Resolve `pa` to a hardware address for egress over `iface`.
    ///
    /// Never blocks. A cache miss installs an INCOMPLETE entry and
    /// broadcasts a request; a hit on an INCOMPLETE entry re-broadcasts
    /// (the request may have been lost). Request emission failures are
    /// logged and do not disturb the cache.
    pub fn resolve(&self, iface: &Arc<IpInterface>, pa: Ipv4Addr) -> Result<Resolution> {
        if iface.device().kind() != DeviceKind::Ethernet {
            debug!(dev = %iface.device().name(), "unsupported hardware address type");
            return Err(Error::UnsupportedFamily);
        }

        let mut cache = self.cache.lock();
        match cache_find(&cache, pa) {
            None => {
                debug!(pa = %pa, "arp cache miss");
                let Some(index) = cache_alloc(&mut cache) else {
                    return Err(Error::CacheExhausted);
                };
                let entry = &mut cache[index];
                entry.state = CacheState::Incomplete;
                entry.pa = pa;
                entry.ha = MacAddr::ZERO;
                entry.timestamp = Instant::now();
                drop(cache);
                if let Err(err) = self.request(iface, pa) {
                    warn!(pa = %pa, %err, "arp request failed");
                }
                Ok(Resolution::Incomplete)
            }
            Some(index) if cache[index].state == CacheState::Incomplete => {
                drop(cache);
                // The earlier request may have been lost; retransmit.
                if let Err(err) = self.request(iface, pa) {
                    warn!(pa = %pa, %err, "arp request failed");
                }
                Ok(Resolution::Incomplete)
            }
            Some(index) => {
                let ha = cache[index].ha;
                drop(cache);
                trace!(pa = %pa, ha = %ha, "arp resolved");
                Ok(Resolution::Found(ha))
            }
        }
    }

    /// Broadcast a request for `tpa` out of `iface`.
    fn request(&self, iface: &Arc<IpInterface>, tpa: Ipv4Addr) -> Result<()> {
        let dev = iface.device();
        let message = ArpMessage {
            op: ARP_OP_REQUEST,
            sha: dev.hw_addr(),
            spa: iface.unicast(),
            tha: MacAddr::ZERO,
            tpa,
        };
        debug!(dev = %dev.name(), tpa = %tpa, "arp request");
        dev.output(ETHER_TYPE_ARP, &message.to_bytes(), dev.broadcast())
    }

    /// Send a reply claiming our address toward `(tha, tpa)`.
    fn reply(&self, iface: &Arc<IpInterface>, tha: MacAddr, tpa: Ipv4Addr, dst: MacAddr) -> Result<()> {
        let dev = iface.device();
        let message = ArpMessage {
            op: ARP_OP_REPLY,
            sha: dev.hw_addr(),
            spa: iface.unicast(),
            tha,
            tpa,
        };
        debug!(dev = %dev.name(), tha = %tha, tpa = %tpa, "arp reply");
        dev.output(ETHER_TYPE_ARP, &message.to_bytes(), dst)
    }

    /// Protocol handler for received ARP messages.
    ///
    /// Runs on the event thread. Merge-flag semantics: the sender's
    /// mapping is updated in place when already cached; a fresh insert
    /// happens only when the message targets our own address, so
    /// arbitrary overheard replies never populate the cache.
    pub fn input(&self, data: &[u8], dev: &DeviceHandle) {
        let Some(message) = ArpMessage::from_bytes(data) else {
            warn!(dev = %dev.name(), len = data.len(), "arp: dropped malformed message");
            return;
        };
        trace!(
            dev = %dev.name(),
            op = message.op,
            spa = %message.spa,
            tpa = %message.tpa,
            "arp input"
        );

        let merged = {
            let mut cache = self.cache.lock();
            self.cache_update(&mut cache, message.spa, message.sha)
        };

        let Some(iface) = dev.interface(Family::Ipv4) else {
            return;
        };
        if iface.unicast() != message.tpa {
            return;
        }
        if !merged {
            let mut cache = self.cache.lock();
            if let Err(err) = self.cache_insert(&mut cache, message.spa, message.sha) {
                warn!(spa = %message.spa, %err, "arp cache insert failed");
            }
        }
        if message.op == ARP_OP_REQUEST {
            if let Err(err) = self.reply(&iface, message.sha, message.spa, message.sha) {
                warn!(dev = %dev.name(), %err, "arp reply failed");
            }
        }
    }

    /// Cache maintenance: release INCOMPLETE entries whose request went
    /// unanswered, so a dead address cannot pin a slot forever.
    pub(crate) fn timer_handler(&self) {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        for entry in cache.iter_mut() {
            if entry.state == CacheState::Incomplete
                && now.duration_since(entry.timestamp) >= self.incomplete_timeout
            {
                debug!(pa = %entry.pa, "arp incomplete entry expired");
                cache_delete(entry);
            }
        }
    }

    /// Snapshot of the cache slots, index-aligned, for inspection in
    /// tests.
    #[cfg(test)]
    pub(crate) fn entries(&self) -> Vec<(CacheState, Ipv4Addr, MacAddr)> {
        self.cache
            .lock()
            .iter()
            .map(|e| (e.state, e.pa, e.ha))
            .collect()
    }
}
