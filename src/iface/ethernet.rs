//! Ethernet II framing
//!
//! This module provides the Ethernet frame codec shared by every Ethernet
//! device driver, plus the ingress/egress helpers drivers delegate to:
//! - frame parsing with destination filtering
//! - frame construction with minimum-size padding

use crate::error::Result;
use crate::iface::device::DeviceHandle;
use crate::stack::NetStack;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::io;
use std::str::FromStr;
use tracing::trace;

/// Ethernet hardware address length in bytes
pub const ETHER_ADDR_LEN: usize = 6;
/// Ethernet II header length in bytes
pub const ETHER_HDR_SIZE: usize = 14;
/// Minimum frame length on the wire (without FCS)
pub const ETHER_FRAME_MIN: usize = 60;
/// Maximum frame length (without FCS)
pub const ETHER_FRAME_MAX: usize = 1514;
/// Maximum payload carried by one frame
pub const ETHER_PAYLOAD_MAX: usize = ETHER_FRAME_MAX - ETHER_HDR_SIZE;

/// EtherType: IPv4
pub const ETHER_TYPE_IP: u16 = 0x0800;
/// EtherType: ARP
pub const ETHER_TYPE_ARP: u16 = 0x0806;

/// Ethernet hardware (MAC) address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; ETHER_ADDR_LEN]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0x00; ETHER_ADDR_LEN]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; ETHER_ADDR_LEN]);

    pub fn octets(&self) -> [u8; ETHER_ADDR_LEN] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == MacAddr::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = crate::error::Error;

    /// Parse the usual `"aa:bb:cc:dd:ee:ff"` form.
    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; ETHER_ADDR_LEN];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| crate::error::Error::InvalidAddress(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| crate::error::Error::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(crate::error::Error::InvalidAddress(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

/// Ethernet II frame header
#[derive(Debug, Clone, Copy)]
pub struct EtherHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EtherHeader {
    /// Parse an Ethernet header from a byte slice.
    ///
    /// Returns None if the data is too short to contain a header.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ETHER_HDR_SIZE {
            return None;
        }
        Some(EtherHeader {
            dst: MacAddr(data[0..6].try_into().unwrap()),
            src: MacAddr(data[6..12].try_into().unwrap()),
            ethertype: BigEndian::read_u16(&data[12..14]),
        })
    }

    /// Convert the header to bytes
    pub fn to_bytes(&self) -> [u8; ETHER_HDR_SIZE] {
        let mut bytes = [0u8; ETHER_HDR_SIZE];
        bytes[0..6].copy_from_slice(&self.dst.0);
        bytes[6..12].copy_from_slice(&self.src.0);
        BigEndian::write_u16(&mut bytes[12..14], self.ethertype);
        bytes
    }
}

/// Frame a payload and hand the result to the driver's write function.
///
/// Pads short frames up to [`ETHER_FRAME_MIN`]; the caller has already
/// checked the payload against the device MTU.
pub fn transmit_helper<W>(
    src: MacAddr,
    ethertype: u16,
    payload: &[u8],
    dst: MacAddr,
    write: W,
) -> Result<()>
where
    W: FnOnce(&[u8]) -> io::Result<usize>,
{
    let header = EtherHeader {
        dst,
        src,
        ethertype,
    };
    let mut frame = Vec::with_capacity(ETHER_HDR_SIZE + payload.len().max(ETHER_FRAME_MIN));
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    if frame.len() < ETHER_FRAME_MIN {
        frame.resize(ETHER_FRAME_MIN, 0);
    }
    trace!(dst = %dst, ethertype = format_args!("0x{:04x}", ethertype), len = frame.len(), "ether: transmit");
    write(&frame)?;
    Ok(())
}

/// Parse a received frame, filter on the destination address, and feed the
/// payload into the stack's ingress path.
///
/// Called from device ISRs on the event thread. Frames that are neither
/// unicast to the device nor broadcast are dropped without a sound.
pub fn input_helper(stack: &NetStack, dev: &DeviceHandle, frame: &[u8]) {
    let Some(header) = EtherHeader::from_bytes(frame) else {
        trace!(dev = %dev.name(), len = frame.len(), "ether: frame too short");
        return;
    };
    if header.dst != dev.hw_addr() && !header.dst.is_broadcast() {
        return;
    }
    trace!(
        dev = %dev.name(),
        src = %header.src,
        ethertype = format_args!("0x{:04x}", header.ethertype),
        len = frame.len(),
        "ether: input"
    );
    if let Err(err) = stack.input(header.ethertype, &frame[ETHER_HDR_SIZE..], dev) {
        trace!(dev = %dev.name(), %err, "ether: input dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_addr_parsing() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");

        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_broadcast_and_multicast() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());
        let multicast = MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
        assert!(multicast.is_multicast());
        assert!(!multicast.is_broadcast());
        let unicast = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        assert!(!unicast.is_multicast());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = EtherHeader {
            dst: MacAddr::BROADCAST,
            src: "02:00:00:00:00:01".parse().unwrap(),
            ethertype: ETHER_TYPE_ARP,
        };
        let bytes = header.to_bytes();
        let parsed = EtherHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.dst, header.dst);
        assert_eq!(parsed.src, header.src);
        assert_eq!(parsed.ethertype, ETHER_TYPE_ARP);
    }

    #[test]
    fn test_transmit_helper_pads_short_frames() {
        let mut written = Vec::new();
        transmit_helper(
            MacAddr::ZERO,
            ETHER_TYPE_IP,
            &[0xab; 10],
            MacAddr::BROADCAST,
            |frame| {
                written.extend_from_slice(frame);
                Ok(frame.len())
            },
        )
        .unwrap();
        assert_eq!(written.len(), ETHER_FRAME_MIN);
        assert_eq!(&written[ETHER_HDR_SIZE..ETHER_HDR_SIZE + 10], &[0xab; 10]);
        assert!(written[ETHER_HDR_SIZE + 10..].iter().all(|&b| b == 0));
    }
}
