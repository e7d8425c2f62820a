//! Transport layer protocols implementation
//!
//! This module contains implementations for transport layer protocols:
//! - UDP: User Datagram Protocol
//! - TCP: Transmission Control Protocol

pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use tcp::{TcpSocket, TcpState};
pub use udp::{UdpDatagram, UdpSocket};

use crate::network::checksum;
use std::net::Ipv4Addr;

/// Internet checksum over the IPv4 pseudo-header followed by a transport
/// segment. Computing this over a segment whose checksum field is already
/// filled in yields zero for valid data.
pub(crate) fn pseudo_header_checksum(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut buf = Vec::with_capacity(12 + segment.len());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.push(0);
    buf.push(protocol);
    buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    buf.extend_from_slice(segment);
    checksum(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};

    #[test]
    fn test_pseudo_header_checksum_closes() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut segment = vec![
            0x04, 0xd2, // src port 1234
            0x00, 0x07, // dst port 7
            0x00, 0x0c, // length 12
            0x00, 0x00, // checksum
            0xde, 0xad, 0xbe, 0xef,
        ];
        let sum = pseudo_header_checksum(src, dst, 17, &segment);
        BigEndian::write_u16(&mut segment[6..8], sum);
        assert_eq!(pseudo_header_checksum(src, dst, 17, &segment), 0);
    }
}
