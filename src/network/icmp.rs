//! ICMP (Internet Control Message Protocol) implementation
//!
//! Answers echo requests and lets other protocols emit error messages
//! (UDP uses port-unreachable for closed ports). Everything else is
//! logged and ignored.

use crate::error::Result;
use crate::iface::ip::IpInterface;
use crate::network::checksum;
use crate::network::ipv4::{IP_PROTOCOL_ICMP, IPV4_HEADER_MIN};
use crate::stack::NetStack;
use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Minimum ICMP header length in bytes
const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACH: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// Destination-unreachable codes
pub const ICMP_CODE_PORT_UNREACH: u8 = 3;

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    pub msg_type: u8,
    pub msg_code: u8,
    pub checksum: u16,
    pub rest: [u8; 4], // Type-specific data (e.g., identifier and sequence for echo)
}

impl IcmpHeader {
    /// Parse an ICMP header from a byte slice
    ///
    /// Returns None if the data is too short to contain a valid ICMP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        Some(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest: data[4..8].try_into().unwrap(),
        })
    }

    /// Convert the ICMP header to bytes
    pub fn to_bytes(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut bytes = [0u8; ICMP_HEADER_LEN];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }
}

/// Protocol handler for received ICMP messages. Runs on the event thread.
pub(crate) fn input(
    stack: &NetStack,
    payload: &[u8],
    _datagram: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    iface: &Arc<IpInterface>,
) {
    let Some(header) = IcmpHeader::from_bytes(payload) else {
        warn!(len = payload.len(), "icmp: dropped short message");
        return;
    };
    if checksum(payload) != 0 {
        warn!(src = %src, "icmp: bad checksum, dropped");
        return;
    }
    trace!(
        src = %src,
        dst = %dst,
        msg_type = header.msg_type,
        msg_code = header.msg_code,
        "icmp input"
    );
    match header.msg_type {
        ICMP_TYPE_ECHO_REQUEST => {
            // Reply from the interface address even if the request went to
            // a broadcast address.
            if let Err(err) = output(
                stack,
                ICMP_TYPE_ECHO_REPLY,
                0,
                header.rest,
                &payload[ICMP_HEADER_LEN..],
                iface.unicast(),
                src,
            ) {
                warn!(dst = %src, %err, "icmp: echo reply failed");
            }
        }
        _ => {
            debug!(msg_type = header.msg_type, "icmp: unsupported type");
        }
    }
}

/// Build and send an ICMP message.
pub(crate) fn output(
    stack: &NetStack,
    msg_type: u8,
    msg_code: u8,
    rest: [u8; 4],
    payload: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<()> {
    let header = IcmpHeader {
        msg_type,
        msg_code,
        checksum: 0,
        rest,
    };
    let mut message = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    message.extend_from_slice(&header.to_bytes());
    message.extend_from_slice(payload);
    let sum = checksum(&message);
    BigEndian::write_u16(&mut message[2..4], sum);
    trace!(dst = %dst, msg_type, msg_code, len = message.len(), "icmp output");
    stack.ip().output(stack, IP_PROTOCOL_ICMP, &message, src, dst)
}

/// Send a destination-unreachable error quoting the offending datagram
/// (its IP header plus the first eight payload bytes, per RFC 792).
pub(crate) fn destination_unreachable(
    stack: &NetStack,
    code: u8,
    datagram: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<()> {
    let quoted_len = datagram.len().min(IPV4_HEADER_MIN + 8);
    output(
        stack,
        ICMP_TYPE_DEST_UNREACH,
        code,
        [0; 4],
        &datagram[..quoted_len],
        src,
        dst,
    )
}
