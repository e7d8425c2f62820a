//! Stack-wide error types

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Stack operation result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the stack to its callers.
///
/// Handlers running on the event thread never propagate these into the
/// dispatcher; they log and return. Everything here is for the user-facing
/// call surface.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("device {0} is not up")]
    DeviceDown(String),

    #[error("device {0} is already up")]
    AlreadyUp(String),

    #[error("too long for {dev}: mtu={mtu}, len={len}")]
    TooLong {
        dev: String,
        mtu: usize,
        len: usize,
    },

    #[error("stack is already running")]
    AlreadyRunning,

    #[error("stack is not running")]
    NotRunning,

    #[error("protocol 0x{0:04x} already registered")]
    ProtocolExists(u16),

    #[error("irq {0} conflicts with an already registered handler")]
    IrqConflict(u32),

    #[error("irq {0} is reserved by the stack")]
    IrqReserved(u32),

    #[error("interface family already present on {0}")]
    InterfaceExists(String),

    #[error("ingress queue full for protocol 0x{0:04x}")]
    QueueFull(u16),

    #[error("unsupported address family")]
    UnsupportedFamily,

    #[error("address resolution in progress")]
    ArpIncomplete,

    #[error("neighbor cache exhausted")]
    CacheExhausted,

    #[error("neighbor entry for {0} already exists")]
    NeighborExists(Ipv4Addr),

    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("address in use: {0}:{1}")]
    AddrInUse(Ipv4Addr, u16),

    #[error("no free protocol control block")]
    PcbExhausted,

    #[error("invalid state for this operation")]
    InvalidState,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("operation timed out")]
    Timeout,

    #[error("connection reset by peer")]
    ConnectionReset,
}
