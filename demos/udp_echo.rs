//! UDP echo demo
//!
//! Echoes every datagram received on port 7 back to its sender.
//!
//! Usage (as root):
//!   cargo run --example udp_echo
//!
//! Then test with:
//!   echo hello | nc -u 192.0.2.1 7

use std::net::Ipv4Addr;
use std::process::Command;
use std::time::Duration;
use tapstack::{logging, Error, MacAddr, NetStack, StackConfig, TapDevice, UdpSocket};

fn main() -> tapstack::Result<()> {
    logging::init();

    let stack = NetStack::new(StackConfig::default())?;
    let mac: MacAddr = "02:00:00:00:00:01".parse()?;
    let dev = TapDevice::attach(&stack, "tap0", mac)?;
    stack.attach_interface(
        &dev,
        Ipv4Addr::new(192, 0, 2, 1),
        Ipv4Addr::new(255, 255, 255, 0),
    )?;

    stack.run()?;

    let status = Command::new("ip")
        .args(["addr", "add", "192.0.2.2/24", "dev", "tap0"])
        .status()?;
    if !status.success() {
        eprintln!("failed to configure address on tap0");
    }
    let status = Command::new("ip")
        .args(["link", "set", "up", "dev", "tap0"])
        .status()?;
    if !status.success() {
        eprintln!("failed to bring up tap0");
    }

    let socket = UdpSocket::open(&stack)?;
    socket.bind(Ipv4Addr::UNSPECIFIED, 7)?;
    println!("echoing on 192.0.2.1:7");

    loop {
        match socket.recv_from(Some(Duration::from_secs(10))) {
            Ok(datagram) => {
                println!(
                    "{} bytes from {}:{}",
                    datagram.data.len(),
                    datagram.remote.0,
                    datagram.remote.1
                );
                socket.send_to(&datagram.data, datagram.remote)?;
            }
            Err(Error::Timeout) => continue,
            Err(err) => {
                eprintln!("receive failed: {}", err);
                break;
            }
        }
    }

    stack.shutdown()?;
    Ok(())
}
