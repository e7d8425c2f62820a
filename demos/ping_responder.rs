//! Ping responder demo
//!
//! Brings up the stack on a TAP device and answers ARP and ICMP echo.
//!
//! Usage (as root):
//!   cargo run --example ping_responder
//!
//! Then test with:
//!   ping 192.0.2.1

use std::net::Ipv4Addr;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tapstack::{logging, MacAddr, NetStack, StackConfig, TapDevice};

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

    // Give the host side of the TAP pair an address and bring it up:
    //   ip addr add 192.0.2.2/24 dev tap0
    //   ip link set up dev tap0
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

    println!("stack running on tap0; try: ping 192.0.2.1");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
