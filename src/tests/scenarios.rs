//! End-to-end scenarios through the event thread: cold resolve, reply
//! handling, eviction under pressure, transmit preconditions, ingress
//! ordering, and shutdown with in-flight work.

use super::*;
use crate::iface::ethernet::ETHER_TYPE_ARP;
use crate::network::arp::{ArpMessage, CacheState, ARP_OP_REPLY, ARP_OP_REQUEST};
use crate::Resolution;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Cold resolve emits a broadcast request; the reply, fed through the
/// ingress path and drained by the event thread, completes resolution.
#[test]
fn cold_resolve_then_reply_resolves() {
    let (stack, dev, iface, frames) = unopened_stack();
    stack.run().unwrap();

    let target = Ipv4Addr::new(192, 168, 0, 2);
    let peer_mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    assert_eq!(
        stack.arp().resolve(&iface, target).unwrap(),
        Resolution::Incomplete
    );
    {
        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        let (ethertype, payload, dst) = &frames[0];
        assert_eq!(*ethertype, ETHER_TYPE_ARP);
        assert_eq!(*dst, MacAddr::BROADCAST);
        let request = ArpMessage::from_bytes(payload).unwrap();
        assert_eq!(request.op, ARP_OP_REQUEST);
        assert_eq!(request.tpa, target);
    }

    stack
        .input(
            ETHER_TYPE_ARP,
            &arp_reply(peer_mac, target, OUR_MAC, OUR_IP),
            &dev,
        )
        .unwrap();

    // Once the softirq drains, resolve finds the mapping.
    let resolved = wait_until(Duration::from_secs(1), || {
        matches!(
            stack.arp().resolve(&iface, target),
            Ok(Resolution::Found(mac)) if mac == peer_mac
        )
    });
    assert!(resolved, "reply never became visible to resolve");

    stack.shutdown().unwrap();
}

/// A reply that answers nobody and is not addressed to us leaves the
/// cache empty and emits nothing.
#[test]
fn overheard_reply_is_ignored() {
    let (stack, dev, _iface, frames) = unopened_stack();
    stack.run().unwrap();

    stack
        .input(
            ETHER_TYPE_ARP,
            &arp_reply(
                MacAddr([0xaa, 0, 0, 0, 0, 1]),
                Ipv4Addr::new(192, 168, 0, 7),
                MacAddr([0x02, 0, 0, 0, 0, 0x09]),
                Ipv4Addr::new(192, 168, 0, 9),
            ),
            &dev,
        )
        .unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(frames.lock().is_empty());
    assert!(stack
        .arp()
        .entries()
        .iter()
        .all(|(state, _, _)| *state == CacheState::Free));

    stack.shutdown().unwrap();
}

/// A request for our address caches the sender and triggers exactly one
/// reply, unicast back to the sender.
#[test]
fn request_to_us_caches_sender_and_replies() {
    let (stack, dev, iface, frames) = unopened_stack();
    stack.run().unwrap();

    let peer_ip = Ipv4Addr::new(192, 168, 0, 5);
    let peer_mac = MacAddr([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    stack
        .input(ETHER_TYPE_ARP, &arp_request(peer_mac, peer_ip, OUR_IP), &dev)
        .unwrap();

    assert!(wait_until(Duration::from_secs(1), || !frames.lock().is_empty()));
    thread::sleep(Duration::from_millis(50));

    {
        let frames = frames.lock();
        assert_eq!(frames.len(), 1, "expected exactly one reply");
        let (ethertype, payload, dst) = &frames[0];
        assert_eq!(*ethertype, ETHER_TYPE_ARP);
        assert_eq!(*dst, peer_mac);
        let reply = ArpMessage::from_bytes(payload).unwrap();
        assert_eq!(reply.op, ARP_OP_REPLY);
        assert_eq!(reply.sha, OUR_MAC);
        assert_eq!(reply.spa, OUR_IP);
        assert_eq!(reply.tha, peer_mac);
        assert_eq!(reply.tpa, peer_ip);
    }
    assert_eq!(
        stack.arp().resolve(&iface, peer_ip).unwrap(),
        Resolution::Found(peer_mac)
    );

    stack.shutdown().unwrap();
}

/// Thirty-two resolved entries at increasing timestamps; one more
/// address reuses the slot of the oldest.
#[test]
fn full_cache_evicts_minimum_timestamp() {
    let (stack, dev, iface, _frames) = mock_stack();

    for host in 0..32u8 {
        let ip = Ipv4Addr::new(192, 168, 0, 10 + host);
        let mac = MacAddr([0x02, 0, 0, 0, 1, host]);
        stack.arp().input(&arp_request(mac, ip, OUR_IP), &dev);
        thread::sleep(Duration::from_millis(2));
    }
    assert!(stack
        .arp()
        .entries()
        .iter()
        .all(|(state, _, _)| *state == CacheState::Resolved));

    let newcomer = Ipv4Addr::new(192, 168, 0, 99);
    assert_eq!(
        stack.arp().resolve(&iface, newcomer).unwrap(),
        Resolution::Incomplete
    );

    let entries = stack.arp().entries();
    assert_eq!(entries[0].0, CacheState::Incomplete);
    assert_eq!(entries[0].1, newcomer);
    assert_eq!(
        entries
            .iter()
            .filter(|(state, _, _)| *state == CacheState::Resolved)
            .count(),
        31
    );
}

/// Oversize transmit fails the MTU precondition; nothing reaches the
/// driver.
#[test]
fn oversize_transmit_is_rejected() {
    let (_stack, dev, _iface, frames) = mock_stack();
    let err = dev
        .output(0x0800, &vec![0u8; 1600], MacAddr::BROADCAST)
        .unwrap_err();
    assert!(matches!(
        err,
        crate::Error::TooLong {
            mtu: 1500,
            len: 1600,
            ..
        }
    ));
    assert!(frames.lock().is_empty());
}

/// Frames handed to input in order are seen by the protocol handler in
/// the same order.
#[test]
fn ingress_order_is_preserved() {
    let stack = NetStack::new(StackConfig::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        stack
            .register_protocol(
                0x88B5,
                "test",
                Box::new(move |_stack: &NetStack, data: &[u8], _dev: &DeviceHandle| {
                    seen.lock().push(data.to_vec());
                }),
            )
            .unwrap();
    }
    let frames: Frames = Arc::new(Mutex::new(Vec::new()));
    let dev = stack
        .register_device(
            crate::DeviceKind::Ethernet,
            1500,
            OUR_MAC,
            MacAddr::BROADCAST,
            Box::new(MockDriver { frames }),
        )
        .unwrap();
    stack.run().unwrap();

    for i in 0..32u8 {
        stack.input(0x88B5, &[i], &dev).unwrap();
    }
    assert!(wait_until(Duration::from_secs(1), || seen.lock().len() == 32));
    let seen = seen.lock();
    for (i, frame) in seen.iter().enumerate() {
        assert_eq!(frame.as_slice(), &[i as u8]);
    }

    stack.shutdown().unwrap();
}

/// Shutdown requested while a handler is busy: the handler finishes
/// first, and nothing runs afterwards.
#[test]
fn shutdown_waits_for_inflight_handler() {
    let stack = NetStack::new(StackConfig::default()).unwrap();
    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        stack
            .register_protocol(
                0x88B5,
                "slow",
                Box::new(move |_stack: &NetStack, _data: &[u8], _dev: &DeviceHandle| {
                    thread::sleep(Duration::from_millis(100));
                    done.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }
    let frames: Frames = Arc::new(Mutex::new(Vec::new()));
    let dev = stack
        .register_device(
            crate::DeviceKind::Ethernet,
            1500,
            OUR_MAC,
            MacAddr::BROADCAST,
            Box::new(MockDriver { frames }),
        )
        .unwrap();
    stack.run().unwrap();

    stack.input(0x88B5, &[0], &dev).unwrap();
    let started = Instant::now();
    stack.shutdown().unwrap();

    assert!(done.load(Ordering::SeqCst), "handler did not run to completion");
    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "shutdown returned before the in-flight handler finished"
    );
}

/// Registration of any kind is rejected once the stack runs.
#[test]
fn registration_after_run_is_rejected() {
    let (stack, dev, _iface, _frames) = unopened_stack();
    stack.run().unwrap();

    assert!(matches!(
        stack.register_protocol(
            0x88B5,
            "late",
            Box::new(|_: &NetStack, _: &[u8], _: &DeviceHandle| {})
        ),
        Err(crate::Error::AlreadyRunning)
    ));
    assert!(matches!(
        stack.register_timer(Duration::from_secs(1), Box::new(|_: &NetStack| {})),
        Err(crate::Error::AlreadyRunning)
    ));
    assert!(matches!(
        stack.subscribe_event(Box::new(|_: &NetStack| {})),
        Err(crate::Error::AlreadyRunning)
    ));
    assert!(matches!(
        stack.request_irq(
            crate::IRQ_BASE + 9,
            "late",
            true,
            dev.clone(),
            Box::new(|_: &NetStack, _: u32, _: &DeviceHandle| {})
        ),
        Err(crate::Error::AlreadyRunning)
    ));

    stack.shutdown().unwrap();
}

/// UDP loopback round trip over the event thread: bind, send to
/// ourselves through the loopback device, receive.
#[test]
fn udp_roundtrip_over_loopback() {
    let stack = NetStack::new(StackConfig::default()).unwrap();
    let lo = crate::LoopbackDevice::attach(&stack).unwrap();
    stack
        .attach_interface(&lo, Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0))
        .unwrap();
    stack.run().unwrap();

    let socket = crate::UdpSocket::open(&stack).unwrap();
    socket.bind(Ipv4Addr::UNSPECIFIED, 7).unwrap();
    socket
        .send_to(b"hello", (Ipv4Addr::new(127, 0, 0, 1), 7))
        .unwrap();

    let datagram = socket.recv_from(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(datagram.data, b"hello");
    assert_eq!(datagram.remote.0, Ipv4Addr::new(127, 0, 0, 1));

    socket.close();
    stack.shutdown().unwrap();
}

/// The cancellation event interrupts a blocked receiver.
#[test]
fn raise_event_interrupts_blocked_sockets() {
    let stack = NetStack::new(StackConfig::default()).unwrap();
    let lo = crate::LoopbackDevice::attach(&stack).unwrap();
    stack
        .attach_interface(&lo, Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0))
        .unwrap();
    stack.run().unwrap();

    let socket = crate::UdpSocket::open(&stack).unwrap();
    socket.bind(Ipv4Addr::UNSPECIFIED, 7).unwrap();

    let receiver = {
        let stack = stack.clone();
        thread::spawn(move || {
            let socket = crate::UdpSocket::open(&stack).unwrap();
            socket.bind(Ipv4Addr::UNSPECIFIED, 8).unwrap();
            socket.recv_from(None)
        })
    };
    thread::sleep(Duration::from_millis(50));
    stack.raise_event();

    let result = receiver.join().unwrap();
    assert!(matches!(result, Err(crate::Error::Interrupted)));

    stack.shutdown().unwrap();
}
