//! End-to-end datapath scenarios over a captured link layer.

mod common;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use common::*;
use culvert_router::{
    wire::{
        arp::{ArpPacket, ARP_PACKET_SIZE},
        ethernet::{self, ETHERTYPE_ARP},
        icmp,
        ipv4::IpProtocol,
        tcp::TcpFlags,
    },
    MacAddress, RouterError,
};

#[test]
fn arp_request_for_router_is_answered() {
    let (router, sink) = router();

    let who_has = ArpPacket::request(H1_MAC, H1_IP, ETH1_IP);
    let frame = ethernet::construct_frame(
        MacAddress::BROADCAST,
        H1_MAC,
        ETHERTYPE_ARP,
        &who_has.to_bytes(),
    );
    router.handle_frame(&frame, "eth1").unwrap();

    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let (frame, iface) = &sent[0];
    assert_eq!(iface, "eth1");

    let eth = ethernet::parse_frame(frame).unwrap();
    assert_eq!(eth.dst_mac, H1_MAC);
    assert_eq!(eth.src_mac, ETH1_MAC);
    let reply = ArpPacket::from_bytes(&frame[14..14 + ARP_PACKET_SIZE]).unwrap();
    assert!(reply.is_reply());
    assert_eq!(reply.sender_mac, ETH1_MAC);
    assert_eq!(reply.sender_ip, ETH1_IP);
    assert_eq!(reply.target_mac, H1_MAC);
    assert_eq!(reply.target_ip, H1_IP);
}

#[test]
fn arp_for_someone_else_is_dropped_silently() {
    let (router, sink) = router();

    let who_has = ArpPacket::request(H1_MAC, H1_IP, Ipv4Addr::new(10, 0, 1, 99));
    let frame = ethernet::construct_frame(
        MacAddress::BROADCAST,
        H1_MAC,
        ETHERTYPE_ARP,
        &who_has.to_bytes(),
    );
    router.handle_frame(&frame, "eth1").unwrap();
    assert!(sink.take().is_empty());
}

#[test]
fn forwarding_hit_decrements_ttl() {
    let (router, sink) = router();
    prime_arp(&router, "eth2", ETH2_MAC, ETH2_IP, GW_MAC, GW_IP);
    sink.take();

    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 0x4242, 1, b"abcdefgh");
    let region = ipv4_region(H1_IP, PEER_IP, IpProtocol::Icmp, 64, &echo);
    let frame = ip_frame(ETH1_MAC, H1_MAC, &region);
    router.handle_frame(&frame, "eth1").unwrap();

    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let (out, iface) = &sent[0];
    assert_eq!(iface, "eth2");

    let fwd = parse_sent_ipv4(out);
    assert_eq!(fwd.dst_mac, GW_MAC);
    assert_eq!(fwd.src_mac, ETH2_MAC);
    assert_eq!(fwd.header.ttl, 63);
    assert_eq!(fwd.header.source, H1_IP);
    assert_eq!(fwd.header.destination, PEER_IP);
    // Payload crosses untouched
    assert_eq!(&fwd.region[20..], echo.as_slice());
}

#[test]
fn forwarding_miss_queues_then_flushes_on_arp_reply() {
    let (router, sink) = router();

    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 7, 1, b"data");
    let region = ipv4_region(H1_IP, PEER_IP, IpProtocol::Icmp, 64, &echo);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();
    assert!(sink.take().is_empty(), "nothing sent before resolution");

    // The gateway answers; the parked frame goes out rewritten.
    prime_arp(&router, "eth2", ETH2_MAC, ETH2_IP, GW_MAC, GW_IP);
    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let (out, iface) = &sent[0];
    assert_eq!(iface, "eth2");
    let fwd = parse_sent_ipv4(out);
    assert_eq!(fwd.dst_mac, GW_MAC);
    assert_eq!(fwd.src_mac, ETH2_MAC);
    assert_eq!(fwd.header.ttl, 63);
    assert_eq!(&fwd.region[20..], echo.as_slice());
}

#[test]
fn arp_retry_exhaustion_yields_host_unreachable() {
    let (router, sink) = router();

    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 9, 1, b"payload!");
    let region = ipv4_region(H1_IP, PEER_IP, IpProtocol::Icmp, 64, &echo);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();

    let base = Instant::now();
    // Five broadcasts on seconds 0..4
    for tick in 0..5u64 {
        router.sweep_arp(base + Duration::from_secs(tick));
        let sent = sink.take();
        assert_eq!(sent.len(), 1, "tick {}", tick);
        let (frame, iface) = &sent[0];
        assert_eq!(iface, "eth2");
        let eth = ethernet::parse_frame(frame).unwrap();
        assert_eq!(eth.dst_mac, MacAddress::BROADCAST);
        assert_eq!(eth.ethertype, ETHERTYPE_ARP);
        let req = ArpPacket::from_bytes(eth.payload).unwrap();
        assert!(req.is_request());
        assert_eq!(req.sender_ip, ETH2_IP);
        assert_eq!(req.target_ip, GW_IP);
        assert_eq!(req.target_mac, MacAddress::BROADCAST);
    }

    // Second 5: one Host Unreachable toward H1, no more broadcasts
    router.sweep_arp(base + Duration::from_secs(5));
    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let (frame, iface) = &sent[0];
    assert_eq!(iface, "eth1");
    let err = parse_sent_ipv4(frame);
    assert_eq!(err.dst_mac, H1_MAC);
    assert_eq!(err.header.destination, H1_IP);
    assert_eq!(err.header.source, ETH1_IP);
    assert_eq!(err.region[20], icmp::ICMP_DEST_UNREACHABLE);
    assert_eq!(err.region[21], icmp::ICMP_CODE_HOST_UNREACHABLE);
    assert!(icmp::verify_checksum(&err.region[20..]));
    // Error data carries the offending IP header
    assert_eq!(&err.region[28..48], &region[..20]);

    // Second 6: the request is gone
    router.sweep_arp(base + Duration::from_secs(6));
    assert!(sink.take().is_empty());
}

#[test]
fn ttl_expiry_sends_time_exceeded() {
    let (router, sink) = router();

    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 3, 1, b"x");
    let region = ipv4_region(H1_IP, PEER_IP, IpProtocol::Icmp, 1, &echo);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();

    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let (frame, iface) = &sent[0];
    assert_eq!(iface, "eth1");
    let err = parse_sent_ipv4(frame);
    assert_eq!(err.header.destination, H1_IP);
    assert_eq!(err.header.source, ETH1_IP);
    assert_eq!(err.region[20], icmp::ICMP_TIME_EXCEEDED);
    assert_eq!(err.region[21], 0);
}

#[test]
fn local_echo_is_answered_with_ttl_255() {
    let (router, sink) = router();
    prime_arp(&router, "eth1", ETH1_MAC, ETH1_IP, H1_MAC, H1_IP);
    sink.take();

    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 0x0707, 3, b"ping-data");
    let region = ipv4_region(H1_IP, ETH1_IP, IpProtocol::Icmp, 64, &echo);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();

    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let (frame, iface) = &sent[0];
    assert_eq!(iface, "eth1");
    let reply = parse_sent_ipv4(frame);
    assert_eq!(reply.dst_mac, H1_MAC);
    assert_eq!(reply.header.source, ETH1_IP);
    assert_eq!(reply.header.destination, H1_IP);
    assert_eq!(reply.header.ttl, 255);

    let icmp_region = &reply.region[20..];
    assert!(icmp::verify_checksum(icmp_region));
    assert_eq!(icmp::msg_type(icmp_region), icmp::ICMP_ECHO_REPLY);
    // Identifier, sequence, and data preserved
    assert_eq!(icmp::echo_id(icmp_region), 0x0707);
    assert_eq!(&icmp_region[6..8], &[0, 3]);
    assert_eq!(&icmp_region[8..], b"ping-data");
}

#[test]
fn tcp_to_router_gets_port_unreachable() {
    let (router, sink) = router();

    // H1 talks to the *other* interface's address; the reply must keep
    // that address as its source.
    let seg = tcp_region(H1_IP, ETH2_IP, 5000, 22, TcpFlags::SYN);
    let region = ipv4_region(H1_IP, ETH2_IP, IpProtocol::Tcp, 64, &seg);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();

    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let (frame, iface) = &sent[0];
    assert_eq!(iface, "eth1");
    let err = parse_sent_ipv4(frame);
    assert_eq!(err.header.source, ETH2_IP);
    assert_eq!(err.header.destination, H1_IP);
    assert_eq!(err.region[20], icmp::ICMP_DEST_UNREACHABLE);
    assert_eq!(err.region[21], icmp::ICMP_CODE_PORT_UNREACHABLE);
    // First 8 payload bytes of the offender (the TCP ports and seq)
    assert_eq!(&err.region[48..56], &seg[..8]);
}

#[test]
fn no_route_sends_net_unreachable() {
    let sink = CaptureSink::new();
    let mut config = base_config();
    config.routes.retain(|r| r.mask != Ipv4Addr::UNSPECIFIED); // drop default route
    let router = culvert_router::Router::new(config, sink.clone()).unwrap();

    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 1, 1, b"x");
    let region = ipv4_region(H1_IP, PEER_IP, IpProtocol::Icmp, 64, &echo);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();

    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    let err = parse_sent_ipv4(&sent[0].0);
    assert_eq!(err.region[20], icmp::ICMP_DEST_UNREACHABLE);
    assert_eq!(err.region[21], icmp::ICMP_CODE_NET_UNREACHABLE);
}

#[test]
fn bad_ip_checksum_is_dropped() {
    let (router, sink) = router();

    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 1, 1, b"x");
    let mut region = ipv4_region(H1_IP, PEER_IP, IpProtocol::Icmp, 64, &echo);
    region[10] ^= 0xFF;
    let result = router.handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1");
    assert_eq!(
        result,
        Err(RouterError::HeaderChecksum {
            what: "ipv4 header"
        })
    );
    assert!(sink.take().is_empty());
}

#[test]
fn runt_frames_are_rejected() {
    let (router, sink) = router();
    assert!(matches!(
        router.handle_frame(&[0u8; 9], "eth1"),
        Err(RouterError::FrameTruncated { .. })
    ));
    assert!(sink.take().is_empty());
}

#[test]
fn unknown_interface_is_an_error() {
    let (router, _sink) = router();
    let frame = [0u8; 60];
    assert!(matches!(
        router.handle_frame(&frame, "eth9"),
        Err(RouterError::UnknownInterface { .. })
    ));
}

#[test]
fn icmp_errors_about_own_packets_are_suppressed() {
    let (router, sink) = router();

    // A packet claiming to come from the router itself dies on TTL, but
    // no diagnostic may be generated about it.
    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 1, 1, b"x");
    let region = ipv4_region(ETH1_IP, PEER_IP, IpProtocol::Icmp, 1, &echo);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();
    assert!(sink.take().is_empty());
}

#[test]
fn echo_identifiers_cross_unchanged_without_nat() {
    let (router, sink) = router();
    prime_arp(&router, "eth2", ETH2_MAC, ETH2_IP, GW_MAC, GW_IP);
    prime_arp(&router, "eth1", ETH1_MAC, ETH1_IP, H1_MAC, H1_IP);
    sink.take();

    // Request out...
    let echo = icmp_echo_region(icmp::ICMP_ECHO_REQUEST, 0x1234, 1, b"x");
    let region = ipv4_region(H1_IP, PEER_IP, IpProtocol::Icmp, 64, &echo);
    router
        .handle_frame(&ip_frame(ETH1_MAC, H1_MAC, &region), "eth1")
        .unwrap();
    let sent = sink.take();
    let out = parse_sent_ipv4(&sent[0].0);
    assert_eq!(icmp::echo_id(&out.region[20..]), 0x1234);

    // ...reply back in
    let echo = icmp_echo_region(icmp::ICMP_ECHO_REPLY, 0x1234, 1, b"x");
    let region = ipv4_region(PEER_IP, H1_IP, IpProtocol::Icmp, 64, &echo);
    router
        .handle_frame(&ip_frame(ETH2_MAC, GW_MAC, &region), "eth2")
        .unwrap();
    let sent = sink.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "eth1");
    let back = parse_sent_ipv4(&sent[0].0);
    assert_eq!(back.header.destination, H1_IP);
    assert_eq!(icmp::echo_id(&back.region[20..]), 0x1234);
}

#[test]
fn unknown_ethertype_is_ignored() {
    let (router, sink) = router();
    let frame = ethernet::construct_frame(ETH1_MAC, H1_MAC, 0x86DD, &[0u8; 40]);
    router.handle_frame(&frame, "eth1").unwrap();
    assert!(sink.take().is_empty());
}
