//! Shared fixtures: a two-subnet router, a capturing sink, and frame
//! builders.
//!
//! Topology used across the end-to-end tests:
//!
//! ```text
//!   H1 10.0.1.11 (aa:..:01) --- eth1 10.0.1.1     [router]
//!   GW 172.64.3.1 (bb:..:01) -- eth2 172.64.3.10  [router] --- 8.8.8.8
//! ```

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use culvert_router::{
    config::{parse_interfaces, parse_routes},
    wire::{
        ethernet,
        icmp::{self, IcmpEchoHeader},
        ipv4::{IpProtocol, Ipv4Header},
        tcp::{self, TcpFlags, TcpHeader},
    },
    FrameSink, MacAddress, NatConfig, Router, RouterConfig, RouterError,
};

pub const ETH1_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
pub const ETH2_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x02]);
pub const ETH1_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
pub const ETH2_IP: Ipv4Addr = Ipv4Addr::new(172, 64, 3, 10);

pub const H1_MAC: MacAddress = MacAddress([0xAA, 0, 0, 0, 0, 0x01]);
pub const H1_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 11);
pub const GW_MAC: MacAddress = MacAddress([0xBB, 0, 0, 0, 0, 0x01]);
pub const GW_IP: Ipv4Addr = Ipv4Addr::new(172, 64, 3, 1);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Records every frame the router transmits.
#[derive(Default)]
pub struct CaptureSink {
    frames: Mutex<Vec<(Vec<u8>, String)>>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything captured so far.
    pub fn take(&self) -> Vec<(Vec<u8>, String)> {
        std::mem::take(&mut *self.frames.lock().expect("sink lock"))
    }
}

impl FrameSink for CaptureSink {
    fn send_frame(&self, frame: &[u8], iface: &str) -> Result<(), RouterError> {
        self.frames
            .lock()
            .expect("sink lock")
            .push((frame.to_vec(), iface.to_owned()));
        Ok(())
    }
}

pub fn base_config() -> RouterConfig {
    let interfaces = parse_interfaces(
        "eth1 02:00:00:00:00:01 10.0.1.1\n\
         eth2 02:00:00:00:00:02 172.64.3.10\n",
    )
    .expect("interfaces");
    let routes = parse_routes(
        "10.0.1.0   0.0.0.0    255.255.255.0 eth1\n\
         172.64.3.0 0.0.0.0    255.255.255.0 eth2\n\
         0.0.0.0    172.64.3.1 0.0.0.0       eth2\n",
    )
    .expect("routes");
    RouterConfig::new(interfaces, routes)
}

/// Opt into log output with `RUST_LOG=debug cargo test`.
fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn router() -> (Router, Arc<CaptureSink>) {
    init_logs();
    let sink = CaptureSink::new();
    let router = Router::new(base_config(), sink.clone()).expect("router");
    (router, sink)
}

pub fn nat_router() -> (Router, Arc<CaptureSink>) {
    init_logs();
    let sink = CaptureSink::new();
    let config = base_config().with_nat(NatConfig::new("eth1", "eth2"));
    let router = Router::new(config, sink.clone()).expect("router");
    (router, sink)
}

/// Resolve `ip -> mac` in the router's ARP cache by replying as the host.
pub fn prime_arp(router: &Router, iface: &str, router_mac: MacAddress, router_ip: Ipv4Addr, host_mac: MacAddress, host_ip: Ipv4Addr) {
    let reply = culvert_router::wire::arp::ArpPacket::reply(host_mac, host_ip, router_mac, router_ip);
    let frame = ethernet::construct_frame(router_mac, host_mac, ethernet::ETHERTYPE_ARP, &reply.to_bytes());
    router.handle_frame(&frame, iface).expect("arp reply");
}

pub fn ipv4_region(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpProtocol,
    ttl: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut hdr = Ipv4Header {
        version: 4,
        ihl: 5,
        tos: 0,
        total_length: (Ipv4Header::MIN_SIZE + payload.len()) as u16,
        identification: 0x1c46,
        flags: 0,
        fragment_offset: 0,
        ttl,
        protocol: proto as u8,
        checksum: 0,
        source: src,
        destination: dst,
    };
    hdr.finalize_checksum();
    let mut region = hdr.to_bytes().to_vec();
    region.extend_from_slice(payload);
    region
}

pub fn icmp_echo_region(icmp_type: u8, id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    let mut region = IcmpEchoHeader {
        icmp_type,
        code: 0,
        checksum: 0,
        identifier: id,
        sequence: seq,
    }
    .to_bytes()
    .to_vec();
    region.extend_from_slice(data);
    icmp::write_checksum(&mut region);
    region
}

pub fn tcp_region(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    flags: TcpFlags,
) -> Vec<u8> {
    let mut region = TcpHeader {
        src_port,
        dst_port,
        seq: 1,
        ack: 0,
        data_offset: 5,
        flags,
        window: 65535,
        checksum: 0,
        urgent: 0,
    }
    .to_bytes()
    .to_vec();
    tcp::write_checksum(&mut region, src, dst);
    region
}

pub fn ip_frame(dst_mac: MacAddress, src_mac: MacAddress, region: &[u8]) -> Vec<u8> {
    ethernet::construct_frame(dst_mac, src_mac, ethernet::ETHERTYPE_IPV4, region)
}

/// Parsed view of a captured IPv4 frame.
pub struct SentIpv4 {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    pub header: Ipv4Header,
    pub region: Vec<u8>,
}

pub fn parse_sent_ipv4(frame: &[u8]) -> SentIpv4 {
    let eth = ethernet::parse_frame(frame).expect("ethernet");
    assert_eq!(eth.ethertype, ethernet::ETHERTYPE_IPV4);
    let header = Ipv4Header::from_bytes(eth.payload).expect("ipv4");
    assert!(
        culvert_router::wire::ipv4::verify_checksum(eth.payload),
        "ipv4 checksum must verify"
    );
    SentIpv4 {
        dst_mac: eth.dst_mac,
        src_mac: eth.src_mac,
        header,
        region: eth.payload.to_vec(),
    }
}
