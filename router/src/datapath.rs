//! Per-frame datapath.
//!
//! One entry point, [`RouterCore::handle_frame`], classifies each
//! received frame and either answers locally, forwards along a route,
//! queues on an unresolved next hop, or drops with an ICMP diagnostic.
//! NAT rewriting happens at egress (inline on an ARP hit, or when a
//! pending frame is flushed by an ARP reply), so queued frames are
//! always the untranslated originals.
//!
//! No monitor lock is held across `FrameSink::send_frame`.

use std::net::Ipv4Addr;
use std::time::Instant;

use log::{debug, error, trace, warn};

use crate::{
    arp_cache::ArpRequest,
    error::RouterError,
    iface::Interface,
    nat::{Direction, NatKind},
    router::{NatRuntime, RouterCore},
    wire::{
        arp::{self, ArpPacket},
        ethernet::{self, ETHERNET_HEADER_SIZE, ETHERTYPE_ARP, ETHERTYPE_IPV4},
        icmp::{
            self, ICMP_CODE_HOST_UNREACHABLE, ICMP_CODE_NET_UNREACHABLE,
            ICMP_CODE_PORT_UNREACHABLE, ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST,
            ICMP_TIME_EXCEEDED,
        },
        ipv4::{self, IpProtocol, Ipv4Header},
        tcp::{self, TcpFlags},
    },
    MacAddress,
};

const ETH: usize = ETHERNET_HEADER_SIZE;

/// Outcome of offering a crossing packet to the NAT table.
enum NatVerdict {
    Forward,
    Drop,
}

/// How an inbound frame addressed to the external IP is handled.
enum InboundNat {
    /// Translatable and mapped; forward toward this internal address
    Target(Ipv4Addr),
    /// Translatable kind but no mapping: silent drop
    Miss,
    /// Not a translatable kind; local-delivery rules apply
    NotApplicable,
}

impl RouterCore {
    /// Datapath entry point, invoked once per received frame.
    pub(crate) fn handle_frame(&self, frame: &[u8], in_iface: &str) -> Result<(), RouterError> {
        if frame.len() < ETH {
            warn!("{}: runt frame of {} bytes dropped", in_iface, frame.len());
            return Err(RouterError::FrameTruncated {
                what: "ethernet frame",
                need: ETH,
                got: frame.len(),
            });
        }
        let iface = self.ifaces.require(in_iface)?;
        let eth = ethernet::parse_frame(frame)?;

        match eth.ethertype {
            ETHERTYPE_ARP => self.handle_arp(frame, iface),
            ETHERTYPE_IPV4 => self.handle_ipv4(frame, iface),
            other => {
                trace!("{}: ethertype {:#06x} ignored", in_iface, other);
                Ok(())
            }
        }
    }

    fn handle_arp(&self, frame: &[u8], iface: &Interface) -> Result<(), RouterError> {
        if frame.len() < ETH + arp::ARP_PACKET_SIZE {
            warn!("{}: truncated arp frame dropped", iface.name);
            return Err(RouterError::FrameTruncated {
                what: "arp frame",
                need: ETH + arp::ARP_PACKET_SIZE,
                got: frame.len(),
            });
        }
        let pkt = ArpPacket::from_bytes(&frame[ETH..])?;

        // Not a proxy ARP: only the receiving interface's own address.
        if pkt.target_ip != iface.ip {
            trace!("{}: arp for {} is not for us", iface.name, pkt.target_ip);
            return Ok(());
        }

        if pkt.is_request() {
            debug!(
                "{}: arp who-has {} tell {}, replying",
                iface.name, pkt.target_ip, pkt.sender_ip
            );
            let reply = ArpPacket::reply(iface.mac, iface.ip, pkt.sender_mac, pkt.sender_ip);
            let mut out = frame.to_vec();
            out[ETH..ETH + arp::ARP_PACKET_SIZE].copy_from_slice(&reply.to_bytes());
            ethernet::set_addrs(&mut out, pkt.sender_mac, iface.mac);
            self.sink.send_frame(&out, &iface.name)
        } else if pkt.is_reply() {
            debug!(
                "{}: arp reply {} is-at {}",
                iface.name, pkt.sender_ip, pkt.sender_mac
            );
            if let Some(req) = self.cache.insert_mac(pkt.sender_mac, pkt.sender_ip) {
                self.flush_pending(req, pkt.sender_mac);
            }
            Ok(())
        } else {
            trace!("{}: arp operation {} ignored", iface.name, pkt.operation);
            Ok(())
        }
    }

    /// Send every frame that was waiting on a freshly resolved next hop.
    fn flush_pending(&self, req: ArpRequest, next_hop: MacAddress) {
        for pkt in req.packets {
            let out_iface = match self.ifaces.require(&pkt.iface) {
                Ok(iface) => iface,
                Err(err) => {
                    warn!("pending frame dropped: {}", err);
                    continue;
                }
            };
            let mut out = pkt.frame;
            if out.len() < ETH + Ipv4Header::MIN_SIZE {
                warn!("pending frame dropped: not an ipv4 packet");
                continue;
            }

            ethernet::set_addrs(&mut out, next_hop, out_iface.mac);
            let region = &mut out[ETH..];
            let ttl = region[8];
            ipv4::set_ttl(region, ttl.saturating_sub(1));
            if let NatVerdict::Drop = self.apply_nat(region, &out_iface.name) {
                continue;
            }
            ipv4::write_checksum(&mut out[ETH..]);

            if let Err(err) = self.sink.send_frame(&out, &out_iface.name) {
                error!("pending frame send failed: {}", err);
            }
        }
    }

    fn handle_ipv4(&self, frame: &[u8], iface: &Interface) -> Result<(), RouterError> {
        if frame.len() < ETH + Ipv4Header::MIN_SIZE {
            warn!("{}: truncated ipv4 frame dropped", iface.name);
            return Err(RouterError::FrameTruncated {
                what: "ipv4 frame",
                need: ETH + Ipv4Header::MIN_SIZE,
                got: frame.len(),
            });
        }
        let region = &frame[ETH..];
        if !ipv4::verify_checksum(region) {
            warn!("{}: ipv4 header checksum mismatch, dropped", iface.name);
            return Err(RouterError::HeaderChecksum {
                what: "ipv4 header",
            });
        }
        let hdr = Ipv4Header::from_bytes(region)?;
        let total = usize::from(hdr.total_length);
        if total < hdr.header_len() || total > region.len() {
            warn!("{}: ipv4 total length out of bounds, dropped", iface.name);
            return Err(RouterError::MalformedPacket {
                what: "ipv4 packet",
                reason: "total length out of bounds",
            });
        }

        // Inbound translation runs before local delivery: frames for the
        // external address may belong to a mapped internal flow.
        if let Some(nat) = &self.nat {
            if iface.name == nat.external_iface && hdr.destination == nat.external_ip {
                match self.classify_inbound(nat, region, &hdr) {
                    InboundNat::Target(ip_int) => {
                        if hdr.ttl <= 1 {
                            warn!("{}: ttl expired in transit", iface.name);
                            return self.send_icmp_error(frame, iface, ICMP_TIME_EXCEEDED, 0);
                        }
                        return self.forward_packet(frame, ip_int, iface);
                    }
                    InboundNat::Miss => {
                        debug!(
                            "{}: no nat mapping for inbound packet from {}, dropped",
                            iface.name, hdr.source
                        );
                        return Ok(());
                    }
                    InboundNat::NotApplicable => {}
                }
            }
        }

        if self.ifaces.owns_ip(hdr.destination) {
            return self.deliver_local(frame, iface, &hdr);
        }

        if hdr.ttl <= 1 {
            warn!(
                "{}: ttl expired for {} -> {}",
                iface.name, hdr.source, hdr.destination
            );
            return self.send_icmp_error(frame, iface, ICMP_TIME_EXCEEDED, 0);
        }

        self.forward_packet(frame, hdr.destination, iface)
    }

    /// A packet addressed to one of our interfaces: answer echo
    /// requests, refuse TCP/UDP with Port Unreachable, ignore the rest.
    fn deliver_local(
        &self,
        frame: &[u8],
        in_iface: &Interface,
        hdr: &Ipv4Header,
    ) -> Result<(), RouterError> {
        let region = &frame[ETH..];
        let hlen = hdr.header_len();
        let total = usize::from(hdr.total_length);

        match IpProtocol::from_u8(hdr.protocol) {
            Some(IpProtocol::Icmp) => {
                if total < hlen + icmp::ICMP_ECHO_HEADER_SIZE {
                    warn!("{}: truncated icmp message dropped", in_iface.name);
                    return Err(RouterError::FrameTruncated {
                        what: "icmp message",
                        need: hlen + icmp::ICMP_ECHO_HEADER_SIZE,
                        got: total,
                    });
                }
                let icmp_region = &region[hlen..total];
                if !icmp::verify_checksum(icmp_region) {
                    warn!("{}: icmp checksum mismatch, dropped", in_iface.name);
                    return Err(RouterError::HeaderChecksum {
                        what: "icmp message",
                    });
                }
                if icmp::msg_type(icmp_region) != ICMP_ECHO_REQUEST {
                    trace!(
                        "{}: icmp type {} to us ignored",
                        in_iface.name,
                        icmp::msg_type(icmp_region)
                    );
                    return Ok(());
                }

                debug!(
                    "{}: echo request for {}, replying",
                    in_iface.name, hdr.destination
                );
                let mut out = frame.to_vec();
                let reply_region = &mut out[ETH..];
                ipv4::set_src(reply_region, hdr.destination);
                ipv4::set_dst(reply_region, hdr.source);
                ipv4::set_ttl(reply_region, 255);
                ipv4::write_checksum(reply_region);
                let reply_icmp = &mut out[ETH + hlen..ETH + total];
                icmp::set_type(reply_icmp, ICMP_ECHO_REPLY);
                icmp::write_checksum(reply_icmp);

                self.local_egress(out, hdr.source)
            }
            Some(IpProtocol::Tcp) | Some(IpProtocol::Udp) => {
                debug!(
                    "{}: transport to router address {}, port unreachable",
                    in_iface.name, hdr.destination
                );
                self.send_icmp_error(
                    frame,
                    in_iface,
                    ICMP_DEST_UNREACHABLE,
                    ICMP_CODE_PORT_UNREACHABLE,
                )
            }
            None => {
                trace!(
                    "{}: protocol {} to us ignored",
                    in_iface.name,
                    hdr.protocol
                );
                Ok(())
            }
        }
    }

    /// Egress for locally generated echo replies: route, resolve, send
    /// or park. The reply leaves with the TTL already finalized.
    fn local_egress(&self, mut out: Vec<u8>, dst: Ipv4Addr) -> Result<(), RouterError> {
        let Some(route) = self.routes.longest_prefix_match(dst) else {
            debug!("no route for echo reply to {}, dropped", dst);
            return Ok(());
        };
        let out_iface = self.ifaces.require(&route.iface)?;
        let next_hop = route.next_hop(dst);

        match self.cache.lookup(next_hop) {
            Some(mac) => {
                ethernet::set_addrs(&mut out, mac, out_iface.mac);
                self.sink.send_frame(&out, &route.iface)
            }
            None => {
                debug!("arp miss for {}, parking echo reply", next_hop);
                self.cache.queue_request(next_hop, &out, &route.iface);
                Ok(())
            }
        }
    }

    /// Forward a transit packet toward `lpm_key` (the destination, or
    /// the mapped internal address for inbound NAT traffic).
    fn forward_packet(
        &self,
        frame: &[u8],
        lpm_key: Ipv4Addr,
        in_iface: &Interface,
    ) -> Result<(), RouterError> {
        let Some(route) = self.routes.longest_prefix_match(lpm_key) else {
            debug!("no route for {}, net unreachable", lpm_key);
            return self.send_icmp_error(
                frame,
                in_iface,
                ICMP_DEST_UNREACHABLE,
                ICMP_CODE_NET_UNREACHABLE,
            );
        };
        let out_iface = self.ifaces.require(&route.iface)?;
        let next_hop = route.next_hop(lpm_key);

        match self.cache.lookup(next_hop) {
            Some(mac) => {
                let mut out = frame.to_vec();
                ethernet::set_addrs(&mut out, mac, out_iface.mac);
                let region = &mut out[ETH..];
                let ttl = region[8];
                ipv4::set_ttl(region, ttl.saturating_sub(1));
                if let NatVerdict::Drop = self.apply_nat(region, &out_iface.name) {
                    return Ok(());
                }
                ipv4::write_checksum(&mut out[ETH..]);
                trace!("forwarding {} via {} ({})", lpm_key, next_hop, route.iface);
                self.sink.send_frame(&out, &route.iface)
            }
            None => {
                debug!("arp miss for {}, queueing frame", next_hop);
                self.cache.queue_request(next_hop, frame, &route.iface);
                Ok(())
            }
        }
    }

    /// Decide whether an inbound frame for the external address belongs
    /// to a mapped flow. The lookup also drives the connection FSM; the
    /// rewrite at egress repeats it, which the transition table absorbs.
    fn classify_inbound(
        &self,
        nat: &NatRuntime,
        region: &[u8],
        hdr: &Ipv4Header,
    ) -> InboundNat {
        let hlen = hdr.header_len();
        let total = usize::from(hdr.total_length);

        match IpProtocol::from_u8(hdr.protocol) {
            Some(IpProtocol::Icmp) if total >= hlen + icmp::ICMP_ECHO_HEADER_SIZE => {
                let icmp_region = &region[hlen..total];
                if icmp::msg_type(icmp_region) != ICMP_ECHO_REPLY {
                    return InboundNat::NotApplicable;
                }
                match nat.table.lookup_external(
                    icmp::echo_id(icmp_region),
                    NatKind::Icmp,
                    hdr.source,
                    0,
                    TcpFlags::empty(),
                ) {
                    Some(mapping) => InboundNat::Target(mapping.ip_int),
                    None => InboundNat::Miss,
                }
            }
            Some(IpProtocol::Tcp) if total >= hlen + tcp::TCP_HEADER_SIZE => {
                let seg = &region[hlen..total];
                match nat.table.lookup_external(
                    tcp::dst_port(seg),
                    NatKind::Tcp,
                    hdr.source,
                    tcp::src_port(seg),
                    tcp::flags(seg),
                ) {
                    Some(mapping) => InboundNat::Target(mapping.ip_int),
                    None => InboundNat::Miss,
                }
            }
            _ => InboundNat::NotApplicable,
        }
    }

    /// Rewrite a packet crossing the NAT boundary, directed by the
    /// outgoing interface. Non-crossing traffic passes through.
    fn apply_nat(&self, region: &mut [u8], out_iface: &str) -> NatVerdict {
        let Some(nat) = &self.nat else {
            return NatVerdict::Forward;
        };
        let dir = if out_iface == nat.external_iface {
            Direction::Outbound
        } else if out_iface == nat.internal_iface {
            Direction::Inbound
        } else {
            return NatVerdict::Forward;
        };
        self.rewrite_nat(nat, region, dir)
    }

    fn rewrite_nat(&self, nat: &NatRuntime, region: &mut [u8], dir: Direction) -> NatVerdict {
        let hdr = match Ipv4Header::from_bytes(region) {
            Ok(hdr) => hdr,
            Err(err) => {
                warn!("nat: unparseable packet dropped: {}", err);
                return NatVerdict::Drop;
            }
        };
        let hlen = hdr.header_len();
        let total = usize::from(hdr.total_length);
        if total < hlen || total > region.len() {
            warn!("nat: total length out of bounds, dropped");
            return NatVerdict::Drop;
        }

        match IpProtocol::from_u8(hdr.protocol) {
            Some(IpProtocol::Icmp) => {
                if total < hlen + icmp::ICMP_ECHO_HEADER_SIZE {
                    return NatVerdict::Forward;
                }
                match (dir, icmp::msg_type(&region[hlen..total])) {
                    (Direction::Outbound, ICMP_ECHO_REQUEST) => {
                        let id = icmp::echo_id(&region[hlen..total]);
                        let mapping = match nat.table.lookup_internal(
                            hdr.source,
                            id,
                            NatKind::Icmp,
                            hdr.destination,
                            0,
                            TcpFlags::empty(),
                        ) {
                            Some(mapping) => mapping,
                            None => match nat.table.insert(
                                hdr.source,
                                id,
                                NatKind::Icmp,
                                hdr.destination,
                                0,
                                true,
                            ) {
                                Ok(mapping) => mapping,
                                Err(err) => {
                                    error!("nat: cannot map icmp flow: {}", err);
                                    return NatVerdict::Drop;
                                }
                            },
                        };
                        ipv4::set_src(region, mapping.ip_ext);
                        let icmp_region = &mut region[hlen..total];
                        icmp::set_echo_id(icmp_region, mapping.aux_ext);
                        icmp::write_checksum(icmp_region);
                        NatVerdict::Forward
                    }
                    (Direction::Inbound, ICMP_ECHO_REPLY) => {
                        let id = icmp::echo_id(&region[hlen..total]);
                        let Some(mapping) = nat.table.lookup_external(
                            id,
                            NatKind::Icmp,
                            hdr.source,
                            0,
                            TcpFlags::empty(),
                        ) else {
                            debug!("nat: echo reply id {} unmapped, dropped", id);
                            return NatVerdict::Drop;
                        };
                        ipv4::set_dst(region, mapping.ip_int);
                        let icmp_region = &mut region[hlen..total];
                        icmp::set_echo_id(icmp_region, mapping.aux_int);
                        icmp::write_checksum(icmp_region);
                        NatVerdict::Forward
                    }
                    _ => NatVerdict::Forward,
                }
            }
            Some(IpProtocol::Tcp) => {
                if total < hlen + tcp::TCP_HEADER_SIZE {
                    warn!("nat: truncated tcp segment dropped");
                    return NatVerdict::Drop;
                }
                let flags = tcp::flags(&region[hlen..total]);
                match dir {
                    Direction::Outbound => {
                        let src_port = tcp::src_port(&region[hlen..total]);
                        let dst_port = tcp::dst_port(&region[hlen..total]);
                        let mapping = match nat.table.lookup_internal(
                            hdr.source,
                            src_port,
                            NatKind::Tcp,
                            hdr.destination,
                            dst_port,
                            flags,
                        ) {
                            Some(mapping) => mapping,
                            None => match nat.table.insert(
                                hdr.source,
                                src_port,
                                NatKind::Tcp,
                                hdr.destination,
                                dst_port,
                                true,
                            ) {
                                Ok(mapping) => mapping,
                                Err(err) => {
                                    error!("nat: cannot map tcp flow: {}", err);
                                    return NatVerdict::Drop;
                                }
                            },
                        };
                        ipv4::set_src(region, mapping.ip_ext);
                        let seg = &mut region[hlen..total];
                        tcp::set_src_port(seg, mapping.aux_ext);
                        tcp::write_checksum(seg, mapping.ip_ext, hdr.destination);
                        NatVerdict::Forward
                    }
                    Direction::Inbound => {
                        let src_port = tcp::src_port(&region[hlen..total]);
                        let dst_port = tcp::dst_port(&region[hlen..total]);
                        let Some(mapping) = nat.table.lookup_external(
                            dst_port,
                            NatKind::Tcp,
                            hdr.source,
                            src_port,
                            flags,
                        ) else {
                            debug!("nat: tcp port {} unmapped, dropped", dst_port);
                            return NatVerdict::Drop;
                        };
                        ipv4::set_dst(region, mapping.ip_int);
                        let seg = &mut region[hlen..total];
                        tcp::set_dst_port(seg, mapping.aux_int);
                        tcp::write_checksum(seg, hdr.source, mapping.ip_int);
                        NatVerdict::Forward
                    }
                }
            }
            _ => NatVerdict::Forward,
        }
    }

    /// Emit an ICMP error (type 3 or 11) about `original` out
    /// `out_iface`, carrying the offending IP header plus eight payload
    /// bytes. Suppressed when the offender's source is one of our own
    /// addresses.
    fn send_icmp_error(
        &self,
        original: &[u8],
        out_iface: &Interface,
        icmp_type: u8,
        code: u8,
    ) -> Result<(), RouterError> {
        let region = &original[ETH..];
        let orig = match Ipv4Header::from_bytes(region) {
            Ok(hdr) => hdr,
            Err(_) => return Ok(()),
        };

        if self.ifaces.owns_ip(orig.source) {
            debug!(
                "suppressing icmp {}/{} about our own packet",
                icmp_type, code
            );
            return Ok(());
        }

        // Port Unreachable answers as the address the sender spoke to;
        // the other diagnostics originate from the replying interface.
        let reply_src = if icmp_type == ICMP_DEST_UNREACHABLE && code == ICMP_CODE_PORT_UNREACHABLE
        {
            orig.destination
        } else {
            out_iface.ip
        };

        let icmp_region = icmp::build_error(icmp_type, code, region);
        let mut ip = Ipv4Header {
            version: 4,
            ihl: 5,
            tos: 0,
            total_length: (Ipv4Header::MIN_SIZE + icmp_region.len()) as u16,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: 255,
            protocol: IpProtocol::Icmp as u8,
            checksum: 0,
            source: reply_src,
            destination: orig.source,
        };
        ip.finalize_checksum();

        let orig_eth = ethernet::parse_frame(original)?;
        let mut payload = Vec::with_capacity(Ipv4Header::MIN_SIZE + icmp_region.len());
        payload.extend_from_slice(&ip.to_bytes());
        payload.extend_from_slice(&icmp_region);
        let out = ethernet::construct_frame(orig_eth.src_mac, out_iface.mac, ETHERTYPE_IPV4, &payload);

        debug!(
            "icmp {}/{} to {} via {}",
            icmp_type, code, orig.source, out_iface.name
        );
        self.sink.send_frame(&out, &out_iface.name)
    }

    /// One sweeper pass: age the cache, retransmit due requests, and
    /// answer exhausted ones with Host Unreachable per parked frame.
    pub(crate) fn sweep_arp(&self, now: Instant) {
        let outcome = self.cache.sweep(now);

        for retry in outcome.retries {
            let Some(out_iface) = self.ifaces.get(&retry.iface) else {
                warn!("arp retry dropped: unknown interface {:?}", retry.iface);
                continue;
            };
            let pkt = ArpPacket::request(out_iface.mac, out_iface.ip, retry.target_ip);
            let frame = ethernet::construct_frame(
                MacAddress::BROADCAST,
                out_iface.mac,
                ETHERTYPE_ARP,
                &pkt.to_bytes(),
            );
            debug!(
                "arp who-has {} tell {} ({})",
                retry.target_ip, out_iface.ip, retry.iface
            );
            if let Err(err) = self.sink.send_frame(&frame, &retry.iface) {
                error!("arp request send failed: {}", err);
            }
        }

        for req in outcome.failed {
            warn!(
                "arp: {} unresolved after {} attempts, failing {} queued packets",
                req.ip,
                req.times_sent,
                req.packets.len()
            );
            for pkt in &req.packets {
                if pkt.frame.len() < ETH + Ipv4Header::MIN_SIZE {
                    continue;
                }
                let Ok(orig) = Ipv4Header::from_bytes(&pkt.frame[ETH..]) else {
                    continue;
                };
                let Some(route) = self.routes.longest_prefix_match(orig.source) else {
                    debug!("no route back to {}, host unreachable dropped", orig.source);
                    continue;
                };
                let Some(out_iface) = self.ifaces.get(&route.iface) else {
                    continue;
                };
                if let Err(err) = self.send_icmp_error(
                    &pkt.frame,
                    out_iface,
                    ICMP_DEST_UNREACHABLE,
                    ICMP_CODE_HOST_UNREACHABLE,
                ) {
                    error!("host unreachable send failed: {}", err);
                }
            }
        }
    }
}
