//! ARP packet codec (RFC 826, Ethernet/IPv4 only).

use std::net::Ipv4Addr;

use crate::{error::RouterError, MacAddress};

/// ARP hardware type: Ethernet
pub const ARP_HTYPE_ETHERNET: u16 = 1;
/// ARP protocol type: IPv4
pub const ARP_PTYPE_IPV4: u16 = 0x0800;
/// ARP operation: Request
pub const ARP_OP_REQUEST: u16 = 1;
/// ARP operation: Reply
pub const ARP_OP_REPLY: u16 = 2;
/// ARP packet size for Ethernet/IPv4: 28 bytes
pub const ARP_PACKET_SIZE: usize = 28;

/// ARP packet for Ethernet/IPv4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Broadcast who-has request. The target hardware field is filled
    /// with `0xff`, matching what the rest of the datapath emits.
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_OP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::BROADCAST,
            target_ip,
        }
    }

    pub fn reply(
        sender_mac: MacAddress,
        sender_ip: Ipv4Addr,
        target_mac: MacAddress,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ARP_OP_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Parse and validate an Ethernet/IPv4 ARP packet.
    pub fn from_bytes(data: &[u8]) -> Result<Self, RouterError> {
        if data.len() < ARP_PACKET_SIZE {
            return Err(RouterError::FrameTruncated {
                what: "arp packet",
                need: ARP_PACKET_SIZE,
                got: data.len(),
            });
        }

        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        let hlen = data[4];
        let plen = data[5];
        if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || hlen != 6 || plen != 4 {
            return Err(RouterError::MalformedPacket {
                what: "arp packet",
                reason: "not ethernet/ipv4",
            });
        }

        let operation = u16::from_be_bytes([data[6], data[7]]);
        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);
        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);
        let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        Ok(Self {
            operation,
            sender_mac: MacAddress(sender_mac),
            sender_ip,
            target_mac: MacAddress(target_mac),
            target_ip,
        })
    }

    /// Serialize to the 28-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(ARP_PACKET_SIZE);

        pkt.extend_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
        pkt.extend_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
        pkt.push(6);
        pkt.push(4);
        pkt.extend_from_slice(&self.operation.to_be_bytes());
        pkt.extend_from_slice(&self.sender_mac.0);
        pkt.extend_from_slice(&self.sender_ip.octets());
        pkt.extend_from_slice(&self.target_mac.0);
        pkt.extend_from_slice(&self.target_ip.octets());

        pkt
    }

    pub fn is_request(&self) -> bool {
        self.operation == ARP_OP_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.operation == ARP_OP_REPLY
    }
}
