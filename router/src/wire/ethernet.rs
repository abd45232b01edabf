//! Ethernet II frame parsing and construction.

use crate::{error::RouterError, MacAddress};

/// Ethernet frame header size: dst(6) + src(6) + ethertype(2) = 14 bytes
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// EtherType constants
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Parsed Ethernet frame
#[derive(Debug, Clone)]
pub struct EthernetFrame<'a> {
    /// Destination MAC address
    pub dst_mac: MacAddress,
    /// Source MAC address
    pub src_mac: MacAddress,
    /// EtherType field
    pub ethertype: u16,
    /// Payload (reference to data after the header)
    pub payload: &'a [u8],
}

/// Parse an Ethernet frame from raw bytes.
///
/// Returns an `EthernetFrame` with a payload reference into the original
/// buffer for zero-copy access.
pub fn parse_frame(data: &[u8]) -> Result<EthernetFrame<'_>, RouterError> {
    if data.len() < ETHERNET_HEADER_SIZE {
        return Err(RouterError::FrameTruncated {
            what: "ethernet frame",
            need: ETHERNET_HEADER_SIZE,
            got: data.len(),
        });
    }

    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    src.copy_from_slice(&data[6..12]);
    let ethertype = u16::from_be_bytes([data[12], data[13]]);

    Ok(EthernetFrame {
        dst_mac: MacAddress(dst),
        src_mac: MacAddress(src),
        ethertype,
        payload: &data[ETHERNET_HEADER_SIZE..],
    })
}

/// Construct an Ethernet frame from components.
pub fn construct_frame(
    dst: MacAddress,
    src: MacAddress,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + payload.len());

    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);

    frame
}

/// Rewrite the destination and source addresses of a frame in place.
///
/// The buffer must hold at least the 14-byte header.
pub fn set_addrs(frame: &mut [u8], dst: MacAddress, src: MacAddress) {
    frame[0..6].copy_from_slice(&dst.0);
    frame[6..12].copy_from_slice(&src.0);
}
