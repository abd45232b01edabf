//! Culvert: a software IPv4 router with optional NAPT.
//!
//! The crate implements the datapath of a multi-interface IPv4 router:
//! per-frame classification (ARP / IPv4), ARP resolution with a retrying
//! request queue, longest-prefix-match forwarding, ICMP diagnostics, and
//! an optional NAPT mode that rewrites ICMP echo identifiers and TCP
//! ports between a designated internal and external interface.
//!
//! The link layer is injected: raw Ethernet frames enter through
//! [`Router::handle_frame`] and leave through a caller-supplied
//! [`FrameSink`]. Two background threads age the ARP cache and the NAT
//! table at 1 Hz; both are owned by the [`Router`] and joined on
//! shutdown.

use core::fmt;

pub mod arp_cache;
pub mod config;
mod datapath;
pub mod error;
pub mod iface;
pub mod link;
pub mod nat;
pub mod route;
pub mod router;
pub mod wire;

pub use config::{NatConfig, RouterConfig};
pub use error::RouterError;
pub use iface::{Interface, InterfaceTable};
pub use link::FrameSink;
pub use route::{RouteEntry, RoutingTable};
pub use router::Router;

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);
    pub const ZERO: Self = Self([0x00; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice; `None` unless exactly representable.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let mut mac = [0u8; 6];
        if bytes.len() < 6 {
            return None;
        }
        mac.copy_from_slice(&bytes[..6]);
        Some(Self(mac))
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}
