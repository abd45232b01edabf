//! Router configuration: interface list, static routes, NAT parameters.
//!
//! Loaded once at startup and immutable thereafter. The table loaders
//! parse the whitespace-column formats the deployment tooling emits:
//! one interface per line as `name mac ipv4`, one route per line as
//! `dest gateway mask iface`. Blank lines and `#` comments are skipped.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::{error::RouterError, iface::Interface, route::RouteEntry, MacAddress};

/// Default ARP cache entry lifetime
pub const DEFAULT_ARP_ENTRY_TIMEOUT: Duration = Duration::from_secs(15);
/// Default ARP cache capacity
pub const DEFAULT_ARP_CACHE_SIZE: usize = 100;
/// Default NAT ICMP query idle timeout
pub const DEFAULT_ICMP_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
/// Default NAT TCP established idle timeout
pub const DEFAULT_TCP_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(7440);
/// Default NAT TCP transitory idle timeout
pub const DEFAULT_TCP_TRANSITORY_TIMEOUT: Duration = Duration::from_secs(300);

/// NAPT parameters; present only when NAT mode is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatConfig {
    /// Name of the interface facing the private network
    pub internal_iface: String,
    /// Name of the interface holding the public address
    pub external_iface: String,
    pub icmp_query_timeout: Duration,
    pub tcp_established_timeout: Duration,
    pub tcp_transitory_timeout: Duration,
}

impl NatConfig {
    pub fn new(internal_iface: impl Into<String>, external_iface: impl Into<String>) -> Self {
        Self {
            internal_iface: internal_iface.into(),
            external_iface: external_iface.into(),
            icmp_query_timeout: DEFAULT_ICMP_QUERY_TIMEOUT,
            tcp_established_timeout: DEFAULT_TCP_ESTABLISHED_TIMEOUT,
            tcp_transitory_timeout: DEFAULT_TCP_TRANSITORY_TIMEOUT,
        }
    }
}

/// Complete router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub interfaces: Vec<Interface>,
    pub routes: Vec<RouteEntry>,
    /// `Some` turns NAT mode on
    pub nat: Option<NatConfig>,
    pub arp_entry_timeout: Duration,
    pub arp_cache_size: usize,
}

impl RouterConfig {
    pub fn new(interfaces: Vec<Interface>, routes: Vec<RouteEntry>) -> Self {
        Self {
            interfaces,
            routes,
            nat: None,
            arp_entry_timeout: DEFAULT_ARP_ENTRY_TIMEOUT,
            arp_cache_size: DEFAULT_ARP_CACHE_SIZE,
        }
    }

    pub fn with_nat(mut self, nat: NatConfig) -> Self {
        self.nat = Some(nat);
        self
    }

    /// Check internal consistency: at least one interface, route and NAT
    /// interface names resolvable, a usable cache size.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.interfaces.is_empty() {
            return Err(RouterError::ConfigInvalid {
                reason: "no interfaces configured",
            });
        }
        if self.arp_cache_size == 0 {
            return Err(RouterError::ConfigInvalid {
                reason: "arp_cache_size must be at least 1",
            });
        }
        for route in &self.routes {
            if !self.interfaces.iter().any(|i| i.name == route.iface) {
                return Err(RouterError::ConfigInvalid {
                    reason: "route references unknown interface",
                });
            }
        }
        if let Some(nat) = &self.nat {
            for name in [&nat.internal_iface, &nat.external_iface] {
                if !self.interfaces.iter().any(|i| &i.name == name) {
                    return Err(RouterError::ConfigInvalid {
                        reason: "nat references unknown interface",
                    });
                }
            }
            if nat.internal_iface == nat.external_iface {
                return Err(RouterError::ConfigInvalid {
                    reason: "nat internal and external interface are the same",
                });
            }
        }
        Ok(())
    }
}

/// Parse an interface table: `name mac ipv4` per line.
pub fn parse_interfaces(text: &str) -> Result<Vec<Interface>, RouterError> {
    let mut interfaces = Vec::new();
    for (idx, line) in content_lines(text) {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(mac), Some(ip), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(RouterError::ConfigParse {
                line: idx,
                reason: "expected: name mac ipv4",
            });
        };
        interfaces.push(Interface {
            name: name.to_owned(),
            mac: parse_mac(mac).ok_or(RouterError::ConfigParse {
                line: idx,
                reason: "invalid mac address",
            })?,
            ip: parse_ipv4(ip, idx)?,
        });
    }
    Ok(interfaces)
}

/// Parse a routing table: `dest gateway mask iface` per line.
pub fn parse_routes(text: &str) -> Result<Vec<RouteEntry>, RouterError> {
    let mut routes = Vec::new();
    for (idx, line) in content_lines(text) {
        let mut fields = line.split_whitespace();
        let (Some(dest), Some(gateway), Some(mask), Some(iface), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(RouterError::ConfigParse {
                line: idx,
                reason: "expected: dest gateway mask iface",
            });
        };
        routes.push(RouteEntry {
            dest: parse_ipv4(dest, idx)?,
            gateway: parse_ipv4(gateway, idx)?,
            mask: parse_ipv4(mask, idx)?,
            iface: iface.to_owned(),
        });
    }
    Ok(routes)
}

/// Non-empty, non-comment lines with their 1-based line numbers.
fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
}

fn parse_ipv4(field: &str, line: usize) -> Result<Ipv4Addr, RouterError> {
    field.parse().map_err(|_| RouterError::ConfigParse {
        line,
        reason: "invalid ipv4 address",
    })
}

fn parse_mac(field: &str) -> Option<MacAddress> {
    let mut bytes = [0u8; 6];
    let mut parts = field.split(':');
    for byte in &mut bytes {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(MacAddress(bytes))
}
