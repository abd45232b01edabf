//! NAPT mapping table.
//!
//! Endpoint-independent translation between (internal IP, internal id)
//! and (external IP, external id), where the id is an ICMP echo
//! identifier or a TCP port. TCP mappings carry one tracked connection
//! per external peer; the connection state machine lives in [`fsm`].
//!
//! One monitor lock guards the table. Lookups return deep copies and,
//! for TCP, advance the matched connection's state as a side effect of
//! the observed flags. The 1 Hz reap expires idle mappings and
//! connections.

pub mod fsm;

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

use crate::{config::NatConfig, error::RouterError, wire::tcp::TcpFlags};

pub use fsm::{Direction, TcpState};

/// Translation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    Icmp,
    Tcp,
}

/// One tracked TCP connection of a mapping (keyed by external peer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatConnection {
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub state: TcpState,
    pub last_updated: Instant,
}

/// One bidirectional translation
#[derive(Debug, Clone, PartialEq)]
pub struct NatMapping {
    pub kind: NatKind,
    pub ip_int: Ipv4Addr,
    pub aux_int: u16,
    pub ip_ext: Ipv4Addr,
    pub aux_ext: u16,
    pub last_updated: Instant,
    /// Tracked connections; always empty for ICMP
    pub conns: Vec<NatConnection>,
}

/// External ports are allocated above this seed, monotonically.
const EXTERNAL_PORT_SEED: u16 = 1024;

#[derive(Debug)]
struct NatState {
    mappings: Vec<NatMapping>,
    /// Highest external id allocated so far; never decreases
    max_port: u16,
}

/// The monitor. See the module docs for the locking contract.
#[derive(Debug)]
pub struct NatTable {
    state: Mutex<NatState>,
    ip_ext: Ipv4Addr,
    icmp_query_timeout: Duration,
    tcp_established_timeout: Duration,
    tcp_transitory_timeout: Duration,
}

impl NatTable {
    /// `ip_ext` is the external interface address every mapping
    /// translates to.
    pub fn new(ip_ext: Ipv4Addr, cfg: &NatConfig) -> Self {
        Self {
            state: Mutex::new(NatState {
                mappings: Vec::new(),
                max_port: EXTERNAL_PORT_SEED,
            }),
            ip_ext,
            icmp_query_timeout: cfg.icmp_query_timeout,
            tcp_established_timeout: cfg.tcp_established_timeout,
            tcp_transitory_timeout: cfg.tcp_transitory_timeout,
        }
    }

    /// Find the mapping for internal flow (`ip_int`, `aux_int`, `kind`),
    /// refreshing it and (for TCP) advancing the connection matching
    /// `peer` with the observed `flags`. Returns a detached copy.
    pub fn lookup_internal(
        &self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: NatKind,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        flags: TcpFlags,
    ) -> Option<NatMapping> {
        let mut state = self.state.lock().expect("nat lock poisoned");
        let now = Instant::now();
        let mapping = state
            .mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.ip_int == ip_int && m.aux_int == aux_int)?;
        touch(mapping, kind, Direction::Outbound, peer_ip, peer_port, flags, now);
        Some(mapping.clone())
    }

    /// Find the mapping for external id (`aux_ext`, `kind`); otherwise
    /// as [`lookup_internal`](Self::lookup_internal).
    pub fn lookup_external(
        &self,
        aux_ext: u16,
        kind: NatKind,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        flags: TcpFlags,
    ) -> Option<NatMapping> {
        let mut state = self.state.lock().expect("nat lock poisoned");
        let now = Instant::now();
        let mapping = state
            .mappings
            .iter_mut()
            .find(|m| m.kind == kind && m.aux_ext == aux_ext)?;
        touch(mapping, kind, Direction::Inbound, peer_ip, peer_port, flags, now);
        Some(mapping.clone())
    }

    /// Create a mapping for a new flow, allocating the next external id.
    /// For TCP the triggering segment's side decides the initial
    /// connection state. Fails once the port space is exhausted; ids are
    /// never recycled.
    pub fn insert(
        &self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: NatKind,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        from_internal: bool,
    ) -> Result<NatMapping, RouterError> {
        let mut state = self.state.lock().expect("nat lock poisoned");
        if state.max_port == u16::MAX {
            return Err(RouterError::NatPortExhausted);
        }
        let aux_ext = state.max_port + 1;
        state.max_port = aux_ext;

        let now = Instant::now();
        let conns = match kind {
            NatKind::Icmp => Vec::new(),
            NatKind::Tcp => {
                let dir = if from_internal {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                };
                vec![NatConnection {
                    peer_ip,
                    peer_port,
                    state: fsm::initial_state(dir),
                    last_updated: now,
                }]
            }
        };
        let mapping = NatMapping {
            kind,
            ip_int,
            aux_int,
            ip_ext: self.ip_ext,
            aux_ext,
            last_updated: now,
            conns,
        };
        debug!(
            "nat: new {:?} mapping {}:{} -> {}:{}",
            kind, ip_int, aux_int, self.ip_ext, aux_ext
        );
        state.mappings.push(mapping.clone());
        Ok(mapping)
    }

    /// One expiry pass at `now`. ICMP mappings idle for the query
    /// timeout are removed. TCP connections expire on the transitory or
    /// established timeout depending on state; a mapping whose last
    /// connection expired is removed.
    pub fn reap(&self, now: Instant) {
        let mut state = self.state.lock().expect("nat lock poisoned");
        let icmp_timeout = self.icmp_query_timeout;
        let established = self.tcp_established_timeout;
        let transitory = self.tcp_transitory_timeout;

        state.mappings.retain_mut(|m| match m.kind {
            NatKind::Icmp => {
                let keep = now.saturating_duration_since(m.last_updated) < icmp_timeout;
                if !keep {
                    debug!("nat: icmp mapping {}:{} expired", m.ip_int, m.aux_int);
                }
                keep
            }
            NatKind::Tcp => {
                m.conns.retain(|c| {
                    let timeout = if c.state.is_transitory() {
                        transitory
                    } else {
                        established
                    };
                    now.saturating_duration_since(c.last_updated) < timeout
                });
                let keep = !m.conns.is_empty();
                if !keep {
                    debug!("nat: tcp mapping {}:{} expired", m.ip_int, m.aux_int);
                }
                keep
            }
        });
    }

    /// Number of live mappings (diagnostics and tests).
    pub fn mapping_count(&self) -> usize {
        self.state.lock().expect("nat lock poisoned").mappings.len()
    }

    #[cfg(test)]
    fn force_max_port(&self, port: u16) {
        self.state.lock().expect("nat lock poisoned").max_port = port;
    }
}

/// Refresh a matched mapping and, for TCP, its connection for `peer`.
/// A SYN for an untracked peer creates the connection.
fn touch(
    mapping: &mut NatMapping,
    kind: NatKind,
    dir: Direction,
    peer_ip: Ipv4Addr,
    peer_port: u16,
    flags: TcpFlags,
    now: Instant,
) {
    mapping.last_updated = now;
    if kind != NatKind::Tcp {
        return;
    }

    if let Some(conn) = mapping
        .conns
        .iter_mut()
        .find(|c| c.peer_ip == peer_ip && c.peer_port == peer_port)
    {
        conn.state = fsm::step(conn.state, dir, flags);
        conn.last_updated = now;
    } else if flags.contains(TcpFlags::SYN) {
        mapping.conns.push(NatConnection {
            peer_ip,
            peer_port,
            state: fsm::initial_state(dir),
            last_updated: now,
        });
    }
}
