//! ARP cache and pending-request queue.
//!
//! A fixed-capacity table of resolved IPv4→MAC entries plus the queue of
//! unresolved requests, each carrying the frames waiting on it. One
//! monitor lock guards both; every value handed out is a detached copy,
//! so callers (the datapath and the sweeper driver) never hold the lock
//! while touching the wire.
//!
//! The 1 Hz sweep is split in two: [`ArpCache::sweep`] runs the aging
//! and retry bookkeeping under the lock and returns owned work items;
//! the router then transmits broadcasts and failure diagnostics without
//! the lock.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::MacAddress;

/// Spacing between retransmissions of one ARP request
pub const ARP_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Transmissions before a request is declared unreachable
pub const ARP_MAX_SENDS: u32 = 5;

/// A resolved cache slot
#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddress,
    added: Instant,
}

/// A frame parked on an unresolved next hop, with its outgoing interface.
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub frame: Vec<u8>,
    pub iface: String,
}

/// An unresolved next hop and everything waiting on it.
#[derive(Debug, Clone)]
pub struct ArpRequest {
    pub ip: Ipv4Addr,
    /// Last transmission time; `None` until the first broadcast goes out
    pub sent: Option<Instant>,
    pub times_sent: u32,
    pub packets: Vec<PendingPacket>,
}

/// Broadcast to emit for a still-live request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySend {
    pub target_ip: Ipv4Addr,
    pub iface: String,
}

/// Result of one sweep pass: broadcasts to send and requests that ran
/// out of retries (detached; the caller owns their queued packets).
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub retries: Vec<RetrySend>,
    pub failed: Vec<ArpRequest>,
}

#[derive(Debug)]
struct CacheState {
    /// Fixed capacity; `None` is an invalid slot
    entries: Vec<Option<ArpEntry>>,
    requests: Vec<ArpRequest>,
}

/// The monitor. See the module docs for the locking contract.
#[derive(Debug)]
pub struct ArpCache {
    state: Mutex<CacheState>,
    entry_timeout: Duration,
}

impl ArpCache {
    pub fn new(capacity: usize, entry_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: vec![None; capacity],
                requests: Vec::new(),
            }),
            entry_timeout,
        }
    }

    /// Look up a resolved, unexpired mapping.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        let state = self.state.lock().expect("arp cache lock poisoned");
        state
            .entries
            .iter()
            .flatten()
            .find(|e| e.ip == ip)
            .map(|e| e.mac)
    }

    /// Park a frame until `ip` resolves, creating the request on first
    /// use. The frame is deep-copied; the sweeper drives resolution.
    pub fn queue_request(&self, ip: Ipv4Addr, frame: &[u8], iface: &str) {
        let mut state = self.state.lock().expect("arp cache lock poisoned");
        let packet = PendingPacket {
            frame: frame.to_vec(),
            iface: iface.to_owned(),
        };
        if let Some(req) = state.requests.iter_mut().find(|r| r.ip == ip) {
            req.packets.push(packet);
        } else {
            state.requests.push(ArpRequest {
                ip,
                sent: None,
                times_sent: 0,
                packets: vec![packet],
            });
        }
    }

    /// Record a resolved mapping and detach the pending request for it,
    /// if any. The caller owns the returned request and its packets;
    /// dropping it is the destroy path.
    ///
    /// The mapping refreshes an existing entry for the same IP, else
    /// takes the first invalid slot, else evicts a pseudorandom slot.
    pub fn insert_mac(&self, mac: MacAddress, ip: Ipv4Addr) -> Option<ArpRequest> {
        let mut state = self.state.lock().expect("arp cache lock poisoned");

        let request = state
            .requests
            .iter()
            .position(|r| r.ip == ip)
            .map(|i| state.requests.remove(i));

        let entry = ArpEntry {
            ip,
            mac,
            added: Instant::now(),
        };
        let slot = state
            .entries
            .iter()
            .position(|e| e.map_or(false, |e| e.ip == ip))
            .or_else(|| state.entries.iter().position(Option::is_none))
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..state.entries.len()));
        state.entries[slot] = Some(entry);

        request
    }

    /// One aging pass at `now`: invalidate expired entries, then walk
    /// the request queue. A request due for service (never sent, or last
    /// sent at least [`ARP_RETRY_INTERVAL`] ago) is either scheduled for
    /// another broadcast or, after [`ARP_MAX_SENDS`] transmissions,
    /// detached as failed.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut state = self.state.lock().expect("arp cache lock poisoned");
        let mut outcome = SweepOutcome::default();

        for slot in state.entries.iter_mut() {
            let expired = slot
                .map_or(false, |e| now.saturating_duration_since(e.added) > self.entry_timeout);
            if expired {
                *slot = None;
            }
        }

        let mut keep = Vec::with_capacity(state.requests.len());
        for mut req in state.requests.drain(..) {
            let due = req
                .sent
                .map_or(true, |t| now.saturating_duration_since(t) >= ARP_RETRY_INTERVAL);
            if !due {
                keep.push(req);
                continue;
            }
            if req.times_sent >= ARP_MAX_SENDS {
                outcome.failed.push(req);
                continue;
            }
            // Retries go out the interface of the first parked frame.
            if let Some(first) = req.packets.first() {
                outcome.retries.push(RetrySend {
                    target_ip: req.ip,
                    iface: first.iface.clone(),
                });
                req.times_sent += 1;
                req.sent = Some(now);
                keep.push(req);
            }
        }
        state.requests = keep;

        outcome
    }

    /// Snapshot of the resolved entries (diagnostics and tests).
    pub fn valid_entries(&self) -> Vec<(Ipv4Addr, MacAddress)> {
        let state = self.state.lock().expect("arp cache lock poisoned");
        state
            .entries
            .iter()
            .flatten()
            .map(|e| (e.ip, e.mac))
            .collect()
    }

    /// Number of unresolved requests currently queued.
    pub fn pending_requests(&self) -> usize {
        let state = self.state.lock().expect("arp cache lock poisoned");
        state.requests.len()
    }
}
