//! Router construction and runtime.
//!
//! [`Router`] wires the configuration tables, the two monitors, and the
//! injected link sink into a shared core, and owns the two 1 Hz timer
//! threads (ARP sweeper, NAT reaper). The timers are paced by
//! `recv_timeout` on a shutdown channel, so [`Router::stop`] (and drop)
//! wakes and joins them promptly.

use std::net::Ipv4Addr;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::info;

use crate::{
    arp_cache::ArpCache,
    config::RouterConfig,
    error::RouterError,
    iface::InterfaceTable,
    link::FrameSink,
    nat::NatTable,
    route::RoutingTable,
};

/// Tick interval of the sweeper and reaper threads
const TIMER_INTERVAL: Duration = Duration::from_secs(1);

/// NAT state plus the interface identities that define the boundary.
pub(crate) struct NatRuntime {
    pub table: NatTable,
    pub internal_iface: String,
    pub external_iface: String,
    pub external_ip: Ipv4Addr,
}

/// State shared between the datapath and the timer threads.
pub(crate) struct RouterCore {
    pub ifaces: InterfaceTable,
    pub routes: RoutingTable,
    pub cache: ArpCache,
    pub nat: Option<NatRuntime>,
    pub sink: Arc<dyn FrameSink>,
}

/// The router: one datapath entry point, two background timers.
pub struct Router {
    core: Arc<RouterCore>,
    timers: Vec<(mpsc::Sender<()>, JoinHandle<()>)>,
}

impl Router {
    /// Build a router from validated configuration and a link sink.
    /// Timer threads are not running until [`start`](Self::start).
    pub fn new(config: RouterConfig, sink: Arc<dyn FrameSink>) -> Result<Self, RouterError> {
        config.validate()?;

        let ifaces = InterfaceTable::new(config.interfaces);
        let nat = match config.nat {
            Some(nat_cfg) => {
                let external_ip = ifaces.require(&nat_cfg.external_iface)?.ip;
                Some(NatRuntime {
                    table: NatTable::new(external_ip, &nat_cfg),
                    internal_iface: nat_cfg.internal_iface,
                    external_iface: nat_cfg.external_iface,
                    external_ip,
                })
            }
            None => None,
        };

        let core = Arc::new(RouterCore {
            ifaces,
            routes: RoutingTable::new(config.routes),
            cache: ArpCache::new(config.arp_cache_size, config.arp_entry_timeout),
            nat,
            sink,
        });

        Ok(Self {
            core,
            timers: Vec::new(),
        })
    }

    /// Spawn the ARP sweeper and, when NAT is on, the NAT reaper.
    /// Calling twice is a no-op.
    pub fn start(&mut self) {
        if !self.timers.is_empty() {
            return;
        }

        let core = Arc::clone(&self.core);
        self.timers
            .push(spawn_timer(move |now| core.sweep_arp(now)));

        if self.core.nat.is_some() {
            let core = Arc::clone(&self.core);
            self.timers
                .push(spawn_timer(move |now| core.reap_nat(now)));
        }

        info!(
            "router started: {} interfaces, {} routes, nat {}",
            self.core.ifaces.len(),
            self.core.routes.len(),
            if self.core.nat.is_some() { "on" } else { "off" }
        );
    }

    /// Signal and join the timer threads. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        for (tx, handle) in self.timers.drain(..) {
            drop(tx);
            let _ = handle.join();
        }
    }

    /// Datapath entry point; frames must be delivered serially.
    pub fn handle_frame(&self, frame: &[u8], in_iface: &str) -> Result<(), RouterError> {
        self.core.handle_frame(frame, in_iface)
    }

    /// Run one ARP sweep pass at `now`. The sweeper thread does this at
    /// 1 Hz; single-threaded embedders and tests may drive it directly.
    pub fn sweep_arp(&self, now: Instant) {
        self.core.sweep_arp(now);
    }

    /// Run one NAT expiry pass at `now` (no-op without NAT); see
    /// [`sweep_arp`](Self::sweep_arp).
    pub fn reap_nat(&self, now: Instant) {
        self.core.reap_nat(now);
    }

    /// Snapshot of the resolved ARP entries.
    pub fn arp_entries(&self) -> Vec<(Ipv4Addr, crate::MacAddress)> {
        self.core.cache.valid_entries()
    }

    /// Number of live NAT mappings (0 without NAT).
    pub fn nat_mappings(&self) -> usize {
        self.core
            .nat
            .as_ref()
            .map_or(0, |nat| nat.table.mapping_count())
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RouterCore {
    pub(crate) fn reap_nat(&self, now: Instant) {
        if let Some(nat) = &self.nat {
            nat.table.reap(now);
        }
    }
}

/// 1 Hz timer thread; the returned sender stops it when dropped.
fn spawn_timer<F>(tick: F) -> (mpsc::Sender<()>, JoinHandle<()>)
where
    F: Fn(Instant) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<()>();
    let handle = std::thread::spawn(move || loop {
        match rx.recv_timeout(TIMER_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => tick(Instant::now()),
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    });
    (tx, handle)
}
