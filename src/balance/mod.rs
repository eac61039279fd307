//! Server selection and queueing.

use std::net::IpAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use futures_channel::oneshot;
use tokio::time::Instant;

use crate::config::{BackendConfig, LbAlgorithm};

pub(crate) mod queue;
pub(crate) mod server;

pub(crate) use self::queue::{process_srv_queue, PendConn, PendQueue};
pub(crate) use self::server::Server;

/// A set of servers plus balancing policy, live counters, and the
/// backend-level pending queue.
#[derive(Debug)]
pub(crate) struct Backend {
    pub(crate) cfg: BackendConfig,
    pub(crate) servers: Vec<Arc<Server>>,
    pub(crate) pending: PendQueue,
    state: Mutex<BackendState>,
    pub(crate) counters: BackendCounters,
}

#[derive(Debug, Default)]
struct BackendState {
    /// Position on the weighted round-robin wheel.
    rr_pos: u64,
    /// Streams currently inside this backend.
    beconn: usize,
    /// Streams queued at the backend (not at a specific server).
    nbpend: usize,
    /// Streams queued anywhere in the backend, servers included.
    totpend: usize,
    totpend_max: usize,
}

#[derive(Debug, Default)]
pub(crate) struct BackendCounters {
    pub(crate) cum_sess: AtomicU64,
    pub(crate) denied: AtomicU64,
    pub(crate) queue_timeouts: AtomicU64,
}

/// Inputs for sticky algorithms.
#[derive(Debug, Default)]
pub(crate) struct LbHint<'a> {
    pub(crate) source: Option<IpAddr>,
    pub(crate) uri_path: Option<&'a str>,
}

/// Outcome of a dispatch attempt.
pub(crate) enum Assign {
    /// A server had room; `served` is already counted.
    Direct(Arc<Server>),
    /// Every candidate was full; the stream waits its turn.
    Queued(PendConn, oneshot::Receiver<Arc<Server>>),
    /// No usable server at all.
    None,
}

impl Backend {
    pub(crate) fn new(cfg: BackendConfig) -> Arc<Backend> {
        let servers = cfg
            .servers
            .iter()
            .cloned()
            .map(|s| Arc::new(Server::new(s)))
            .collect();
        Arc::new(Backend {
            cfg,
            servers,
            pending: PendQueue::new(),
            state: Mutex::new(BackendState::default()),
            counters: BackendCounters::default(),
        })
    }

    pub(crate) fn beconn(&self) -> usize {
        self.state.lock().unwrap().beconn
    }

    pub(crate) fn conn_inc(&self) {
        self.state.lock().unwrap().beconn += 1;
    }

    pub(crate) fn conn_dec(&self) {
        let mut st = self.state.lock().unwrap();
        st.beconn = st.beconn.saturating_sub(1);
    }

    pub(crate) fn nbpend(&self) -> usize {
        self.state.lock().unwrap().nbpend
    }

    pub(crate) fn totpend(&self) -> usize {
        self.state.lock().unwrap().totpend
    }

    pub(crate) fn totpend_max(&self) -> usize {
        self.state.lock().unwrap().totpend_max
    }

    pub(crate) fn nbpend_inc(&self) {
        self.state.lock().unwrap().nbpend += 1;
    }

    pub(crate) fn nbpend_dec(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.nbpend > 0, "backend pendconn already freed");
        st.nbpend = st.nbpend.saturating_sub(1);
    }

    pub(crate) fn totpend_inc(&self) {
        let mut st = self.state.lock().unwrap();
        st.totpend += 1;
        if st.totpend > st.totpend_max {
            st.totpend_max = st.totpend;
        }
    }

    pub(crate) fn totpend_dec(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.totpend > 0, "backend totpend already freed");
        st.totpend = st.totpend.saturating_sub(1);
    }

    /// The servers currently eligible: usable actives, or usable
    /// backups when no active is left.
    fn eligible(&self) -> Vec<Arc<Server>> {
        let actives: Vec<Arc<Server>> = self
            .servers
            .iter()
            .filter(|s| s.is_usable() && s.eweight() > 0)
            .cloned()
            .collect();
        if !actives.is_empty() {
            return actives;
        }
        self.servers
            .iter()
            .filter(|s| s.is_backup() && s.eweight() > 0)
            .cloned()
            .collect()
    }

    /// Run the configured algorithm over the eligible servers.
    ///
    /// Sticky algorithms (source, uri) always name a server; the
    /// others may be asked to skip servers that are already full.
    pub(crate) fn select_server(&self, hint: &LbHint<'_>) -> Option<Arc<Server>> {
        let eligible = self.eligible();
        if eligible.is_empty() {
            return None;
        }
        let now = Instant::now();
        for srv in &eligible {
            srv.maybe_finish_warmup(now);
        }
        match self.cfg.balance {
            LbAlgorithm::RoundRobin => {
                let total = total_weight(&eligible);
                let mut st = self.state.lock().unwrap();
                st.rr_pos = st.rr_pos.wrapping_add(1);
                let offset = st.rr_pos % total;
                drop(st);
                Some(pick_by_weight_offset(&eligible, offset))
            }
            LbAlgorithm::LeastConn => eligible
                .iter()
                .enumerate()
                .min_by_key(|(i, s)| (s.served() + s.nbpend(), *i))
                .map(|(_, s)| Arc::clone(s)),
            LbAlgorithm::Source => {
                let key = match hint.source {
                    Some(IpAddr::V4(ip)) => fnv1a(&ip.octets()),
                    Some(IpAddr::V6(ip)) => fnv1a(&ip.octets()),
                    None => 0,
                };
                let total = total_weight(&eligible);
                Some(pick_by_weight_offset(&eligible, key % total))
            }
            LbAlgorithm::Uri => {
                let key = fnv1a(hint.uri_path.unwrap_or("/").as_bytes());
                let total = total_weight(&eligible);
                Some(pick_by_weight_offset(&eligible, key % total))
            }
            LbAlgorithm::First => {
                let beconn = self.beconn();
                eligible
                    .iter()
                    .find(|s| s.served() < s.dyn_maxconn(beconn, self.cfg.fullconn, now))
                    .cloned()
                    .or_else(|| eligible.first().cloned())
            }
        }
    }

    /// Whether the algorithm pins the stream to the selected server
    /// (so a full server queues on its own FIFO instead of the
    /// backend's).
    fn is_sticky(&self) -> bool {
        matches!(self.cfg.balance, LbAlgorithm::Source | LbAlgorithm::Uri)
    }
}

/// Choose a server for a stream, or enqueue it.
pub(crate) fn assign_server(backend: &Arc<Backend>, hint: &LbHint<'_>) -> Assign {
    let srv = match backend.select_server(hint) {
        Some(srv) => srv,
        None => return Assign::None,
    };
    let now = Instant::now();
    let cap = srv.dyn_maxconn(backend.beconn(), backend.cfg.fullconn, now);
    if srv.served() < cap {
        srv.take_conn();
        return Assign::Direct(srv);
    }

    debug!(
        "server {} full ({}/{}), queueing",
        srv.cfg.name,
        srv.served(),
        cap
    );
    let (pendconn, rx) = if backend.is_sticky() {
        queue::enqueue_server(backend, &srv)
    } else {
        queue::enqueue_backend(backend)
    };
    Assign::Queued(pendconn, rx)
}

fn total_weight(servers: &[Arc<Server>]) -> u64 {
    let total: u64 = servers.iter().map(|s| u64::from(s.eweight())).sum();
    std::cmp::max(total, 1)
}

fn pick_by_weight_offset(servers: &[Arc<Server>], mut offset: u64) -> Arc<Server> {
    for srv in servers {
        let w = u64::from(srv.eweight());
        if offset < w {
            return Arc::clone(srv);
        }
        offset -= w;
    }
    // Rounding put us past the wheel; wrap to the first.
    Arc::clone(&servers[0])
}

/// FNV-1a, the hash applied to sticky keys.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x1_0000_01b3);
    }
    hash
}
