//! Runtime state of one upstream server.

use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::time::Instant;

use super::queue::PendQueue;
use crate::config::ServerConfig;

/// Administrative / health state of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Healthy and taking traffic.
    Running,
    /// Only used when no active server is left.
    Backup,
    /// Administratively disabled.
    Maintain,
    /// Recently up, ramping its capacity.
    WarmingUp,
    /// Failing health checks, about to go down.
    GoingDown,
    /// Out of rotation.
    Down,
}

#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) cfg: ServerConfig,
    /// Streams waiting specifically for this server.
    pub(crate) pending: PendQueue,
    mutable: Mutex<Mutable>,
    pub(crate) counters: ServerCounters,
}

#[derive(Debug)]
struct Mutable {
    state: ServerState,
    /// Effective weight; starts at the configured weight.
    eweight: u32,
    /// Streams currently assigned to this server.
    served: usize,
    /// Streams queued specifically for this server.
    nbpend: usize,
    nbpend_max: usize,
    /// When the operational state last changed; slow-start measures
    /// from here.
    last_change: Instant,
}

/// Totals a stats consumer would format.
#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub(crate) cum_sess: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) redispatches: AtomicU64,
    pub(crate) connect_errors: AtomicU64,
    pub(crate) failed_resp: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
}

impl Server {
    pub(crate) fn new(cfg: ServerConfig) -> Server {
        let state = if cfg.backup {
            ServerState::Backup
        } else if cfg.slowstart.is_some() {
            ServerState::WarmingUp
        } else {
            ServerState::Running
        };
        let eweight = cfg.weight;
        Server {
            cfg,
            pending: PendQueue::new(),
            mutable: Mutex::new(Mutable {
                state,
                eweight,
                served: 0,
                nbpend: 0,
                nbpend_max: 0,
                last_change: Instant::now(),
            }),
            counters: ServerCounters::default(),
        }
    }

    pub(crate) fn state(&self) -> ServerState {
        self.mutable.lock().unwrap().state
    }

    pub(crate) fn set_state(&self, state: ServerState) {
        let mut m = self.mutable.lock().unwrap();
        if m.state != state {
            debug!("server {} {:?} -> {:?}", self.cfg.name, m.state, state);
            m.state = state;
            m.last_change = Instant::now();
        }
    }

    pub(crate) fn eweight(&self) -> u32 {
        self.mutable.lock().unwrap().eweight
    }

    pub(crate) fn served(&self) -> usize {
        self.mutable.lock().unwrap().served
    }

    pub(crate) fn nbpend(&self) -> usize {
        self.mutable.lock().unwrap().nbpend
    }

    pub(crate) fn nbpend_max(&self) -> usize {
        self.mutable.lock().unwrap().nbpend_max
    }

    pub(crate) fn is_usable(&self) -> bool {
        matches!(
            self.state(),
            ServerState::Running | ServerState::WarmingUp | ServerState::GoingDown
        )
    }

    pub(crate) fn is_backup(&self) -> bool {
        self.state() == ServerState::Backup
    }

    pub(crate) fn take_conn(&self) {
        let mut m = self.mutable.lock().unwrap();
        m.served += 1;
        self.counters.cum_sess.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases one served slot; the caller then runs the queues.
    pub(crate) fn release_conn(&self) {
        let mut m = self.mutable.lock().unwrap();
        debug_assert!(m.served > 0, "release without take");
        m.served = m.served.saturating_sub(1);
    }

    pub(crate) fn pend_inc(&self) -> usize {
        let mut m = self.mutable.lock().unwrap();
        m.nbpend += 1;
        m.nbpend_max = cmp::max(m.nbpend_max, m.nbpend);
        m.nbpend
    }

    pub(crate) fn pend_dec(&self) {
        let mut m = self.mutable.lock().unwrap();
        debug_assert!(m.nbpend > 0, "pendconn already freed");
        m.nbpend = m.nbpend.saturating_sub(1);
    }

    /// The dynamic concurrency cap, per the queueing design:
    /// `max(minconn, beconn * maxconn / fullconn)` clipped to
    /// `[1, maxconn]`, then scaled by the slow-start ratio while the
    /// server warms up.
    pub(crate) fn dyn_maxconn(&self, beconn: usize, fullconn: usize, now: Instant) -> usize {
        if self.cfg.maxconn == 0 {
            return usize::MAX;
        }
        let base = if self.cfg.minconn > 0 && fullconn > 0 {
            cmp::max(self.cfg.minconn, beconn * self.cfg.maxconn / fullconn)
        } else {
            self.cfg.maxconn
        };
        let base = cmp::min(cmp::max(base, 1), self.cfg.maxconn);

        let m = self.mutable.lock().unwrap();
        if m.state != ServerState::WarmingUp {
            return base;
        }
        let slowstart = match self.cfg.slowstart {
            Some(slowstart) if !slowstart.is_zero() => slowstart,
            _ => return base,
        };
        let elapsed = now.saturating_duration_since(m.last_change);
        if elapsed >= slowstart {
            return base;
        }
        // Percentage ramp, never below 1%.
        let pct = cmp::max(
            1,
            (100 * elapsed.as_millis()) / slowstart.as_millis(),
        ) as usize;
        cmp::max(1, base * pct / 100)
    }

    /// Ends warm-up once the slow-start window has fully elapsed.
    pub(crate) fn maybe_finish_warmup(&self, now: Instant) {
        let mut m = self.mutable.lock().unwrap();
        if m.state != ServerState::WarmingUp {
            return;
        }
        match self.cfg.slowstart {
            Some(slowstart)
                if now.saturating_duration_since(m.last_change) >= slowstart =>
            {
                debug!("server {} finished warm-up", self.cfg.name);
                m.state = ServerState::Running;
            }
            None => m.state = ServerState::Running,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn dyn_maxconn_scales_with_backend_load() {
        let srv = Server::new(
            ServerConfig::new("s1", addr()).maxconn(100).minconn(10),
        );
        let now = Instant::now();

        // Light backend load sits at the floor.
        assert_eq!(srv.dyn_maxconn(0, 1000, now), 10);
        // Half of fullconn: half of maxconn.
        assert_eq!(srv.dyn_maxconn(500, 1000, now), 50);
        // At or beyond fullconn: the configured cap, clipped.
        assert_eq!(srv.dyn_maxconn(1000, 1000, now), 100);
        assert_eq!(srv.dyn_maxconn(2000, 1000, now), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn slowstart_cap_is_monotonic_until_elapsed() {
        let srv = Server::new(
            ServerConfig::new("s1", addr())
                .maxconn(2)
                .minconn(1)
                .slowstart(Duration::from_secs(10)),
        );
        assert_eq!(srv.state(), ServerState::WarmingUp);

        let start = Instant::now();
        let mut last = 0;
        for step in 0..=10 {
            let now = start + Duration::from_secs(step);
            let cap = srv.dyn_maxconn(10, 10, now);
            assert!(cap >= last, "cap decreased during warm-up");
            assert!(cap <= 2);
            last = cap;
        }
        // After the window, the configured value holds exactly.
        assert_eq!(
            srv.dyn_maxconn(10, 10, start + Duration::from_secs(11)),
            2
        );
        srv.maybe_finish_warmup(start + Duration::from_secs(11));
        assert_eq!(srv.state(), ServerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn slowstart_starts_at_minimum_one() {
        let srv = Server::new(
            ServerConfig::new("s1", addr())
                .maxconn(2)
                .minconn(1)
                .slowstart(Duration::from_secs(10)),
        );
        let cap = srv.dyn_maxconn(10, 10, Instant::now());
        assert_eq!(cap, 1, "warm-up must still allow one stream");
    }

    #[test]
    fn served_and_pend_counters() {
        let srv = Server::new(ServerConfig::new("s1", addr()).maxconn(4));
        srv.take_conn();
        srv.take_conn();
        assert_eq!(srv.served(), 2);
        srv.release_conn();
        assert_eq!(srv.served(), 1);

        assert_eq!(srv.pend_inc(), 1);
        assert_eq!(srv.pend_inc(), 2);
        srv.pend_dec();
        assert_eq!(srv.nbpend(), 1);
        assert_eq!(srv.nbpend_max(), 2);
    }
}
