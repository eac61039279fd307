//! Frontend listeners.
//!
//! Binding, accepting, admission control, and handing each accepted
//! connection to its stream.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::balance::Backend;
use crate::common::exec::Exec;
use crate::common::pool::BufferPool;
use crate::config::{BackendConfig, FrontendConfig};
use crate::stick::{StickKey, StickTable, TableConfig, TrackFlags};
use crate::stream::Stream;

/// How long to sleep after a resource-exhaustion accept error
/// (EMFILE and friends) before accepting again.
const ACCEPT_ERROR_SLEEP: Duration = Duration::from_secs(1);

/// Runtime state of one frontend.
#[derive(Debug)]
pub(crate) struct Frontend {
    pub(crate) cfg: FrontendConfig,
    pub(crate) counters: FrontendCounters,
    cur_conns: AtomicUsize,
    /// Source-tracking table for admission, when configured.
    pub(crate) stick: Option<Arc<StickTable>>,
    /// Connections per second per source beyond which we refuse.
    pub(crate) conn_rate_limit: Option<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct FrontendCounters {
    /// Connections ever accepted.
    pub(crate) cum_conns: AtomicU64,
    /// Requests ever parsed.
    pub(crate) cum_req: AtomicU64,
    /// Connections refused by admission rules.
    pub(crate) denied: AtomicU64,
    /// Requests that never parsed or timed out waiting.
    pub(crate) failed_req: AtomicU64,
    /// Streams that found no usable server.
    pub(crate) failed_conns: AtomicU64,
}

impl Frontend {
    pub(crate) fn new(
        cfg: FrontendConfig,
        stick: Option<Arc<StickTable>>,
        conn_rate_limit: Option<u64>,
    ) -> Frontend {
        Frontend {
            cfg,
            counters: FrontendCounters::default(),
            cur_conns: AtomicUsize::new(0),
            stick,
            conn_rate_limit,
        }
    }

    pub(crate) fn conn_opened(&self) -> usize {
        self.cur_conns.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn conn_closed(&self) {
        let prev = self.cur_conns.load(Ordering::Acquire);
        if prev > 0 {
            self.cur_conns.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn cur_conns(&self) -> usize {
        self.cur_conns.load(Ordering::Acquire)
    }
}

/// One frontend-to-backend proxy, ready to be bound.
#[derive(Debug)]
pub struct Proxy {
    frontend: FrontendConfig,
    backend: BackendConfig,
    stick: Option<(TableConfig, Option<u64>)>,
    max_buffers: usize,
}

impl Proxy {
    /// Couples a frontend with the backend its streams are routed to.
    pub fn new(frontend: FrontendConfig, backend: BackendConfig) -> Proxy {
        Proxy {
            frontend,
            backend,
            stick: None,
            max_buffers: 1024,
        }
    }

    /// Track client sources in a stick table, refusing sources whose
    /// connection rate exceeds `limit` (when given).
    pub fn track_sources(mut self, table: TableConfig, limit: Option<u64>) -> Proxy {
        self.stick = Some((table, limit));
        self
    }

    /// Caps the worker's buffer pool.
    pub fn max_buffers(mut self, max: usize) -> Proxy {
        self.max_buffers = max;
        self
    }

    /// Bind the frontend address. A bind failure is fatal to startup.
    pub async fn bind(self) -> crate::Result<Listener> {
        let inner = TcpListener::bind(self.frontend.bind)
            .await
            .map_err(crate::Error::new_listen)?;
        let (stick, conn_rate_limit) = match self.stick {
            Some((table_cfg, limit)) => (Some(StickTable::new(table_cfg)), limit),
            None => (None, None),
        };
        info!(
            "frontend {} listening on {}",
            self.frontend.name,
            inner.local_addr().map_err(crate::Error::new_listen)?
        );
        Ok(Listener {
            inner,
            frontend: Arc::new(Frontend::new(self.frontend, stick, conn_rate_limit)),
            backend: Backend::new(self.backend),
            pool: BufferPool::new(self.max_buffers),
            exec: Exec::Tokio,
        })
    }
}

/// A bound frontend, accepting connections when served.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    frontend: Arc<Frontend>,
    backend: Arc<Backend>,
    pool: BufferPool,
    exec: Exec,
}

impl Listener {
    /// The locally bound address.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        self.inner.local_addr().map_err(crate::Error::new_listen)
    }

    /// Accept connections forever, spawning one stream per client.
    pub async fn serve(self) -> crate::Result<()> {
        if let Some(table) = self.frontend.stick.as_ref() {
            // The periodic sweep that evicts expired, unreferenced
            // entries.
            let table = Arc::clone(table);
            let period = table.cfg.expire;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    table.expire_sweep();
                }
            });
        }
        loop {
            let (sock, peer) = match self.inner.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    if is_connection_error(&e) {
                        debug!("accepted connection already errored: {}", e);
                        continue;
                    }
                    // Resource exhaustion (EMFILE/ENFILE): back off
                    // instead of spinning on the listener.
                    error!("{}", crate::Error::new_accept(e));
                    tokio::time::sleep(ACCEPT_ERROR_SLEEP).await;
                    continue;
                }
            };

            let fe = &self.frontend;
            fe.counters.cum_conns.fetch_add(1, Ordering::Relaxed);

            if fe.cfg.maxconn > 0 && fe.cur_conns() >= fe.cfg.maxconn {
                debug!("frontend {} full, refusing {}", fe.cfg.name, peer);
                fe.counters.denied.fetch_add(1, Ordering::Relaxed);
                drop(sock);
                continue;
            }

            let mut stkctr = Vec::new();
            let mut tarpitted = false;
            if let Some(ref table) = fe.stick {
                match table.track(
                    StickKey::from(peer.ip()),
                    TrackFlags {
                        backend: false,
                        content: true,
                    },
                ) {
                    Some(ctr) => {
                        if let Some(limit) = fe.conn_rate_limit {
                            if ctr.entry.conn_rate() > limit {
                                if fe.cfg.timeouts.tarpit.is_some() {
                                    // Hold the offender instead of
                                    // giving it a fast refusal.
                                    debug!("source {} over rate, tarpitting", peer.ip());
                                    tarpitted = true;
                                } else {
                                    debug!("source {} over rate, refusing", peer.ip());
                                    fe.counters.denied.fetch_add(1, Ordering::Relaxed);
                                    drop(ctr);
                                    drop(sock);
                                    continue;
                                }
                            }
                        }
                        stkctr.push(ctr);
                    }
                    None => {
                        // Table full of referenced entries; admit
                        // untracked rather than refuse.
                        trace!("stick table full, {} untracked", peer.ip());
                    }
                }
            }

            let _ = sock.set_nodelay(true);
            fe.conn_opened();
            let mut stream = Stream::new(
                sock,
                peer,
                Arc::clone(fe),
                Arc::clone(&self.backend),
                self.pool.clone(),
                stkctr,
            );
            if tarpitted {
                stream.tarpit();
            }
            self.exec.execute(stream);
        }
    }
}

/// Errors that mean the accepted socket died before we got it, not
/// that the listener itself is in trouble.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
        ] {
            assert!(is_connection_error(&io::Error::new(kind, "x")));
        }
        assert!(!is_connection_error(&io::Error::new(
            io::ErrorKind::Other,
            "emfile"
        )));
    }

    #[test]
    fn frontend_conn_gauge() {
        let fe = Frontend::new(
            FrontendConfig::new("fe", "127.0.0.1:0".parse().unwrap()),
            None,
            None,
        );
        assert_eq!(fe.conn_opened(), 1);
        assert_eq!(fe.conn_opened(), 2);
        fe.conn_closed();
        assert_eq!(fe.cur_conns(), 1);
        fe.conn_closed();
        fe.conn_closed();
        assert_eq!(fe.cur_conns(), 0, "never goes negative");
    }
}
