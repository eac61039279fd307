//! Pending-connection queues.
//!
//! A stream that cannot be served right away waits in a FIFO: the
//! server's own queue when the algorithm pinned it to that server, the
//! backend's queue otherwise. When a server frees a slot it drains the
//! two queues by strict request age, so a busy specific-server queue
//! can never starve the backend queue (or vice versa).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_channel::oneshot;
use tokio::time::Instant;

use super::{Backend, Server};

static NEXT_PEND_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Pending {
    id: u64,
    queued_at: Instant,
    tx: oneshot::Sender<Arc<Server>>,
}

/// One FIFO of pending streams.
#[derive(Debug)]
pub(crate) struct PendQueue {
    inner: Mutex<VecDeque<Pending>>,
}

impl PendQueue {
    pub(crate) fn new() -> PendQueue {
        PendQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, tx: oneshot::Sender<Arc<Server>>) -> u64 {
        let id = NEXT_PEND_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().push_back(Pending {
            id,
            queued_at: Instant::now(),
            tx,
        });
        id
    }

    fn oldest(&self) -> Option<Instant> {
        self.inner.lock().unwrap().front().map(|p| p.queued_at)
    }

    fn pop(&self) -> Option<Pending> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Detach by id. Returns false when the entry was already
    /// dequeued, so counters are touched exactly once.
    fn remove(&self, id: u64) -> bool {
        let mut q = self.inner.lock().unwrap();
        let before = q.len();
        q.retain(|p| p.id != id);
        q.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Where a pendconn is parked.
#[derive(Debug)]
enum Slot {
    Server(Arc<Server>),
    Backend,
}

/// The stream's handle on its queue position. Dropping it (or calling
/// `cancel`) detaches the entry and fixes the counters, exactly once.
#[derive(Debug)]
pub(crate) struct PendConn {
    id: u64,
    slot: Slot,
    backend: Arc<Backend>,
    active: bool,
}

impl PendConn {
    pub(crate) fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let removed = match self.slot {
            Slot::Server(ref srv) => {
                if srv.pending.remove(self.id) {
                    srv.pend_dec();
                    true
                } else {
                    false
                }
            }
            Slot::Backend => {
                if self.backend.pending.remove(self.id) {
                    self.backend.nbpend_dec();
                    true
                } else {
                    false
                }
            }
        };
        if removed {
            self.backend.totpend_dec();
            trace!("pendconn {} canceled", self.id);
        }
    }

    /// The dequeuer got to us first; nothing left to detach.
    pub(crate) fn mark_assigned(&mut self) {
        self.active = false;
    }
}

impl Drop for PendConn {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Park a stream on a specific server's queue.
pub(crate) fn enqueue_server(
    backend: &Arc<Backend>,
    srv: &Arc<Server>,
) -> (PendConn, oneshot::Receiver<Arc<Server>>) {
    let (tx, rx) = oneshot::channel();
    let id = srv.pending.push(tx);
    srv.pend_inc();
    backend.totpend_inc();
    trace!("pendconn {} queued at server {}", id, srv.cfg.name);
    (
        PendConn {
            id,
            slot: Slot::Server(Arc::clone(srv)),
            backend: Arc::clone(backend),
            active: true,
        },
        rx,
    )
}

/// Park a stream on the backend queue.
pub(crate) fn enqueue_backend(
    backend: &Arc<Backend>,
) -> (PendConn, oneshot::Receiver<Arc<Server>>) {
    let (tx, rx) = oneshot::channel();
    let id = backend.pending.push(tx);
    backend.nbpend_inc();
    backend.totpend_inc();
    trace!("pendconn {} queued at backend {}", id, backend.cfg.name);
    (
        PendConn {
            id,
            slot: Slot::Backend,
            backend: Arc::clone(backend),
            active: true,
        },
        rx,
    )
}

/// Hand freed capacity on `srv` to waiting streams.
///
/// Runs while the server has room, each round taking the pending
/// stream with the strictly older `queued_at` between the server's own
/// queue and the backend's queue (the server queue wins ties). The
/// dequeued stream gets the server, `served` is counted on its behalf,
/// and its task is woken through the oneshot.
pub(crate) fn process_srv_queue(srv: &Arc<Server>, backend: &Arc<Backend>) {
    loop {
        let now = Instant::now();
        srv.maybe_finish_warmup(now);
        let cap = srv.dyn_maxconn(backend.beconn(), backend.cfg.fullconn, now);
        if srv.served() >= cap {
            return;
        }

        let use_server_queue = match (srv.pending.oldest(), backend.pending.oldest()) {
            (Some(s), Some(b)) => s <= b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return,
        };

        let pending = if use_server_queue {
            match srv.pending.pop() {
                Some(p) => {
                    srv.pend_dec();
                    backend.totpend_dec();
                    p
                }
                None => continue,
            }
        } else {
            match backend.pending.pop() {
                Some(p) => {
                    backend.nbpend_dec();
                    backend.totpend_dec();
                    p
                }
                None => continue,
            }
        };

        if pending.tx.is_canceled() {
            // The stream aborted between detach and hand-off.
            trace!("pendconn {} receiver gone, skipping", pending.id);
            continue;
        }
        srv.take_conn();
        if pending.tx.send(Arc::clone(srv)).is_err() {
            srv.release_conn();
            continue;
        }
        trace!("pendconn {} assigned to {}", pending.id, srv.cfg.name);
    }
}
