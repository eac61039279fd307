//! The shared buffer pool.
//!
//! Channels and muxes draw fixed-size `BytesMut` buffers from one pool
//! per worker. When the pool is dry the requester parks on a FIFO wait
//! queue and stops asking to read; whenever a buffer comes back,
//! `offer_buffers` wakes exactly one waiter, which decides for itself
//! whether it can proceed. Waiters are woken before the releasing task
//! gets to run again, so a released buffer cannot be re-taken by its
//! previous owner ahead of the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;

/// Default size of one pooled buffer.
pub(crate) const BUFFER_SIZE: usize = 16 * 1024;

/// Headroom kept free at the tail of every pooled buffer so in-place
/// header rewriting cannot overflow.
pub(crate) const BUFFER_RESERVE: usize = 1024;

static NEXT_WAITER_ID: AtomicUsize = AtomicUsize::new(0);

/// Shared handle to a worker's buffer pool.
#[derive(Clone)]
pub(crate) struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

struct PoolInner {
    free: Vec<BytesMut>,
    /// Buffers currently out on loan.
    lent: usize,
    max_buffers: usize,
    buf_size: usize,
    waiters: VecDeque<(usize, Waker)>,
}

impl BufferPool {
    pub(crate) fn new(max_buffers: usize) -> BufferPool {
        BufferPool::with_buffer_size(max_buffers, BUFFER_SIZE)
    }

    pub(crate) fn with_buffer_size(max_buffers: usize, buf_size: usize) -> BufferPool {
        assert!(max_buffers > 0);
        BufferPool {
            inner: Arc::new(Mutex::new(PoolInner {
                free: Vec::new(),
                lent: 0,
                max_buffers,
                buf_size,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Try to take a buffer without waiting.
    pub(crate) fn try_alloc(&self) -> Option<BytesMut> {
        let mut inner = self.inner.lock().unwrap();
        inner.try_alloc()
    }

    /// Take a buffer, parking this task on the wait queue if the pool
    /// is dry. The `waiter` node carries the queue position across
    /// polls so one task never occupies two slots.
    pub(crate) fn poll_alloc(
        &self,
        cx: &mut Context<'_>,
        waiter: &mut BufferWait,
    ) -> Poll<BytesMut> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buf) = inner.try_alloc() {
            inner.forget_waiter(waiter);
            return Poll::Ready(buf);
        }
        trace!("buffer pool dry; parking waiter {}", waiter.id);
        inner.park(waiter, cx.waker());
        Poll::Pending
    }

    /// Return a buffer to the pool and offer it to the longest waiter.
    pub(crate) fn release(&self, mut buf: BytesMut) {
        let waker = {
            let mut inner = self.inner.lock().unwrap();
            buf.clear();
            debug_assert!(inner.lent > 0, "release without matching alloc");
            inner.lent = inner.lent.saturating_sub(1);
            if inner.free.len() + inner.lent < inner.max_buffers {
                inner.free.push(buf);
            }
            inner.offer_buffers()
        };
        // Wake outside the lock.
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Drop a waiter's queue slot, if it holds one.
    pub(crate) fn cancel_wait(&self, waiter: &mut BufferWait) {
        let mut inner = self.inner.lock().unwrap();
        inner.forget_waiter(waiter);
    }

    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }
}

impl PoolInner {
    fn try_alloc(&mut self) -> Option<BytesMut> {
        if let Some(buf) = self.free.pop() {
            self.lent += 1;
            return Some(buf);
        }
        if self.lent < self.max_buffers {
            self.lent += 1;
            return Some(BytesMut::with_capacity(self.buf_size));
        }
        None
    }

    fn park(&mut self, waiter: &mut BufferWait, waker: &Waker) {
        if let Some(slot) = self.waiters.iter_mut().find(|(id, _)| *id == waiter.id) {
            slot.1 = waker.clone();
        } else {
            self.waiters.push_back((waiter.id, waker.clone()));
            waiter.queued = true;
        }
    }

    fn forget_waiter(&mut self, waiter: &mut BufferWait) {
        if waiter.queued {
            self.waiters.retain(|(id, _)| *id != waiter.id);
            waiter.queued = false;
        }
    }

    /// Pick the waiter that has been waiting longest. The woken task
    /// re-runs `poll_alloc` and re-parks (at its old queue position)
    /// if someone else got the buffer first.
    fn offer_buffers(&mut self) -> Option<Waker> {
        if self.free.is_empty() && self.lent >= self.max_buffers {
            return None;
        }
        self.waiters.pop_front().map(|(id, waker)| {
            trace!("offering buffer to waiter {}", id);
            waker
        })
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BufferPool")
            .field("free", &inner.free.len())
            .field("lent", &inner.lent)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// A task's position in the buffer wait queue.
pub(crate) struct BufferWait {
    id: usize,
    queued: bool,
}

impl BufferWait {
    pub(crate) fn new() -> BufferWait {
        BufferWait {
            id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed),
            queued: false,
        }
    }
}

impl std::fmt::Debug for BufferWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferWait")
            .field("id", &self.id)
            .field("queued", &self.queued)
            .finish()
    }
}
