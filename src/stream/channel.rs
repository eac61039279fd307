//! The half-duplex channel between a stream's two interfaces.
//!
//! The request channel carries client bytes toward the server, the
//! response channel the opposite way. Each wraps one pooled buffer, a
//! forward budget that lets body bytes pass without waking analysers,
//! shutdown flags for both halves, and the expiry ticks the stream
//! folds into its own deadline.

use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::time::Instant;

use crate::common::pool::{BufferPool, BufferWait, BUFFER_RESERVE};

/// Channel condition flags.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ChanFlags(u16);

impl ChanFlags {
    /// The producer saw a read of zero: no more input will ever come.
    pub(crate) const READ_NULL: ChanFlags = ChanFlags(1 << 0);
    /// Read side definitely closed.
    pub(crate) const SHUTR: ChanFlags = ChanFlags(1 << 1);
    /// Write side definitely closed.
    pub(crate) const SHUTW: ChanFlags = ChanFlags(1 << 2);
    /// Close the read side as soon as practical.
    pub(crate) const SHUTR_NOW: ChanFlags = ChanFlags(1 << 3);
    /// Close the write side once pending data is flushed.
    pub(crate) const SHUTW_NOW: ChanFlags = ChanFlags(1 << 4);
    /// The consumer side is still waiting for its connection.
    pub(crate) const WAIT_CONN: ChanFlags = ChanFlags(1 << 5);
    /// Read as much as possible without waiting for a full buffer.
    pub(crate) const READ_DONTWAIT: ChanFlags = ChanFlags(1 << 6);
    /// Never wait for more data before processing.
    pub(crate) const NEVER_WAIT: ChanFlags = ChanFlags(1 << 7);
    /// Wake the writer when room appears.
    pub(crate) const WAKE_WRITE: ChanFlags = ChanFlags(1 << 8);
    /// A write happened since the flag was last cleared.
    pub(crate) const WRITE_EVENT: ChanFlags = ChanFlags(1 << 9);

    pub(crate) fn contains(self, other: ChanFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub(crate) fn insert(&mut self, other: ChanFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: ChanFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ChanFlags {
    type Output = ChanFlags;
    fn bitor(self, rhs: ChanFlags) -> ChanFlags {
        ChanFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for ChanFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChanFlags")
            .field(&format_args!("{:#b}", self.0))
            .finish()
    }
}

pub(crate) struct Channel {
    pool: BufferPool,
    wait: BufferWait,
    buf: Option<BytesMut>,
    /// Logical size of the pooled buffer. `BytesMut::capacity` shrinks
    /// as consumed front slices are handed out, so the producer gate
    /// works off this instead.
    size: usize,
    /// Bytes allowed through without another analyser pass.
    to_forward: u64,
    pub(crate) flags: ChanFlags,
    /// Trailers ride beside the byte buffer.
    trailers: Option<HeaderMap>,
    /// Total bytes that ever crossed this channel.
    total: u64,
    /// Read-side inactivity deadline.
    pub(crate) rex: Option<Instant>,
    /// Write-side inactivity deadline.
    pub(crate) wex: Option<Instant>,
}

impl Channel {
    pub(crate) fn new(pool: BufferPool) -> Channel {
        Channel {
            pool,
            wait: BufferWait::new(),
            buf: None,
            size: 0,
            to_forward: 0,
            flags: ChanFlags::default(),
            trailers: None,
            total: 0,
            rex: None,
            wex: None,
        }
    }

    /// Make sure the channel has its pooled buffer, parking on the
    /// pool's wait queue when it is dry.
    pub(crate) fn poll_ensure_buf(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.buf.is_some() {
            return Poll::Ready(());
        }
        match self.pool.poll_alloc(cx, &mut self.wait) {
            Poll::Ready(buf) => {
                self.size = buf.capacity();
                self.buf = Some(buf);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Give the buffer back once the channel is drained, so an idle
    /// keep-alive stream does not pin pool capacity.
    pub(crate) fn release_buf(&mut self) {
        if let Some(buf) = self.buf.take() {
            debug_assert!(buf.is_empty(), "releasing non-empty channel buffer");
            self.pool.release(buf);
        }
    }

    /// Room left for the producer. The reserve stays free so header
    /// rewriting can always grow a message in place.
    pub(crate) fn room(&self) -> usize {
        match self.buf {
            Some(ref buf) => self
                .size
                .saturating_sub(BUFFER_RESERVE)
                .saturating_sub(buf.len()),
            None => 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.as_ref().map(|b| b.is_empty()).unwrap_or(true) && self.trailers.is_none()
    }

    pub(crate) fn data(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    /// Producer appends bytes, up to the room available.
    pub(crate) fn put(&mut self, data: &[u8]) -> usize {
        let room = self.room();
        let take = std::cmp::min(room, data.len());
        if take == 0 {
            return 0;
        }
        if let Some(ref mut buf) = self.buf {
            buf.extend_from_slice(&data[..take]);
            self.flags.insert(ChanFlags::WRITE_EVENT);
            self.total += take as u64;
        }
        take
    }

    pub(crate) fn put_trailers(&mut self, trailers: HeaderMap) {
        debug_assert!(self.trailers.is_none(), "trailers already buffered");
        self.trailers = Some(trailers);
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    /// Consumer takes up to `max` bytes, spending forward budget
    /// first.
    pub(crate) fn take(&mut self, max: usize) -> Option<Bytes> {
        let buf = self.buf.as_mut()?;
        if buf.is_empty() {
            return None;
        }
        let n = std::cmp::min(max, buf.len());
        let out = buf.split_to(n).freeze();
        let spent = std::cmp::min(self.to_forward, n as u64);
        self.to_forward -= spent;
        Some(out)
    }

    /// Grant the consumer `bytes` more without analyser wakeups.
    pub(crate) fn forward(&mut self, bytes: u64) {
        self.to_forward = self.to_forward.saturating_add(bytes);
    }

    pub(crate) fn to_forward(&self) -> u64 {
        self.to_forward
    }

    /// Bytes an analyser may still claim: what is buffered beyond the
    /// already-granted forward budget.
    pub(crate) fn analysable(&self) -> usize {
        let data = self.data() as u64;
        data.saturating_sub(self.to_forward) as usize
    }

    pub(crate) fn shutr(&mut self) {
        self.flags.insert(ChanFlags::SHUTR | ChanFlags::READ_NULL);
        self.rex = None;
    }

    pub(crate) fn shutw(&mut self) {
        self.flags.insert(ChanFlags::SHUTW);
        self.wex = None;
    }

    pub(crate) fn is_shutr(&self) -> bool {
        self.flags.contains(ChanFlags::SHUTR)
    }

    pub(crate) fn is_shutw(&self) -> bool {
        self.flags.contains(ChanFlags::SHUTW)
    }

    /// Both halves done: producer closed and everything drained.
    pub(crate) fn is_done(&self) -> bool {
        self.is_shutr() && self.is_empty()
    }

    /// The earlier of the two expiries, for the stream's deadline.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        match (self.rex, self.wex) {
            (Some(r), Some(w)) => Some(std::cmp::min(r, w)),
            (r, w) => r.or(w),
        }
    }

    /// `BytesMut` keeps channel contents contiguous, so the historical
    /// realignment before analysing is structural; keep the seam and
    /// make the promise checkable.
    pub(crate) fn make_contiguous(&mut self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Forget the finished transaction: flags, budget, deadlines. The
    /// pooled buffer goes back so an idle stream does not pin it.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.is_empty(), "resetting channel with data");
        self.flags = ChanFlags::default();
        self.to_forward = 0;
        self.trailers = None;
        self.rex = None;
        self.wex = None;
        if self.buf.as_ref().map(|b| b.is_empty()).unwrap_or(false) {
            self.release_buf();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("data", &self.data())
            .field("to_forward", &self.to_forward)
            .field("flags", &self.flags)
            .field("total", &self.total)
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.pool.release(buf);
        }
        self.pool.cancel_wait(&mut self.wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::task::noop_waker;

    fn ready_channel(pool_bufs: usize) -> Channel {
        let pool = BufferPool::with_buffer_size(pool_bufs, 4096);
        let mut ch = Channel::new(pool);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(ch.poll_ensure_buf(&mut cx).is_ready());
        ch
    }

    #[test]
    fn put_take_and_totals() {
        let mut ch = ready_channel(2);
        assert_eq!(ch.put(b"hello"), 5);
        assert_eq!(ch.data(), 5);
        assert_eq!(ch.total(), 5);
        assert!(ch.flags.contains(ChanFlags::WRITE_EVENT));
        assert_eq!(ch.make_contiguous(), b"hello");

        let got = ch.take(3).unwrap();
        assert_eq!(&got[..], b"hel");
        assert_eq!(ch.data(), 2);
        // Totals count production, not consumption.
        assert_eq!(ch.total(), 5);
    }

    #[test]
    fn room_respects_reserve() {
        let pool = BufferPool::with_buffer_size(1, 4096);
        let mut ch = Channel::new(pool);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(ch.poll_ensure_buf(&mut cx).is_ready());

        assert_eq!(ch.room(), 4096 - BUFFER_RESERVE);
        let big = vec![0u8; 4096];
        let wrote = ch.put(&big);
        assert_eq!(wrote, 4096 - BUFFER_RESERVE, "reserve headroom stays free");
    }

    #[test]
    fn forward_budget_is_spent_by_take() {
        let mut ch = ready_channel(1);
        ch.put(b"0123456789");
        ch.forward(4);
        assert_eq!(ch.to_forward(), 4);
        assert_eq!(ch.analysable(), 6);

        ch.take(2);
        assert_eq!(ch.to_forward(), 2);
        ch.take(8);
        assert_eq!(ch.to_forward(), 0);
        assert_eq!(ch.analysable(), 0);
    }

    #[test]
    fn alloc_parks_when_pool_dry() {
        let pool = BufferPool::with_buffer_size(1, 4096);
        let hog = pool.try_alloc().unwrap();

        let mut ch = Channel::new(pool.clone());
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(ch.poll_ensure_buf(&mut cx).is_pending());
        assert_eq!(pool.waiters(), 1);

        pool.release(hog);
        assert!(ch.poll_ensure_buf(&mut cx).is_ready());
        assert_eq!(pool.waiters(), 0);
    }

    #[test]
    fn room_survives_sustained_throughput() {
        // Far more bytes than one buffer holds must be able to pass,
        // as long as the consumer keeps draining.
        let mut ch = ready_channel(1);
        let payload = vec![7u8; 2048];
        for _ in 0..10 {
            assert_eq!(ch.put(&payload), 2048, "producer must keep its room");
            let got = ch.take(4096).unwrap();
            assert_eq!(got.len(), 2048);
        }
        assert_eq!(ch.total(), 20480);
    }

    #[test]
    fn shutdown_flags_and_done() {
        let mut ch = ready_channel(1);
        ch.put(b"tail");
        ch.shutr();
        assert!(ch.is_shutr());
        assert!(!ch.is_done(), "still has data to drain");
        ch.take(16);
        assert!(ch.is_done());

        ch.shutw();
        assert!(ch.is_shutw());
    }
}
