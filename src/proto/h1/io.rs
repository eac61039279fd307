//! Connection buffers.
//!
//! Each mux owns one `Transport`: a receive buffer that the head
//! parser and the body framer consume in place, and a transmit queue
//! holding flattened head bytes plus the re-framed body segments,
//! drained with vectored writes when the socket supports them.
//!
//! The transport stays dumb on purpose. Reads come in slabs matching
//! the worker's pooled buffer size, and how much may sit unconsumed
//! is the channels' business: their room and forward budget throttle
//! the producer, the transport only moves bytes.

use std::io::{self, IoSlice};
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::buf::{BufList, Cursor};
use crate::common::pool::BUFFER_SIZE;

/// How far the receive buffer may grow while a message head is still
/// incomplete: one pooled buffer, the same bound a channel gives a
/// body. A head that cannot fit is refused, not buffered forever.
pub(crate) const DEFAULT_RX_LIMIT: usize = BUFFER_SIZE;

/// Smallest settable receive limit.
pub(crate) const MINIMUM_RX_LIMIT: usize = 1024;

/// Queued transmit segments beyond which the owner must drain before
/// queueing more. Bounds the bookkeeping of one vectored write.
const TX_SEGMENT_LIMIT: usize = 32;

/// Queued transmit bytes beyond which the owner must drain: two
/// pooled buffers, enough for a head plus one full channel frame.
const TX_BYTES_LIMIT: usize = 2 * BUFFER_SIZE;

/// At most this many slices go into one vectored write.
const MAX_WRITE_VECS: usize = 16;

pub(crate) struct Transport<T> {
    io: T,
    rx: BytesMut,
    rx_limit: usize,
    tx: TxQueue,
}

impl<T> Transport<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T) -> Transport<T> {
        let vectored = io.is_write_vectored();
        Transport {
            io,
            rx: BytesMut::new(),
            rx_limit: DEFAULT_RX_LIMIT,
            tx: TxQueue::new(vectored),
        }
    }

    pub(crate) fn set_rx_limit(&mut self, limit: usize) {
        assert!(
            limit >= MINIMUM_RX_LIMIT,
            "receive limit below {}",
            MINIMUM_RX_LIMIT
        );
        self.rx_limit = limit;
    }

    pub(crate) fn rx_limit(&self) -> usize {
        self.rx_limit
    }

    pub(crate) fn rx(&self) -> &[u8] {
        &self.rx
    }

    pub(crate) fn rx_mut(&mut self) -> &mut BytesMut {
        &mut self.rx
    }

    pub(crate) fn rx_is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn rx_len(&self) -> usize {
        self.rx.len()
    }

    /// Eat CRLFs left between messages, so a keep-alive peer that
    /// pads its pipelining never looks like a malformed next head.
    pub(crate) fn consume_blank_lines(&mut self) {
        let keep = self
            .rx
            .iter()
            .position(|&b| b != b'\r' && b != b'\n')
            .unwrap_or(self.rx.len());
        if keep > 0 {
            self.rx.advance(keep);
        }
    }

    /// Hand out raw received bytes (tunnel mode).
    pub(crate) fn take_rx(&mut self, max: usize) -> Bytes {
        let n = std::cmp::min(max, self.rx.len());
        self.rx.split_to(n).freeze()
    }

    /// Read one slab from the socket into the receive buffer.
    /// `Ok(0)` is the peer's close.
    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if self.rx.capacity() - self.rx.len() < BUFFER_SIZE {
            self.rx.reserve(BUFFER_SIZE);
        }
        let spare = self.rx.chunk_mut();
        let spare = unsafe { &mut *(spare as *mut _ as *mut [MaybeUninit<u8>]) };
        let mut slab = ReadBuf::uninit(spare);
        ready!(Pin::new(&mut self.io).poll_read(cx, &mut slab))?;
        let n = slab.filled().len();
        unsafe {
            // The n bytes were just initialized by the read above.
            self.rx.advance_mut(n);
        }
        trace!("filled {} bytes", n);
        Poll::Ready(Ok(n))
    }

    /// The flatten area for an outgoing message head.
    pub(crate) fn head_buf(&mut self) -> &mut Vec<u8> {
        self.tx.head_mut()
    }

    pub(crate) fn tx_mut(&mut self) -> &mut TxQueue {
        &mut self.tx
    }

    /// Whether the transmit queue can take more before a drain.
    pub(crate) fn can_queue_tx(&self) -> bool {
        self.tx.segments_queued() < TX_SEGMENT_LIMIT && self.tx.bytes_queued() < TX_BYTES_LIMIT
    }

    pub(crate) fn has_queued_tx(&self) -> bool {
        !self.tx.is_empty()
    }

    /// Push everything queued onto the socket, then flush it.
    pub(crate) fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.tx.is_empty() {
            let n = if self.tx.vectored && self.tx.segments_queued() > 0 {
                let mut vecs = [IoSlice::new(&[]); MAX_WRITE_VECS];
                let cnt = self.tx.fill_vectored(&mut vecs);
                ready!(Pin::new(&mut self.io).poll_write_vectored(cx, &vecs[..cnt]))?
            } else {
                ready!(Pin::new(&mut self.io).poll_write(cx, self.tx.next_slice()))?
            };
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            trace!("drained {} bytes", n);
            self.tx.consume(n);
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    pub(crate) fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl<T> std::fmt::Debug for Transport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("rx", &self.rx.len())
            .field("tx", &self.tx)
            .finish()
    }
}

/// The transmit side: head bytes flattened so a message head always
/// goes out as one slice, body payloads queued as whole segments.
pub(crate) struct TxQueue {
    head: Cursor<Vec<u8>>,
    segments: BufList<Bytes>,
    vectored: bool,
}

impl TxQueue {
    pub(super) fn new(vectored: bool) -> TxQueue {
        TxQueue {
            head: Cursor::new(Vec::new()),
            segments: BufList::new(),
            vectored,
        }
    }

    fn head_mut(&mut self) -> &mut Vec<u8> {
        // Heads are only written at a transaction boundary, when the
        // previous transaction has fully drained.
        debug_assert!(
            self.segments.bufs_cnt() == 0,
            "head written while body segments queued"
        );
        self.head.get_mut()
    }

    /// Queue one body segment.
    pub(crate) fn push_segment(&mut self, segment: Bytes) {
        if !segment.is_empty() {
            self.segments.push(segment);
        }
    }

    pub(super) fn bytes_queued(&self) -> usize {
        self.head.remaining() + self.segments.remaining()
    }

    pub(super) fn segments_queued(&self) -> usize {
        self.segments.bufs_cnt()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.bytes_queued() == 0
    }

    /// The next contiguous run to write sequentially.
    fn next_slice(&self) -> &[u8] {
        if self.head.remaining() > 0 {
            self.head.chunk()
        } else {
            self.segments.chunk()
        }
    }

    /// Gather head-then-segments into `vecs` for one vectored write.
    fn fill_vectored<'t>(&'t self, vecs: &mut [IoSlice<'t>]) -> usize {
        let mut cnt = 0;
        if self.head.remaining() > 0 {
            vecs[cnt] = IoSlice::new(self.head.chunk());
            cnt += 1;
        }
        cnt + self.segments.chunks_vectored(&mut vecs[cnt..])
    }

    /// Account `n` written bytes, head first, then segments.
    fn consume(&mut self, mut n: usize) {
        let from_head = std::cmp::min(n, self.head.remaining());
        if from_head > 0 {
            self.head.advance(from_head);
            n -= from_head;
        }
        if self.head.remaining() == 0 {
            self.head.reset();
        }
        if n > 0 {
            self.segments.advance(n);
        }
    }

    /// Drain everything queued into one vector (test inspection).
    #[cfg(test)]
    pub(super) fn take_queued(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes_queued());
        while self.head.remaining() > 0 {
            let chunk = self.head.chunk();
            out.extend_from_slice(chunk);
            let n = chunk.len();
            self.head.advance(n);
        }
        self.head.reset();
        while self.segments.remaining() > 0 {
            let chunk = self.segments.chunk();
            out.extend_from_slice(chunk);
            let n = chunk.len();
            self.segments.advance(n);
        }
        out
    }
}

impl std::fmt::Debug for TxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxQueue")
            .field("bytes", &self.bytes_queued())
            .field("segments", &self.segments_queued())
            .field("vectored", &self.vectored)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_is_a_no_op_when_nothing_is_queued() {
        // The mock errors on any unscripted write, so draining an
        // empty queue must never touch the socket.
        let mock = tokio_test::io::Builder::new().build();
        let mut transport = Transport::new(mock);
        futures_util::future::poll_fn(|cx| transport.poll_drain(cx))
            .await
            .expect("empty drain");
    }

    #[tokio::test]
    async fn drains_head_before_segments() {
        let mock = tokio_test::io::Builder::new()
            .write(b"HEAD")
            .write(b"one")
            .write(b"two")
            .build();
        let mut transport = Transport::new(mock);
        transport.head_buf().extend_from_slice(b"HEAD");
        transport.tx_mut().push_segment(Bytes::from_static(b"one"));
        transport.tx_mut().push_segment(Bytes::from_static(b"two"));
        assert!(transport.has_queued_tx());

        futures_util::future::poll_fn(|cx| transport.poll_drain(cx))
            .await
            .expect("drain");
        assert!(!transport.has_queued_tx());
    }

    #[tokio::test]
    async fn fill_appends_and_blank_lines_are_eaten() {
        let mock = tokio_test::io::Builder::new()
            .read(b"\r\n\r\nGET")
            .read(b" / HT")
            .build();
        let mut transport = Transport::new(mock);

        let n = futures_util::future::poll_fn(|cx| transport.poll_fill(cx))
            .await
            .unwrap();
        assert_eq!(n, 7);
        transport.consume_blank_lines();
        assert_eq!(transport.rx(), b"GET");

        let n = futures_util::future::poll_fn(|cx| transport.poll_fill(cx))
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(transport.rx(), b"GET / HT");
    }

    #[tokio::test]
    async fn take_rx_hands_out_raw_bytes() {
        let mock = tokio_test::io::Builder::new().read(b"tunnel bytes").build();
        let mut transport = Transport::new(mock);
        futures_util::future::poll_fn(|cx| transport.poll_fill(cx))
            .await
            .unwrap();

        assert_eq!(&transport.take_rx(6)[..], b"tunnel");
        assert_eq!(&transport.take_rx(64)[..], b" bytes");
        assert!(transport.rx_is_empty());
    }

    #[test]
    fn queue_limits_gate_more_writes() {
        let mock = tokio_test::io::Builder::new().build();
        let mut transport = Transport::new(mock);
        assert!(transport.can_queue_tx());

        for _ in 0..TX_SEGMENT_LIMIT {
            transport.tx_mut().push_segment(Bytes::from_static(b"x"));
        }
        assert!(!transport.can_queue_tx(), "segment cap reached");

        let mock = tokio_test::io::Builder::new().build();
        let mut transport = Transport::new(mock);
        transport
            .tx_mut()
            .push_segment(Bytes::from(vec![0u8; TX_BYTES_LIMIT]));
        assert!(!transport.can_queue_tx(), "byte cap reached");
    }

    #[test]
    fn consume_spans_head_and_segments() {
        let mut tx = TxQueue::new(false);
        tx.head_mut().extend_from_slice(b"abcd");
        tx.push_segment(Bytes::from_static(b"efgh"));

        tx.consume(6);
        assert_eq!(tx.next_slice(), b"gh");
        tx.consume(2);
        assert!(tx.is_empty());

        // The head area is reusable once drained.
        tx.head_mut().extend_from_slice(b"next");
        assert_eq!(tx.next_slice(), b"next");
    }
}
