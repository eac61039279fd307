//! Transport-level connection state.
//!
//! A `Connection` owns one socket-like transport plus the flag word
//! that tracks its phase (handshake vs data), readiness wishes, and
//! sticky failure state. Readiness wishes are deduplicated: asking for
//! the same thing twice without intervening I/O touches the poller at
//! most once.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// The connection flag word.
///
/// Either the `SOCK_*` (handshake) or the `DATA_*` bits may drive
/// polling at any time, never both; `POLL_SOCK` says which. The
/// `CURR_*` bits mirror what was last pushed to the poller, so a wish
/// that matches the current state is a no-op.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ConnFlags(u32);

impl ConnFlags {
    pub(crate) const SOCK_RD_ENA: ConnFlags = ConnFlags(1 << 0);
    pub(crate) const SOCK_WR_ENA: ConnFlags = ConnFlags(1 << 1);
    pub(crate) const DATA_RD_ENA: ConnFlags = ConnFlags(1 << 2);
    pub(crate) const DATA_WR_ENA: ConnFlags = ConnFlags(1 << 3);
    /// The handshake layer owns polling (SOCK phase).
    pub(crate) const POLL_SOCK: ConnFlags = ConnFlags(1 << 4);
    /// Read interest as last pushed to the poller.
    pub(crate) const CURR_RD_ENA: ConnFlags = ConnFlags(1 << 5);
    /// Write interest as last pushed to the poller.
    pub(crate) const CURR_WR_ENA: ConnFlags = ConnFlags(1 << 6);
    /// The transport completed at least one successful operation.
    pub(crate) const CONNECTED: ConnFlags = ConnFlags(1 << 7);
    /// Still waiting for the L4 connect to be confirmed.
    pub(crate) const WAIT_L4_CONN: ConnFlags = ConnFlags(1 << 8);
    /// A transport error was seen; sticky.
    pub(crate) const ERROR: ConnFlags = ConnFlags(1 << 9);
    /// Read side is half-closed.
    pub(crate) const SOCK_RD_SH: ConnFlags = ConnFlags(1 << 10);
    /// Write side is half-closed.
    pub(crate) const SOCK_WR_SH: ConnFlags = ConnFlags(1 << 11);

    pub(crate) fn contains(self, other: ConnFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub(crate) fn insert(&mut self, other: ConnFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: ConnFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ConnFlags {
    type Output = ConnFlags;
    fn bitor(self, rhs: ConnFlags) -> ConnFlags {
        ConnFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ConnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnFlags")
            .field(&format_args!("{:#b}", self.0))
            .finish()
    }
}

pub(crate) struct Connection<T> {
    io: T,
    flags: ConnFlags,
    source: Option<SocketAddr>,
    target: Option<SocketAddr>,
    /// Effective polling changes pushed down; wish dedup keeps this
    /// from growing on repeated identical wishes.
    poll_updates: u64,
}

impl<T> Connection<T> {
    pub(crate) fn new(io: T) -> Connection<T> {
        let mut flags = ConnFlags::default();
        flags.insert(ConnFlags::WAIT_L4_CONN);
        Connection {
            io,
            flags,
            source: None,
            target: None,
            poll_updates: 0,
        }
    }

    pub(crate) fn with_addrs(
        io: T,
        source: Option<SocketAddr>,
        target: Option<SocketAddr>,
    ) -> Connection<T> {
        let mut conn = Connection::new(io);
        conn.source = source;
        conn.target = target;
        conn
    }

    pub(crate) fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.flags.contains(ConnFlags::CONNECTED)
    }

    pub(crate) fn has_error(&self) -> bool {
        self.flags.contains(ConnFlags::ERROR)
    }

    pub(crate) fn is_read_shut(&self) -> bool {
        self.flags.contains(ConnFlags::SOCK_RD_SH)
    }

    /// Enter the handshake phase: the transport's own protocol (e.g. a
    /// TLS layer) drives polling until `handshake_done`.
    pub(crate) fn start_handshake(&mut self) {
        self.flags.insert(ConnFlags::POLL_SOCK);
        self.update_polling();
    }

    pub(crate) fn handshake_done(&mut self) {
        self.flags.remove(
            ConnFlags::POLL_SOCK | ConnFlags::SOCK_RD_ENA | ConnFlags::SOCK_WR_ENA,
        );
        self.flags.insert(ConnFlags::CONNECTED);
        self.flags.remove(ConnFlags::WAIT_L4_CONN);
        self.update_polling();
    }

    pub(crate) fn data_want_recv(&mut self) {
        self.flags.insert(ConnFlags::DATA_RD_ENA);
        self.update_polling();
    }

    pub(crate) fn data_stop_recv(&mut self) {
        self.flags.remove(ConnFlags::DATA_RD_ENA);
        self.update_polling();
    }

    pub(crate) fn data_want_send(&mut self) {
        self.flags.insert(ConnFlags::DATA_WR_ENA);
        self.update_polling();
    }

    pub(crate) fn data_stop_send(&mut self) {
        self.flags.remove(ConnFlags::DATA_WR_ENA);
        self.update_polling();
    }

    pub(crate) fn sock_want_recv(&mut self) {
        self.flags.insert(ConnFlags::SOCK_RD_ENA);
        self.update_polling();
    }

    pub(crate) fn sock_want_send(&mut self) {
        self.flags.insert(ConnFlags::SOCK_WR_ENA);
        self.update_polling();
    }

    #[cfg(test)]
    pub(crate) fn poll_updates(&self) -> u64 {
        self.poll_updates
    }

    /// Translate the wishes of the active layer into poller state, but
    /// only when they differ from what the poller already knows.
    fn update_polling(&mut self) {
        let (rd_src, wr_src) = if self.flags.contains(ConnFlags::POLL_SOCK) {
            (ConnFlags::SOCK_RD_ENA, ConnFlags::SOCK_WR_ENA)
        } else {
            (ConnFlags::DATA_RD_ENA, ConnFlags::DATA_WR_ENA)
        };
        let want_rd = self.flags.contains(rd_src);
        let want_wr = self.flags.contains(wr_src);
        let curr_rd = self.flags.contains(ConnFlags::CURR_RD_ENA);
        let curr_wr = self.flags.contains(ConnFlags::CURR_WR_ENA);

        if want_rd == curr_rd && want_wr == curr_wr {
            return;
        }
        if want_rd {
            self.flags.insert(ConnFlags::CURR_RD_ENA);
        } else {
            self.flags.remove(ConnFlags::CURR_RD_ENA);
        }
        if want_wr {
            self.flags.insert(ConnFlags::CURR_WR_ENA);
        } else {
            self.flags.remove(ConnFlags::CURR_WR_ENA);
        }
        self.poll_updates += 1;
        trace!(
            "polling update #{}: rd={} wr={}",
            self.poll_updates,
            want_rd,
            want_wr
        );
    }

    fn record_success(&mut self) {
        if self.flags.contains(ConnFlags::WAIT_L4_CONN) {
            self.flags.remove(ConnFlags::WAIT_L4_CONN);
            self.flags.insert(ConnFlags::CONNECTED);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("flags", &self.flags)
            .field("source", &self.source)
            .field("target", &self.target)
            .finish()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Connection<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n == 0 {
                    this.flags.insert(ConnFlags::SOCK_RD_SH);
                } else {
                    this.record_success();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.flags.insert(ConnFlags::ERROR);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Connection<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.record_success();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.flags.insert(ConnFlags::ERROR);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(n)) => {
                this.record_success();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.flags.insert(ConnFlags::ERROR);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_flush(cx) {
            Poll::Ready(Err(e)) => {
                this.flags.insert(ConnFlags::ERROR);
                Poll::Ready(Err(e))
            }
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                this.flags.insert(ConnFlags::SOCK_WR_SH);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.flags.insert(ConnFlags::ERROR);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_want_recv_updates_poller_once() {
        let mut conn = Connection::new(tokio_test::io::Builder::new().build());
        assert_eq!(conn.poll_updates(), 0);

        conn.data_want_recv();
        assert_eq!(conn.poll_updates(), 1);

        // Same wish again: nothing changed, no new poller call.
        conn.data_want_recv();
        assert_eq!(conn.poll_updates(), 1);

        conn.data_stop_recv();
        assert_eq!(conn.poll_updates(), 2);
        conn.data_stop_recv();
        assert_eq!(conn.poll_updates(), 2);
    }

    #[test]
    fn send_side_wishes_dedup_too() {
        let mut conn = Connection::new(tokio_test::io::Builder::new().build());
        conn.data_want_send();
        conn.data_want_send();
        assert_eq!(conn.poll_updates(), 1);
        assert!(conn.flags().contains(ConnFlags::CURR_WR_ENA));
        conn.data_stop_send();
        assert_eq!(conn.poll_updates(), 2);

        // Sock-phase write wishes only matter during the handshake.
        conn.start_handshake();
        conn.sock_want_send();
        assert!(conn.flags().contains(ConnFlags::CURR_WR_ENA));
    }

    #[test]
    fn sock_and_data_phases_never_both_drive_polling() {
        let mut conn = Connection::new(tokio_test::io::Builder::new().build());

        // During the handshake, data wishes are parked: they change
        // nothing until the sock phase ends.
        conn.start_handshake();
        conn.data_want_recv();
        assert!(!conn.flags().contains(ConnFlags::CURR_RD_ENA));

        conn.sock_want_recv();
        assert!(conn.flags().contains(ConnFlags::CURR_RD_ENA));

        // Handshake done: the parked data wish takes over seamlessly.
        conn.handshake_done();
        assert!(conn.flags().contains(ConnFlags::CURR_RD_ENA));
        assert!(conn.is_connected());
        assert!(!conn.flags().contains(ConnFlags::POLL_SOCK));
    }

    #[tokio::test]
    async fn read_zero_sets_half_closed() {
        use tokio::io::AsyncReadExt;

        let mock = tokio_test::io::Builder::new().read(b"x").build();
        let mut conn = Connection::new(mock);

        let mut buf = [0u8; 8];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 1);
        assert!(conn.is_connected(), "first successful op confirms L4");

        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(conn.is_read_shut());
    }
}
