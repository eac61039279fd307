//! The H1 multiplexer.
//!
//! One mux per connection, binding it to at most one in-flight
//! message per direction. The receive side walks head parsing and
//! body framing over the transport's receive buffer; the transmit
//! side flattens heads and queues re-framed body segments. What
//! happens between transactions is the stream's decided connection
//! mode: reset for keep-alive, go opaque as a tunnel, or close.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::ready;
use http::header::{self, HeaderValue};
use http::{HeaderMap, Method, Version};
use tokio::io::{AsyncRead, AsyncWrite};

use super::decode::{BodyEvent, BodyFramer, FramingError};
use super::encode::BodyWriter;
use super::io::Transport;
use super::parse::Flags as ParseFlags;
use super::parse::Parser;
use super::{Decode, Frame, Http1Transaction, ParseContext};
use crate::common::pool::BUFFER_SIZE;
use crate::proto::{ConnectionMode, DecodedLength, MessageHead};

/// Blocking and fatal conditions of a mux, kept apart from the
/// per-direction progression so several can hold at once.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MuxFlags(u16);

impl MuxFlags {
    /// A transport or framing error was seen; sticky.
    pub(crate) const ERROR: MuxFlags = MuxFlags(1 << 0);
    /// An orderly write shutdown was requested.
    pub(crate) const SHUTW_NOW: MuxFlags = MuxFlags(1 << 1);
    /// The write side has been shut down.
    pub(crate) const SHUTW: MuxFlags = MuxFlags(1 << 2);
    /// Read returned zero; no more bytes will arrive.
    pub(crate) const READ_NULL: MuxFlags = MuxFlags(1 << 3);
    /// The stream cannot absorb more frames right now.
    pub(crate) const RX_FULL: MuxFlags = MuxFlags(1 << 4);
    /// Between transactions, waiting for the next request head.
    pub(crate) const WAIT_NEXT_REQ: MuxFlags = MuxFlags(1 << 5);

    pub(crate) fn contains(self, other: MuxFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub(crate) fn intersects(self, other: MuxFlags) -> bool {
        (self.0 & other.0) != 0
    }

    pub(crate) fn insert(&mut self, other: MuxFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: MuxFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for MuxFlags {
    type Output = MuxFlags;
    fn bitor(self, rhs: MuxFlags) -> MuxFlags {
        MuxFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for MuxFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MuxFlags")
            .field(&format_args!("{:#b}", self.0))
            .finish()
    }
}

/// Where the receive direction of a transaction stands. The names
/// mirror the stream's request/response phases: a head is awaited,
/// a body is framed, then the direction is done until the sync point.
#[derive(Debug)]
enum RxState {
    Head,
    Body(BodyFramer),
    Done,
    Tunnel,
    Closed,
}

/// Where the transmit direction stands.
#[derive(Debug)]
enum TxState {
    Head,
    Body(BodyWriter),
    Done,
    Tunnel,
    Closed,
}

pub(crate) struct Mux<I, T> {
    io: Transport<I>,
    h1m: Parser,
    rx: RxState,
    tx: TxState,
    flags: MuxFlags,
    /// What happens once the current transaction completes. The
    /// stream decides this from both heads; until then, keep-alive.
    mode: ConnectionMode,
    /// Method of the in-flight transaction; picks the response framing.
    req_method: Option<Method>,
    version: Version,
    /// Framing flags of the last head parsed from the peer.
    last_flags: ParseFlags,
    /// Heads parsed from the peer on this connection.
    transactions: u64,
    _marker: PhantomData<fn(T)>,
}

impl<I, T> Mux<I, T>
where
    I: AsyncRead + AsyncWrite + Unpin,
    T: Http1Transaction,
{
    pub(crate) fn new(io: I) -> Mux<I, T> {
        Mux {
            io: Transport::new(io),
            h1m: if T::is_server() {
                Parser::request()
            } else {
                Parser::response()
            },
            rx: RxState::Head,
            tx: TxState::Head,
            flags: MuxFlags::default(),
            mode: ConnectionMode::KeepAlive,
            req_method: None,
            // We assume a modern world where the remote speaks
            // HTTP/1.1; `poll_read_head` downgrades if told otherwise.
            version: Version::HTTP_11,
            last_flags: ParseFlags::default(),
            transactions: 0,
            _marker: PhantomData,
        }
    }

    pub(crate) fn set_rx_limit(&mut self, limit: usize) {
        self.io.set_rx_limit(limit);
    }

    pub(crate) fn set_accept_invalid_uri(&mut self, enabled: bool) {
        self.h1m.set_accept_invalid_uri(enabled);
    }

    pub(crate) fn set_req_method(&mut self, method: Method) {
        self.req_method = Some(method);
    }

    /// Record what the connection does once the transaction ends.
    /// `ServerClose` is a stream-level split; at the connection level
    /// it is a plain close.
    pub(crate) fn set_mode(&mut self, mode: ConnectionMode) {
        self.mode = match mode {
            ConnectionMode::ServerClose => ConnectionMode::Close,
            other => other,
        };
    }

    pub(crate) fn transactions(&self) -> u64 {
        self.transactions
    }

    pub(crate) fn peer_version(&self) -> Version {
        self.version
    }

    /// Framing facts of the last head parsed from the peer.
    pub(crate) fn peer_flags(&self) -> ParseFlags {
        self.last_flags
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        matches!(self.rx, RxState::Closed)
    }

    pub(crate) fn is_write_closed(&self) -> bool {
        matches!(self.tx, TxState::Closed)
    }

    pub(crate) fn has_error(&self) -> bool {
        self.flags.contains(MuxFlags::ERROR)
    }

    pub(crate) fn set_rx_full(&mut self, full: bool) {
        if full {
            self.flags.insert(MuxFlags::RX_FULL);
        } else {
            self.flags.remove(MuxFlags::RX_FULL);
        }
    }

    /// The receive gate, consulted both before reading and before
    /// asking the poller for more: nothing fatal has happened, the
    /// stream side can absorb frames, and either buffered input
    /// remains to be consumed or the peer has not already closed.
    pub(crate) fn recv_allowed(&self) -> bool {
        if self.flags.intersects(MuxFlags::ERROR | MuxFlags::SHUTW_NOW) {
            return false;
        }
        if self.flags.contains(MuxFlags::RX_FULL) {
            return false;
        }
        !self.io.rx_is_empty() || !self.flags.contains(MuxFlags::READ_NULL)
    }

    pub(crate) fn can_read_head(&self) -> bool {
        if !self.recv_allowed() || !matches!(self.rx, RxState::Head) {
            return false;
        }
        // A backend mux only expects a response once its request head
        // is out.
        T::is_server() || !matches!(self.tx, TxState::Head)
    }

    pub(crate) fn can_read_body(&self) -> bool {
        self.recv_allowed() && matches!(self.rx, RxState::Body(_))
    }

    pub(crate) fn can_read_tunnel(&self) -> bool {
        self.recv_allowed() && matches!(self.rx, RxState::Tunnel)
    }

    pub(crate) fn can_write_head(&self) -> bool {
        !self.flags.intersects(MuxFlags::ERROR | MuxFlags::SHUTW)
            && matches!(self.tx, TxState::Head)
    }

    pub(crate) fn can_write_body(&self) -> bool {
        matches!(self.tx, TxState::Body(_))
    }

    pub(crate) fn can_write_tunnel(&self) -> bool {
        matches!(self.tx, TxState::Tunnel)
    }

    /// Whether the transmit queue can take more before a flush.
    pub(crate) fn can_queue(&self) -> bool {
        self.io.can_queue_tx()
    }

    pub(crate) fn poll_read_head(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<crate::Result<(MessageHead<T::Incoming>, DecodedLength, bool)>>> {
        debug_assert!(self.can_read_head());
        trace!("Mux::poll_read_head {}", T::LOG);

        loop {
            let parsed = match T::parse(
                self.io.rx_mut(),
                ParseContext {
                    h1m: &mut self.h1m,
                    req_method: &mut self.req_method,
                },
            ) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => {
                    if self.io.rx_len() >= self.io.rx_limit() {
                        debug!("head exceeds the {} byte limit", self.io.rx_limit());
                        return self.fail_head(crate::Error::new_too_large());
                    }
                    match ready!(self.io.poll_fill(cx)) {
                        Ok(0) => return self.head_eof(),
                        Ok(_) => continue,
                        Err(e) => {
                            self.flags.insert(MuxFlags::ERROR);
                            self.rx = RxState::Closed;
                            return Poll::Ready(Some(Err(crate::Error::new_io(e))));
                        }
                    }
                }
                Err(parse_err) => {
                    debug!("head parse failed: {:?}", parse_err);
                    return self.fail_head(parse_err.into());
                }
            };

            self.version = parsed.head.version;
            self.last_flags = parsed.flags;

            let decode = match T::decoder(&parsed, &mut self.req_method) {
                Ok(decode) => decode,
                Err(e) => {
                    debug!("no usable body framing: {:?}", e);
                    return self.fail_head(e.into());
                }
            };
            let (framer, is_final) = match decode {
                Decode::Normal(framer) => (framer, false),
                Decode::Final(framer) => (framer, true),
                Decode::Ignore => {
                    // An interim message; go parse the real one.
                    self.h1m.reset();
                    continue;
                }
            };

            self.flags.remove(MuxFlags::WAIT_NEXT_REQ);
            self.transactions += 1;
            let body_len = framer.advertised();
            debug!("incoming body: {}", body_len);

            if framer.is_done() && !is_final {
                self.rx = RxState::Done;
                self.end_of_transaction();
            } else {
                self.rx = RxState::Body(framer);
            }
            return Poll::Ready(Some(Ok((parsed.head, body_len, is_final))));
        }
    }

    /// A head that can never be parsed. The read side is beyond
    /// saving; the write side stays usable, because the owner still
    /// owes the peer an error message.
    fn fail_head<Z>(&mut self, err: crate::Error) -> Poll<Option<crate::Result<Z>>> {
        self.rx = RxState::Closed;
        self.flags.insert(MuxFlags::READ_NULL);
        self.mode = ConnectionMode::Close;
        Poll::Ready(Some(Err(err)))
    }

    /// The peer closed while a head was awaited. Harmless between
    /// transactions; an error when bytes were pending or when this
    /// side already sent a request and is owed its response.
    fn head_eof<Z>(&mut self) -> Poll<Option<crate::Result<Z>>> {
        self.flags.insert(MuxFlags::READ_NULL);
        self.rx = RxState::Closed;
        self.io.consume_blank_lines();

        let mid_head = !self.io.rx_is_empty();
        let owed_response = !T::is_server() && !matches!(self.tx, TxState::Head);
        if mid_head || owed_response {
            debug!("peer closed mid-head ({} bytes buffered)", self.io.rx_len());
            self.mode = ConnectionMode::Close;
            Poll::Ready(Some(Err(crate::Error::new_incomplete())))
        } else {
            trace!("peer closed between transactions {}", T::LOG);
            self.tx = TxState::Closed;
            Poll::Ready(None)
        }
    }

    pub(crate) fn poll_read_body(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Frame>>> {
        debug_assert!(self.can_read_body());
        trace!("Mux::poll_read_body {}", T::LOG);

        enum Step {
            Emit(Frame),
            Finished { close_delimited: bool },
            Fill,
        }

        loop {
            let step = match self.rx {
                RxState::Body(ref mut framer) => match framer.decode(self.io.rx_mut()) {
                    Ok(BodyEvent::Data(data)) => Step::Emit(Frame::Data(data)),
                    Ok(BodyEvent::Trailers(fields)) => Step::Emit(Frame::Trailers(fields)),
                    Ok(BodyEvent::Done) => Step::Finished {
                        close_delimited: framer.is_close_delimited(),
                    },
                    Ok(BodyEvent::NeedMore) => Step::Fill,
                    Err(e) => {
                        debug!("body framing violated: {}", e);
                        self.flags.insert(MuxFlags::ERROR);
                        self.rx = RxState::Closed;
                        return Poll::Ready(Some(Err(e.into())));
                    }
                },
                ref other => unreachable!("poll_read_body in {:?}", other),
            };

            match step {
                Step::Emit(frame) => return Poll::Ready(Some(Ok(frame))),
                Step::Finished { close_delimited } => {
                    trace!("incoming body complete {}", T::LOG);
                    self.rx = if close_delimited {
                        RxState::Closed
                    } else {
                        RxState::Done
                    };
                    self.end_of_transaction();
                    return Poll::Ready(None);
                }
                Step::Fill => {
                    let n = match ready!(self.io.poll_fill(cx)) {
                        Ok(n) => n,
                        Err(e) => {
                            self.flags.insert(MuxFlags::ERROR);
                            self.rx = RxState::Closed;
                            return Poll::Ready(Some(Err(e)));
                        }
                    };
                    if n == 0 {
                        self.flags.insert(MuxFlags::READ_NULL);
                        match self.rx {
                            RxState::Body(ref mut framer) if framer.is_close_delimited() => {
                                framer.note_eof();
                            }
                            _ => {
                                debug!("peer closed mid-body");
                                self.flags.insert(MuxFlags::ERROR);
                                self.rx = RxState::Closed;
                                return Poll::Ready(Some(Err(FramingError::PeerClosed.into())));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Raw reads once the connection has become a tunnel.
    pub(crate) fn poll_read_tunnel(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Bytes>> {
        debug_assert!(matches!(self.rx, RxState::Tunnel));
        if self.io.rx_is_empty() {
            if ready!(self.io.poll_fill(cx))? == 0 {
                self.flags.insert(MuxFlags::READ_NULL);
                self.rx = RxState::Closed;
                return Poll::Ready(Ok(Bytes::new()));
            }
        }
        Poll::Ready(Ok(self.io.take_rx(BUFFER_SIZE)))
    }

    pub(crate) fn write_head(&mut self, mut head: MessageHead<T::Outgoing>, body: DecodedLength) {
        debug_assert!(self.can_write_head());
        trace!("Mux::write_head {}", T::LOG);

        let writer = T::encode(&mut head, body, self.io.head_buf());
        self.tx = if writer.is_done() {
            TxState::Done
        } else {
            TxState::Body(writer)
        };
    }

    pub(crate) fn write_body(&mut self, chunk: Bytes) {
        debug_assert!(self.can_write_body() && self.can_queue());
        let done = match self.tx {
            TxState::Body(ref mut writer) => {
                writer.write_chunk(chunk, self.io.tx_mut());
                writer.is_done()
            }
            ref other => unreachable!("write_body in {:?}", other),
        };
        if done {
            self.tx = TxState::Done;
            self.end_of_transaction();
        }
    }

    pub(crate) fn write_trailers(&mut self, trailers: HeaderMap) {
        debug_assert!(self.can_write_body() && self.can_queue());
        let done = match self.tx {
            TxState::Body(ref mut writer) => writer.write_trailers(&trailers, self.io.tx_mut()),
            ref other => unreachable!("write_trailers in {:?}", other),
        };
        if done {
            self.tx = TxState::Done;
            self.end_of_transaction();
        }
    }

    /// Finish the outgoing message body: queue the terminator, or
    /// report a sized body that came up short.
    pub(crate) fn finish_body(&mut self) -> crate::Result<()> {
        let next = match self.tx {
            TxState::Body(ref mut writer) => {
                if writer.is_close_delimited() {
                    // This body only ends with the connection.
                    TxState::Closed
                } else {
                    match writer.finish(self.io.tx_mut()) {
                        Ok(()) => TxState::Done,
                        Err(missing) => {
                            debug!("outgoing body short by {} bytes", missing);
                            self.flags.insert(MuxFlags::ERROR);
                            self.mode = ConnectionMode::Close;
                            return Err(crate::Error::new_incomplete());
                        }
                    }
                }
            }
            TxState::Done => TxState::Done,
            ref other => unreachable!("finish_body in {:?}", other),
        };
        self.tx = next;
        self.end_of_transaction();
        Ok(())
    }

    pub(crate) fn write_tunnel(&mut self, chunk: Bytes) {
        debug_assert!(self.can_write_tunnel());
        self.io.tx_mut().push_segment(chunk);
    }

    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        match ready!(self.io.poll_drain(cx)) {
            Ok(()) => {
                self.end_of_transaction();
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                self.flags.insert(MuxFlags::ERROR);
                Poll::Ready(Err(crate::Error::new_io(e)))
            }
        }
    }

    pub(crate) fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flags.insert(MuxFlags::SHUTW_NOW);
        match ready!(self.io.poll_shutdown(cx)) {
            Ok(()) => {
                self.flags.insert(MuxFlags::SHUTW);
                self.tx = TxState::Closed;
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    /// Promote both directions to opaque byte passing (CONNECT, 101).
    /// A side that already closed stays closed.
    pub(crate) fn into_tunnel_mode(&mut self) {
        self.mode = ConnectionMode::Tunnel;
        if !matches!(self.rx, RxState::Tunnel | RxState::Closed) {
            trace!("Mux::into_tunnel_mode {}", T::LOG);
            self.rx = RxState::Tunnel;
        }
        if !matches!(self.tx, TxState::Tunnel | TxState::Closed) {
            self.tx = TxState::Tunnel;
        }
    }

    /// The transaction sync point: once both directions are done and
    /// everything queued has reached the wire, the decided mode says
    /// what the connection does next.
    fn end_of_transaction(&mut self) {
        if !matches!(self.rx, RxState::Done) || !matches!(self.tx, TxState::Done) {
            return;
        }
        if self.io.has_queued_tx() {
            // Not on the wire yet; a later flush re-enters here.
            return;
        }
        match self.mode {
            ConnectionMode::KeepAlive => {
                trace!("transaction done, resetting {}", T::LOG);
                self.h1m.reset();
                self.req_method = None;
                self.rx = RxState::Head;
                self.tx = TxState::Head;
                self.flags.insert(MuxFlags::WAIT_NEXT_REQ);
            }
            ConnectionMode::Tunnel => {
                self.rx = RxState::Tunnel;
                self.tx = TxState::Tunnel;
            }
            ConnectionMode::Close | ConnectionMode::ServerClose => {
                trace!("transaction done, closing {}", T::LOG);
                self.rx = RxState::Closed;
                self.tx = TxState::Closed;
                self.flags.insert(MuxFlags::SHUTW_NOW);
            }
        }
    }
}

impl<I, T> fmt::Debug for Mux<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .field("mode", &self.mode)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Whether the peer asked to keep the connection open.
fn wants_keep_alive(flags: ParseFlags) -> bool {
    if flags.contains(ParseFlags::VER_11) {
        // 1.1 defaults to keep-alive unless `close` was sent.
        !flags.contains(ParseFlags::CONN_CLO)
    } else {
        // 1.0 (and promoted 0.9) default to close unless asked.
        flags.contains(ParseFlags::CONN_KAL)
    }
}

/// Decide the connection mode for one side of a transaction.
///
/// `configured` is the proxy's http-mode; the request and response
/// framing facts narrow it down. `Tunnel` is only entered via 101 or a
/// successful CONNECT, which the caller signals with `is_final`.
pub(crate) fn decide_mode(
    configured: ConnectionMode,
    req_flags: ParseFlags,
    res_flags: Option<ParseFlags>,
    res_has_len: bool,
    is_final: bool,
) -> ConnectionMode {
    if is_final {
        return ConnectionMode::Tunnel;
    }
    match configured {
        ConnectionMode::Tunnel => return ConnectionMode::Tunnel,
        ConnectionMode::Close => return ConnectionMode::Close,
        ConnectionMode::ServerClose | ConnectionMode::KeepAlive => {}
    }
    if !wants_keep_alive(req_flags) {
        return ConnectionMode::Close;
    }
    if let Some(res_flags) = res_flags {
        if !res_has_len {
            // Without a transfer length the only delimiter is close.
            return ConnectionMode::Close;
        }
        if !wants_keep_alive(res_flags) {
            return ConnectionMode::Close;
        }
    }
    configured
}

/// Rewrite `Connection` headers so the emitted head matches the
/// decided mode. Foreign tokens (e.g. `upgrade`) are preserved.
pub(crate) fn rewrite_connection_headers(
    headers: &mut HeaderMap,
    mode: ConnectionMode,
    peer_version: Version,
) {
    let mut tokens: Vec<String> = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(s) = value.to_str() {
            for token in s.split(',') {
                let token = token.trim();
                if token.is_empty()
                    || token.eq_ignore_ascii_case("close")
                    || token.eq_ignore_ascii_case("keep-alive")
                {
                    continue;
                }
                tokens.push(token.to_owned());
            }
        }
    }

    match mode {
        ConnectionMode::Close | ConnectionMode::ServerClose => {
            if peer_version == Version::HTTP_11 {
                tokens.push("close".to_owned());
            }
            // 1.0 closes by default; saying so is redundant.
        }
        ConnectionMode::KeepAlive => {
            if peer_version == Version::HTTP_10 {
                tokens.push("keep-alive".to_owned());
            }
        }
        ConnectionMode::Tunnel => {}
    }

    if tokens.is_empty() {
        headers.remove(header::CONNECTION);
    } else {
        let joined = tokens.join(", ");
        match HeaderValue::from_str(&joined) {
            Ok(value) => {
                headers.insert(header::CONNECTION, value);
            }
            Err(_) => {
                headers.remove(header::CONNECTION);
            }
        }
    }
}
