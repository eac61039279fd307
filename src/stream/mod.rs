//! The stream: one client transaction flowing through the proxy.
//!
//! A stream owns the two sides (client connection, upstream
//! connection), the two half-duplex channels between them, and the
//! analyser bitmask that schedules the work. Its `poll` is a
//! fixed-point driver: analysers run in bit order against the request
//! then the response channel, interface state changes are folded in,
//! and the pass repeats until nothing makes progress; the earliest
//! pending deadline arms the timer.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_channel::oneshot;
use futures_util::ready;
use http::header::HeaderValue;
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant, Sleep};

pub(crate) mod analyser;
pub(crate) mod channel;
pub(crate) mod interface;

use self::analyser::{AnMask, TermInitiator, TermPhase, Termination};
use self::channel::{ChanFlags, Channel};
use self::interface::{SiError, SiState, StreamInterface};
use crate::balance::{assign_server, process_srv_queue, Assign, Backend, PendConn, Server};
use crate::common::pool::BufferPool;
use crate::connection::Connection;
use crate::listener::Frontend;
use crate::proto::h1::conn::{decide_mode, rewrite_connection_headers};
use crate::proto::h1::parse::Flags as ParseFlags;
use crate::proto::h1::{ClientTransaction, Frame, Http1Transaction, Mux, ServerTransaction};
use crate::proto::{ConnectionMode, DecodedLength, MessageHead, RequestLine};
use crate::stick::StkCtr;

static NEXT_STREAM_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

const FORWARD_CHUNK: usize = 16 * 1024;

/// Progress of the request (front-to-back) half.
#[derive(Debug, PartialEq)]
enum ReqPhase {
    WaitHead,
    Dispatch,
    SendHead,
    Body,
    Done,
}

/// Progress of the response (back-to-front) half.
#[derive(Debug, PartialEq)]
enum ResPhase {
    Idle,
    WaitHead,
    Body,
    Done,
}

/// Where the server-side interface currently blocks.
enum Dispatch {
    Idle,
    Queued {
        pend: PendConn,
        rx: oneshot::Receiver<Arc<Server>>,
    },
    Connecting {
        fut: Pin<Box<dyn Future<Output = crate::Result<TcpStream>> + Send>>,
    },
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Idle => f.write_str("Idle"),
            Dispatch::Queued { .. } => f.write_str("Queued"),
            Dispatch::Connecting { .. } => f.write_str("Connecting"),
        }
    }
}

/// The in-flight transaction.
#[derive(Debug, Default)]
struct Txn {
    req_head: Option<MessageHead<RequestLine>>,
    req_body: Option<DecodedLength>,
    req_flags: ParseFlags,
    method: Option<Method>,
    status: Option<StatusCode>,
    res_flags: ParseFlags,
    /// Decided connection mode, known once the response head is seen.
    mode: Option<ConnectionMode>,
}

pub(crate) struct Stream<T> {
    uniq_id: u64,
    source: std::net::SocketAddr,
    frontend: Arc<Frontend>,
    backend: Arc<Backend>,
    front: Mux<Connection<T>, ServerTransaction>,
    back: Option<Mux<Connection<TcpStream>, ClientTransaction>>,
    req: Channel,
    res: Channel,
    front_si: StreamInterface,
    back_si: StreamInterface,
    req_an: AnMask,
    res_an: AnMask,
    txn: Txn,
    req_phase: ReqPhase,
    res_phase: ResPhase,
    dispatch: Dispatch,
    srv: Option<Arc<Server>>,
    srv_slot_held: bool,
    redispatched: bool,
    stkctr: Vec<StkCtr>,
    term: Termination,
    /// Error response the proxy itself owes the client.
    error_status: Option<StatusCode>,
    error_sent: bool,
    req_pending: Option<Bytes>,
    res_pending: Option<Bytes>,
    timer: Pin<Box<Sleep>>,
    timer_deadline: Option<Instant>,
    first_txn: bool,
    backend_counted: bool,
    tunnel: bool,
    tarpitted: bool,
}

impl<T> Stream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        io: T,
        source: std::net::SocketAddr,
        frontend: Arc<Frontend>,
        backend: Arc<Backend>,
        pool: BufferPool,
        stkctr: Vec<StkCtr>,
    ) -> Stream<T> {
        let mut front = Mux::new(Connection::with_addrs(io, Some(source), None));
        front.set_accept_invalid_uri(frontend.cfg.accept_invalid_uri);
        if let Some(max) = frontend.cfg.max_buf_size {
            front.set_rx_limit(max);
        }
        let uniq_id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        trace!("stream {} accepted from {}", uniq_id, source);

        let mut front_si = StreamInterface::new();
        front_si.set_state(SiState::Est);

        Stream {
            uniq_id,
            source,
            frontend,
            backend,
            front,
            back: None,
            req: Channel::new(pool.clone()),
            res: Channel::new(pool),
            front_si,
            back_si: StreamInterface::new(),
            req_an: AnMask::request_set(),
            res_an: AnMask::response_set(),
            txn: Txn::default(),
            req_phase: ReqPhase::WaitHead,
            res_phase: ResPhase::Idle,
            dispatch: Dispatch::Idle,
            srv: None,
            srv_slot_held: false,
            redispatched: false,
            stkctr,
            term: Termination::default(),
            error_status: None,
            error_sent: false,
            req_pending: None,
            res_pending: None,
            timer: Box::pin(sleep_until(Instant::now())),
            timer_deadline: None,
            first_txn: true,
            backend_counted: false,
            tunnel: false,
            tarpitted: false,
        }
    }

    /// Put the stream in the tarpit: the request is read and then
    /// held until the tarpit timeout elapses, when an error closes it.
    pub(crate) fn tarpit(&mut self) {
        self.tarpitted = true;
    }

    // ===== request-side analysers =====

    /// Run the request-channel analysers once. Returns whether any of
    /// them made progress.
    fn req_analysers(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        if self.error_status.is_some() {
            return false;
        }

        if self.req_an.contains(AnMask::REQ_WAIT_HTTP) && self.req_phase == ReqPhase::WaitHead {
            progress |= self.an_wait_request(cx);
        }
        if self.req_an.contains(AnMask::REQ_LB) && self.req_phase == ReqPhase::Dispatch {
            progress |= self.an_dispatch(cx);
        }
        if self.req_phase == ReqPhase::SendHead {
            progress |= self.an_send_request_head();
        }
        if self.req_phase == ReqPhase::Body {
            progress |= self.an_forward_request(cx);
        }
        progress
    }

    fn an_wait_request(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.front.can_read_head() {
            if self.front.is_read_closed() || self.front.has_error() {
                self.front_si.set_state(SiState::Dis);
                self.req_an.remove(AnMask::REQ_WAIT_HTTP);
                self.req_phase = ReqPhase::Done;
                self.res_phase = ResPhase::Done;
                return true;
            }
            return false;
        }
        if self.req.rex.is_none() {
            let dur = if self.first_txn {
                self.frontend.cfg.timeouts.client
            } else {
                self.frontend
                    .cfg
                    .timeouts
                    .keep_alive
                    .or(self.frontend.cfg.timeouts.client)
            };
            self.req.rex = dur.map(|d| Instant::now() + d);
        }

        let parsed = match self.front.poll_read_head(cx) {
            Poll::Pending => return false,
            Poll::Ready(None) => {
                // Client went away between requests.
                trace!("stream {}: client closed", self.uniq_id);
                self.front_si.set_state(SiState::Dis);
                self.req_an.remove(AnMask::REQ_WAIT_HTTP);
                self.req_phase = ReqPhase::Done;
                self.res_phase = ResPhase::Done;
                self.req.shutr();
                return true;
            }
            Poll::Ready(Some(Err(e))) => {
                debug!("stream {}: request error: {}", self.uniq_id, e);
                self.frontend.counters.failed_req.fetch_add(1, Ordering::Relaxed);
                if e.is_timeout() || e.is_incomplete_message() {
                    self.term.set(TermInitiator::Client, TermPhase::Request);
                    self.front_si.fail(SiError::Abort);
                    self.req_phase = ReqPhase::Done;
                    self.res_phase = ResPhase::Done;
                    return true;
                }
                let status = if e.is_parse_too_large() {
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                self.term.set(TermInitiator::Proxy, TermPhase::Request);
                self.start_error_response(status);
                return true;
            }
            Poll::Ready(Some(Ok(parsed))) => parsed,
        };

        let (head, body_len, _is_final) = parsed;
        debug!(
            "stream {}: {} {} {:?}",
            self.uniq_id, head.subject.0, head.subject.1, head.version
        );
        self.req.rex = None;
        self.frontend.counters.cum_req.fetch_add(1, Ordering::Relaxed);
        // HTTP-level tracking applies to content-tracking counters.
        for ctr in &self.stkctr {
            if ctr.flags.content {
                ctr.entry.note_http_req();
            }
        }

        self.txn.method = Some(head.subject.0.clone());
        self.txn.req_flags = self.front.peer_flags();
        self.txn.req_body = Some(body_len);
        self.txn.req_head = Some(head);

        self.req_an.remove(AnMask::REQ_WAIT_HTTP | AnMask::REQ_TRACK);
        self.req_phase = ReqPhase::Dispatch;
        self.first_txn = false;
        true
    }

    fn an_dispatch(&mut self, cx: &mut Context<'_>) -> bool {
        if self.tarpitted {
            // Tarpitted streams never reach a server; they sit on the
            // hold deadline until it fires.
            if self.back_si.state != SiState::Tar {
                self.back_si.set_state(SiState::Tar);
                let hold = self.frontend.cfg.timeouts.tarpit.unwrap_or_default();
                self.back_si.exp = Some(Instant::now() + hold);
                return true;
            }
            return false;
        }
        if !self.backend_counted {
            self.backend.conn_inc();
            self.backend_counted = true;
            for ctr in &self.stkctr {
                if ctr.flags.backend {
                    ctr.entry.sess_cnt.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Only a fresh dispatch may consider connection reuse or tear
        // down a stale one; a pending queue wait or connect keeps its
        // state across polls.
        if matches!(self.dispatch, Dispatch::Idle) {
            if let Some(ref back) = self.back {
                if !back.is_read_closed() && !back.is_write_closed() && !back.has_error() {
                    // A reusable upstream connection skips the
                    // balancer entirely.
                    self.req_an.remove(AnMask::REQ_LB);
                    self.req_phase = ReqPhase::SendHead;
                    self.back_si.set_state(SiState::Est);
                    return true;
                }
            }
            self.back = None;
            self.release_server_slot();
        }

        loop {
            match std::mem::replace(&mut self.dispatch, Dispatch::Idle) {
                Dispatch::Idle => {
                    self.back_si.set_state(SiState::Req);
                    self.req.flags.insert(ChanFlags::WAIT_CONN);
                    let head = self.txn.req_head.as_ref().expect("dispatch without head");
                    let hint = crate::balance::LbHint {
                        source: Some(self.source.ip()),
                        uri_path: Some(head.subject.1.path()),
                    };
                    match assign_server(&self.backend, &hint) {
                        Assign::Direct(srv) => {
                            self.note_assigned(srv);
                            continue;
                        }
                        Assign::Queued(pend, rx) => {
                            self.back_si.set_state(SiState::Que);
                            self.back_si.exp = self
                                .backend
                                .cfg
                                .timeouts
                                .queue
                                .map(|d| Instant::now() + d);
                            self.dispatch = Dispatch::Queued { pend, rx };
                            return true;
                        }
                        Assign::None => {
                            warn!(
                                "stream {} on backend {}: {}",
                                self.uniq_id,
                                self.backend.cfg.name,
                                crate::Error::new_no_server()
                            );
                            self.term.set(TermInitiator::Proxy, TermPhase::Connect);
                            self.start_error_response(StatusCode::SERVICE_UNAVAILABLE);
                            return true;
                        }
                    }
                }
                Dispatch::Queued { pend, mut rx } => {
                    match Pin::new(&mut rx).poll(cx) {
                        Poll::Pending => {
                            self.dispatch = Dispatch::Queued { pend, rx };
                            return false;
                        }
                        Poll::Ready(Ok(srv)) => {
                            let mut pend = pend;
                            pend.mark_assigned();
                            self.back_si.exp = None;
                            self.note_assigned(srv);
                            continue;
                        }
                        Poll::Ready(Err(_canceled)) => {
                            // The queue vanished under us.
                            self.back_si.exp = None;
                            self.back_si.fail(SiError::Internal);
                            self.term.set(TermInitiator::Resource, TermPhase::Queue);
                            self.start_error_response(StatusCode::SERVICE_UNAVAILABLE);
                            return true;
                        }
                    }
                }
                Dispatch::Connecting { mut fut } => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        self.dispatch = Dispatch::Connecting { fut };
                        return false;
                    }
                    Poll::Ready(Ok(stream)) => {
                        let srv = self.srv.as_ref().expect("connected without server");
                        debug!(
                            "stream {}: connected to {} ({})",
                            self.uniq_id, srv.cfg.name, srv.cfg.addr
                        );
                        let conn =
                            Connection::with_addrs(stream, None, Some(srv.cfg.addr));
                        let mut back = Mux::new(conn);
                        if let Some(max) = self.frontend.cfg.max_buf_size {
                            back.set_rx_limit(max);
                        }
                        self.back = Some(back);
                        self.back_si.set_state(SiState::Rdy);
                        self.back_si.set_state(SiState::Est);
                        self.req.flags.remove(ChanFlags::WAIT_CONN);
                        self.req_an.remove(AnMask::REQ_LB);
                        self.req_phase = ReqPhase::SendHead;
                        return true;
                    }
                    Poll::Ready(Err(e)) => {
                        self.back_si.set_state(SiState::Cer);
                        let srv = self.srv.take();
                        self.srv_slot_held = false;
                        if let Some(ref srv) = srv {
                            srv.release_conn();
                            process_srv_queue(srv, &self.backend);
                        }
                        if self.backend.cfg.redispatch && !self.redispatched {
                            // One trip back through the balancer.
                            self.redispatched = true;
                            if let Some(ref srv) = srv {
                                srv.counters.redispatches.fetch_add(1, Ordering::Relaxed);
                            }
                            debug!("stream {}: redispatching after {}", self.uniq_id, e);
                            self.dispatch = Dispatch::Idle;
                            continue;
                        }
                        debug!("stream {}: connect failed: {}", self.uniq_id, e);
                        self.back_si.fail(SiError::ConnRefused);
                        self.term.set(TermInitiator::Server, TermPhase::Connect);
                        self.start_error_response(StatusCode::SERVICE_UNAVAILABLE);
                        return true;
                    }
                },
            }
        }
    }

    fn note_assigned(&mut self, srv: Arc<Server>) {
        self.back_si.set_state(SiState::Ass);
        self.back_si.set_state(SiState::Con);
        self.backend.counters.cum_sess.fetch_add(1, Ordering::Relaxed);
        let connect_timeout = self.backend.cfg.timeouts.connect;
        let retries = self.backend.cfg.retries;
        let fut = {
            let srv = Arc::clone(&srv);
            Box::pin(async move {
                crate::connect::connect_to_server(&srv, connect_timeout, retries).await
            })
        };
        self.srv = Some(srv);
        self.srv_slot_held = true;
        self.dispatch = Dispatch::Connecting { fut };
    }

    fn an_send_request_head(&mut self) -> bool {
        let back = self.back.as_mut().expect("send head without back mux");
        if !back.can_write_head() {
            return false;
        }
        let mut head = self.txn.req_head.take().expect("request head consumed twice");
        let body = self.txn.req_body.unwrap_or(DecodedLength::ZERO);

        // The server side follows the configured mode; keep-alive
        // toward the server unless the proxy closes per transaction.
        let server_mode = match self.frontend.cfg.mode {
            crate::config::HttpMode::Close => ConnectionMode::Close,
            crate::config::HttpMode::ServerClose => ConnectionMode::Close,
            crate::config::HttpMode::Tunnel => ConnectionMode::Tunnel,
            crate::config::HttpMode::KeepAlive => ConnectionMode::KeepAlive,
        };
        rewrite_connection_headers(&mut head.headers, server_mode, Version::HTTP_11);

        if let Some(ref method) = self.txn.method {
            back.set_req_method(method.clone());
        }
        back.write_head(head, body);
        self.req_phase = ReqPhase::Body;
        self.res_phase = ResPhase::WaitHead;
        self.res.rex = self
            .backend
            .cfg
            .timeouts
            .server
            .map(|d| Instant::now() + d);
        // Grant the whole request body passage through the channel.
        match body {
            DecodedLength::CHUNKED | DecodedLength::CLOSE_DELIMITED => {
                self.req.forward(u64::MAX / 2)
            }
            len => self.req.forward(len.danger_len()),
        }
        true
    }

    fn an_forward_request(&mut self, cx: &mut Context<'_>) -> bool {
        let back = match self.back {
            Some(ref mut back) => back,
            None => return false,
        };
        if self.frontend.cfg.timeouts.client.is_some()
            && self.front.can_read_body()
            && self.req.rex.is_none()
        {
            self.req.rex = self
                .frontend
                .cfg
                .timeouts
                .client
                .map(|d| Instant::now() + d);
        }
        let (progress, finished) = pump_message(
            cx,
            &mut self.front,
            back,
            &mut self.req,
            &mut self.req_pending,
        );
        if finished {
            trace!("stream {}: request forwarded", self.uniq_id);
            self.req.rex = None;
            self.req_an.remove(AnMask::REQ_FWD);
            self.req_phase = ReqPhase::Done;
            if let Some(srv) = self.srv.as_ref() {
                srv.counters.bytes_out.fetch_add(self.req.total(), Ordering::Relaxed);
            }
            return true;
        }
        progress
    }

    // ===== response-side analysers =====

    fn res_analysers(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        if self.error_status.is_some() {
            return false;
        }
        if self.res_an.contains(AnMask::RES_WAIT_HTTP) && self.res_phase == ResPhase::WaitHead {
            progress |= self.an_wait_response(cx);
        }
        if self.res_phase == ResPhase::Body {
            progress |= self.an_forward_response(cx);
        }
        progress
    }

    fn an_wait_response(&mut self, cx: &mut Context<'_>) -> bool {
        let back = match self.back {
            Some(ref mut back) => back,
            None => return false,
        };
        // The request may still be sitting in the write buffer; keep
        // pushing it out while waiting for the response.
        if let Poll::Ready(Err(e)) = back.poll_flush(cx) {
            debug!("stream {}: upstream write error: {}", self.uniq_id, e);
            self.term.set(TermInitiator::Server, TermPhase::Headers);
            self.start_error_response(StatusCode::BAD_GATEWAY);
            return true;
        }
        if !back.can_read_head() {
            return false;
        }

        let parsed = match back.poll_read_head(cx) {
            Poll::Pending => return false,
            Poll::Ready(None) => {
                debug!("stream {}: upstream closed before response", self.uniq_id);
                self.srv_failed_response();
                self.term.set(TermInitiator::Server, TermPhase::Headers);
                self.start_error_response(StatusCode::BAD_GATEWAY);
                return true;
            }
            Poll::Ready(Some(Err(e))) => {
                debug!("stream {}: response error: {}", self.uniq_id, e);
                self.srv_failed_response();
                self.term.set(TermInitiator::Server, TermPhase::Headers);
                self.start_error_response(StatusCode::BAD_GATEWAY);
                return true;
            }
            Poll::Ready(Some(Ok(parsed))) => parsed,
        };

        let (mut head, body_len, is_final) = parsed;
        let back = self.back.as_mut().expect("still here");
        self.res.rex = None;
        self.txn.status = Some(head.subject);
        self.txn.res_flags = back.peer_flags();

        // Decide what happens to both connections after this
        // transaction, then rewrite the head we relay.
        let mode = decide_mode(
            self.frontend.cfg.mode.connection_mode(),
            self.txn.req_flags,
            Some(self.txn.res_flags),
            body_len != DecodedLength::CLOSE_DELIMITED,
            is_final,
        );
        self.txn.mode = Some(mode);
        debug!(
            "stream {}: {} -> mode {:?}",
            self.uniq_id, head.subject, mode
        );
        // Tell both muxes what their sync point should do: the server
        // side sees server-close as a plain close, the client side
        // stays alive through it.
        back.set_mode(mode);
        let client_mode = match mode {
            ConnectionMode::ServerClose => ConnectionMode::KeepAlive,
            other => other,
        };
        self.front.set_mode(client_mode);
        let client_version = self.front.peer_version();
        rewrite_connection_headers(&mut head.headers, client_mode, client_version);

        if head.subject.is_server_error() || head.subject.is_client_error() {
            for ctr in &self.stkctr {
                if ctr.flags.content {
                    ctr.entry.note_http_err();
                }
            }
        }

        if self.front.can_write_head() {
            self.front.write_head(head, body_len);
        } else {
            // The client never waits on anything but this response.
            debug!("stream {}: client mux cannot take response", self.uniq_id);
            self.term.set(TermInitiator::Client, TermPhase::Headers);
            self.res_phase = ResPhase::Done;
            return true;
        }
        self.res_an.remove(AnMask::RES_WAIT_HTTP);

        if is_final {
            // 101 or successful CONNECT: both directions go opaque as
            // soon as the heads are exchanged.
            self.tunnel = true;
            self.req_an = AnMask::default();
            self.res_an = AnMask::default();
            self.req_phase = ReqPhase::Done;
            self.res_phase = ResPhase::Done;
            self.req.rex = None;
            self.res.rex = None;
            return true;
        }

        match body_len {
            DecodedLength::CHUNKED | DecodedLength::CLOSE_DELIMITED => {
                self.res.forward(u64::MAX / 2)
            }
            len => self.res.forward(len.danger_len()),
        }
        self.res.rex = self
            .backend
            .cfg
            .timeouts
            .server
            .map(|d| Instant::now() + d);
        self.res_phase = ResPhase::Body;
        true
    }

    fn an_forward_response(&mut self, cx: &mut Context<'_>) -> bool {
        let back = match self.back {
            Some(ref mut back) => back,
            None => return false,
        };
        let (progress, finished) = pump_message(
            cx,
            back,
            &mut self.front,
            &mut self.res,
            &mut self.res_pending,
        );
        if finished {
            trace!("stream {}: response forwarded", self.uniq_id);
            self.res.rex = None;
            self.res_an.remove(AnMask::RES_FWD);
            self.res_phase = ResPhase::Done;
            if let Some(srv) = self.srv.as_ref() {
                srv.counters.bytes_in.fetch_add(self.res.total(), Ordering::Relaxed);
            }
            return true;
        }
        progress
    }

    // ===== error path =====

    fn start_error_response(&mut self, status: StatusCode) {
        if self.error_status.is_some() {
            return;
        }
        debug!("stream {}: local error response {}", self.uniq_id, status);
        self.error_status = Some(status);
        self.req_an = AnMask::default();
        self.res_an = AnMask::default();
        self.req_phase = ReqPhase::Done;
        self.res_phase = ResPhase::Done;
        // Abort whatever the channels were doing.
        self.req.flags.insert(ChanFlags::SHUTR_NOW);
        self.res.flags.insert(ChanFlags::SHUTW_NOW);
        self.dispatch = Dispatch::Idle;
        self.back = None;
        self.release_server_slot();
        for ctr in &self.stkctr {
            if ctr.flags.content {
                ctr.entry.note_http_err();
            }
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            self.frontend.counters.failed_conns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Push the owed error message to the client, then shut down.
    fn poll_send_error(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let status = match self.error_status {
            Some(status) => status,
            None => return Poll::Ready(()),
        };
        if !self.error_sent {
            if self.front.can_write_head() {
                let body = error_body(status);
                let mut len = itoa::Buffer::new();
                let mut headers = HeaderMap::new();
                headers.insert(
                    http::header::CONTENT_LENGTH,
                    HeaderValue::from_str(len.format(body.len())).expect("length is ascii"),
                );
                headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("text/html"),
                );
                headers.insert(
                    http::header::CONNECTION,
                    HeaderValue::from_static("close"),
                );
                self.front.set_mode(ConnectionMode::Close);
                self.front.write_head(
                    MessageHead {
                        version: Version::HTTP_11,
                        subject: status,
                        headers,
                    },
                    DecodedLength::new(body.len() as u64),
                );
                if self.front.can_write_body() {
                    self.front.write_body(Bytes::from_static(body));
                }
                let _ = self.front.finish_body();
            }
            self.error_sent = true;
        }
        match ready!(self.front.poll_flush(cx)) {
            Ok(()) => {}
            Err(e) => trace!("stream {}: error flush failed: {}", self.uniq_id, e),
        }
        let _ = ready!(self.front.poll_shutdown(cx));
        Poll::Ready(())
    }

    // ===== lifecycle =====

    fn srv_failed_response(&mut self) {
        if let Some(srv) = self.srv.as_ref() {
            srv.counters.failed_resp.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn release_server_slot(&mut self) {
        if self.srv_slot_held {
            self.srv_slot_held = false;
            if let Some(srv) = self.srv.take() {
                srv.release_conn();
                process_srv_queue(&srv, &self.backend);
            }
        } else {
            self.srv = None;
        }
    }

    /// The transaction sync point: both halves done. Reset for the
    /// next keep-alive request, promote to tunnel, or finish.
    fn end_transaction(&mut self, cx: &mut Context<'_>) -> Poll<bool> {
        // Everything must actually be on the wire first.
        if let Some(ref mut back) = self.back {
            if let Poll::Ready(Err(e)) = back.poll_flush(cx) {
                trace!("stream {}: upstream flush failed: {}", self.uniq_id, e);
            }
        }
        match self.front.poll_flush(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => {
                debug!("stream {}: client flush failed: {}", self.uniq_id, e);
                self.term.set(TermInitiator::Client, TermPhase::Last);
                return Poll::Ready(false);
            }
            Poll::Ready(Ok(())) => {}
        }

        if self.tunnel {
            return Poll::Ready(false);
        }

        let mode = self.txn.mode.unwrap_or(ConnectionMode::Close);
        if self.front_si.state >= SiState::Dis || self.front.has_error() {
            return Poll::Ready(false);
        }
        match mode {
            ConnectionMode::KeepAlive => {}
            ConnectionMode::ServerClose => {
                self.back = None;
                self.release_server_slot();
            }
            ConnectionMode::Close | ConnectionMode::Tunnel => {
                return Poll::Ready(false);
            }
        }

        trace!("stream {}: resetting for next transaction", self.uniq_id);
        debug_assert!(
            self.req_an.is_empty() && self.res_an.is_empty(),
            "analysers left armed at the sync point"
        );
        self.txn = Txn::default();
        self.req_an = AnMask::request_set();
        self.res_an = AnMask::response_set();
        self.req_phase = ReqPhase::WaitHead;
        self.res_phase = ResPhase::Idle;
        self.req.reset();
        self.res.reset();
        self.req_pending = None;
        self.res_pending = None;
        self.redispatched = false;
        Poll::Ready(true)
    }

    /// Tunnel mode: bytes pass opaquely both ways until either side
    /// closes.
    fn poll_tunnel(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let back = match self.back {
            Some(ref mut back) => back,
            None => return Poll::Ready(()),
        };
        self.front.into_tunnel_mode();
        back.into_tunnel_mode();
        // Tunnelled bytes are never held back for a fuller buffer.
        self.req
            .flags
            .insert(ChanFlags::NEVER_WAIT | ChanFlags::READ_DONTWAIT);
        self.res
            .flags
            .insert(ChanFlags::NEVER_WAIT | ChanFlags::READ_DONTWAIT);

        loop {
            let mut progress = false;
            progress |= pump_tunnel(cx, &mut self.front, back, &mut self.req, &mut self.req_pending);
            progress |= pump_tunnel(cx, back, &mut self.front, &mut self.res, &mut self.res_pending);

            let _ = self.front.poll_flush(cx);
            let _ = back.poll_flush(cx);

            let front_dead = self.front.is_read_closed() && self.req.is_done();
            let back_dead = back.is_read_closed() && self.res.is_done();
            if (front_dead && back_dead)
                || self.front.has_error()
                || back.has_error()
            {
                trace!("stream {}: tunnel finished", self.uniq_id);
                return Poll::Ready(());
            }
            if !progress {
                return Poll::Pending;
            }
        }
    }

    /// Arm the task timer with the earliest pending deadline, and
    /// translate an elapsed deadline into termination flags.
    fn poll_deadlines(&mut self, cx: &mut Context<'_>) -> bool {
        let mut earliest: Option<Instant> = None;
        let mut fold = |candidate: Option<Instant>| {
            if let Some(c) = candidate {
                earliest = Some(match earliest {
                    Some(e) if e <= c => e,
                    _ => c,
                });
            }
        };
        fold(self.req.next_expiry());
        fold(self.res.next_expiry());
        fold(self.back_si.exp);
        fold(self.front_si.exp);

        let deadline = match earliest {
            Some(deadline) => deadline,
            None => {
                self.timer_deadline = None;
                return false;
            }
        };

        if self.timer_deadline != Some(deadline) {
            self.timer_deadline = Some(deadline);
            self.timer.as_mut().reset(deadline);
        }
        if self.timer.as_mut().poll(cx).is_pending() {
            return false;
        }

        let now = Instant::now();
        let mut fired = false;

        if self.back_si.exp.map(|e| e <= now).unwrap_or(false) {
            self.back_si.exp = None;
            if self.back_si.state == SiState::Tar {
                // The tarpit hold elapsed; the offender finally gets
                // its error.
                self.back_si.fail(SiError::Timeout);
                self.term.set_timeout(TermInitiator::Proxy, TermPhase::Tarpit);
                self.start_error_response(StatusCode::INTERNAL_SERVER_ERROR);
            } else {
                // Queue wait ran out.
                self.backend.counters.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                self.back_si.fail(SiError::Timeout);
                self.term.set_timeout(TermInitiator::Server, TermPhase::Queue);
                self.start_error_response(StatusCode::SERVICE_UNAVAILABLE);
            }
            fired = true;
        }
        if self.req.rex.map(|e| e <= now).unwrap_or(false) {
            self.req.rex = None;
            if self.first_txn || self.req_phase == ReqPhase::Body {
                self.frontend.counters.failed_req.fetch_add(1, Ordering::Relaxed);
                self.front_si.fail(SiError::Timeout);
                self.term.set_timeout(TermInitiator::Client, TermPhase::Request);
                self.start_error_response(StatusCode::REQUEST_TIMEOUT);
            } else {
                // Idle keep-alive expiry is a clean end.
                trace!("stream {}: keep-alive idle timeout", self.uniq_id);
                self.req_phase = ReqPhase::Done;
                self.res_phase = ResPhase::Done;
                self.front_si.set_state(SiState::Dis);
            }
            fired = true;
        }
        if self.res.rex.map(|e| e <= now).unwrap_or(false) {
            self.res.rex = None;
            self.srv_failed_response();
            self.back_si.fail(SiError::Timeout);
            self.term.set_timeout(TermInitiator::Server, TermPhase::Data);
            self.start_error_response(StatusCode::GATEWAY_TIMEOUT);
            fired = true;
        }
        fired
    }
}

impl<T> Future for Stream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        loop {
            // The fixed point: request analysers, then response
            // analysers, folding in interface changes, until a pass
            // moves nothing.
            loop {
                let mut progress = false;
                progress |= this.req_analysers(cx);
                progress |= this.res_analysers(cx);
                progress |= this.front_si.state_changed();
                progress |= this.back_si.state_changed();
                this.front_si.settle();
                this.back_si.settle();
                if !progress {
                    break;
                }
            }

            if this.error_status.is_some() {
                return this.poll_send_error(cx).map(|()| this.finish());
            }

            if this.req_phase == ReqPhase::Done && this.res_phase == ResPhase::Done {
                if this.tunnel {
                    return this.poll_tunnel(cx).map(|()| this.finish());
                }
                match this.end_transaction(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(true) => continue,
                    Poll::Ready(false) => return Poll::Ready(this.finish()),
                }
            }

            // Nothing moved: park on the earliest deadline (progress
            // from an elapsed one re-enters the loop).
            if this.poll_deadlines(cx) {
                continue;
            }
            return Poll::Pending;
        }
    }
}

impl<T> Stream<T> {
    fn finish(&mut self) {
        self.front_si.set_state(SiState::Clo);
        self.back_si.set_state(SiState::Clo);
        let code = self.term.code();
        if self.term.is_clean() {
            trace!("stream {} finished cleanly", self.uniq_id);
        } else {
            debug!(
                "stream {} finished, termination {}{}",
                self.uniq_id, code[0], code[1]
            );
        }
        for ctr in &self.stkctr {
            ctr.entry.add_bytes(self.req.total(), self.res.total());
        }
    }
}

impl<T> Drop for Stream<T> {
    fn drop(&mut self) {
        // Dispatch handles (pendconn) cancel themselves; the served
        // slot and the backend counter are ours to give back.
        if self.srv_slot_held {
            self.srv_slot_held = false;
            if let Some(srv) = self.srv.take() {
                srv.release_conn();
                process_srv_queue(&srv, &self.backend);
            }
        }
        if self.backend_counted {
            self.backend.conn_dec();
        }
        self.frontend.conn_closed();
    }
}

/// Move one message body from `src` to `dst` through `ch`.
///
/// Returns `(progress, finished)`; `finished` means the whole body,
/// trailers included, has been handed to `dst` and the terminator
/// queued.
fn pump_message<I1, X1, I2, X2>(
    cx: &mut Context<'_>,
    src: &mut Mux<I1, X1>,
    dst: &mut Mux<I2, X2>,
    ch: &mut Channel,
    pending: &mut Option<Bytes>,
) -> (bool, bool)
where
    I1: AsyncRead + AsyncWrite + Unpin,
    I2: AsyncRead + AsyncWrite + Unpin,
    X1: Http1Transaction,
    X2: Http1Transaction,
{
    let mut progress = false;

    loop {
        // Spill first: a frame that did not fit keeps its order.
        if let Some(chunk) = pending.take() {
            if ch.poll_ensure_buf(cx).is_pending() {
                *pending = Some(chunk);
                break;
            }
            let n = ch.put(&chunk);
            if n > 0 {
                progress = true;
            }
            if n < chunk.len() {
                *pending = Some(chunk.slice(n..));
            }
        }

        // Drain the channel into the destination mux.
        while !ch.is_empty() && dst.can_write_body() && dst.can_queue() {
            if let Some(bytes) = ch.take(FORWARD_CHUNK) {
                dst.write_body(bytes);
                progress = true;
            } else {
                break;
            }
        }
        if ch.is_empty() {
            if let Some(trailers) = ch.take_trailers() {
                if dst.can_write_body() {
                    dst.write_trailers(trailers);
                    progress = true;
                }
            }
        }

        // Push bytes toward the peer while we are at it.
        if let Poll::Ready(Err(_)) = dst.poll_flush(cx) {
            ch.shutw();
            break;
        }

        // Body already fully read?
        if ch.is_shutr() {
            break;
        }

        // Pull the next frame from the source, unless the channel is
        // exerting backpressure.
        if pending.is_some() || ch.room() == 0 {
            src.set_rx_full(true);
            ch.flags.insert(ChanFlags::WAKE_WRITE);
            break;
        }
        src.set_rx_full(false);
        ch.flags.remove(ChanFlags::WAKE_WRITE);
        if !src.can_read_body() {
            // No body at all (content-length zero), or the source is
            // past its body: synthesize EOF.
            ch.shutr();
            break;
        }
        match src.poll_read_body(cx) {
            Poll::Pending => break,
            Poll::Ready(None) => {
                ch.shutr();
                progress = true;
            }
            Poll::Ready(Some(Ok(Frame::Data(bytes)))) => {
                *pending = Some(bytes);
                progress = true;
            }
            Poll::Ready(Some(Ok(Frame::Trailers(trailers)))) => {
                ch.put_trailers(trailers);
                progress = true;
            }
            Poll::Ready(Some(Err(e))) => {
                debug!("body read error: {}", e);
                ch.shutr();
                progress = true;
            }
        }
    }

    let finished = ch.is_done() && pending.is_none() && {
        if dst.can_write_body() {
            dst.finish_body().is_ok()
        } else {
            true
        }
    };
    (progress, finished)
}

/// Opaque byte pump for tunnel mode.
fn pump_tunnel<I1, X1, I2, X2>(
    cx: &mut Context<'_>,
    src: &mut Mux<I1, X1>,
    dst: &mut Mux<I2, X2>,
    ch: &mut Channel,
    pending: &mut Option<Bytes>,
) -> bool
where
    I1: AsyncRead + AsyncWrite + Unpin,
    I2: AsyncRead + AsyncWrite + Unpin,
    X1: Http1Transaction,
    X2: Http1Transaction,
{
    let mut progress = false;
    loop {
        if let Some(chunk) = pending.take() {
            if ch.poll_ensure_buf(cx).is_pending() {
                *pending = Some(chunk);
                break;
            }
            let n = ch.put(&chunk);
            progress |= n > 0;
            if n < chunk.len() {
                *pending = Some(chunk.slice(n..));
            }
        }
        while !ch.is_empty() && dst.can_write_tunnel() && dst.can_queue() {
            match ch.take(FORWARD_CHUNK) {
                Some(bytes) => {
                    dst.write_tunnel(bytes);
                    progress = true;
                }
                None => break,
            }
        }
        if pending.is_some() || ch.room() == 0 {
            break;
        }
        if !src.can_read_tunnel() {
            break;
        }
        match src.poll_read_tunnel(cx) {
            Poll::Pending => break,
            Poll::Ready(Ok(bytes)) if bytes.is_empty() => {
                ch.shutr();
                progress = true;
                break;
            }
            Poll::Ready(Ok(bytes)) => {
                *pending = Some(bytes);
                progress = true;
            }
            Poll::Ready(Err(e)) => {
                trace!("tunnel read error: {}", e);
                ch.shutr();
                progress = true;
                break;
            }
        }
    }
    progress
}

/// The canned bodies of locally generated error responses.
fn error_body(status: StatusCode) -> &'static [u8] {
    match status.as_u16() {
        400 => {
            b"<html><body><h1>400 Bad request</h1>\nYour browser sent an invalid request.\n</body></html>\n"
        }
        403 => {
            b"<html><body><h1>403 Forbidden</h1>\nRequest forbidden by administrative rules.\n</body></html>\n"
        }
        408 => {
            b"<html><body><h1>408 Request Time-out</h1>\nYour browser didn't send a complete request in time.\n</body></html>\n"
        }
        500 => {
            b"<html><body><h1>500 Internal Server Error</h1>\nAn internal server error occurred.\n</body></html>\n"
        }
        502 => {
            b"<html><body><h1>502 Bad Gateway</h1>\nThe server returned an invalid or incomplete response.\n</body></html>\n"
        }
        503 => {
            b"<html><body><h1>503 Service Unavailable</h1>\nNo server is available to handle this request.\n</body></html>\n"
        }
        504 => {
            b"<html><body><h1>504 Gateway Time-out</h1>\nThe server didn't respond in time.\n</body></html>\n"
        }
        _ => b"<html><body><h1>Proxy error</h1>\n</body></html>\n",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, FrontendConfig, ServerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frontend() -> Arc<Frontend> {
        let cfg = FrontendConfig::new("fe", "127.0.0.1:0".parse().unwrap());
        Arc::new(Frontend::new(cfg, None, None))
    }

    async fn upstream(script: &'static [(&'static [u8], &'static [u8])]) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            for (expect, reply) in script {
                let mut got = vec![0u8; expect.len()];
                if sock.read_exact(&mut got).await.is_err() {
                    return;
                }
                assert_eq!(&got[..], *expect, "upstream saw unexpected bytes");
                if sock.write_all(reply).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    fn spawn_stream(
        addr: std::net::SocketAddr,
        client: tokio::io::DuplexStream,
    ) -> tokio::task::JoinHandle<()> {
        let be = Backend::new(
            BackendConfig::new("be").server(ServerConfig::new("s0", addr)),
        );
        let stream = Stream::new(
            client,
            "127.0.0.1:55555".parse().unwrap(),
            frontend(),
            be,
            BufferPool::new(64),
            Vec::new(),
        );
        tokio::spawn(stream)
    }

    #[tokio::test]
    async fn proxies_a_simple_get() {
        let _ = pretty_env_logger::try_init();
        let addr = upstream(&[(
            b"GET /a HTTP/1.1\r\nhost: x\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        )])
        .await;

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let handle = spawn_stream(addr, server_side);

        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = vec![0u8; 1024];
        let n = client.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", text);
        assert!(text.ends_with("ok"), "got: {}", text);

        drop(client);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn keep_alive_carries_two_requests() {
        let _ = pretty_env_logger::try_init();
        let addr = upstream(&[
            (
                b"GET /a HTTP/1.1\r\nhost: x\r\n\r\n",
                b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na",
            ),
            (
                b"GET /b HTTP/1.1\r\nhost: x\r\n\r\n",
                b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb",
            ),
        ])
        .await;

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let handle = spawn_stream(addr, server_side);

        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("200 OK"), "got: {}", text);
        assert!(text.ends_with('a'), "got: {}", text);

        client
            .write_all(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.ends_with('b'), "second response: {}", text);

        drop(client);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn bad_request_gets_400() {
        let _ = pretty_env_logger::try_init();
        // Backend never sees the request; any addr works.
        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let handle = spawn_stream("127.0.0.1:9".parse().unwrap(), server_side);

        client
            .write_all(b"GET \x01 bogus\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {}", text);
        assert!(text.contains("connection: close"), "got: {}", text);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn refused_upstream_gets_503() {
        let _ = pretty_env_logger::try_init();
        // Reserve a port and close it again.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let be = Backend::new(
            BackendConfig::new("be")
                .retries(0)
                .server(ServerConfig::new("gone", addr)),
        );
        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let stream = Stream::new(
            server_side,
            "127.0.0.1:55555".parse().unwrap(),
            frontend(),
            be,
            BufferPool::new(64),
            Vec::new(),
        );
        let handle = tokio::spawn(stream);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(
            text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
            "got: {}",
            text
        );
        let _ = handle.await;
    }

    #[tokio::test]
    async fn chunked_response_reaches_client_reframed() {
        let _ = pretty_env_logger::try_init();
        let addr = upstream(&[(
            b"GET /c HTTP/1.1\r\nhost: x\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )])
        .await;

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let handle = spawn_stream(addr, server_side);

        client
            .write_all(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        // Keep-alive stays up, so read until the terminating chunk.
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "eof before chunked end: {:?}", String::from_utf8_lossy(&collected));
            collected.extend_from_slice(&buf[..n]);
            if collected.ends_with(b"0\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", text);
        assert!(text.contains("transfer-encoding: chunked"), "got: {}", text);
        assert!(text.contains("hello"), "got: {}", text);

        drop(client);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn tarpitted_stream_holds_then_errors() {
        let _ = pretty_env_logger::try_init();

        let mut cfg = FrontendConfig::new("fe", "127.0.0.1:0".parse().unwrap());
        cfg.timeouts.tarpit = Some(std::time::Duration::from_millis(50));
        let fe = Arc::new(Frontend::new(cfg, None, None));
        let be = Backend::new(
            BackendConfig::new("be").server(ServerConfig::new("s0", "127.0.0.1:9".parse().unwrap())),
        );

        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let mut stream = Stream::new(
            server_side,
            "127.0.0.1:55555".parse().unwrap(),
            fe,
            be,
            BufferPool::new(64),
            Vec::new(),
        );
        stream.tarpit();
        let handle = tokio::spawn(stream);

        let started = std::time::Instant::now();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(
            text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"),
            "got: {}",
            text
        );
        assert!(
            started.elapsed() >= std::time::Duration::from_millis(50),
            "the response must wait out the tarpit hold"
        );
        let _ = handle.await;
    }

    #[test]
    fn error_bodies_mention_status() {
        for status in [400u16, 403, 408, 500, 502, 503, 504] {
            let body = error_body(StatusCode::from_u16(status).unwrap());
            let text = String::from_utf8_lossy(body);
            assert!(text.contains(&status.to_string()), "{}", text);
        }
    }
}
