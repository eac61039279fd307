//! Programmatic proxy configuration.
//!
//! Parsing a config file into these structures is the embedder's
//! business; the data plane only consumes the result.

use std::net::SocketAddr;
use std::time::Duration;

use crate::proto::ConnectionMode;

/// All the deadlines one proxy applies. A `None` disables that guard.
#[derive(Clone, Debug, Default)]
pub struct Timeouts {
    /// Inactivity from the client while we expect request data.
    pub client: Option<Duration>,
    /// Inactivity from the server while we expect response data.
    pub server: Option<Duration>,
    /// Maximum time for an upstream TCP connect attempt.
    pub connect: Option<Duration>,
    /// Maximum time a stream may sit in a pending queue.
    pub queue: Option<Duration>,
    /// How long an idle keep-alive connection waits for its next
    /// request.
    pub keep_alive: Option<Duration>,
    /// Hold applied to tarpitted requests before the error response.
    pub tarpit: Option<Duration>,
}

/// What happens to a connection once a transaction completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMode {
    /// Process every request, keep connections open (default).
    KeepAlive,
    /// Keep the client side open but close the server connection
    /// after each response.
    ServerClose,
    /// Close both sides after the first transaction.
    Close,
    /// Analyse the first request, then pass bytes blindly.
    Tunnel,
}

impl Default for HttpMode {
    fn default() -> HttpMode {
        HttpMode::KeepAlive
    }
}

impl HttpMode {
    pub(crate) fn connection_mode(self) -> ConnectionMode {
        match self {
            HttpMode::KeepAlive => ConnectionMode::KeepAlive,
            HttpMode::ServerClose => ConnectionMode::ServerClose,
            HttpMode::Close => ConnectionMode::Close,
            HttpMode::Tunnel => ConnectionMode::Tunnel,
        }
    }
}

/// Server selection policy of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LbAlgorithm {
    /// Weighted round-robin.
    RoundRobin,
    /// Fewest in-flight streams first.
    LeastConn,
    /// Hash of the client source address.
    Source,
    /// Hash of the request URI path.
    Uri,
    /// First server (in config order) with room.
    First,
}

impl Default for LbAlgorithm {
    fn default() -> LbAlgorithm {
        LbAlgorithm::RoundRobin
    }
}

/// One upstream server of a backend.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Display name, unique within the backend.
    pub name: String,
    /// Address to dial.
    pub addr: SocketAddr,
    /// Load-balancing weight; 0 takes the server out of rotation.
    pub weight: u32,
    /// Hard cap of concurrent streams; 0 means unlimited.
    pub maxconn: usize,
    /// Floor of the dynamic cap when the backend is lightly loaded.
    pub minconn: usize,
    /// Ramp-up period after the server (re)starts.
    pub slowstart: Option<Duration>,
    /// Only eligible when every active server is down.
    pub backup: bool,
}

impl ServerConfig {
    /// A server with default tuning.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            name: name.into(),
            addr,
            weight: 1,
            maxconn: 0,
            minconn: 0,
            slowstart: None,
            backup: false,
        }
    }

    /// Sets the load-balancing weight.
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the concurrent stream cap.
    pub fn maxconn(mut self, maxconn: usize) -> Self {
        self.maxconn = maxconn;
        self
    }

    /// Sets the dynamic cap floor.
    pub fn minconn(mut self, minconn: usize) -> Self {
        self.minconn = minconn;
        self
    }

    /// Sets the warm-up ramp duration.
    pub fn slowstart(mut self, dur: Duration) -> Self {
        self.slowstart = Some(dur);
        self
    }

    /// Marks the server as a backup.
    pub fn backup(mut self) -> Self {
        self.backup = true;
        self
    }
}

/// A set of servers plus balancing policy.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Backend name, for logs and counters.
    pub name: String,
    /// Server selection policy.
    pub balance: LbAlgorithm,
    /// The servers.
    pub servers: Vec<ServerConfig>,
    /// Upstream connect attempts beyond the first.
    pub retries: u32,
    /// Allow going back through the balancer when a sticky server's
    /// retries are exhausted.
    pub redispatch: bool,
    /// Backend load at which dynamic maxconn reaches the configured
    /// maxconn; 0 disables dynamic scaling.
    pub fullconn: usize,
    /// Connection handling mode.
    pub mode: HttpMode,
    /// Deadlines applied on the server side.
    pub timeouts: Timeouts,
}

impl BackendConfig {
    /// A backend with default tuning and no servers.
    pub fn new(name: impl Into<String>) -> BackendConfig {
        BackendConfig {
            name: name.into(),
            balance: LbAlgorithm::default(),
            servers: Vec::new(),
            retries: 3,
            redispatch: false,
            fullconn: 0,
            mode: HttpMode::default(),
            timeouts: Timeouts::default(),
        }
    }

    /// Adds a server.
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    /// Sets the balancing algorithm.
    pub fn balance(mut self, algo: LbAlgorithm) -> Self {
        self.balance = algo;
        self
    }

    /// Sets the connect retry budget.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Enables redispatch on retry exhaustion.
    pub fn redispatch(mut self) -> Self {
        self.redispatch = true;
        self
    }

    /// Sets the full-load reference for dynamic maxconn.
    pub fn fullconn(mut self, fullconn: usize) -> Self {
        self.fullconn = fullconn;
        self
    }

    /// Sets the connection handling mode.
    pub fn mode(mut self, mode: HttpMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the server-side timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// A listener plus its admission rules.
#[derive(Clone, Debug)]
pub struct FrontendConfig {
    /// Frontend name, for logs and counters.
    pub name: String,
    /// Address to bind.
    pub bind: SocketAddr,
    /// Cap of concurrent accepted connections; 0 means unlimited.
    pub maxconn: usize,
    /// Connection handling mode.
    pub mode: HttpMode,
    /// Keep parsing a URI containing non-ASCII bytes, recording the
    /// offender instead of failing the request.
    pub accept_invalid_uri: bool,
    /// Cap on the per-connection buffers; a message head that cannot
    /// fit is refused.
    pub max_buf_size: Option<usize>,
    /// Deadlines applied on the client side.
    pub timeouts: Timeouts,
}

impl FrontendConfig {
    /// A frontend with default tuning.
    pub fn new(name: impl Into<String>, bind: SocketAddr) -> FrontendConfig {
        FrontendConfig {
            name: name.into(),
            bind,
            maxconn: 0,
            mode: HttpMode::default(),
            accept_invalid_uri: false,
            max_buf_size: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Caps the per-connection buffer size.
    pub fn max_buf_size(mut self, max: usize) -> Self {
        self.max_buf_size = Some(max);
        self
    }

    /// Sets the concurrent connection cap.
    pub fn maxconn(mut self, maxconn: usize) -> Self {
        self.maxconn = maxconn;
        self
    }

    /// Sets the connection handling mode.
    pub fn mode(mut self, mode: HttpMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the client-side timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
