#![cfg_attr(test, deny(rust_2018_idioms))]

//! # crossbar
//!
//! crossbar is the data-plane core of a TCP/HTTP/1.1 reverse proxy and
//! load balancer: frontends accept client connections, streams route
//! each request through admission, tracking, and server selection, and
//! an HTTP/1 multiplexer per connection shuttles parsed messages with
//! strict accounting, timeouts, and failure handling.
//!
//! ## What lives here
//!
//! - The restartable HTTP/1.x parser and the per-connection mux
//!   (keep-alive, tunnel, and close modes, chunked bodies, trailers).
//! - The stream state machine tying a client connection to an
//!   upstream one through two half-duplex channels.
//! - Server selection (round-robin, least-conn, hashes), pending
//!   queues with dynamic per-server concurrency and slow-start.
//! - Stick tables: per-key counters and sliding-window rates tracked
//!   by streams.
//! - A UDP DNS resolver client for refreshing server addresses.
//!
//! ## What deliberately does not
//!
//! Configuration parsing, stats rendering, TLS, and process
//! supervision belong to the embedder; this crate exposes the
//! counters and hooks those layers consume.
//!
//! ## Example
//!
//! ```no_run
//! use crossbar::{BackendConfig, FrontendConfig, Proxy, ServerConfig};
//!
//! # async fn run() -> crossbar::Result<()> {
//! let frontend = FrontendConfig::new("web", "0.0.0.0:8080".parse().unwrap());
//! let backend = BackendConfig::new("app")
//!     .server(ServerConfig::new("app1", "10.0.0.10:8000".parse().unwrap()))
//!     .server(ServerConfig::new("app2", "10.0.0.11:8000".parse().unwrap()));
//!
//! let listener = Proxy::new(frontend, backend).bind().await?;
//! listener.serve().await
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod balance;
mod common;
mod config;
mod connect;
mod connection;
mod dns;
mod error;
mod listener;
mod proto;
mod stick;
mod stream;

pub use crate::balance::server::ServerState;
pub use crate::common::exec::Executor;
pub use crate::config::{
    BackendConfig, FrontendConfig, HttpMode, LbAlgorithm, ServerConfig, Timeouts,
};
pub use crate::dns::{Family, Resolver, ResolverConfig};
pub use crate::error::{Error, Result, Timeout};
pub use crate::listener::{Listener, Proxy};
pub use crate::stick::{StickKey, TableConfig};
