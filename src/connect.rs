//! Upstream connection establishment.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::balance::Server;

/// Pause between connect attempts to the same server.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Dial `srv`, honouring the connect timeout and the retry budget.
///
/// A successful connection clears the remaining budget; counters
/// record every intermediate failure. The caller decides whether an
/// exhausted budget redispatches through the balancer.
pub(crate) async fn connect_to_server(
    srv: &Arc<Server>,
    connect_timeout: Option<Duration>,
    retries: u32,
) -> crate::Result<TcpStream> {
    let attempts = retries.saturating_add(1);
    let mut last_err: Option<std::io::Error> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            srv.counters.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(RETRY_PAUSE).await;
        }
        trace!(
            "connecting to {} ({}) attempt {}/{}",
            srv.cfg.name,
            srv.cfg.addr,
            attempt + 1,
            attempts
        );

        let dial = TcpStream::connect(srv.cfg.addr);
        let result = match connect_timeout {
            Some(limit) => match timeout(limit, dial).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    srv.counters.connect_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("connect to {} timed out", srv.cfg.name);
                    last_err = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timeout",
                    ));
                    continue;
                }
            },
            None => dial.await,
        };

        match result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                srv.counters.connect_errors.fetch_add(1, Ordering::Relaxed);
                debug!("connect to {} failed: {}", srv.cfg.name, e);
                last_err = Some(e);
            }
        }
    }

    let cause = last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempt made"));
    Err(crate::Error::new_retries_exhausted(cause))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn connects_first_try() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::new(Server::new(ServerConfig::new("s0", addr)));

        let stream = connect_to_server(&srv, Some(Duration::from_secs(1)), 3)
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());
        assert_eq!(srv.counters.retries.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn refused_until_budget_exhausted() {
        // Grab a port, then close it so connects are refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let srv = Arc::new(Server::new(ServerConfig::new("s0", addr)));
        let err = connect_to_server(&srv, Some(Duration::from_secs(1)), 2)
            .await
            .unwrap_err();
        assert!(err.is_retries_exhausted());
        assert_eq!(srv.counters.retries.load(Ordering::Relaxed), 2);
        assert_eq!(srv.counters.connect_errors.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn succeeds_after_listener_appears() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        drop(listener);

        let srv = Arc::new(Server::new(ServerConfig::new("s0", addr)));

        // Re-bind the port while the first attempt is failing; the
        // retry pause leaves plenty of margin.
        let rebind = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::net::TcpListener::bind(addr).await
        });

        let result = connect_to_server(&srv, Some(Duration::from_secs(1)), 3).await;
        let _listener = rebind.await.unwrap().expect("rebind");
        let stream = result.expect("connect retried into the new listener");
        assert!(stream.peer_addr().is_ok());
        let retries = srv.counters.retries.load(Ordering::Relaxed);
        assert!(retries >= 1, "at least one retry happened");
    }
}
