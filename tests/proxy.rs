#![deny(rust_2018_idioms)]

//! End-to-end proxy tests over real sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crossbar::{BackendConfig, FrontendConfig, LbAlgorithm, Proxy, ServerConfig};

/// A minimal keep-alive HTTP/1.1 upstream: answers every GET with a
/// 200 whose body is the request path. Tracks peak concurrency.
async fn upstream(
    delay: Option<Duration>,
    concurrency: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let concurrency = Arc::clone(&concurrency);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];
                loop {
                    // Read one request head.
                    let head_end = loop {
                        if let Some(pos) = find_head_end(&buf) {
                            break pos;
                        }
                        match sock.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
                    buf.drain(..head_end + 4);
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_owned();

                    let now = concurrency.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    concurrency.fetch_sub(1, Ordering::SeqCst);

                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                        path.len(),
                        path
                    );
                    if sock.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn start_proxy(backend: BackendConfig) -> SocketAddr {
    let frontend = FrontendConfig::new("fe-test", "127.0.0.1:0".parse().unwrap());
    let listener = Proxy::new(frontend, backend).bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.serve().await;
    });
    addr
}

async fn read_response(sock: &mut TcpStream) -> String {
    // Responses in these tests carry a Content-Length; read until the
    // advertised body is complete.
    let mut collected: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 2048];
    loop {
        if let Some(head_end) = find_head_end(&collected) {
            let head = String::from_utf8_lossy(&collected[..head_end]).into_owned();
            let clen: usize = head
                .lines()
                .find_map(|line| {
                    let mut parts = line.splitn(2, ':');
                    let name = parts.next()?.trim();
                    if name.eq_ignore_ascii_case("content-length") {
                        parts.next()?.trim().parse().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if collected.len() >= head_end + 4 + clen {
                let response =
                    String::from_utf8_lossy(&collected[..head_end + 4 + clen]).into_owned();
                collected.drain(..head_end + 4 + clen);
                return response;
            }
        }
        let n = sock.read(&mut tmp).await.unwrap();
        assert!(n > 0, "eof mid-response: {:?}", String::from_utf8_lossy(&collected));
        collected.extend_from_slice(&tmp[..n]);
    }
}

#[tokio::test]
async fn get_roundtrip() {
    let _ = pretty_env_logger::try_init();
    let upstream_addr = upstream(None, Default::default(), Default::default()).await;
    let proxy = start_proxy(
        BackendConfig::new("be").server(ServerConfig::new("s0", upstream_addr)),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: t\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("/hello"), "{}", response);
}

#[tokio::test]
async fn keep_alive_and_pipelining() {
    let _ = pretty_env_logger::try_init();
    let upstream_addr = upstream(None, Default::default(), Default::default()).await;
    let proxy = start_proxy(
        BackendConfig::new("be").server(ServerConfig::new("s0", upstream_addr)),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    // Two pipelined requests in one write.
    client
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await
        .unwrap();

    let first = read_response(&mut client).await;
    assert!(first.ends_with("/a"), "{}", first);
    let second = read_response(&mut client).await;
    assert!(second.ends_with("/b"), "{}", second);

    // The connection is reset for a third request.
    client
        .write_all(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let third = read_response(&mut client).await;
    assert!(third.ends_with("/c"), "{}", third);
}

#[tokio::test]
async fn chunked_response_keeps_connection() {
    let _ = pretty_env_logger::try_init();

    // A bespoke upstream that answers chunked, twice.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        for _ in 0..2 {
            loop {
                if find_head_end(&buf).is_some() {
                    break;
                }
                let n = sock.read(&mut tmp).await.unwrap();
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            let end = find_head_end(&buf).unwrap();
            buf.drain(..end + 4);
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        }
    });

    let proxy = start_proxy(
        BackendConfig::new("be").server(ServerConfig::new("s0", upstream_addr)),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut collected = Vec::new();
    let mut tmp = [0u8; 1024];
    while !collected.ends_with(b"0\r\n\r\n") {
        let n = client.read(&mut tmp).await.unwrap();
        assert!(n > 0, "eof before chunked end");
        collected.extend_from_slice(&tmp[..n]);
    }
    let text = String::from_utf8_lossy(&collected);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    assert!(text.contains("hello"), "{}", text);

    // Keep-alive survived the chunked exchange: same client
    // connection, same upstream connection.
    client
        .write_all(b"GET /two HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut collected = Vec::new();
    while !collected.ends_with(b"0\r\n\r\n") {
        let n = client.read(&mut tmp).await.unwrap();
        assert!(n > 0, "eof before second chunked end");
        collected.extend_from_slice(&tmp[..n]);
    }
}

#[tokio::test]
async fn maxconn_queues_excess_streams() {
    let _ = pretty_env_logger::try_init();
    let concurrency = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let upstream_addr = upstream(
        Some(Duration::from_millis(50)),
        Arc::clone(&concurrency),
        Arc::clone(&peak),
    )
    .await;

    let proxy = start_proxy(
        BackendConfig::new("be")
            .balance(LbAlgorithm::RoundRobin)
            .server(ServerConfig::new("s0", upstream_addr).maxconn(1)),
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..4 {
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(proxy).await.unwrap();
            let req = format!("GET /q{} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n", i);
            client.write_all(req.as_bytes()).await.unwrap();
            read_response(&mut client).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let response = task.await.unwrap();
        assert!(response.contains("200 OK"), "client {}: {}", i, response);
    }
    assert_eq!(
        peak.load(Ordering::SeqCst),
        1,
        "maxconn=1 must serialize upstream work"
    );
}

#[tokio::test]
async fn dead_backend_yields_503() {
    let _ = pretty_env_logger::try_init();
    // Reserve a port, then free it so connects are refused.
    let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gone_addr = gone.local_addr().unwrap();
    drop(gone);

    let proxy = start_proxy(
        BackendConfig::new("be")
            .retries(0)
            .server(ServerConfig::new("gone", gone_addr)),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(
        text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "{}",
        text
    );
}
