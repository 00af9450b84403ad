//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use rpc_relay::config::RelayConfig;
use rpc_relay::lifecycle::Shutdown;
use rpc_relay::net::BoundedReader;
use rpc_relay::relay::{RelayResult, RelayServer};
use rpc_relay::OutboundRequest;

/// Read one request off a mock backend socket and return its raw bytes.
async fn read_request(socket: &mut TcpStream) -> Vec<u8> {
    match BoundedReader::new(64 * 1024).fill(socket).await {
        Ok(request) => request.as_bytes().to_vec(),
        Err(_) => Vec::new(),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Start a mock backend on `handler`'s terms: it gets the raw request and
/// returns the raw response bytes to write before closing.
pub async fn start_raw_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let response = handler(request).await;
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Start a mock backend that returns a fixed JSON body.
pub async fn start_mock_backend(body: &'static str) -> SocketAddr {
    start_programmable_backend(move || async move { (200, body.to_string()) }).await
}

/// Start a programmable mock backend with async support.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let f = Arc::new(f);
    start_raw_backend(move |_request| {
        let f = f.clone();
        async move {
            let (status, body) = f().await;
            format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                status_text(status),
                body.len(),
                body
            )
            .into_bytes()
        }
    })
    .await
}

/// Start a backend whose response body is the exact request it received.
pub async fn start_echo_backend() -> SocketAddr {
    start_raw_backend(|request| async move {
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", request.len()).into_bytes();
        response.extend_from_slice(&request);
        response
    })
    .await
}

/// Start a backend answering with a chunked body made of `chunks`.
pub async fn start_chunked_backend(chunks: &'static [&'static str]) -> SocketAddr {
    start_raw_backend(move |_request| async move {
        let mut response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for chunk in chunks {
            response.extend_from_slice(format!("{:x}\r\n{}\r\n", chunk.len(), chunk).as_bytes());
        }
        response.extend_from_slice(b"0\r\n\r\n");
        response
    })
    .await
}

/// Start a backend that waits `delay` before answering.
pub async fn start_slow_backend(delay: Duration) -> SocketAddr {
    start_programmable_backend(move || async move {
        tokio::time::sleep(delay).await;
        (200, r#"{"result":null}"#.to_string())
    })
    .await
}

/// A local port with nothing listening on it.
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Relay config listening on an ephemeral loopback port, relaying to `backend`.
pub fn relay_config(backend: SocketAddr) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.listener.host = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.backend.url = format!("http://{}", backend);
    config.timeouts.connect_secs = 1;
    config.timeouts.read_secs = 2;
    config.timeouts.backend_secs = 2;
    config.timeouts.shutdown_grace_secs = 2;
    config.retries.connect_attempts = 1;
    config
}

pub fn template(path: &str, body: Option<&str>) -> OutboundRequest {
    OutboundRequest::builder("POST", "127.0.0.1", "0")
        .path(path)
        .maybe_body(body.map(|b| b.as_bytes().to_vec()))
        .build()
        .unwrap()
}

/// A running relay in serve mode.
pub struct RunningRelay {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<RelayResult<()>>,
}

impl RunningRelay {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the accept loop to finish.
    pub async fn stop(self) -> RelayResult<()> {
        self.shutdown.trigger();
        self.handle.await.unwrap()
    }
}

pub async fn start_relay(config: RelayConfig, template: OutboundRequest) -> RunningRelay {
    let server = RelayServer::new(config, template).unwrap();
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let handle = tokio::spawn(async move { server.run(listener, receiver).await });

    RunningRelay { addr, shutdown, handle }
}

/// HTTP client that never reuses connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
