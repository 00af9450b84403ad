//! Connection handling and the accept loop.
//!
//! # Responsibilities
//! - Drive one connection through read, forward and respond
//! - Answer failures with a gateway error response while the client is there
//! - Run the accept loop, one task per connection, until shutdown
//! - Drain in-flight connections within the grace period
//!
//! # Design Decisions
//! - Each task owns its client and backend streams; only the configuration
//!   and the request template are shared (`Arc`)
//! - A client whose connection fails while the backend call is in flight
//!   cancels it; a half-close (EOF) still gets the response
//! - Per-connection failures never stop the accept loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::http::request::OutboundRequest;
use crate::net::listener::ConnectionPermit;
use crate::net::{BoundedReader, Connection, ConnectionState, ConnectionTracker, Listener};
use crate::observability::metrics;
use crate::relay::forwarder::{outbound_request, Forwarder};
use crate::relay::responder::Responder;
use crate::relay::types::{BackendTarget, RelayError, RelayResult};

/// Upper bound on draining a rejected client.
const MAX_LINGER: Duration = Duration::from_secs(2);

/// Relays single request/response exchanges.
#[derive(Debug)]
pub struct Relay {
    template: OutboundRequest,
    reader: BoundedReader,
    read_timeout: Duration,
    forwarder: Forwarder,
    responder: Responder,
}

impl Relay {
    pub fn new(config: &RelayConfig, template: OutboundRequest) -> RelayResult<Self> {
        let target = BackendTarget::parse(&config.backend.url)?;
        Ok(Self {
            template,
            reader: BoundedReader::new(config.limits.inbound_capacity),
            read_timeout: Duration::from_secs(config.timeouts.read_secs),
            forwarder: Forwarder::new(target, config),
            responder: Responder::new(Duration::from_secs(config.timeouts.write_secs)),
        })
    }

    pub fn template(&self) -> &OutboundRequest {
        &self.template
    }

    pub fn backend(&self) -> &BackendTarget {
        self.forwarder.target()
    }

    /// Handle one client connection to completion.
    ///
    /// Returns the backend status relayed to the client. On failure the
    /// client receives an error response when one applies.
    pub async fn handle<S>(&self, stream: S, conn: &mut Connection) -> RelayResult<u16>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let result = self.exchange(&mut reader, &mut writer, conn).await;
        match &result {
            Ok(status) => {
                conn.advance(ConnectionState::Closed);
                metrics::record_request("relayed", *status, start);
                tracing::info!(
                    status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Request relayed"
                );
            }
            Err(e) => {
                conn.advance(ConnectionState::Errored);
                let status = e.status();
                metrics::record_request(e.outcome(), status.unwrap_or(0), start);

                if let Some(status) = status {
                    tracing::warn!(error = %e, status, "Relay failed, answering with error response");
                    let request_id = conn.request_id().to_string();
                    if let Err(write_err) = self
                        .responder
                        .reject(&mut writer, status, &e.to_string(), &request_id)
                        .await
                    {
                        tracing::debug!(error = %write_err, "Could not deliver error response");
                    } else {
                        drain_client(&mut reader, self.read_timeout.min(MAX_LINGER)).await;
                    }
                } else {
                    tracing::warn!(error = %e, kind = ?e.kind(), "Relay failed");
                }
            }
        }
        result
    }

    async fn exchange<R, W>(&self, reader: &mut R, writer: &mut W, conn: &mut Connection) -> RelayResult<u16>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        conn.advance(ConnectionState::Reading);
        let inbound = self.reader.read_request(reader, self.read_timeout).await?;
        let parsed = inbound.parse()?;
        tracing::debug!(
            method = %parsed.method,
            target = %parsed.target,
            bytes = inbound.received(),
            "Request read"
        );

        let request = outbound_request(&self.template, self.forwarder.target(), &parsed)?;

        conn.advance(ConnectionState::Forwarding);
        // EOF here is a half-close: the client still waits for the response.
        let response = tokio::select! {
            result = self.forwarder.forward(&request) => result?,
            _ = client_reset(reader) => return Err(RelayError::ClientDisconnected),
        };

        conn.advance(ConnectionState::Responding);
        let bytes = self.responder.relay(writer, &response).await?;
        tracing::debug!(bytes, "Response written");
        Ok(response.status_code())
    }
}

/// Discard what the client is still sending, until it closes or `limit`
/// elapses. Closing with unread input would reset the connection and the
/// client could lose the error response.
async fn drain_client<R>(reader: &mut R, limit: Duration)
where
    R: AsyncRead + Unpin,
{
    let drain = async {
        let mut sink = [0u8; 512];
        while let Ok(n) = reader.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(limit, drain).await;
}

/// Completes only if reading from the client fails (e.g. connection reset).
/// After EOF the read side is no longer polled and this never completes.
async fn client_reset<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut sink = [0u8; 512];
    loop {
        match reader.read(&mut sink).await {
            Ok(0) => return std::future::pending::<()>().await,
            // One request per connection; anything further is discarded.
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "Client read side failed while forwarding");
                return;
            }
        }
    }
}

fn connection_span(conn: &Connection) -> tracing::Span {
    tracing::info_span!(
        "connection",
        connection_id = %conn.id(),
        request_id = %conn.request_id(),
        peer_addr = %conn.peer(),
    )
}

/// The relay server: binds the listener and runs the accept loop.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    relay: Arc<Relay>,
    tracker: ConnectionTracker,
}

impl RelayServer {
    pub fn new(config: RelayConfig, template: OutboundRequest) -> RelayResult<Self> {
        let relay = Relay::new(&config, template)?;
        Ok(Self {
            config: Arc::new(config),
            relay: Arc::new(relay),
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub async fn bind(&self) -> RelayResult<Listener> {
        Ok(Listener::bind(&self.config.listener).await?)
    }

    /// Accept and relay exactly one connection. Any failure is returned.
    pub async fn serve_once(&self, listener: &Listener) -> RelayResult<u16> {
        let (stream, peer, _permit) = listener.accept().await?;
        let guard = self.tracker.track();
        let mut conn = Connection::new(guard.id(), peer);
        let span = connection_span(&conn);
        self.relay.handle(stream, &mut conn).instrument(span).await
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(&self, listener: Listener, mut shutdown: broadcast::Receiver<()>) -> RelayResult<()> {
        tracing::info!(
            backend = %self.relay.backend(),
            path = self.relay.template().path(),
            "Relay accepting connections"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.spawn_connection(stream, peer, permit),
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        // Back off briefly so a persistent failure (e.g. fd exhaustion) does not spin.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }
        drop(listener);

        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);
        if self.tracker.wait_idle(grace).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                grace = ?grace,
                "Grace period elapsed with connections still open"
            );
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let relay = Arc::clone(&self.relay);
        let guard = self.tracker.track();
        let mut conn = Connection::new(guard.id(), peer);
        let span = connection_span(&conn);

        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                // Errors are logged and answered inside `handle`.
                let _ = relay.handle(stream, &mut conn).await;
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::framing::parse_response_head;
    use crate::net::ConnectionId;
    use crate::net::ReadError;
    use crate::relay::types::BackendError;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};
    use tokio::net::TcpListener;

    fn template() -> OutboundRequest {
        OutboundRequest::builder("POST", "localhost", "8080")
            .path("/balance")
            .body(r#"{"id":1}"#)
            .build()
            .unwrap()
    }

    fn config(backend: SocketAddr) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.backend.url = format!("http://{}", backend);
        config.timeouts.connect_secs = 1;
        config.timeouts.read_secs = 1;
        config.timeouts.backend_secs = 1;
        config.retries.connect_attempts = 1;
        config.limits.inbound_capacity = 256;
        config
    }

    fn conn() -> Connection {
        Connection::new(ConnectionId::new(), "127.0.0.1:40000".parse().unwrap())
    }

    fn closed_port() -> SocketAddr {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    }

    async fn fixed_backend(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = BoundedReader::new(4096).fill(&mut socket).await;
                let _ = socket.write_all(response).await;
            }
        });
        addr
    }

    async fn client_response(mut client: tokio::io::DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn relays_backend_response_verbatim() {
        let wire: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 14\r\n\r\n{\"result\":1.5}";
        let relay = Relay::new(&config(fixed_backend(wire).await), template()).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}")
            .await
            .unwrap();

        let mut conn = conn();
        let status = relay.handle(server, &mut conn).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(client_response(client).await, wire);
    }

    #[tokio::test]
    async fn truncated_request_gets_413() {
        let relay = Relay::new(&config(closed_port()), template()).unwrap();
        let (mut client, server) = tokio::io::duplex(4096);
        let mut request = b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n".to_vec();
        request.resize(300, b'x');
        client.write_all(&request).await.unwrap();

        let mut conn = conn();
        let err = relay.handle(server, &mut conn).await.unwrap_err();
        assert!(matches!(err, RelayError::Read(ReadError::Truncated { .. })));
        assert_eq!(conn.state(), ConnectionState::Errored);

        let response = client_response(client).await;
        assert_eq!(parse_response_head(&response).unwrap().unwrap().status, 413);
    }

    #[tokio::test]
    async fn unreachable_backend_gets_502() {
        let relay = Relay::new(&config(closed_port()), template()).unwrap();
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let err = relay.handle(server, &mut conn()).await.unwrap_err();
        assert!(matches!(err, RelayError::Backend(BackendError::Unreachable { .. })));

        let response = client_response(client).await;
        let head = parse_response_head(&response).unwrap().unwrap();
        assert_eq!(head.status, 502);
        let body: serde_json::Value = serde_json::from_slice(&response[head.head_len..]).unwrap();
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["error"]["code"], -32000);
        assert!(body["id"].is_null());
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let relay = Relay::new(&config(closed_port()), template()).unwrap();
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"\x00\x01 not http\r\n\r\n").await.unwrap();

        relay.handle(server, &mut conn()).await.unwrap_err();
        let response = client_response(client).await;
        assert_eq!(parse_response_head(&response).unwrap().unwrap().status, 400);
    }

    /// Client stream whose EOF surfaces as a connection reset.
    struct ResetOnEof(tokio::io::DuplexStream);

    impl AsyncRead for ResetOnEof {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let before = buf.filled().len();
            match Pin::new(&mut self.0).poll_read(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                    Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
                }
                other => other,
            }
        }
    }

    impl AsyncWrite for ResetOnEof {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    /// Backend that reads the request and then answers after `delay`.
    async fn delayed_backend(delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = BoundedReader::new(4096).fill(&mut socket).await;
                tokio::time::sleep(delay).await;
                let _ = socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn client_reset_cancels_backend_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = BoundedReader::new(4096).fill(&mut socket).await;
            // Never answer; report when the relay drops the connection.
            let mut rest = [0u8; 16];
            let n = socket.read(&mut rest).await.unwrap_or(0);
            let _ = closed_tx.send(n);
        });

        let mut config = config(backend);
        config.timeouts.backend_secs = 10;
        let relay = Relay::new(&config, template()).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}")
            .await
            .unwrap();

        let server = ResetOnEof(server);
        let handle = tokio::spawn(async move { relay.handle(server, &mut conn()).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(client);

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::ClientDisconnected)));

        let n = tokio::time::timeout(Duration::from_secs(2), closed_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn half_closed_client_still_gets_response() {
        let relay = Relay::new(&config(delayed_backend(Duration::from_millis(200)).await), template()).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut conn = conn();
        let status = relay.handle(server, &mut conn).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(client_response(client).await.ends_with(b"\r\n\r\nok"));
    }

    #[tokio::test]
    async fn rejects_invalid_backend_url() {
        let mut config = RelayConfig::default();
        config.backend.url = "https://node:8332".into();
        assert!(matches!(
            Relay::new(&config, template()),
            Err(RelayError::BackendUrl(_))
        ));
    }
}
