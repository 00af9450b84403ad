//! Backend forwarding.
//!
//! # Responsibilities
//! - Derive the outbound request for an inbound call from the CLI template
//! - Connect to the backend with a deadline and transient-failure retries
//! - Write the request and read one framed response
//!
//! # Design Decisions
//! - One fresh backend connection per relayed call, closed afterwards
//! - The response is framed by status, `Transfer-Encoding` and
//!   `Content-Length`; only unframed responses are read to close
//! - Dropping the forward future aborts the call and closes the socket

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::RelayConfig;
use crate::http::framing::{parse_response_head, response_framing, BodyFraming, BodyTracker};
use crate::http::request::{BuildError, HttpVersion, OutboundRequest, METHOD_POST};
use crate::http::response::{BackendResponse, StatusLine};
use crate::net::ParsedInbound;
use crate::observability::metrics;
use crate::relay::types::{BackendError, BackendTarget};
use crate::resilience::{is_retryable_connect_error, RetryPolicy};

const READ_CHUNK: usize = 8 * 1024;

/// Headers the relay computes itself and never copies from the template.
const MANAGED_HEADERS: [&str; 4] = ["host", "content-length", "transfer-encoding", "connection"];

fn header_name(line: &str) -> &str {
    line.split_once(':').map_or(line, |(name, _)| name.trim())
}

/// Build the request sent to `target` for one inbound call.
///
/// Path, extra headers and the fallback body come from `template`; the
/// inbound body (when non-empty) and its `Content-Type` are carried over.
pub fn outbound_request(
    template: &OutboundRequest,
    target: &BackendTarget,
    inbound: &ParsedInbound,
) -> Result<OutboundRequest, BuildError> {
    let mut headers: Vec<String> = template
        .headers()
        .iter()
        .filter(|line| {
            let name = header_name(line);
            !MANAGED_HEADERS.iter().any(|m| name.eq_ignore_ascii_case(m))
        })
        .cloned()
        .collect();

    if template.header("content-type").is_none() {
        if let Some(content_type) = inbound.header("content-type") {
            headers.push(format!("Content-Type: {}", content_type));
        }
    }
    headers.push("Connection: close".to_string());

    let body = if inbound.body.is_empty() {
        template.body().map(<[u8]>::to_vec)
    } else {
        Some(inbound.body.clone())
    };

    OutboundRequest::builder(METHOD_POST, target.host(), target.port().to_string())
        .path(template.path())
        .headers(headers)
        .maybe_body(body)
        .version(HttpVersion::Http11)
        .frame_body(true)
        .build()
}

/// Sends requests to the backend and reads its responses.
#[derive(Debug, Clone)]
pub struct Forwarder {
    target: BackendTarget,
    connect_timeout: Duration,
    round_trip_timeout: Duration,
    max_response_bytes: usize,
    retry: RetryPolicy,
}

impl Forwarder {
    pub fn new(target: BackendTarget, config: &RelayConfig) -> Self {
        Self {
            target,
            connect_timeout: Duration::from_secs(config.timeouts.connect_secs),
            round_trip_timeout: Duration::from_secs(config.timeouts.backend_secs),
            max_response_bytes: config.limits.max_response_bytes,
            retry: RetryPolicy::from_config(&config.retries),
        }
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    /// Send `request` and read the backend's response within the round-trip deadline.
    pub async fn forward(&self, request: &OutboundRequest) -> Result<BackendResponse, BackendError> {
        let deadline = self.round_trip_timeout;
        let result = match timeout(deadline, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(deadline)),
        };
        if let Err(e) = &result {
            metrics::record_backend_error(e.kind());
        }
        result
    }

    async fn round_trip(&self, request: &OutboundRequest) -> Result<BackendResponse, BackendError> {
        let mut stream = self.connect().await?;

        let bytes = request.to_bytes();
        tracing::debug!(backend = %self.target, bytes = bytes.len(), path = request.path(), "Sending request to backend");
        stream
            .write_all(&bytes)
            .await
            .map_err(|source| self.unreachable(source))?;
        stream.flush().await.map_err(|source| self.unreachable(source))?;

        let response = read_response(&mut stream, self.max_response_bytes).await?;
        tracing::debug!(
            backend = %self.target,
            status = response.status_code(),
            bytes = response.as_bytes().len(),
            "Backend responded"
        );
        Ok(response)
    }

    async fn connect(&self) -> Result<TcpStream, BackendError> {
        let authority = self.target.authority();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match timeout(self.connect_timeout, TcpStream::connect(authority.as_str())).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Could not set TCP_NODELAY on backend socket");
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            };

            match self.retry.next_delay(attempt) {
                Some(delay) if is_retryable_connect_error(&err) => {
                    tracing::warn!(
                        backend = %self.target,
                        attempt,
                        delay = ?delay,
                        error = %err,
                        "Backend connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(self.unreachable(err)),
            }
        }
    }

    fn unreachable(&self, source: io::Error) -> BackendError {
        BackendError::Unreachable {
            backend: self.target.to_string(),
            source,
        }
    }
}

/// Read one framed HTTP response, skipping interim 1xx responses.
///
/// The returned response's raw bytes start at the final status line and end
/// at the end of the framed body.
pub async fn read_response<R>(reader: &mut R, limit: usize) -> Result<BackendResponse, BackendError>
where
    R: AsyncRead + Unpin,
{
    let mut raw: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut start = 0;

    let head = loop {
        match parse_response_head(&raw[start..]).map_err(|e| BackendError::MalformedResponse(e.to_string()))? {
            Some(head) if head.status == 101 => {
                return Err(BackendError::MalformedResponse(
                    "backend switched protocols (101) on a relayed call".into(),
                ));
            }
            Some(head) if (100..200).contains(&head.status) => {
                start += head.head_len;
            }
            Some(head) => break head,
            None => {
                if read_more(reader, &mut raw, limit).await? == 0 {
                    return Err(BackendError::MalformedResponse(
                        "connection closed before a complete response head".into(),
                    ));
                }
            }
        }
    };

    let framing = response_framing(head.status, &head.headers)
        .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
    let body_start = start + head.head_len;
    let mut body = BodyTracker::new(framing);

    loop {
        let offset = body_start + body.consumed();
        body.feed(&raw[offset..])
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        if body.is_complete() {
            break;
        }
        if read_more(reader, &mut raw, limit).await? == 0 {
            if framing == BodyFraming::UntilClose {
                break;
            }
            return Err(BackendError::MalformedResponse(
                "connection closed before the end of the body".into(),
            ));
        }
    }

    let end = body_start + body.consumed();
    raw.truncate(end);
    raw.drain(..start);

    let status = StatusLine {
        version: head.version,
        code: head.status,
        reason: head.reason,
    };
    Ok(BackendResponse::new(status, head.headers, body.into_body(), raw))
}

/// Append one read to `raw`, enforcing `limit`. Returns bytes read.
async fn read_more<R>(reader: &mut R, raw: &mut Vec<u8>, limit: usize) -> Result<usize, BackendError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let n = reader.read(&mut chunk).await.map_err(|e| {
        BackendError::MalformedResponse(format!("connection error while reading response: {}", e))
    })?;
    if raw.len() + n > limit {
        return Err(BackendError::ResponseTooLarge { limit });
    }
    raw.extend_from_slice(&chunk[..n]);
    Ok(n)
}
