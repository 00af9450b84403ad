//! Client-facing writes.
//!
//! # Responsibilities
//! - Relay the backend response to the client unchanged
//! - Send gateway error responses when a call cannot be relayed
//! - Flush and close the write side once the response is out
//!
//! # Design Decisions
//! - Every write is bounded by a deadline so a stalled client cannot pin a task
//! - A client that vanished mid-write is reported, not retried

use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::http::response::{error_response, BackendResponse};
use crate::relay::types::WriteError;

/// Writes responses to the client.
#[derive(Debug, Clone, Copy)]
pub struct Responder {
    write_timeout: Duration,
}

impl Responder {
    pub fn new(write_timeout: Duration) -> Self {
        Self { write_timeout }
    }

    /// Write the backend response exactly as received. Returns bytes written.
    pub async fn relay<W>(&self, writer: &mut W, response: &BackendResponse) -> Result<usize, WriteError>
    where
        W: AsyncWrite + Unpin,
    {
        self.send(writer, response.as_bytes()).await
    }

    /// Answer with a relay-generated error response.
    pub async fn reject<W>(
        &self,
        writer: &mut W,
        status: u16,
        message: &str,
        request_id: &str,
    ) -> Result<usize, WriteError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = error_response(status, message, request_id);
        self.send(writer, &bytes).await
    }

    async fn send<W>(&self, writer: &mut W, bytes: &[u8]) -> Result<usize, WriteError>
    where
        W: AsyncWrite + Unpin,
    {
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            writer.shutdown().await
        };
        match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(bytes.len()),
            Ok(Err(e)) => Err(WriteError::ClientGone(e)),
            Err(_) => Err(WriteError::Timeout(self.write_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::framing::{header_value, parse_response_head};
    use crate::http::response::StatusLine;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn relays_raw_bytes() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}".to_vec();
        let response = BackendResponse::new(
            StatusLine {
                version: 1,
                code: 200,
                reason: "OK".into(),
            },
            vec![("Content-Length".into(), "2".into())],
            b"{}".to_vec(),
            raw.clone(),
        );

        let (mut client, mut server) = tokio::io::duplex(1024);
        let written = Responder::new(Duration::from_secs(1))
            .relay(&mut server, &response)
            .await
            .unwrap();
        assert_eq!(written, raw.len());

        drop(server);
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, raw);
    }

    #[tokio::test]
    async fn rejects_with_json_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        Responder::new(Duration::from_secs(1))
            .reject(&mut server, 413, "request too large", "req-1")
            .await
            .unwrap();

        drop(server);
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        let head = parse_response_head(&received).unwrap().unwrap();
        assert_eq!(head.status, 413);
        assert_eq!(header_value(&head.headers, "x-request-id"), Some("req-1"));
        let body: serde_json::Value = serde_json::from_slice(&received[head.head_len..]).unwrap();
        assert_eq!(body["error"]["code"], -32600);
        assert_eq!(body["error"]["message"], "request too large");
    }

    #[tokio::test]
    async fn stalled_client_times_out() {
        // Tiny pipe that nobody drains.
        let (_client, mut server) = tokio::io::duplex(8);
        let err = Responder::new(Duration::from_millis(50))
            .reject(&mut server, 502, "backend unreachable", "req-2")
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Timeout(_)));
    }

    #[tokio::test]
    async fn vanished_client_is_reported() {
        let (client, mut server) = tokio::io::duplex(8);
        drop(client);
        let err = Responder::new(Duration::from_secs(1))
            .reject(&mut server, 502, "backend unreachable", "req-3")
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::ClientGone(_)));
    }
}
