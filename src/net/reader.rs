//! Bounded inbound request reader.
//!
//! # Responsibilities
//! - Read a client request into a buffer of fixed capacity
//! - Stop at the logical end of the HTTP message, at peer close, or when full
//! - Report truncation as an error, never as a complete request
//!
//! # Design Decisions
//! - Capacity is fixed per reader; requests that do not fit are rejected (413)
//! - The head is re-parsed after each read until complete, then the body is
//!   tracked incrementally
//! - The whole read is bounded by a deadline

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::http::framing::{
    header_value, parse_request_head, request_framing, BodyTracker, FramingError, Headers,
};

/// Capacity of the inbound buffer unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Errors produced while reading an inbound request.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The buffer filled before the request ended.
    #[error("request does not fit in the {capacity}-byte buffer")]
    Truncated { capacity: usize },

    #[error("cannot read request from the socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out reading request after {0:?}")]
    Timeout(Duration),

    #[error("malformed request: {0}")]
    Malformed(#[from] FramingError),

    /// The peer closed before the declared end of the request.
    #[error("request ended before its declared length")]
    Incomplete,

    /// The peer closed without sending anything.
    #[error("connection closed before a request was sent")]
    Empty,
}

/// How a read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Peer closed, or the logical end of the message was reached.
    Complete,
    /// Buffer filled before the end was seen.
    Truncated,
}

/// Raw inbound bytes as captured by [`BoundedReader`].
#[derive(Debug, Clone)]
pub struct InboundRequest {
    buf: Vec<u8>,
    received: usize,
    status: ReadStatus,
}

impl InboundRequest {
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes actually received.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn status(&self) -> ReadStatus {
        self.status
    }

    pub fn is_truncated(&self) -> bool {
        self.status == ReadStatus::Truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.received]
    }

    /// Parse the captured bytes into a request suitable for forwarding.
    pub fn parse(&self) -> Result<ParsedInbound, ReadError> {
        if self.is_truncated() {
            return Err(ReadError::Truncated {
                capacity: self.capacity(),
            });
        }
        let data = self.as_bytes();
        let head = parse_request_head(data)?.ok_or(ReadError::Incomplete)?;
        let mut body = BodyTracker::new(request_framing(&head.headers)?);
        body.feed(&data[head.head_len..])?;
        if !body.is_complete() {
            return Err(ReadError::Incomplete);
        }

        Ok(ParsedInbound {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body: body.into_body(),
        })
    }
}

/// A parsed inbound request with any transfer coding removed from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInbound {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ParsedInbound {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// Detects the logical end of a request as bytes arrive.
#[derive(Debug, Default)]
struct EndDetector {
    head_len: usize,
    body: Option<BodyTracker>,
}

impl EndDetector {
    /// `data` is everything received so far.
    fn reached(&mut self, data: &[u8]) -> Result<bool, FramingError> {
        if self.body.is_none() {
            let Some(head) = parse_request_head(data)? else {
                return Ok(false);
            };
            self.head_len = head.head_len;
            self.body = Some(BodyTracker::new(request_framing(&head.headers)?));
        }
        match self.body.as_mut() {
            Some(body) => {
                let offset = self.head_len + body.consumed();
                body.feed(&data[offset..])?;
                Ok(body.is_complete())
            }
            None => Ok(false),
        }
    }
}

/// Reads one request into a fixed-capacity buffer.
#[derive(Debug, Clone, Copy)]
pub struct BoundedReader {
    capacity: usize,
}

impl BoundedReader {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read until the buffer is full, the peer closes, or the request ends.
    ///
    /// Truncation is reported through [`InboundRequest::status`]; use
    /// [`BoundedReader::read_request`] to have it surfaced as an error.
    pub async fn fill<R>(&self, reader: &mut R) -> Result<InboundRequest, ReadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.capacity];
        let mut received = 0;
        let mut end = EndDetector::default();

        let status = loop {
            if received == self.capacity {
                break ReadStatus::Truncated;
            }
            let n = reader.read(&mut buf[received..]).await?;
            if n == 0 {
                break ReadStatus::Complete;
            }
            received += n;
            if end.reached(&buf[..received])? {
                break ReadStatus::Complete;
            }
        };

        Ok(InboundRequest { buf, received, status })
    }

    /// Read a request within `deadline`, rejecting truncated and empty reads.
    pub async fn read_request<R>(&self, reader: &mut R, deadline: Duration) -> Result<InboundRequest, ReadError>
    where
        R: AsyncRead + Unpin,
    {
        let inbound = tokio::time::timeout(deadline, self.fill(reader))
            .await
            .map_err(|_| ReadError::Timeout(deadline))??;

        match inbound.status() {
            ReadStatus::Truncated => Err(ReadError::Truncated {
                capacity: self.capacity,
            }),
            ReadStatus::Complete if inbound.received() == 0 => Err(ReadError::Empty),
            ReadStatus::Complete => Ok(inbound),
        }
    }
}

impl Default for BoundedReader {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
