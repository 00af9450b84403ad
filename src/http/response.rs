//! Backend responses and gateway-generated error responses.
//!
//! # Responsibilities
//! - Hold a backend response both parsed and exactly as received
//! - Serialize relay-originated error responses (JSON-RPC style body)
//!
//! # Design Decisions
//! - The relay never rewrites a backend response; the raw bytes are relayed
//! - Error bodies follow the JSON-RPC 2.0 error object shape so RPC clients
//!   can surface them uniformly

use serde::Serialize;

use crate::http::framing::{header_value, Headers};

/// Parsed status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    /// Minor HTTP/1.x version.
    pub version: u8,
    pub code: u16,
    pub reason: String,
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/1.{} {} {}", self.version, self.code, self.reason)
    }
}

/// A complete, framed response read from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: StatusLine,
    pub headers: Headers,
    /// Payload with any transfer coding removed.
    pub body: Vec<u8>,
    raw: Vec<u8>,
}

impl BackendResponse {
    pub fn new(status: StatusLine, headers: Headers, body: Vec<u8>, raw: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            raw,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status.code
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Bytes exactly as the backend sent them (head and framed body).
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }
}

#[derive(Serialize)]
struct RpcErrorObject<'a> {
    code: i32,
    message: &'a str,
}

#[derive(Serialize)]
struct RpcErrorBody<'a> {
    jsonrpc: &'static str,
    error: RpcErrorObject<'a>,
    id: Option<u64>,
}

/// JSON-RPC error code for a failure with the given HTTP status.
///
/// Client faults use "Invalid Request"; everything upstream is a server error.
pub fn rpc_error_code(status: u16) -> i32 {
    match status {
        400..=499 => -32600,
        _ => -32000,
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Serialize a relay-originated error response.
pub fn error_response(status: u16, message: &str, request_id: &str) -> Vec<u8> {
    let body = RpcErrorBody {
        jsonrpc: "2.0",
        error: RpcErrorObject {
            code: rpc_error_code(status),
            message,
        },
        id: None,
    };
    // Serializing plain strings and integers cannot fail.
    let body = serde_json::to_vec(&body).unwrap_or_default();

    let mut out = Vec::with_capacity(160 + body.len());
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes());
    out.extend_from_slice(b"Content-Type: application/json\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(format!("X-Request-Id: {}\r\n", request_id).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&body);
    out
}
