//! HTTP/1.x message framing.
//!
//! Knowing where a message ends is what lets the relay stop reading without
//! waiting for the peer to close. Heads are parsed with `httparse`; bodies are
//! delimited by `Content-Length`, chunked transfer coding, or connection close
//! (responses only).

use thiserror::Error;

/// Upper bound on header lines per message.
pub const MAX_HEADERS: usize = 64;

/// Errors raised while framing a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("invalid message head: {0}")]
    Head(String),

    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("unsupported Transfer-Encoding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("invalid chunked body: {0}")]
    InvalidChunk(&'static str),
}

impl From<httparse::Error> for FramingError {
    fn from(e: httparse::Error) -> Self {
        FramingError::Head(e.to_string())
    }
}

/// Owned header list in wire order.
pub type Headers = Vec<(String, String)>;

/// First value of `name` (case-insensitive).
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    raw.iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
        .collect()
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
    /// Bytes occupied by the head including the blank line.
    pub head_len: usize,
}

/// Parsed status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub head_len: usize,
}

/// Parse a request head. `Ok(None)` means more bytes are needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, FramingError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut storage);
    match req.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(head_len) => Ok(Some(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: collect_headers(req.headers),
            head_len,
        })),
    }
}

/// Parse a response head. `Ok(None)` means more bytes are needed.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, FramingError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut storage);
    match resp.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(head_len) => Ok(Some(ResponseHead {
            version: resp.version.unwrap_or(1),
            status: resp.code.unwrap_or_default(),
            reason: resp.reason.unwrap_or_default().to_string(),
            headers: collect_headers(resp.headers),
            head_len,
        })),
    }
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    ContentLength(usize),
    /// Chunked transfer coding.
    Chunked,
    /// Everything until the peer closes (responses only).
    UntilClose,
}

/// Framing of a request body. Requests without a declared length have none.
pub fn request_framing(headers: &[(String, String)]) -> Result<BodyFraming, FramingError> {
    if let Some(te) = transfer_encoding(headers) {
        return if last_coding_is_chunked(&te) {
            Ok(BodyFraming::Chunked)
        } else {
            Err(FramingError::UnsupportedTransferEncoding(te))
        };
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::ContentLength(n)),
    }
}

/// Framing of a response body given its status.
pub fn response_framing(status: u16, headers: &[(String, String)]) -> Result<BodyFraming, FramingError> {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyFraming::Empty);
    }
    if let Some(te) = transfer_encoding(headers) {
        return if last_coding_is_chunked(&te) {
            Ok(BodyFraming::Chunked)
        } else {
            Ok(BodyFraming::UntilClose)
        };
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::ContentLength(n)),
        None => Ok(BodyFraming::UntilClose),
    }
}

fn transfer_encoding(headers: &[(String, String)]) -> Option<String> {
    let codings: Vec<&str> = headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
        .map(|(_, v)| v.as_str())
        .collect();
    if codings.is_empty() {
        None
    } else {
        Some(codings.join(", "))
    }
}

fn last_coding_is_chunked(te: &str) -> bool {
    te.rsplit(',')
        .next()
        .map(|c| c.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// All `Content-Length` values must agree.
fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, FramingError> {
    let mut found: Option<usize> = None;
    for (_, value) in headers.iter().filter(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FramingError::InvalidContentLength(value.clone()));
            }
            let n: usize = part
                .parse()
                .map_err(|_| FramingError::InvalidContentLength(value.clone()))?;
            match found {
                Some(prev) if prev != n => {
                    return Err(FramingError::InvalidContentLength(format!("conflicting values {} and {}", prev, n)))
                }
                _ => found = Some(n),
            }
        }
    }
    Ok(found)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    FinalLf,
    Complete,
}

/// Incremental decoder for `Transfer-Encoding: chunked`.
///
/// Bytes are fed as they arrive; decoded payload is appended to the caller's
/// buffer. The decoder stops consuming at the end of the message, so any
/// bytes after it are left to the caller.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkState,
    size: usize,
    has_digit: bool,
    remaining: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            size: 0,
            has_digit: false,
            remaining: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Complete
    }

    /// Feed `input`, appending decoded bytes to `out`.
    /// Returns how many input bytes were consumed.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, FramingError> {
        let mut i = 0;
        while i < input.len() && self.state != ChunkState::Complete {
            let b = input[i];
            match self.state {
                ChunkState::Size => match b {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = (b as char).to_digit(16).unwrap_or(0) as usize;
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(digit))
                            .ok_or(FramingError::InvalidChunk("chunk size overflow"))?;
                        self.has_digit = true;
                    }
                    b';' | b' ' | b'\t' if self.has_digit => self.state = ChunkState::Extension,
                    b'\r' if self.has_digit => self.state = ChunkState::SizeLf,
                    _ => return Err(FramingError::InvalidChunk("invalid chunk size")),
                },
                ChunkState::Extension => {
                    if b == b'\r' {
                        self.state = ChunkState::SizeLf;
                    }
                }
                ChunkState::SizeLf => {
                    if b != b'\n' {
                        return Err(FramingError::InvalidChunk("expected LF after chunk size"));
                    }
                    if self.size == 0 {
                        self.state = ChunkState::TrailerStart;
                    } else {
                        self.remaining = self.size;
                        self.state = ChunkState::Data;
                    }
                    self.size = 0;
                    self.has_digit = false;
                }
                ChunkState::Data => {
                    let take = self.remaining.min(input.len() - i);
                    out.extend_from_slice(&input[i..i + take]);
                    self.remaining -= take;
                    i += take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                    continue;
                }
                ChunkState::DataCr => {
                    if b != b'\r' {
                        return Err(FramingError::InvalidChunk("expected CRLF after chunk data"));
                    }
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if b != b'\n' {
                        return Err(FramingError::InvalidChunk("expected CRLF after chunk data"));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::TrailerStart => {
                    self.state = if b == b'\r' {
                        ChunkState::FinalLf
                    } else {
                        ChunkState::TrailerLine
                    };
                }
                ChunkState::TrailerLine => {
                    if b == b'\r' {
                        self.state = ChunkState::TrailerLf;
                    }
                }
                ChunkState::TrailerLf => {
                    if b != b'\n' {
                        return Err(FramingError::InvalidChunk("expected LF in trailer"));
                    }
                    self.state = ChunkState::TrailerStart;
                }
                ChunkState::FinalLf => {
                    if b != b'\n' {
                        return Err(FramingError::InvalidChunk("expected final LF"));
                    }
                    self.state = ChunkState::Complete;
                }
                ChunkState::Complete => break,
            }
            i += 1;
        }
        Ok(i)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks whether a body delimited by `framing` has fully arrived.
///
/// Fed with the bytes that follow the head; collects the decoded body.
#[derive(Debug, Clone)]
pub struct BodyTracker {
    framing: BodyFraming,
    chunked: Option<ChunkedDecoder>,
    /// Raw body bytes consumed so far (excluding anything past the end).
    consumed: usize,
    decoded: Vec<u8>,
}

impl BodyTracker {
    pub fn new(framing: BodyFraming) -> Self {
        let chunked = match framing {
            BodyFraming::Chunked => Some(ChunkedDecoder::new()),
            _ => None,
        };
        Self {
            framing,
            chunked,
            consumed: 0,
            decoded: Vec::new(),
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Feed body bytes; returns how many belong to this message.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, FramingError> {
        let used = match self.framing {
            BodyFraming::Empty => 0,
            BodyFraming::ContentLength(n) => {
                let take = (n - self.consumed).min(input.len());
                self.decoded.extend_from_slice(&input[..take]);
                take
            }
            BodyFraming::Chunked => match self.chunked.as_mut() {
                Some(decoder) => decoder.feed(input, &mut self.decoded)?,
                None => 0,
            },
            BodyFraming::UntilClose => {
                self.decoded.extend_from_slice(input);
                input.len()
            }
        };
        self.consumed += used;
        Ok(used)
    }

    /// True once the body is fully delimited. Close-delimited bodies are
    /// only complete when the caller observes EOF.
    pub fn is_complete(&self) -> bool {
        match self.framing {
            BodyFraming::Empty => true,
            BodyFraming::ContentLength(n) => self.consumed == n,
            BodyFraming::Chunked => self.chunked.as_ref().is_some_and(ChunkedDecoder::is_complete),
            BodyFraming::UntilClose => false,
        }
    }

    /// Raw body bytes that belong to the message.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn into_body(self) -> Vec<u8> {
        self.decoded
    }
}
