//! Outbound request construction.
//!
//! # Responsibilities
//! - Validate method, host, port, path and extra header lines
//! - Serialize request line, `Host` header, extra headers, blank line, body
//! - Optionally compute body framing (`Content-Length`) automatically
//!
//! # Design Decisions
//! - Fields are appended structurally; there is no pre-sized buffer to get wrong
//! - Header lines are kept in the order given
//! - Building is pure: the builder only returns a value

use thiserror::Error;

/// The only method the relay emits.
pub const METHOD_POST: &str = "POST";

/// Path used when none is given.
pub const DEFAULT_PATH: &str = "/";

/// Errors produced while building an outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Method other than POST.
    #[error("unsupported method '{0}': only POST is supported")]
    UnsupportedMethod(String),

    /// Empty or malformed host, port, path or header line.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// HTTP version label written on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    /// `HTTP/1.1`, used on the wire to the backend.
    Http11,
    /// `HTTP/2`, the label the command-line tool has always printed.
    #[default]
    Http2,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http2 => "HTTP/2",
        }
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully validated POST request ready to be written to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    host: String,
    port: String,
    path: String,
    headers: Vec<String>,
    body: Option<Vec<u8>>,
    version: HttpVersion,
}

impl OutboundRequest {
    /// Start building a request. The method is checked in [`RequestBuilder::build`].
    pub fn builder(method: impl Into<String>, host: impl Into<String>, port: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, host, port)
    }

    pub fn method(&self) -> &'static str {
        METHOD_POST
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Extra header lines, in order, without their CRLF.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// Value of the first extra header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .filter_map(|line| line.split_once(':'))
            .find(|(n, _)| n.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = self.body.as_ref().map_or(0, Vec::len);
        let headers_len: usize = self.headers.iter().map(|h| h.len() + 2).sum();
        let mut out = Vec::with_capacity(64 + self.path.len() + self.host.len() + headers_len + body_len);

        out.extend_from_slice(format!("{} {} {}\r\n", METHOD_POST, self.path, self.version).as_bytes());
        out.extend_from_slice(format!("Host: {}:{}\r\n", self.host, self.port).as_bytes());
        for line in &self.headers {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

/// Builder for [`OutboundRequest`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: String,
    host: String,
    port: String,
    path: String,
    headers: Vec<String>,
    body: Option<Vec<u8>>,
    version: HttpVersion,
    frame_body: bool,
}

impl RequestBuilder {
    pub fn new(method: impl Into<String>, host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            host: host.into(),
            port: port.into(),
            path: String::new(),
            headers: Vec::new(),
            body: None,
            version: HttpVersion::default(),
            frame_body: false,
        }
    }

    /// Request target. Empty means [`DEFAULT_PATH`].
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Append one `Name: value` header line.
    pub fn header(mut self, line: impl Into<String>) -> Self {
        self.headers.push(line.into());
        self
    }

    pub fn headers<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.headers.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn maybe_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body;
        self
    }

    pub fn version(mut self, version: HttpVersion) -> Self {
        self.version = version;
        self
    }

    /// Append `Content-Length` unless a header line already declares it.
    pub fn frame_body(mut self, enabled: bool) -> Self {
        self.frame_body = enabled;
        self
    }

    pub fn build(self) -> Result<OutboundRequest, BuildError> {
        if self.method != METHOD_POST {
            return Err(BuildError::UnsupportedMethod(self.method));
        }
        if self.host.is_empty() {
            return Err(BuildError::InvalidArgument("host must not be empty".into()));
        }
        if self.port.is_empty() {
            return Err(BuildError::InvalidArgument("port must not be empty".into()));
        }
        check_token("host", &self.host)?;
        check_token("port", &self.port)?;

        let path = if self.path.is_empty() {
            DEFAULT_PATH.to_string()
        } else {
            check_token("path", &self.path)?;
            self.path
        };

        for line in &self.headers {
            check_header_line(line)?;
        }

        let mut request = OutboundRequest {
            host: self.host,
            port: self.port,
            path,
            headers: self.headers,
            body: self.body,
            version: self.version,
        };

        if self.frame_body && request.header("content-length").is_none() {
            let len = request.body.as_ref().map_or(0, Vec::len);
            request.headers.push(format!("Content-Length: {}", len));
        }

        Ok(request)
    }
}

/// Request-line components must not break the line apart.
fn check_token(what: &str, value: &str) -> Result<(), BuildError> {
    if value.bytes().any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n') {
        return Err(BuildError::InvalidArgument(format!(
            "{} must not contain whitespace or line breaks: {:?}",
            what, value
        )));
    }
    Ok(())
}

fn check_header_line(line: &str) -> Result<(), BuildError> {
    if line.contains('\r') || line.contains('\n') {
        return Err(BuildError::InvalidArgument(format!(
            "header line must not contain line breaks: {:?}",
            line
        )));
    }
    let name = match line.split_once(':') {
        Some((name, _)) => name,
        None => {
            return Err(BuildError::InvalidArgument(format!(
                "header line must have the form 'Name: value': {:?}",
                line
            )))
        }
    };
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(BuildError::InvalidArgument(format!("invalid header name in {:?}", line)));
    }
    Ok(())
}

/// RFC 7230 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
