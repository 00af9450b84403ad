//! Relay-wide types and error definitions.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::http::BuildError;
use crate::net::{ListenerError, ReadError};

/// Where relayed requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// Host as written in a URL (IPv6 literals keep their brackets).
    host: String,
    port: u16,
}

/// Why a backend URL was rejected.
#[derive(Debug, Error)]
pub enum BackendUrlError {
    #[error("cannot parse '{url}': {source}")]
    Parse {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme '{0}': only http is supported")]
    UnsupportedScheme(String),

    #[error("credentials in the URL are not supported; pass an Authorization header line instead")]
    Credentials,

    #[error("URL has no host")]
    MissingHost,

    #[error("URL must not carry a path, query or fragment ('{0}'); pass the RPC path as the <path> argument")]
    Path(String),
}

impl BackendTarget {
    /// Parse `http://host[:port][/]`. A bare `host:port` is taken as http.
    pub fn parse(raw: &str) -> Result<Self, BackendUrlError> {
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };
        let url = url::Url::parse(&with_scheme).map_err(|source| BackendUrlError::Parse {
            url: raw.to_string(),
            source,
        })?;

        if url.scheme() != "http" {
            return Err(BackendUrlError::UnsupportedScheme(url.scheme().to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(BackendUrlError::Credentials);
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(BackendUrlError::Path(url.path().to_string()));
        }
        let host = url.host_str().ok_or(BackendUrlError::MissingHost)?.to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, usable both for connecting and for the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http://{}:{}", self.host, self.port)
    }
}

/// Errors on the backend leg.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection could not be established or broke while sending.
    #[error("backend {backend} unreachable: {source}")]
    Unreachable {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// Round-trip exceeded its deadline.
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    /// Response could not be framed.
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("backend response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
}

impl BackendError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Unreachable { .. } => "unreachable",
            BackendError::Timeout(_) => "timeout",
            BackendError::MalformedResponse(_) => "malformed",
            BackendError::ResponseTooLarge { .. } => "too_large",
        }
    }
}

/// Errors writing to the client.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("client went away: {0}")]
    ClientGone(#[source] io::Error),

    #[error("timed out writing response after {0:?}")]
    Timeout(Duration),
}

/// Error taxonomy used for exit codes and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing arguments, unsupported method, invalid configuration.
    Usage,
    /// Resolve, bind, listen or accept failure.
    NetworkSetup,
    /// Inbound read failure, including truncation.
    Read,
    /// Backend unreachable, timed out or answered garbage.
    Backend,
    /// Client gone before the response was written.
    Write,
}

/// Any failure of the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid backend URL: {0}")]
    BackendUrl(#[from] BackendUrlError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Write(#[from] WriteError),

    /// Client hung up while the backend call was in flight.
    #[error("client disconnected before the backend answered")]
    ClientDisconnected,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Build(_) | RelayError::Config(_) | RelayError::BackendUrl(_) => ErrorKind::Usage,
            RelayError::Listener(_) => ErrorKind::NetworkSetup,
            RelayError::Read(_) => ErrorKind::Read,
            RelayError::Backend(_) => ErrorKind::Backend,
            RelayError::Write(_) | RelayError::ClientDisconnected => ErrorKind::Write,
        }
    }

    /// Status for the error response sent to the client, if one should be sent.
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Read(ReadError::Truncated { .. }) => Some(413),
            RelayError::Read(ReadError::Malformed(_) | ReadError::Incomplete) => Some(400),
            RelayError::Read(ReadError::Timeout(_)) => Some(408),
            RelayError::Read(ReadError::Io(_) | ReadError::Empty) => None,
            RelayError::Build(_) => Some(400),
            RelayError::Backend(BackendError::Timeout(_)) => Some(504),
            RelayError::Backend(_) => Some(502),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            RelayError::Read(ReadError::Truncated { .. }) => "truncated",
            RelayError::Read(_) => "read_error",
            RelayError::Backend(e) => e.kind(),
            RelayError::ClientDisconnected => "client_disconnected",
            RelayError::Write(_) => "write_error",
            _ => "error",
        }
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
