//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Resolve and bind to the configured host:port
//! - Listen with a bounded backlog
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;

use crate::config::ListenerConfig;

/// Host used when none is given.
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when the given one is missing, non-numeric or out of range.
pub const DEFAULT_PORT: u16 = 80;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Host name did not resolve.
    #[error("No such host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Failed to create or bind the socket.
    #[error("Cannot bind the socket to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Failed to listen on the bound socket.
    #[error("Cannot listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Failed to accept connection.
    #[error("Cannot accept connection from the client: {0}")]
    Accept(#[source] io::Error),
}

/// Empty host means [`DEFAULT_HOST`].
pub fn effective_host(host: &str) -> &str {
    if host.is_empty() {
        DEFAULT_HOST
    } else {
        host
    }
}

/// Parse a command-line port. Anything that is not a number in 1..=65535
/// falls back to [`DEFAULT_PORT`].
pub fn parse_port(raw: &str) -> u16 {
    match raw.trim().parse::<i64>() {
        Ok(n) if (1..=i64::from(u16::MAX)).contains(&n) => n as u16,
        _ => DEFAULT_PORT,
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
}

impl Listener {
    /// Resolve, bind and listen on the configured address.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let host = effective_host(&config.host);
        let addr = resolve(host, config.port).await?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        socket.set_reuseaddr(true).map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        socket.bind(addr).map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let inner = socket
            .listen(config.backlog)
            .map_err(|source| ListenerError::Listen { addr, source })?;

        let local_addr = inner
            .local_addr()
            .map_err(|source| ListenerError::Listen { addr, source })?;

        tracing::info!(
            address = %local_addr,
            backlog = config.backlog,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Accept(io::Error::other("connection limit closed")))?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Resolve `host:port`, preferring an IPv4 address.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let resolve_err = |source| ListenerError::Resolve {
        host: host.to_string(),
        source,
    };
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(resolve_err)?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| resolve_err(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
