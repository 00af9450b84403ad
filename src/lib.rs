//! HTTP to JSON-RPC relay library.
//!
//! Accepts HTTP POST calls on a local socket and relays each one, framed and
//! bounded, to a single JSON-RPC backend over HTTP/1.1.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod relay;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::RelayConfig;
pub use http::{BuildError, OutboundRequest};
pub use lifecycle::Shutdown;
pub use relay::{RelayError, RelayServer};
