//! Relay subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (server.rs)
//!     → BoundedReader (net) reads one request
//!     → forwarder.rs derives the outbound request from the template,
//!       connects to the backend and reads one framed response
//!     → responder.rs writes it back verbatim, or an error response
//! ```
//!
//! # Design Decisions
//! - One request per client connection and one backend connection per request
//! - Errors carry their client-facing status (`RelayError::status`)

pub mod forwarder;
pub mod responder;
pub mod server;
pub mod types;

pub use forwarder::{outbound_request, read_response, Forwarder};
pub use responder::Responder;
pub use server::{Relay, RelayServer};
pub use types::{BackendError, BackendTarget, BackendUrlError, ErrorKind, RelayError, RelayResult, WriteError};
