//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (resolve, bind, bounded backlog, connection limits)
//!     → connection.rs (connection ID, state machine, drain tracking)
//!     → reader.rs (bounded, framing-aware request read)
//!     → Hand off to the relay
//!
//! Connection States:
//!     Accepted → Reading → Forwarding → Responding → Closed
//!                    (any live state) → Errored
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue and semaphore prevent resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Inbound requests never exceed a fixed buffer; overflow is an error

pub mod connection;
pub mod listener;
pub mod reader;

pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionTracker};
pub use listener::{Listener, ListenerError};
pub use reader::{BoundedReader, InboundRequest, ParsedInbound, ReadError, ReadStatus};
