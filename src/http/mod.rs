//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! CLI arguments
//!     → request.rs (OutboundRequest builder, template for every relayed call)
//! Inbound bytes / backend bytes
//!     → framing.rs (head parsing, Content-Length / chunked / close framing)
//!     → response.rs (BackendResponse, gateway error responses)
//! ```

pub mod framing;
pub mod request;
pub mod response;

pub use framing::{BodyFraming, ChunkedDecoder, FramingError};
pub use request::{BuildError, HttpVersion, OutboundRequest, RequestBuilder};
pub use response::{error_response, BackendResponse, StatusLine};
