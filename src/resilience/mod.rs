//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Connection to backend:
//!     → retries.rs (is the failure transient? attempts left?)
//!     → backoff.rs (jittered exponential delay before the next attempt)
//! ```
//!
//! Every external call also carries a deadline; those are applied where the
//! call is made (reader, forwarder, responder) with `tokio::time::timeout`.

pub mod backoff;
pub mod retries;

pub use retries::{is_retryable_connect_error, RetryPolicy};
