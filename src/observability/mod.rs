//! Observability for the failover client
//!
//! Structured logging with tracing; client counters live in
//! [`crate::client::ClientStats`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{replay_span, supervisor_span};
