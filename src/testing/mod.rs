//! Testing utilities and mock implementations
//!
//! Mocks for the transport and store seams so the failover client can be
//! tested without a running broker.

pub mod mocks;

pub use mocks::*;
