//! The host pool's entry point
//!
//! [`ConnectionProvider`] owns the lifecycle; [`ManagedConnection`] is what it hands out.

pub mod connection;
pub mod lifecycle;

pub use connection::ManagedConnection;
pub use lifecycle::{ConnectionProvider, ProviderState, ValidationResult};
