//! Testing utilities
//!
//! An in-memory broker driver for exercising the provider without a broker.

pub mod mocks;

pub use mocks::*;
