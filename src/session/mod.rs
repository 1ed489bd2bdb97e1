//! Per-context session binding

pub mod manager;

pub use manager::{ContextKey, SessionManager};
