//! Observability: structured logging and metrics
//!
//! The connector logs through `tracing` everywhere; hosts that already install a
//! subscriber can ignore [`init_logging`] entirely.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{fault_span, lifecycle_span, session_span};
