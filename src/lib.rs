//! brokerpool - broker connection lifecycle, pooling and caching
//!
//! A connection provider for message-broker connectors. A host pool calls
//! `initialise`, `connect`, `validate`, `disconnect` and `dispose`; the provider creates
//! connections through a pluggable driver, optionally shares one physical connection
//! behind a session cache, binds sessions to execution contexts and forwards
//! asynchronous connection faults to registered observers.
//!
//! # Overview
//!
//! - [`support`] - the driver traits and protocol dialects
//! - [`caching`] - caching strategy and the cache-wrapping connection factory
//! - [`fault`] - fault listener hub and relay
//! - [`session`] - per-context session binding
//! - [`provider`] - the lifecycle the host pool drives
//! - [`testing`] - an in-memory driver
//!
//! # Quick Start
//!
//! ```rust
//! use brokerpool::testing::MockConnectionFactory;
//! use brokerpool::{
//!     AckMode, BrokerSession, ConnectionProvider, ConnectorConfig, ContextKey, StaticFactorySource,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(MockConnectionFactory::new());
//! let provider = ConnectionProvider::new(
//!     ConnectorConfig::default(),
//!     Arc::new(StaticFactorySource::new(factory)),
//! );
//!
//! provider.initialise().await?;
//! let connection = provider.connect().await?;
//! assert!(provider.validate(&connection).await.is_success());
//!
//! let context = ContextKey::new("flow-1");
//! let session = connection.session(&context, false, AckMode::Auto).await?;
//! let again = connection.session(&context, false, AckMode::Auto).await?;
//! assert_eq!(session.id(), again.id());
//!
//! provider.disconnect(connection).await?;
//! provider.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod caching;
pub mod config;
pub mod error;
pub mod fault;
pub mod observability;
pub mod provider;
pub mod session;
pub mod support;
pub mod testing;

pub use caching::{CachingConfiguration, CachingConnectionFactory, CachingStrategy};
pub use config::{ConfigError, ConnectorConfig};
pub use error::{ConnectorError, ConnectorResult};
pub use fault::{FaultListenerHub, FaultObserver, FaultRelay, ObserverResult};
pub use provider::{ConnectionProvider, ManagedConnection, ProviderState, ValidationResult};
pub use session::{ContextKey, SessionManager};
pub use support::{
    AckMode, BrokerConnection, BrokerError, BrokerFault, BrokerSession, ConnectionFactory,
    ConnectionFactorySource, ConsumerAckMode, ConsumerSpec, Destination, ExceptionListener,
    MessageConsumer, MessageProducer, ProtocolVersion, StaticFactorySource,
};
