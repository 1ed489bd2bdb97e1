//! Driver capability seam
//!
//! This module defines the traits a broker driver implements so the connector can
//! create connections, sessions, producers and consumers without knowing the wire
//! protocol, plus the small value types that cross that boundary.
//!
//! - [`ConnectionFactory`] produces raw [`BrokerConnection`]s
//! - [`BrokerConnection`] creates [`BrokerSession`]s and reports asynchronous
//!   failures to an [`ExceptionListener`]
//! - [`BrokerSession`] creates [`MessageProducer`]s and [`MessageConsumer`]s
//! - [`dialect`] selects the [`ProtocolSupport`] for a configured [`ProtocolVersion`]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub mod dialect;

pub use dialect::{support_for, ProtocolSupport, ProtocolVersion};

/// Errors raised by a broker driver
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Resource already closed: {message}")]
    Closed { message: String },

    #[error("Broker operation failed: {message}")]
    Operation { message: String },

    #[error("{feature} is not supported by protocol version {version}")]
    Unsupported { feature: String, version: String },

    #[error("Credential mismatch: cached connection belongs to user '{configured}', requested '{requested}'")]
    CredentialMismatch {
        configured: String,
        requested: String,
    },
}

impl BrokerError {
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn closed<S: Into<String>>(message: S) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    pub fn operation<S: Into<String>>(message: S) -> Self {
        Self::Operation {
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(feature: S, version: ProtocolVersion) -> Self {
        Self::Unsupported {
            feature: feature.into(),
            version: version.to_string(),
        }
    }

    /// True for errors caused by how the connector is configured rather than by the broker
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BrokerError::CredentialMismatch { .. } | BrokerError::Unsupported { .. }
        )
    }
}

/// Session acknowledgement mode as understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The session acknowledges each message as it is delivered
    Auto,
    /// The application acknowledges explicitly
    Client,
    /// Lazy acknowledgement, duplicates tolerated
    DupsOk,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => write!(f, "AUTO_ACKNOWLEDGE"),
            AckMode::Client => write!(f, "CLIENT_ACKNOWLEDGE"),
            AckMode::DupsOk => write!(f, "DUPS_OK_ACKNOWLEDGE"),
        }
    }
}

/// Acknowledgement mode as configured on a consumer operation
///
/// `Immediate` lets the broker client acknowledge on receipt, `Auto` acknowledges once
/// the consuming flow finishes and `Manual` leaves it to the application. The last two
/// both need client acknowledgement at the session level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerAckMode {
    Immediate,
    Auto,
    Manual,
    DupsOk,
}

impl ConsumerAckMode {
    pub fn session_ack_mode(&self) -> AckMode {
        match self {
            ConsumerAckMode::Immediate => AckMode::Auto,
            ConsumerAckMode::Auto | ConsumerAckMode::Manual => AckMode::Client,
            ConsumerAckMode::DupsOk => AckMode::DupsOk,
        }
    }
}

/// Target of a producer or source of a consumer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub fn queue<S: Into<String>>(name: S) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic<S: Into<String>>(name: S) -> Self {
        Destination::Topic(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{name}"),
            Destination::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

/// Everything that identifies a consumer for creation and caching
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerSpec {
    pub destination: Destination,
    pub selector: Option<String>,
    pub durable_subscription: Option<String>,
    pub no_local: bool,
    pub shared: bool,
}

impl ConsumerSpec {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            selector: None,
            durable_subscription: None,
            no_local: false,
            shared: false,
        }
    }

    pub fn with_selector<S: Into<String>>(mut self, selector: S) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_durable_subscription<S: Into<String>>(mut self, name: S) -> Self {
        self.durable_subscription = Some(name.into());
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }
}

/// Asynchronous failure reported by a connection outside of any call
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerFault {
    pub message: String,
    pub error_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl BrokerFault {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_code<S: Into<String>>(mut self, code: S) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

impl fmt::Display for BrokerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Receiver of asynchronous connection failures
///
/// Called on driver-owned threads, so implementations must not block for long.
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, fault: &BrokerFault);
}

/// Producer of raw broker connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Human readable name used in diagnostics
    fn name(&self) -> &str;

    /// Factories taking part in distributed (XA) transactions must never be cached
    fn is_xa_capable(&self) -> bool {
        false
    }

    /// True when the factory already caches connections or sessions itself
    fn is_caching(&self) -> bool {
        false
    }

    /// One-time preparation before the first connection is created
    async fn initialise(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Create a connection with the factory's default identity
    ///
    /// Drivers may decline to produce a connection by returning `Ok(None)`; the
    /// connector treats that as a broken driver rather than a transient failure.
    async fn create_connection(&self) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError>;

    /// Create a connection authenticated as `username`
    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError>;

    /// Stop whatever the factory holds on to (a cached connection, for instance)
    async fn stop(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Release the factory for good
    async fn dispose(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// A live connection to the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Start message delivery; starting a started connection is a no-op
    async fn start(&self) -> Result<(), BrokerError>;

    async fn stop(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn client_id(&self) -> Option<String>;

    fn set_client_id(&self, client_id: &str) -> Result<(), BrokerError>;

    fn exception_listener(&self) -> Option<Arc<dyn ExceptionListener>>;

    fn set_exception_listener(
        &self,
        listener: Arc<dyn ExceptionListener>,
    ) -> Result<(), BrokerError>;

    async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// A single-threaded unit of message work on a connection
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Identity of the underlying broker session
    fn id(&self) -> Uuid;

    fn is_transacted(&self) -> bool;

    fn ack_mode(&self) -> AckMode;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn MessageProducer>, BrokerError>;

    async fn create_consumer(
        &self,
        spec: &ConsumerSpec,
    ) -> Result<Arc<dyn MessageConsumer>, BrokerError>;

    async fn commit(&self) -> Result<(), BrokerError>;

    async fn rollback(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn id(&self) -> Uuid;

    fn destination(&self) -> &Destination;

    async fn send(&self, body: Bytes) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageConsumer: Send + Sync {
    fn id(&self) -> Uuid;

    fn spec(&self) -> &ConsumerSpec;

    /// Take the next available message without waiting
    async fn receive_no_wait(&self) -> Result<Option<Bytes>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Where the provider obtains its raw factory from
#[async_trait]
pub trait ConnectionFactorySource: Send + Sync {
    async fn connection_factory(&self) -> Result<Arc<dyn ConnectionFactory>, BrokerError>;
}

/// Source handing out an already built factory
pub struct StaticFactorySource {
    factory: Arc<dyn ConnectionFactory>,
}

impl StaticFactorySource {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl ConnectionFactorySource for StaticFactorySource {
    async fn connection_factory(&self) -> Result<Arc<dyn ConnectionFactory>, BrokerError> {
        Ok(self.factory.clone())
    }
}
