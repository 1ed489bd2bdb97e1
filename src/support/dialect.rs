//! Protocol dialect selection
//!
//! Each supported protocol generation gets its own [`ProtocolSupport`] implementation.
//! The implementations share the creation logic and differ only in which consumer
//! features they accept, so selecting one is a pure table lookup done once at
//! provider initialisation.

use super::{
    AckMode, BrokerConnection, BrokerError, BrokerSession, ConnectionFactory, ConsumerSpec,
    Destination, MessageConsumer, MessageProducer,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Supported protocol generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "1.0.2b")]
    V102b,
    #[default]
    #[serde(rename = "1.1")]
    V11,
    #[serde(rename = "2.0")]
    V20,
}

impl ProtocolVersion {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolVersion::V102b => "1.0.2b",
            ProtocolVersion::V11 => "1.1",
            ProtocolVersion::V20 => "2.0",
        }
    }

    /// Shared subscriptions arrived with 2.0
    pub fn supports_shared_subscriptions(&self) -> bool {
        matches!(self, ProtocolVersion::V20)
    }

    /// 1.0.2b only understands no-local on topic subscribers
    pub fn supports_no_local_on_queues(&self) -> bool {
        !matches!(self, ProtocolVersion::V102b)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Creation operations for one protocol generation
#[async_trait]
pub trait ProtocolSupport: Send + Sync {
    fn version(&self) -> ProtocolVersion;

    async fn create_connection(
        &self,
        factory: &dyn ConnectionFactory,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        factory.create_connection().await
    }

    async fn create_connection_with_credentials(
        &self,
        factory: &dyn ConnectionFactory,
        username: &str,
        password: &str,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        factory
            .create_connection_with_credentials(username, password)
            .await
    }

    async fn create_session(
        &self,
        connection: &dyn BrokerConnection,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        connection.create_session(transacted, ack_mode).await
    }

    async fn create_producer(
        &self,
        session: &dyn BrokerSession,
        destination: &Destination,
    ) -> Result<Arc<dyn MessageProducer>, BrokerError> {
        session.create_producer(destination).await
    }

    async fn create_consumer(
        &self,
        session: &dyn BrokerSession,
        spec: &ConsumerSpec,
    ) -> Result<Arc<dyn MessageConsumer>, BrokerError> {
        check_consumer_spec(self.version(), spec)?;
        session.create_consumer(spec).await
    }
}

/// Reject consumer features the dialect cannot express
pub fn check_consumer_spec(
    version: ProtocolVersion,
    spec: &ConsumerSpec,
) -> Result<(), BrokerError> {
    if spec.shared && !version.supports_shared_subscriptions() {
        return Err(BrokerError::unsupported("Shared subscription", version));
    }
    if spec.durable_subscription.is_some() && !spec.destination.is_topic() {
        return Err(BrokerError::unsupported(
            "Durable subscription on a queue",
            version,
        ));
    }
    if spec.no_local && !spec.destination.is_topic() && !version.supports_no_local_on_queues() {
        return Err(BrokerError::unsupported("No-local queue receiver", version));
    }
    Ok(())
}

/// 1.0.2b: separate queue and topic domains, no shared subscriptions
#[derive(Debug, Default)]
pub struct V102bSupport;

/// 1.1: unified domains
#[derive(Debug, Default)]
pub struct V11Support;

/// 2.0: adds shared subscriptions
#[derive(Debug, Default)]
pub struct V20Support;

#[async_trait]
impl ProtocolSupport for V102bSupport {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V102b
    }
}

#[async_trait]
impl ProtocolSupport for V11Support {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V11
    }
}

#[async_trait]
impl ProtocolSupport for V20Support {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::V20
    }
}

/// Look up the support implementation for a configured version
pub fn support_for(version: ProtocolVersion) -> Arc<dyn ProtocolSupport> {
    match version {
        ProtocolVersion::V102b => Arc::new(V102bSupport),
        ProtocolVersion::V11 => Arc::new(V11Support),
        ProtocolVersion::V20 => Arc::new(V20Support),
    }
}
