//! The connection handle given to the host pool

use crate::error::{ConnectorError, ConnectorResult};
use crate::fault::{FaultListenerHub, FaultObserver, ObserverId};
use crate::session::{ContextKey, SessionManager};
use crate::support::{
    AckMode, BrokerConnection, BrokerError, BrokerSession, ConsumerAckMode, ConsumerSpec,
    Destination, MessageConsumer, MessageProducer, ProtocolSupport, ProtocolVersion,
};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A connection produced by [`ConnectionProvider::connect`](super::ConnectionProvider::connect)
///
/// Sessions are bound per execution context through the provider's session manager.
///
/// Fault observers registered here go to the hub of the connect cycle that produced the
/// connection. Disconnecting any connection of the provider ends that cycle for all of
/// them: the hub is suppressed, including for sibling connections still in use, and
/// observers have to be registered again on a connection from the next `connect`.
pub struct ManagedConnection {
    id: Uuid,
    connection: Arc<dyn BrokerConnection>,
    support: Arc<dyn ProtocolSupport>,
    sessions: Arc<SessionManager>,
    fault_hub: Arc<FaultListenerHub>,
    cached: bool,
    created_at: DateTime<Utc>,
}

impl ManagedConnection {
    pub(crate) fn new(
        connection: Arc<dyn BrokerConnection>,
        support: Arc<dyn ProtocolSupport>,
        sessions: Arc<SessionManager>,
        fault_hub: Arc<FaultListenerHub>,
        cached: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            support,
            sessions,
            fault_hub,
            cached,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.support.version()
    }

    /// The underlying broker connection (a shared handle when caching is enabled)
    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn fault_hub(&self) -> &Arc<FaultListenerHub> {
        &self.fault_hub
    }

    /// Session bound to `context`, created on first use
    pub async fn session(
        &self,
        context: &ContextKey,
        transacted: bool,
        ack_mode: AckMode,
    ) -> ConnectorResult<Arc<dyn BrokerSession>> {
        let connection = self.connection.clone();
        let support = self.support.clone();
        self.sessions
            .get_or_create_session(context, self.id, transacted, ack_mode, move || async move {
                support
                    .create_session(connection.as_ref(), transacted, ack_mode)
                    .await
            })
            .await
            .map_err(ConnectorError::from)
    }

    /// Session for a consumer operation, acknowledging the way `ack` needs
    pub async fn consumer_session(
        &self,
        context: &ContextKey,
        ack: ConsumerAckMode,
    ) -> ConnectorResult<Arc<dyn BrokerSession>> {
        self.session(context, false, ack.session_ack_mode()).await
    }

    pub async fn release_session(&self, context: &ContextKey) -> bool {
        self.sessions.release_session(context).await
    }

    /// Producer on `session`, checked against this connection's protocol version
    pub async fn create_producer(
        &self,
        session: &dyn BrokerSession,
        destination: &Destination,
    ) -> ConnectorResult<Arc<dyn MessageProducer>> {
        Ok(self.support.create_producer(session, destination).await?)
    }

    /// Consumer on `session`; features the protocol version lacks are rejected
    pub async fn create_consumer(
        &self,
        session: &dyn BrokerSession,
        spec: &ConsumerSpec,
    ) -> ConnectorResult<Arc<dyn MessageConsumer>> {
        self.support
            .create_consumer(session, spec)
            .await
            .map_err(|e| match e {
                BrokerError::Unsupported { .. } => ConnectorError::configuration(e.to_string()),
                other => ConnectorError::from(other),
            })
    }

    /// Observe faults until the current connect cycle ends
    pub fn register_fault_observer(&self, observer: Arc<dyn FaultObserver>) -> ObserverId {
        self.fault_hub.add_observer(observer)
    }

    pub fn remove_fault_observer(&self, id: ObserverId) -> bool {
        self.fault_hub.remove_observer(id)
    }

    pub(crate) async fn stop(&self) -> Result<(), BrokerError> {
        self.connection.stop().await
    }

    /// Release every bound session, then close the connection
    pub(crate) async fn dispose(self) -> Result<(), BrokerError> {
        let released = self.sessions.release_connection(self.id).await;
        debug!(connection_id = %self.id, released, "Disposing connection");
        self.connection.close().await
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("protocol_version", &self.protocol_version())
            .field("cached", &self.cached)
            .field("fault_hub", &self.fault_hub.id())
            .field("created_at", &self.created_at)
            .finish()
    }
}
