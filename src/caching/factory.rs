//! Connection factory that shares one physical connection and caches its sessions
//!
//! The factory wraps a raw [`ConnectionFactory`] and implements the same trait. Every
//! connection it returns is a [`SharedConnection`] handle onto the single physical
//! connection; stopping or closing a handle leaves the physical connection alone.
//! Sessions are lent from a pool bounded by the configured session cache size: each
//! caller holds its own session until it closes it, and only returned sessions are
//! reused or evicted.

use super::lru::SessionSlot;
use super::pool::{SessionLease, SessionPool};
use super::session::CachedSession;
use super::strategy::CachingConfiguration;
use crate::config::is_blank;
use crate::support::{
    AckMode, BrokerConnection, BrokerError, BrokerSession, ConnectionFactory, ExceptionListener,
    ProtocolSupport,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Username and password pair; the password never shows up in `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// The one real connection behind every [`SharedConnection`]
struct PhysicalConnection {
    id: Uuid,
    connection: Arc<dyn BrokerConnection>,
    username: Option<String>,
    support: Arc<dyn ProtocolSupport>,
    configuration: CachingConfiguration,
    pool: Arc<SessionPool>,
}

impl PhysicalConnection {
    fn new(
        connection: Arc<dyn BrokerConnection>,
        username: Option<String>,
        support: Arc<dyn ProtocolSupport>,
        configuration: CachingConfiguration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            username,
            support,
            configuration,
            pool: Arc::new(SessionPool::new(configuration.session_cache_size)),
        }
    }

    /// Lend a cached session of the slot, creating one on a miss
    async fn session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<SessionLease, BrokerError> {
        let slot = SessionSlot::new(transacted, ack_mode);
        self.pool
            .checkout(slot, move || async move {
                let physical = self
                    .support
                    .create_session(self.connection.as_ref(), transacted, ack_mode)
                    .await?;
                Ok(CachedSession::new(
                    slot,
                    physical,
                    self.support.clone(),
                    self.configuration,
                ))
            })
            .await
            .map_err(|e| match e {
                BrokerError::Closed { .. } => BrokerError::closed(format!(
                    "Cached connection {} has been reset",
                    self.id
                )),
                other => other,
            })
    }

    async fn session_count(&self) -> usize {
        self.pool.session_count().await
    }

    /// Close every cached session, lent or idle, then the connection
    ///
    /// The first failure is returned.
    async fn reset(&self) -> Result<(), BrokerError> {
        let drained = self.pool.close().await;

        let mut first_error: Option<BrokerError> = None;
        for session in drained {
            if let Err(e) = session.physical_close().await {
                warn!(connection_id = %self.id, error = %e, "Failed to close cached session");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.connection.stop().await {
            debug!(connection_id = %self.id, error = %e, "Failed to stop cached connection");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.connection.close().await {
            first_error.get_or_insert(e);
        }

        info!(connection_id = %self.id, "Cached connection reset");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Handle onto the shared physical connection
///
/// `start` is forwarded; `stop` and `close` only end this handle's use of the
/// connection. Sessions are lent from the factory's session cache and go back to it
/// when closed.
pub struct SharedConnection {
    physical: Arc<PhysicalConnection>,
}

impl SharedConnection {
    fn new(physical: Arc<PhysicalConnection>) -> Self {
        Self { physical }
    }

    /// Id of the physical connection behind this handle
    pub fn physical_id(&self) -> Uuid {
        self.physical.id
    }
}

#[async_trait]
impl BrokerConnection for SharedConnection {
    async fn start(&self) -> Result<(), BrokerError> {
        self.physical.connection.start().await
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        debug!(connection_id = %self.physical.id, "Ignoring stop on shared connection");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        debug!(connection_id = %self.physical.id, "Ignoring close on shared connection");
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        self.physical.connection.client_id()
    }

    fn set_client_id(&self, client_id: &str) -> Result<(), BrokerError> {
        if self.client_id().as_deref() == Some(client_id) {
            return Ok(());
        }
        Err(BrokerError::operation(
            "Client id of a shared connection is fixed by the caching factory",
        ))
    }

    fn exception_listener(&self) -> Option<Arc<dyn ExceptionListener>> {
        self.physical.connection.exception_listener()
    }

    fn set_exception_listener(
        &self,
        _listener: Arc<dyn ExceptionListener>,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::operation(
            "Exception listener of a shared connection is managed by the caching factory",
        ))
    }

    async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let lease = self.physical.session(transacted, ack_mode).await?;
        Ok(Arc::new(lease))
    }
}

/// Caching wrapper around a raw connection factory
pub struct CachingConnectionFactory {
    name: String,
    target: Arc<dyn ConnectionFactory>,
    support: Arc<dyn ProtocolSupport>,
    configuration: CachingConfiguration,
    listener: Arc<dyn ExceptionListener>,
    client_id: Option<String>,
    /// Configured credentials, or the first pair requested when none were configured
    credentials: std::sync::Mutex<Option<Credentials>>,
    state: Mutex<Option<Arc<PhysicalConnection>>>,
    disposed: AtomicBool,
}

impl CachingConnectionFactory {
    pub fn new(
        target: Arc<dyn ConnectionFactory>,
        configuration: CachingConfiguration,
        support: Arc<dyn ProtocolSupport>,
        listener: Arc<dyn ExceptionListener>,
    ) -> Self {
        Self {
            name: format!("caching({})", target.name()),
            target,
            support,
            configuration,
            listener,
            client_id: None,
            credentials: std::sync::Mutex::new(None),
            state: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Authenticate the physical connection; a blank username leaves it anonymous
    pub fn with_credentials(self, credentials: Option<Credentials>) -> Self {
        let credentials = credentials.filter(|c| !is_blank(Some(&c.username)));
        *self
            .credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credentials;
        self
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id.filter(|id| !is_blank(Some(id)));
        self
    }

    pub fn configuration(&self) -> CachingConfiguration {
        self.configuration
    }

    pub fn target(&self) -> &Arc<dyn ConnectionFactory> {
        &self.target
    }

    pub async fn has_physical_connection(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn cached_session_count(&self) -> usize {
        let physical = self.state.lock().await.clone();
        match physical {
            Some(physical) => physical.session_count().await,
            None => 0,
        }
    }

    fn configured_credentials(&self) -> Option<Credentials> {
        self.credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn shared_connection(
        &self,
        requested: Option<(&str, &str)>,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed(format!(
                "Connection factory {} has been disposed",
                self.name
            )));
        }

        let mut state = self.state.lock().await;
        let credentials = self.check_credentials(state.as_deref(), requested)?;

        if let Some(physical) = state.as_ref() {
            return Ok(Some(Arc::new(SharedConnection::new(physical.clone()))));
        }

        let Some(physical) = self.create_physical(credentials.clone()).await? else {
            return Ok(None);
        };
        if let (Some(_), Some(credentials)) = (requested, credentials) {
            self.credentials
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get_or_insert(credentials);
        }
        info!(
            connection_id = %physical.id,
            factory = %self.target.name(),
            authenticated = physical.username.is_some(),
            "Created cached physical connection"
        );
        *state = Some(physical.clone());
        Ok(Some(Arc::new(SharedConnection::new(physical))))
    }

    /// Credentials the physical connection is (or will be) created with
    ///
    /// A requested pair must match whatever the cached connection is bound to. With
    /// nothing configured the requested pair is used, and bound once creation succeeds.
    fn check_credentials(
        &self,
        physical: Option<&PhysicalConnection>,
        requested: Option<(&str, &str)>,
    ) -> Result<Option<Credentials>, BrokerError> {
        let bound = self
            .credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some((username, password)) = requested else {
            return Ok(bound.clone());
        };

        match bound.as_ref() {
            Some(credentials) if credentials.matches(username, password) => Ok(bound.clone()),
            Some(credentials) => Err(BrokerError::CredentialMismatch {
                configured: credentials.username.clone(),
                requested: username.to_string(),
            }),
            None if physical.is_some() => Err(BrokerError::CredentialMismatch {
                configured: "<anonymous>".to_string(),
                requested: username.to_string(),
            }),
            None => Ok(Some(Credentials::new(username, password))),
        }
    }

    async fn create_physical(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<Option<Arc<PhysicalConnection>>, BrokerError> {
        let created = match &credentials {
            Some(c) => {
                self.support
                    .create_connection_with_credentials(
                        self.target.as_ref(),
                        &c.username,
                        c.password(),
                    )
                    .await?
            }
            None => self.support.create_connection(self.target.as_ref()).await?,
        };
        let Some(connection) = created else {
            return Ok(None);
        };

        if let Some(client_id) = self.client_id.as_deref() {
            if connection.client_id().as_deref() != Some(client_id) {
                if let Err(e) = connection.set_client_id(client_id) {
                    if let Err(close_error) = connection.close().await {
                        debug!(error = %close_error, "Failed to close connection after client id rejection");
                    }
                    return Err(e);
                }
            }
        }

        if let Err(e) = connection.set_exception_listener(self.listener.clone()) {
            debug!(error = %e, "Could not register exception listener on cached connection");
        }

        Ok(Some(Arc::new(PhysicalConnection::new(
            connection,
            credentials.map(|c| c.username),
            self.support.clone(),
            self.configuration,
        ))))
    }

    /// Drop the physical connection and every cached session
    ///
    /// The next connection request creates a fresh physical connection.
    pub async fn reset(&self) -> Result<(), BrokerError> {
        let physical = self.state.lock().await.take();
        match physical {
            Some(physical) => physical.reset().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CachingConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingConnectionFactory")
            .field("name", &self.name)
            .field("configuration", &self.configuration)
            .field("client_id", &self.client_id)
            .field("credentials", &self.configured_credentials())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for CachingConnectionFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_caching(&self) -> bool {
        true
    }

    async fn initialise(&self) -> Result<(), BrokerError> {
        self.target.initialise().await
    }

    async fn create_connection(&self) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        self.shared_connection(None).await
    }

    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        self.shared_connection(Some((username, password))).await
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.reset().await
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let reset = self.reset().await;
        let disposed = self.target.dispose().await;
        reset.and(disposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{support_for, BrokerFault, Destination, ProtocolVersion};
    use crate::testing::mocks::{MockConnectionFactory, RecordingListener};
    use std::num::NonZeroUsize;

    fn caching_factory(
        raw: &Arc<MockConnectionFactory>,
        size: usize,
    ) -> (CachingConnectionFactory, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let configuration = CachingConfiguration::default()
            .with_session_cache_size(NonZeroUsize::new(size).unwrap());
        let factory = CachingConnectionFactory::new(
            raw.clone(),
            configuration,
            support_for(ProtocolVersion::V11),
            listener.clone(),
        );
        (factory, listener)
    }

    #[tokio::test]
    async fn test_repeat_requests_share_one_physical_connection() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);

        let first = factory.create_connection().await.unwrap().unwrap();
        let second = factory.create_connection().await.unwrap().unwrap();
        first.close().await.unwrap();
        first.stop().await.unwrap();

        assert_eq!(raw.connections_created(), 1);
        let physical = raw.last_connection().unwrap();
        assert!(!physical.is_closed());
        assert_eq!(physical.stop_calls(), 0);
        second.start().await.unwrap();
        assert!(physical.is_started());
        assert!(factory.is_caching());
    }

    #[tokio::test]
    async fn test_listener_registered_once_on_physical_connection() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, listener) = caching_factory(&raw, 4);

        for _ in 0..3 {
            factory.create_connection().await.unwrap().unwrap();
        }

        let physical = raw.last_connection().unwrap();
        assert_eq!(physical.listener_registrations(), 1);
        assert!(physical.emit_fault(&BrokerFault::new("socket closed")));
        assert_eq!(listener.faults().len(), 1);
    }

    #[tokio::test]
    async fn test_same_slot_returns_same_session() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 1);
        let connection = factory.create_connection().await.unwrap().unwrap();

        let a = connection.create_session(false, AckMode::Auto).await.unwrap();
        a.close().await.unwrap();
        let b = connection.create_session(false, AckMode::Auto).await.unwrap();

        assert_eq!(a.id(), b.id());
        assert_eq!(raw.last_connection().unwrap().sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_sessions_in_use_are_never_shared() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);
        let connection = factory.create_connection().await.unwrap().unwrap();

        let a = connection.create_session(true, AckMode::Auto).await.unwrap();
        let b = connection.create_session(true, AckMode::Auto).await.unwrap();
        a.close().await.unwrap();

        assert_ne!(a.id(), b.id());
        assert!(matches!(a.commit().await, Err(BrokerError::Closed { .. })));
        b.commit().await.unwrap();
        let physical = raw.last_connection().unwrap();
        assert_eq!(physical.session(0).unwrap().rollbacks(), 1);
        assert_eq!(physical.session(1).unwrap().rollbacks(), 0);
        assert_eq!(physical.session(1).unwrap().commits(), 1);
    }

    #[tokio::test]
    async fn test_eviction_closes_idle_session_before_returning_new_one() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 1);
        let connection = factory.create_connection().await.unwrap().unwrap();

        let plain = connection.create_session(false, AckMode::Auto).await.unwrap();
        plain.close().await.unwrap();
        let transacted = connection.create_session(true, AckMode::Auto).await.unwrap();

        assert_ne!(plain.id(), transacted.id());
        let physical = raw.last_connection().unwrap();
        assert!(physical.session(0).unwrap().is_closed());
        assert!(!physical.session(1).unwrap().is_closed());
        assert_eq!(factory.cached_session_count().await, 1);
    }

    #[tokio::test]
    async fn test_session_in_use_survives_cache_pressure() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 1);
        let connection = factory.create_connection().await.unwrap().unwrap();

        let held = connection.create_session(false, AckMode::Auto).await.unwrap();
        let other = connection.create_session(true, AckMode::Auto).await.unwrap();

        let physical = raw.last_connection().unwrap();
        assert!(!physical.session(0).unwrap().is_closed());
        assert!(held
            .create_producer(&Destination::queue("orders"))
            .await
            .is_ok());

        other.close().await.unwrap();
        assert!(physical.session(1).unwrap().is_closed());
        assert_eq!(factory.cached_session_count().await, 1);
    }

    #[tokio::test]
    async fn test_least_recently_returned_session_is_evicted() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 2);
        let connection = factory.create_connection().await.unwrap().unwrap();

        for (transacted, ack_mode) in [
            (false, AckMode::Auto),
            (false, AckMode::Client),
            // returning the auto-ack session again leaves the client-ack one oldest
            (false, AckMode::Auto),
        ] {
            let session = connection.create_session(transacted, ack_mode).await.unwrap();
            session.close().await.unwrap();
        }
        connection.create_session(true, AckMode::Auto).await.unwrap();

        let physical = raw.last_connection().unwrap();
        assert_eq!(physical.sessions_created(), 3);
        assert!(!physical.session(0).unwrap().is_closed());
        assert!(physical.session(1).unwrap().is_closed());
        assert!(!physical.session(2).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_configured_credentials_authenticate_physical_connection() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);
        let factory = factory.with_credentials(Some(Credentials::new("app", "secret")));

        factory.create_connection().await.unwrap().unwrap();
        factory
            .create_connection_with_credentials("app", "secret")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(raw.usernames(), vec![Some("app".to_string())]);
    }

    #[tokio::test]
    async fn test_credential_mismatch_is_rejected() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);
        let factory = factory.with_credentials(Some(Credentials::new("app", "secret")));

        let result = factory
            .create_connection_with_credentials("intruder", "guess")
            .await;

        match result {
            Err(BrokerError::CredentialMismatch {
                configured,
                requested,
            }) => {
                assert_eq!(configured, "app");
                assert_eq!(requested, "intruder");
            }
            _ => panic!("expected credential mismatch"),
        }
        assert_eq!(raw.connections_created(), 0);
    }

    #[tokio::test]
    async fn test_failed_creation_does_not_bind_requested_credentials() {
        let raw = Arc::new(MockConnectionFactory::new());
        raw.fail_next_creates(1);
        let (factory, _) = caching_factory(&raw, 4);

        assert!(factory
            .create_connection_with_credentials("app", "secret")
            .await
            .is_err());
        factory
            .create_connection_with_credentials("other", "pw")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(raw.usernames(), vec![Some("other".to_string())]);
    }

    #[tokio::test]
    async fn test_first_requested_credentials_bind_when_none_configured() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);

        factory
            .create_connection_with_credentials("app", "secret")
            .await
            .unwrap()
            .unwrap();
        let again = factory.create_connection_with_credentials("other", "pw").await;

        assert!(matches!(again, Err(BrokerError::CredentialMismatch { .. })));
        assert_eq!(raw.connections_created(), 1);
    }

    #[tokio::test]
    async fn test_client_id_applied_to_physical_connection() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);
        let factory = factory.with_client_id(Some("orders".to_string()));

        let connection = factory.create_connection().await.unwrap().unwrap();

        assert_eq!(connection.client_id().as_deref(), Some("orders"));
        assert!(connection.set_client_id("orders").is_ok());
        assert!(connection.set_client_id("other").is_err());
    }

    #[tokio::test]
    async fn test_creation_failure_leaves_no_cached_state() {
        let raw = Arc::new(MockConnectionFactory::new());
        raw.fail_next_creates(1);
        let (factory, _) = caching_factory(&raw, 4);

        assert!(factory.create_connection().await.is_err());
        assert!(!factory.has_physical_connection().await);

        factory.create_connection().await.unwrap().unwrap();
        assert!(factory.has_physical_connection().await);
    }

    #[tokio::test]
    async fn test_rejected_client_id_closes_connection() {
        let raw = Arc::new(MockConnectionFactory::new());
        raw.fail_client_id(true);
        let (factory, _) = caching_factory(&raw, 4);
        let factory = factory.with_client_id(Some("orders".to_string()));

        assert!(factory.create_connection().await.is_err());
        assert!(!factory.has_physical_connection().await);
        assert!(raw.last_connection().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_stop_resets_cache() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);
        let old_handle = factory.create_connection().await.unwrap().unwrap();
        old_handle.create_session(false, AckMode::Auto).await.unwrap();

        factory.stop().await.unwrap();

        let first = raw.connection(0).unwrap();
        assert!(first.is_closed());
        assert!(first.session(0).unwrap().is_closed());
        assert!(matches!(
            old_handle.create_session(false, AckMode::Auto).await,
            Err(BrokerError::Closed { .. })
        ));

        factory.create_connection().await.unwrap().unwrap();
        assert_eq!(raw.connections_created(), 2);
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let raw = Arc::new(MockConnectionFactory::new());
        let (factory, _) = caching_factory(&raw, 4);
        factory.create_connection().await.unwrap().unwrap();

        factory.dispose().await.unwrap();
        factory.dispose().await.unwrap();

        assert_eq!(raw.dispose_calls(), 1);
        assert!(matches!(
            factory.create_connection().await,
            Err(BrokerError::Closed { .. })
        ));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let rendered = format!("{:?}", Credentials::new("app", "hunter2"));
        assert!(rendered.contains("app"));
        assert!(!rendered.contains("hunter2"));
    }
}
