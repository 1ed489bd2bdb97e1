//! Connection provider lifecycle
//!
//! `Uninitialised -> Initialised -> Connected <-> Disconnected -> Disposed`
//!
//! The host pool drives the provider: `initialise` once, then any number of
//! `connect`/`validate`/`disconnect` calls, then `dispose`. Every method takes `&self`;
//! state lives behind short-lived std locks that are never held across an `.await`.

use super::connection::ManagedConnection;
use crate::caching::{CachingConfiguration, CachingConnectionFactory, CachingStrategy, Credentials};
use crate::config::{is_blank, ConnectorConfig};
use crate::error::{sanitize_error_message, ConnectorError, ConnectorResult};
use crate::fault::{FaultListenerHub, FaultRelay};
use crate::observability::metrics;
use crate::session::SessionManager;
use crate::support::{
    support_for, BrokerConnection, BrokerError, ConnectionFactory, ConnectionFactorySource,
    ExceptionListener, ProtocolSupport, ProtocolVersion,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the provider is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Uninitialised,
    Initialised,
    Connected,
    Disconnected,
    Disposed,
}

impl ProviderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderState::Uninitialised => "uninitialised",
            ProviderState::Initialised => "initialised",
            ProviderState::Connected => "connected",
            ProviderState::Disconnected => "disconnected",
            ProviderState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`ConnectionProvider::validate`]
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Success,
    Failure {
        message: String,
        cause: Option<BrokerError>,
    },
}

impl ValidationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ValidationResult::Success)
    }
}

/// Everything `initialise` resolved; cloned out of the lock for each operation
#[derive(Clone)]
struct ActiveFactory {
    factory: Arc<dyn ConnectionFactory>,
    support: Arc<dyn ProtocolSupport>,
    caching: Option<CachingConfiguration>,
    credentials: Option<Credentials>,
}

enum OpenError {
    NoConnection,
    Broker(BrokerError),
}

impl From<BrokerError> for OpenError {
    fn from(e: BrokerError) -> Self {
        OpenError::Broker(e)
    }
}

/// Creates, validates and tears down broker connections for a host pool
pub struct ConnectionProvider {
    config: ConnectorConfig,
    source: Arc<dyn ConnectionFactorySource>,
    strategy: CachingStrategy,
    sessions: Arc<SessionManager>,
    relay: Arc<FaultRelay>,
    state: RwLock<ProviderState>,
    active: RwLock<Option<ActiveFactory>>,
    /// Connections handed out and not yet disconnected
    open_connections: Mutex<HashSet<Uuid>>,
}

impl ConnectionProvider {
    pub fn new(config: ConnectorConfig, source: Arc<dyn ConnectionFactorySource>) -> Self {
        let strategy = config.caching.strategy();
        Self {
            config,
            source,
            strategy,
            sessions: Arc::new(SessionManager::new()),
            relay: Arc::new(FaultRelay::new()),
            state: RwLock::new(ProviderState::Uninitialised),
            active: RwLock::new(None),
            open_connections: Mutex::new(HashSet::new()),
        }
    }

    /// Override the caching strategy derived from the configuration
    pub fn with_caching_strategy(mut self, strategy: CachingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Share a session manager between providers
    pub fn with_session_manager(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn state(&self) -> ProviderState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.config.connection.protocol_version
    }

    /// True once `initialise` wrapped the factory with the session cache
    pub fn is_cache_enabled(&self) -> bool {
        self.caching_configuration().is_some()
    }

    pub fn caching_configuration(&self) -> Option<CachingConfiguration> {
        self.active_factory().and_then(|active| active.caching)
    }

    /// Hub observers registered now will be notified of faults
    pub fn fault_hub(&self) -> Arc<FaultListenerHub> {
        self.relay.current_hub()
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn active_factory(&self) -> Option<ActiveFactory> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_state(&self, next: ProviderState) {
        let previous = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            info!(from = %previous, to = %next, "Provider state changed");
        }
        metrics().set_provider_state(next.as_str());
    }

    fn require_usable(&self, operation: &str) -> ConnectorResult<ActiveFactory> {
        match self.state() {
            ProviderState::Uninitialised => Err(ConnectorError::illegal_state(format!(
                "Cannot {operation}: provider has not been initialised"
            ))),
            ProviderState::Disposed => Err(ConnectorError::illegal_state(format!(
                "Cannot {operation}: provider has been disposed"
            ))),
            _ => self.active_factory().ok_or_else(|| {
                ConnectorError::illegal_state(format!("Cannot {operation}: no active factory"))
            }),
        }
    }

    /// Resolve the protocol support, obtain and prepare the factory, apply caching
    #[tracing::instrument(name = "provider_initialise", skip(self), fields(dialect = %self.protocol_version()))]
    pub async fn initialise(&self) -> ConnectorResult<()> {
        match self.state() {
            ProviderState::Uninitialised => {}
            ProviderState::Disposed => {
                return Err(ConnectorError::illegal_state(
                    "Cannot initialise a disposed provider",
                ))
            }
            other => {
                return Err(ConnectorError::illegal_state(format!(
                    "Provider is already initialised (state: {other})"
                )))
            }
        }

        let support = support_for(self.protocol_version());

        let credentials = self.resolve_credentials()?;

        let raw = self
            .source
            .connection_factory()
            .await
            .map_err(|e| ConnectorError::initialisation("connection factory lookup", e))?;
        raw.initialise()
            .await
            .map_err(|e| ConnectorError::initialisation(raw.name(), e))?;

        let caching = self.strategy.resolve(raw.as_ref());
        let factory: Arc<dyn ConnectionFactory> = match caching {
            Some(configuration) => {
                let listener: Arc<dyn ExceptionListener> = self.relay.clone();
                let wrapped = CachingConnectionFactory::new(
                    raw.clone(),
                    configuration,
                    support.clone(),
                    listener,
                )
                .with_credentials(credentials.clone())
                .with_client_id(self.config.client_id().map(str::to_string));
                info!(
                    factory = %raw.name(),
                    session_cache_size = configuration.session_cache_size.get(),
                    cache_producers = configuration.cache_producers,
                    cache_consumers = configuration.cache_consumers,
                    "Caching enabled"
                );
                Arc::new(wrapped)
            }
            None => {
                debug!(
                    factory = %raw.name(),
                    xa = raw.is_xa_capable(),
                    caching = raw.is_caching(),
                    "Using connection factory without caching"
                );
                raw
            }
        };

        {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state != ProviderState::Uninitialised {
                return Err(ConnectorError::illegal_state(format!(
                    "Provider changed state during initialisation (state: {})",
                    *state
                )));
            }
            *self
                .active
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ActiveFactory {
                factory,
                support,
                caching,
                credentials,
            });
            *state = ProviderState::Initialised;
        }
        info!(state = %ProviderState::Initialised, "Provider initialised");
        metrics().set_provider_state(ProviderState::Initialised.as_str());
        Ok(())
    }

    fn resolve_credentials(&self) -> ConnectorResult<Option<Credentials>> {
        let username = self.config.username();
        if is_blank(username) {
            return Ok(None);
        }
        let password = self.config.password().map_err(|e| {
            ConnectorError::initialisation(
                "credentials",
                BrokerError::authentication(e.to_string()),
            )
        })?;
        Ok(username.map(|u| Credentials::new(u, password.unwrap_or_default())))
    }

    /// Create and start a connection
    ///
    /// A failure leaves the provider connectable: the factory is stopped best effort so
    /// a retry starts from a clean slate.
    #[tracing::instrument(name = "provider_connect", skip(self))]
    pub async fn connect(&self) -> ConnectorResult<ManagedConnection> {
        let active = self.require_usable("connect")?;
        metrics().connection_attempt();
        let hub = self.relay.begin_connect();

        let connection = match self.open(&active).await {
            Ok(connection) => connection,
            Err(error) => {
                metrics().connection_failed();
                if let Err(stop_error) = active.factory.stop().await {
                    debug!(error = %stop_error, "Failed to stop connection factory after connect failure");
                }
                return Err(match error {
                    OpenError::NoConnection => ConnectorError::illegal_state(format!(
                        "Connection factory {} returned no connection",
                        active.factory.name()
                    )),
                    OpenError::Broker(e) if e.is_configuration() => {
                        ConnectorError::configuration(sanitize_error_message(&e.to_string()))
                    }
                    OpenError::Broker(e) => {
                        warn!(error = %sanitize_error_message(&e.to_string()), "Failed to create connection");
                        ConnectorError::connection_creation(e)
                    }
                });
            }
        };

        let managed = ManagedConnection::new(
            connection,
            active.support.clone(),
            self.sessions.clone(),
            hub,
            active.caching.is_some(),
        );
        self.open_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(managed.id());
        self.set_state(ProviderState::Connected);
        metrics().connection_established();
        info!(
            connection_id = %managed.id(),
            cached = managed.is_cached(),
            dialect = %managed.protocol_version(),
            "Connection established"
        );
        Ok(managed)
    }

    async fn open(&self, active: &ActiveFactory) -> Result<Arc<dyn BrokerConnection>, OpenError> {
        let factory = active.factory.as_ref();
        let created = match (&active.caching, &active.credentials) {
            (None, Some(credentials)) => {
                active
                    .support
                    .create_connection_with_credentials(
                        factory,
                        &credentials.username,
                        credentials.password(),
                    )
                    .await?
            }
            _ => active.support.create_connection(factory).await?,
        };
        let connection = created.ok_or(OpenError::NoConnection)?;

        if active.caching.is_none() {
            if let Err(e) = self.prepare_uncached(connection.as_ref()) {
                close_quietly(connection.as_ref()).await;
                return Err(e.into());
            }
        }

        if let Err(e) = connection.start().await {
            if active.caching.is_none() {
                close_quietly(connection.as_ref()).await;
            }
            return Err(e.into());
        }
        Ok(connection)
    }

    /// Client id and exception listener for connections the caching factory did not set up
    fn prepare_uncached(&self, connection: &dyn BrokerConnection) -> Result<(), BrokerError> {
        if let Some(client_id) = self.config.client_id().filter(|id| !is_blank(Some(id))) {
            if connection.client_id().as_deref() != Some(client_id) {
                connection.set_client_id(client_id)?;
            }
        }

        if connection.exception_listener().is_none() {
            let listener: Arc<dyn ExceptionListener> = self.relay.clone();
            if let Err(e) = connection.set_exception_listener(listener) {
                debug!(error = %e, "Could not register exception listener");
            }
        }
        Ok(())
    }

    /// Check the connection is still usable by starting it again
    #[tracing::instrument(name = "provider_validate", skip(self, connection), fields(connection_id = %connection.id()))]
    pub async fn validate(&self, connection: &ManagedConnection) -> ValidationResult {
        match connection.connection().start().await {
            Ok(()) => {
                metrics().connection_validated(true);
                ValidationResult::Success
            }
            Err(e) => {
                metrics().connection_validated(false);
                let message = format!(
                    "Invalid connection provided: Connection could not be started. {}",
                    sanitize_error_message(&e.to_string())
                );
                debug!(message = %message, "Connection validation failed");
                ValidationResult::Failure {
                    message,
                    cause: Some(e),
                }
            }
        }
    }

    /// Stop and dispose `connection`
    ///
    /// Faults raised while tearing down are not forwarded to observers. Stop failures
    /// are logged; dispose failures are returned.
    #[tracing::instrument(name = "provider_disconnect", skip(self, connection), fields(connection_id = %connection.id()))]
    pub async fn disconnect(&self, connection: ManagedConnection) -> ConnectorResult<()> {
        self.relay.begin_disconnect();
        let connection_id = connection.id();

        if let Err(e) = connection.stop().await {
            warn!(error = %sanitize_error_message(&e.to_string()), "Failed to stop connection");
        }

        let result = connection
            .dispose()
            .await
            .map_err(|source| ConnectorError::Dispose { source });

        let remaining = {
            let mut open = self
                .open_connections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            open.remove(&connection_id);
            open.len()
        };
        metrics().connection_disconnected();
        if remaining == 0 && self.state() == ProviderState::Connected {
            self.set_state(ProviderState::Disconnected);
        }
        result
    }

    /// Dispose the factory; the provider cannot be used afterwards
    ///
    /// Sessions still bound to connections that were never disconnected are released
    /// first.
    #[tracing::instrument(name = "provider_dispose", skip(self))]
    pub async fn dispose(&self) {
        if self.state() == ProviderState::Disposed {
            return;
        }
        self.set_state(ProviderState::Disposed);
        self.relay.begin_disconnect();

        let abandoned: Vec<Uuid> = self
            .open_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();
        for connection_id in abandoned {
            let released = self.sessions.release_connection(connection_id).await;
            debug!(%connection_id, released, "Released sessions of undisconnected connection");
        }

        let active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(active) = active {
            if let Err(e) = active.factory.dispose().await {
                warn!(
                    factory = %active.factory.name(),
                    error = %sanitize_error_message(&e.to_string()),
                    "Failed to dispose connection factory"
                );
            }
        }
    }
}

impl fmt::Debug for ConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProvider")
            .field("state", &self.state())
            .field("dialect", &self.protocol_version())
            .field("strategy", &self.strategy)
            .field(
                "open_connections",
                &self
                    .open_connections
                    .lock()
                    .map(|open| open.len())
                    .unwrap_or_default(),
            )
            .finish()
    }
}

async fn close_quietly(connection: &dyn BrokerConnection) {
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Failed to close connection after setup failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::StaticFactorySource;
    use crate::testing::mocks::MockConnectionFactory;

    fn provider(raw: &Arc<MockConnectionFactory>, config: ConnectorConfig) -> ConnectionProvider {
        ConnectionProvider::new(config, Arc::new(StaticFactorySource::new(raw.clone())))
    }

    #[tokio::test]
    async fn test_states_through_lifecycle() {
        let raw = Arc::new(MockConnectionFactory::new());
        let provider = provider(&raw, ConnectorConfig::default());
        assert_eq!(provider.state(), ProviderState::Uninitialised);

        provider.initialise().await.unwrap();
        assert_eq!(provider.state(), ProviderState::Initialised);
        assert!(provider.is_cache_enabled());

        let connection = provider.connect().await.unwrap();
        assert_eq!(provider.state(), ProviderState::Connected);

        provider.disconnect(connection).await.unwrap();
        assert_eq!(provider.state(), ProviderState::Disconnected);

        provider.dispose().await;
        assert_eq!(provider.state(), ProviderState::Disposed);
        assert_eq!(raw.dispose_calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_before_initialise_is_illegal() {
        let raw = Arc::new(MockConnectionFactory::new());
        let provider = provider(&raw, ConnectorConfig::default());

        let err = provider.connect().await.unwrap_err();
        assert!(matches!(err, ConnectorError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_initialise_twice_is_illegal() {
        let raw = Arc::new(MockConnectionFactory::new());
        let provider = provider(&raw, ConnectorConfig::default());
        provider.initialise().await.unwrap();

        let err = provider.initialise().await.unwrap_err();
        assert!(matches!(err, ConnectorError::IllegalState { .. }));
        assert_eq!(raw.initialise_calls(), 1);
    }

    #[tokio::test]
    async fn test_initialise_failure_retains_nothing() {
        let raw = Arc::new(MockConnectionFactory::new());
        raw.fail_initialise(true);
        let provider = provider(&raw, ConnectorConfig::default());

        let err = provider.initialise().await.unwrap_err();

        assert!(matches!(err, ConnectorError::Initialisation { .. }));
        assert_eq!(provider.state(), ProviderState::Uninitialised);
        assert!(!provider.is_cache_enabled());
    }

    #[tokio::test]
    async fn test_missing_password_env_fails_initialise() {
        let raw = Arc::new(MockConnectionFactory::new());
        let mut config = ConnectorConfig::default();
        config.connection.username = Some("app".to_string());
        config.connection.password_env = Some("BROKERPOOL_TEST_UNSET_PASSWORD".to_string());
        let provider = provider(&raw, config);

        let err = provider.initialise().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Initialisation { .. }));
    }

    #[tokio::test]
    async fn test_xa_factory_is_used_uncached() {
        let raw = Arc::new(MockConnectionFactory::new().xa_capable());
        let provider = provider(&raw, ConnectorConfig::default());
        provider.initialise().await.unwrap();

        assert!(!provider.is_cache_enabled());
        let connection = provider.connect().await.unwrap();
        assert!(!connection.is_cached());
    }

    #[tokio::test]
    async fn test_no_connection_is_illegal_state() {
        let raw = Arc::new(MockConnectionFactory::new());
        raw.return_no_connection(true);
        let provider = provider(&raw, ConnectorConfig::default());
        provider.initialise().await.unwrap();

        let err = provider.connect().await.unwrap_err();
        assert!(matches!(err, ConnectorError::IllegalState { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_terminal() {
        let raw = Arc::new(MockConnectionFactory::new());
        let provider = provider(&raw, ConnectorConfig::default());
        provider.initialise().await.unwrap();

        provider.dispose().await;
        provider.dispose().await;

        assert_eq!(raw.dispose_calls(), 1);
        assert!(matches!(
            provider.initialise().await,
            Err(ConnectorError::IllegalState { .. })
        ));
        assert!(matches!(
            provider.connect().await,
            Err(ConnectorError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_validation_result_helpers() {
        assert!(ValidationResult::Success.is_success());
        let failure = ValidationResult::Failure {
            message: "down".to_string(),
            cause: None,
        };
        assert!(!failure.is_success());
    }
}
