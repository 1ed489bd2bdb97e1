//! In-memory broker driver
//!
//! Implements the driver traits without a broker so the provider, the cache and the
//! CLI simulation can be exercised end to end. Every object records what was done to it
//! and failures can be injected at each step.

use crate::support::{
    AckMode, BrokerConnection, BrokerError, BrokerFault, BrokerSession, ConnectionFactory,
    ConnectionFactorySource, ConsumerSpec, Destination, ExceptionListener, MessageConsumer,
    MessageProducer,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Failure switches shared by a factory and everything it creates
#[derive(Debug, Default)]
pub struct MockControls {
    fail_creates: AtomicUsize,
    return_no_connection: AtomicBool,
    fail_initialise: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_close: AtomicBool,
    fail_factory_stop: AtomicBool,
    fail_dispose: AtomicBool,
    fail_client_id: AtomicBool,
    fail_listener_registration: AtomicBool,
    fail_session_create: AtomicBool,
    fail_session_close: AtomicBool,
}

impl MockControls {
    fn take_create_failure(&self) -> bool {
        self.fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Mock raw connection factory
#[derive(Debug)]
pub struct MockConnectionFactory {
    name: String,
    xa: bool,
    caching: bool,
    controls: Arc<MockControls>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    initialise_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
}

impl Default for MockConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::named("mock-broker")
    }

    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            xa: false,
            caching: false,
            controls: Arc::new(MockControls::default()),
            connections: Mutex::new(Vec::new()),
            initialise_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
        }
    }

    pub fn xa_capable(mut self) -> Self {
        self.xa = true;
        self
    }

    pub fn already_caching(mut self) -> Self {
        self.caching = true;
        self
    }

    /// Fail the next `count` connection creations with `Unavailable`
    pub fn fail_next_creates(&self, count: usize) {
        self.controls.fail_creates.store(count, Ordering::SeqCst);
    }

    pub fn return_no_connection(&self, enabled: bool) {
        self.controls
            .return_no_connection
            .store(enabled, Ordering::SeqCst);
    }

    pub fn fail_initialise(&self, enabled: bool) {
        self.controls.fail_initialise.store(enabled, Ordering::SeqCst);
    }

    /// Affects connections already created as well as new ones
    pub fn fail_start(&self, enabled: bool) {
        self.controls.fail_start.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_connection_stop(&self, enabled: bool) {
        self.controls.fail_stop.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_connection_close(&self, enabled: bool) {
        self.controls.fail_close.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_factory_stop(&self, enabled: bool) {
        self.controls.fail_factory_stop.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_dispose(&self, enabled: bool) {
        self.controls.fail_dispose.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_client_id(&self, enabled: bool) {
        self.controls.fail_client_id.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_listener_registration(&self, enabled: bool) {
        self.controls
            .fail_listener_registration
            .store(enabled, Ordering::SeqCst);
    }

    pub fn fail_session_create(&self, enabled: bool) {
        self.controls
            .fail_session_create
            .store(enabled, Ordering::SeqCst);
    }

    pub fn fail_session_close(&self, enabled: bool) {
        self.controls
            .fail_session_close
            .store(enabled, Ordering::SeqCst);
    }

    pub fn connections_created(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<MockConnection>> {
        lock(&self.connections).get(index).cloned()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        lock(&self.connections).last().cloned()
    }

    /// Username of every connection created, `None` for anonymous ones
    pub fn usernames(&self) -> Vec<Option<String>> {
        lock(&self.connections)
            .iter()
            .map(|c| c.username.clone())
            .collect()
    }

    pub fn initialise_calls(&self) -> usize {
        self.initialise_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    /// Raise `fault` on every open connection; returns how many had a listener
    pub fn emit_fault(&self, fault: &BrokerFault) -> usize {
        let connections: Vec<_> = lock(&self.connections).clone();
        connections
            .iter()
            .filter(|c| !c.is_closed())
            .filter(|c| c.emit_fault(fault))
            .count()
    }

    fn create(&self, username: Option<&str>) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        if self.controls.take_create_failure() {
            return Err(BrokerError::unavailable(format!(
                "{}: connection refused",
                self.name
            )));
        }
        if self.controls.return_no_connection.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let connection = Arc::new(MockConnection::new(
            username.map(str::to_string),
            self.controls.clone(),
        ));
        lock(&self.connections).push(connection.clone());
        Ok(Some(connection))
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_xa_capable(&self) -> bool {
        self.xa
    }

    fn is_caching(&self) -> bool {
        self.caching
    }

    async fn initialise(&self) -> Result<(), BrokerError> {
        self.initialise_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_initialise.load(Ordering::SeqCst) {
            return Err(BrokerError::operation("factory initialisation failed"));
        }
        Ok(())
    }

    async fn create_connection(&self) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        self.create(None)
    }

    async fn create_connection_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Arc<dyn BrokerConnection>>, BrokerError> {
        if password == "wrong" {
            return Err(BrokerError::authentication(format!(
                "bad credentials for user {username}"
            )));
        }
        self.create(Some(username))
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_factory_stop.load(Ordering::SeqCst) {
            return Err(BrokerError::operation("factory stop failed"));
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_dispose.load(Ordering::SeqCst) {
            return Err(BrokerError::operation("factory dispose failed"));
        }
        Ok(())
    }
}

/// Mock broker connection
pub struct MockConnection {
    id: Uuid,
    username: Option<String>,
    controls: Arc<MockControls>,
    started: AtomicBool,
    closed: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    close_calls: AtomicUsize,
    client_id: Mutex<Option<String>>,
    listener: Mutex<Option<Arc<dyn ExceptionListener>>>,
    listener_registrations: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MockConnection {
    fn new(username: Option<String>, controls: Arc<MockControls>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
            controls,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            client_id: Mutex::new(None),
            listener: Mutex::new(None),
            listener_registrations: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn listener_registrations(&self) -> usize {
        self.listener_registrations.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn session(&self, index: usize) -> Option<Arc<MockSession>> {
        lock(&self.sessions).get(index).cloned()
    }

    /// Deliver `fault` to the registered listener the way a driver thread would
    pub fn emit_fault(&self, fault: &BrokerFault) -> bool {
        let listener = lock(&self.listener).clone();
        match listener {
            Some(listener) => {
                listener.on_exception(fault);
                true
            }
            None => false,
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::closed(format!("connection {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn start(&self) -> Result<(), BrokerError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        if self.controls.fail_start.load(Ordering::SeqCst) {
            return Err(BrokerError::unavailable("connection could not be started"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_stop.load(Ordering::SeqCst) {
            return Err(BrokerError::operation("connection stop failed"));
        }
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::operation("connection close failed"));
        }
        self.started.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        lock(&self.client_id).clone()
    }

    fn set_client_id(&self, client_id: &str) -> Result<(), BrokerError> {
        if self.controls.fail_client_id.load(Ordering::SeqCst) {
            return Err(BrokerError::operation(format!(
                "client id {client_id} is already in use"
            )));
        }
        *lock(&self.client_id) = Some(client_id.to_string());
        Ok(())
    }

    fn exception_listener(&self) -> Option<Arc<dyn ExceptionListener>> {
        lock(&self.listener).clone()
    }

    fn set_exception_listener(
        &self,
        listener: Arc<dyn ExceptionListener>,
    ) -> Result<(), BrokerError> {
        if self
            .controls
            .fail_listener_registration
            .load(Ordering::SeqCst)
        {
            return Err(BrokerError::operation("listener registration refused"));
        }
        self.listener_registrations.fetch_add(1, Ordering::SeqCst);
        *lock(&self.listener) = Some(listener);
        Ok(())
    }

    async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        self.ensure_open()?;
        if self.controls.fail_session_create.load(Ordering::SeqCst) {
            return Err(BrokerError::operation("session creation failed"));
        }
        let session = Arc::new(MockSession::with_controls(
            transacted,
            ack_mode,
            self.controls.clone(),
        ));
        lock(&self.sessions).push(session.clone());
        Ok(session)
    }
}

/// Mock broker session
#[derive(Debug)]
pub struct MockSession {
    id: Uuid,
    transacted: bool,
    ack_mode: AckMode,
    controls: Arc<MockControls>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    producers: Mutex<Vec<Arc<MockProducer>>>,
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
}

impl MockSession {
    pub fn new(transacted: bool, ack_mode: AckMode) -> Self {
        Self::with_controls(transacted, ack_mode, Arc::new(MockControls::default()))
    }

    fn with_controls(transacted: bool, ack_mode: AckMode, controls: Arc<MockControls>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transacted,
            ack_mode,
            controls,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn producers_created(&self) -> usize {
        lock(&self.producers).len()
    }

    pub fn consumers_created(&self) -> usize {
        lock(&self.consumers).len()
    }

    pub fn producer(&self, index: usize) -> Option<Arc<MockProducer>> {
        lock(&self.producers).get(index).cloned()
    }

    pub fn consumer(&self, index: usize) -> Option<Arc<MockConsumer>> {
        lock(&self.consumers).get(index).cloned()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::closed(format!("session {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_transacted(&self) -> bool {
        self.transacted
    }

    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn MessageProducer>, BrokerError> {
        self.ensure_open()?;
        let producer = Arc::new(MockProducer::new(destination.clone()));
        lock(&self.producers).push(producer.clone());
        Ok(producer)
    }

    async fn create_consumer(
        &self,
        spec: &ConsumerSpec,
    ) -> Result<Arc<dyn MessageConsumer>, BrokerError> {
        self.ensure_open()?;
        let consumer = Arc::new(MockConsumer::new(spec.clone()));
        lock(&self.consumers).push(consumer.clone());
        Ok(consumer)
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_session_close.load(Ordering::SeqCst) {
            return Err(BrokerError::operation("session close failed"));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock producer keeping everything it sent
#[derive(Debug)]
pub struct MockProducer {
    id: Uuid,
    destination: Destination,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockProducer {
    fn new(destination: Destination) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.sent).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProducer for MockProducer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn send(&self, body: Bytes) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::closed("producer is closed"));
        }
        lock(&self.sent).push(body);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock consumer reading from a local queue
#[derive(Debug)]
pub struct MockConsumer {
    id: Uuid,
    spec: ConsumerSpec,
    pending: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
}

impl MockConsumer {
    fn new(spec: ConsumerSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Make `body` available to the next receive
    pub fn push(&self, body: Bytes) {
        lock(&self.pending).push_back(body);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageConsumer for MockConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    async fn receive_no_wait(&self) -> Result<Option<Bytes>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::closed("consumer is closed"));
        }
        Ok(lock(&self.pending).pop_front())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Exception listener that keeps every fault it is given
#[derive(Debug, Default)]
pub struct RecordingListener {
    faults: Mutex<Vec<BrokerFault>>,
}

impl RecordingListener {
    pub fn faults(&self) -> Vec<BrokerFault> {
        lock(&self.faults).clone()
    }
}

impl ExceptionListener for RecordingListener {
    fn on_exception(&self, fault: &BrokerFault) {
        lock(&self.faults).push(fault.clone());
    }
}

/// Factory source whose lookup always fails
#[derive(Debug, Default)]
pub struct UnavailableFactorySource;

#[async_trait]
impl ConnectionFactorySource for UnavailableFactorySource {
    async fn connection_factory(&self) -> Result<Arc<dyn ConnectionFactory>, BrokerError> {
        Err(BrokerError::unavailable("no connection factory registered"))
    }
}
