//! Binds broker sessions to execution contexts
//!
//! One session per context: the first request for a context creates the session, every
//! later request returns it until the context releases it. Contexts are independent of
//! each other; requests for the same context are serialised on a per-context mutex.
//!
//! ```rust
//! use brokerpool::testing::MockSession;
//! use brokerpool::{AckMode, BrokerError, BrokerSession, ContextKey, SessionManager};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let manager = SessionManager::new();
//! let context = ContextKey::new("flow-1");
//! let connection_id = uuid::Uuid::new_v4();
//!
//! let physical = Arc::new(MockSession::new(false, AckMode::Auto));
//! let supplied = physical.clone();
//!
//! let session = manager
//!     .get_or_create_session(&context, connection_id, false, AckMode::Auto, move || async move {
//!         Ok::<Arc<dyn BrokerSession>, BrokerError>(supplied)
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(session.id(), physical.id());
//! assert!(manager.is_bound(&context).await);
//! assert!(manager.release_session(&context).await);
//! assert!(physical.is_closed());
//! # });
//! ```

use crate::observability::metrics;
use crate::support::{AckMode, BrokerError, BrokerSession};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

/// Identity of an execution context (a flow run, a transaction)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey(String);

impl ContextKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// Fresh random key
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ContextKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<Uuid> for ContextKey {
    fn from(key: Uuid) -> Self {
        Self(key.to_string())
    }
}

#[derive(Clone)]
struct BoundSession {
    session: Arc<dyn BrokerSession>,
    connection_id: Uuid,
    transacted: bool,
    ack_mode: AckMode,
    bound_at: DateTime<Utc>,
}

type Slot = Arc<Mutex<Option<BoundSession>>>;

/// Context to session bindings
#[derive(Default)]
pub struct SessionManager {
    bindings: DashMap<ContextKey, Slot>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session bound to `context`, created with `supplier` when there is none
    ///
    /// The first successful creation wins: a later call for the same context gets the
    /// bound session back whatever `transacted` and `ack_mode` it asks for. A supplier
    /// failure binds nothing.
    pub async fn get_or_create_session<F, Fut>(
        &self,
        context: &ContextKey,
        connection_id: Uuid,
        transacted: bool,
        ack_mode: AckMode,
        supplier: F,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn BrokerSession>, BrokerError>>,
    {
        let span = crate::session_span!(context = %context, connection_id = %connection_id);
        async move {
            let (slot, mut bound) = self.lock_slot(context).await;

            if let Some(existing) = bound.as_ref() {
                if existing.transacted != transacted || existing.ack_mode != ack_mode {
                    debug!(
                        bound_transacted = existing.transacted,
                        bound_ack_mode = %existing.ack_mode,
                        "Returning session bound with different settings"
                    );
                }
                return Ok(existing.session.clone());
            }

            match supplier().await {
                Ok(session) => {
                    *bound = Some(BoundSession {
                        session: session.clone(),
                        connection_id,
                        transacted,
                        ack_mode,
                        bound_at: Utc::now(),
                    });
                    metrics().session_bound();
                    debug!(session = %session.id(), transacted, ack_mode = %ack_mode, "Session bound to context");
                    Ok(session)
                }
                Err(e) => {
                    self.bindings
                        .remove_if(context, |_, current| Arc::ptr_eq(current, &slot));
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Lock the slot currently registered for `context`, creating it if needed
    ///
    /// A slot removed by a concurrent release while we waited is stale; go around again
    /// so the new binding lands in the map.
    async fn lock_slot(&self, context: &ContextKey) -> (Slot, OwnedMutexGuard<Option<BoundSession>>) {
        loop {
            let slot = self
                .bindings
                .entry(context.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone();
            let guard = slot.clone().lock_owned().await;
            if self.is_current(context, &slot) {
                return (slot, guard);
            }
        }
    }

    fn is_current(&self, context: &ContextKey, slot: &Slot) -> bool {
        self.bindings
            .get(context)
            .map_or(false, |current| Arc::ptr_eq(current.value(), slot))
    }

    /// Unbind and close the session of `context`
    ///
    /// Returns false when nothing was bound. Close failures are logged only.
    pub async fn release_session(&self, context: &ContextKey) -> bool {
        let Some(slot) = self.bindings.get(context).map(|s| s.value().clone()) else {
            return false;
        };

        let released = {
            let mut bound = slot.lock().await;
            let released = bound.take();
            self.bindings
                .remove_if(context, |_, current| Arc::ptr_eq(current, &slot));
            released
        };

        match released {
            Some(bound) => {
                close_released(context, bound).await;
                true
            }
            None => false,
        }
    }

    /// Release every context bound to a session of `connection_id`
    pub async fn release_connection(&self, connection_id: Uuid) -> usize {
        let slots: Vec<(ContextKey, Slot)> = self
            .bindings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut released = 0;
        for (context, slot) in slots {
            let taken = {
                let mut bound = slot.lock().await;
                if bound
                    .as_ref()
                    .map_or(false, |b| b.connection_id == connection_id)
                {
                    self.bindings
                        .remove_if(&context, |_, current| Arc::ptr_eq(current, &slot));
                    bound.take()
                } else {
                    None
                }
            };
            if let Some(bound) = taken {
                close_released(&context, bound).await;
                released += 1;
            }
        }

        if released > 0 {
            debug!(connection_id = %connection_id, released, "Released sessions of connection");
        }
        released
    }

    /// Whether a session is currently bound to `context`
    pub async fn is_bound(&self, context: &ContextKey) -> bool {
        let Some(slot) = self.bindings.get(context).map(|s| s.value().clone()) else {
            return false;
        };
        let bound = slot.lock().await;
        bound.is_some()
    }

    /// Number of contexts with a binding or a binding in progress
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("contexts", &self.bindings.len())
            .finish()
    }
}

async fn close_released(context: &ContextKey, bound: BoundSession) {
    metrics().session_released();
    let held_for = Utc::now() - bound.bound_at;
    if let Err(e) = bound.session.close().await {
        warn!(context = %context, error = %e, "Failed to close released session");
    } else {
        debug!(
            context = %context,
            session = %bound.session.id(),
            held_ms = held_for.num_milliseconds(),
            "Session released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockSession;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn supplier(
        created: Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::future::Ready<Result<Arc<dyn BrokerSession>, BrokerError>> {
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            let session: Arc<dyn BrokerSession> = Arc::new(MockSession::new(false, AckMode::Auto));
            std::future::ready(Ok(session))
        }
    }

    #[tokio::test]
    async fn test_same_context_gets_same_session() {
        let manager = SessionManager::new();
        let created = Arc::new(AtomicUsize::new(0));
        let context = ContextKey::new("flow-1");
        let connection = Uuid::new_v4();

        let first = manager
            .get_or_create_session(&context, connection, false, AckMode::Auto, supplier(created.clone()))
            .await
            .unwrap();
        let second = manager
            .get_or_create_session(&context, connection, true, AckMode::Client, supplier(created.clone()))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(!second.is_transacted());
    }

    #[tokio::test]
    async fn test_release_then_request_creates_new_session() {
        let manager = SessionManager::new();
        let created = Arc::new(AtomicUsize::new(0));
        let context = ContextKey::generate();
        let connection = Uuid::new_v4();

        let first = manager
            .get_or_create_session(&context, connection, false, AckMode::Auto, supplier(created.clone()))
            .await
            .unwrap();
        assert!(manager.release_session(&context).await);
        assert!(!manager.release_session(&context).await);

        let second = manager
            .get_or_create_session(&context, connection, false, AckMode::Auto, supplier(created.clone()))
            .await
            .unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_closes_session() {
        let manager = SessionManager::new();
        let context = ContextKey::new("flow-1");
        let physical = Arc::new(MockSession::new(false, AckMode::Auto));
        let handed_out = physical.clone();

        manager
            .get_or_create_session(&context, Uuid::new_v4(), false, AckMode::Auto, move || async move {
                let session: Arc<dyn BrokerSession> = handed_out;
                Ok(session)
            })
            .await
            .unwrap();
        manager.release_session(&context).await;

        assert!(physical.is_closed());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_supplier_failure_binds_nothing() {
        let manager = SessionManager::new();
        let context = ContextKey::new("flow-1");

        let result = manager
            .get_or_create_session(&context, Uuid::new_v4(), false, AckMode::Auto, || async {
                Err::<Arc<dyn BrokerSession>, _>(BrokerError::unavailable("broker down"))
            })
            .await;

        assert!(matches!(result, Err(BrokerError::Unavailable { .. })));
        assert!(!manager.is_bound(&context).await);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_release_connection_only_touches_its_sessions() {
        let manager = SessionManager::new();
        let created = Arc::new(AtomicUsize::new(0));
        let doomed = Uuid::new_v4();
        let survivor = Uuid::new_v4();

        for i in 0..3 {
            manager
                .get_or_create_session(&ContextKey::new(format!("doomed-{i}")), doomed, false, AckMode::Auto, supplier(created.clone()))
                .await
                .unwrap();
        }
        manager
            .get_or_create_session(&ContextKey::new("kept"), survivor, false, AckMode::Auto, supplier(created.clone()))
            .await
            .unwrap();

        assert_eq!(manager.release_connection(doomed).await, 3);
        assert_eq!(manager.len(), 1);
        assert!(manager.is_bound(&ContextKey::new("kept")).await);
    }

    #[test]
    fn test_context_key_conversions() {
        let id = Uuid::new_v4();
        assert_eq!(ContextKey::from(id).as_str(), id.to_string());
        assert_eq!(ContextKey::from("a"), ContextKey::new("a".to_string()));
        assert_eq!(ContextKey::new("tx-9").to_string(), "tx-9");
    }
}
