//! Checkout pool of cached sessions
//!
//! A cached session is either lent to exactly one caller or idle in the pool. Lookups
//! only consider idle sessions, so two callers never share a session, and eviction only
//! picks idle sessions, so a session is never closed under its holder. While every
//! session is lent out the pool grows past its capacity; a session returned while the
//! pool is over capacity is closed instead of kept.

use super::lru::{LruMap, SessionSlot};
use super::session::CachedSession;
use crate::observability::metrics;
use crate::support::{
    AckMode, BrokerError, BrokerSession, ConsumerSpec, Destination, MessageConsumer,
    MessageProducer,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

struct PoolState {
    idle: LruMap<Uuid, Arc<CachedSession>>,
    lent: HashMap<Uuid, Arc<CachedSession>>,
    closed: bool,
}

impl PoolState {
    fn len(&self) -> usize {
        self.idle.len() + self.lent.len()
    }
}

/// Sessions of one physical connection, bounded by the session cache size
pub struct SessionPool {
    capacity: NonZeroUsize,
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                idle: LruMap::new(capacity),
                lent: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    /// Lend an idle session of `slot`, or one made by `create` when none is idle
    ///
    /// At capacity the idle session returned longest ago is closed before `create`
    /// runs.
    pub async fn checkout<F, Fut>(
        self: &Arc<Self>,
        slot: SessionSlot,
        create: F,
    ) -> Result<SessionLease, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedSession, BrokerError>>,
    {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::closed("Session cache has been closed"));
        }

        if let Some((id, session)) = state.idle.take_most_recent_where(|s| s.slot() == slot) {
            state.lent.insert(id, session.clone());
            metrics().session_cache_hit();
            debug!(session = %id, transacted = slot.transacted, ack_mode = %slot.ack_mode, "Lending idle cached session");
            return Ok(SessionLease::new(session, self.clone()));
        }

        if state.len() >= self.capacity.get() {
            if let Some((id, evicted)) = state.idle.pop_lru() {
                metrics().session_evicted();
                debug!(
                    session = %id,
                    transacted = evicted.slot().transacted,
                    ack_mode = %evicted.slot().ack_mode,
                    "Evicting least recently returned session"
                );
                if let Err(e) = evicted.physical_close().await {
                    warn!(session = %id, error = %e, "Failed to close evicted session");
                }
            }
        }

        let session = Arc::new(create().await?);
        state.lent.insert(session.id(), session.clone());
        metrics().session_created();
        debug!(
            session = %session.id(),
            transacted = slot.transacted,
            ack_mode = %slot.ack_mode,
            cached = state.len(),
            "Created cached session"
        );
        Ok(SessionLease::new(session, self.clone()))
    }

    /// Take a lent session back, keeping it idle when there is room
    async fn check_in(&self, session: Arc<CachedSession>) {
        session.prepare_for_reuse().await;

        let mut discarded = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.lent.remove(&session.id());
            if state.closed || session.is_closed() || state.len() >= self.capacity.get() {
                discarded.push(session.clone());
            } else if let Some((_, evicted)) = state.idle.insert(session.id(), session.clone()) {
                discarded.push(evicted);
            }
        }

        if discarded.is_empty() {
            debug!(session = %session.id(), "Session returned to cache");
        }
        for surplus in discarded {
            if let Err(e) = surplus.physical_close().await {
                warn!(session = %surplus.id(), error = %e, "Failed to close surplus session");
            }
        }
    }

    /// Stop lending and hand every session, idle or lent, to the caller to close
    pub async fn close(&self) -> Vec<Arc<CachedSession>> {
        let mut state = self.state.lock().await;
        state.closed = true;
        let mut sessions = state.idle.drain();
        sessions.extend(state.lent.drain().map(|(_, session)| session));
        sessions
    }

    /// Idle plus lent sessions
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }
}

/// One caller's use of a cached session
///
/// Closing the lease rolls back uncommitted transacted work and returns the session to
/// the pool. Every operation on a closed lease fails with [`BrokerError::Closed`].
pub struct SessionLease {
    session: Arc<CachedSession>,
    pool: Arc<SessionPool>,
    returned: AtomicBool,
}

impl SessionLease {
    fn new(session: Arc<CachedSession>, pool: Arc<SessionPool>) -> Self {
        Self {
            session,
            pool,
            returned: AtomicBool::new(false),
        }
    }

    pub fn is_returned(&self) -> bool {
        self.returned.load(Ordering::SeqCst)
    }

    fn ensure_held(&self) -> Result<(), BrokerError> {
        if self.is_returned() {
            Err(BrokerError::closed(format!(
                "Session {} has been returned to the cache",
                self.session.id()
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerSession for SessionLease {
    fn id(&self) -> Uuid {
        self.session.id()
    }

    fn is_transacted(&self) -> bool {
        self.session.slot().transacted
    }

    fn ack_mode(&self) -> AckMode {
        self.session.slot().ack_mode
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn MessageProducer>, BrokerError> {
        self.ensure_held()?;
        self.session.create_producer(destination).await
    }

    async fn create_consumer(
        &self,
        spec: &ConsumerSpec,
    ) -> Result<Arc<dyn MessageConsumer>, BrokerError> {
        self.ensure_held()?;
        self.session.create_consumer(spec).await
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.ensure_held()?;
        self.session.commit().await
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        self.ensure_held()?;
        self.session.rollback().await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.returned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.check_in(self.session.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::CachingConfiguration;
    use crate::support::{support_for, ProtocolVersion};
    use crate::testing::mocks::MockSession;

    fn pool(capacity: usize) -> Arc<SessionPool> {
        Arc::new(SessionPool::new(NonZeroUsize::new(capacity).unwrap()))
    }

    /// Creates mock sessions on checkout misses and remembers them
    #[derive(Default)]
    struct Driver {
        created: std::sync::Mutex<Vec<Arc<MockSession>>>,
    }

    impl Driver {
        fn make(&self, transacted: bool, ack_mode: AckMode) -> CachedSession {
            let physical = Arc::new(MockSession::new(transacted, ack_mode));
            self.created.lock().unwrap().push(physical.clone());
            CachedSession::new(
                SessionSlot::new(transacted, ack_mode),
                physical,
                support_for(ProtocolVersion::V11),
                CachingConfiguration::default(),
            )
        }

        async fn lend(
            &self,
            pool: &Arc<SessionPool>,
            transacted: bool,
            ack_mode: AckMode,
        ) -> SessionLease {
            pool.checkout(SessionSlot::new(transacted, ack_mode), move || async move {
                Ok(self.make(transacted, ack_mode))
            })
            .await
            .unwrap()
        }

        fn physical(&self, index: usize) -> Arc<MockSession> {
            self.created.lock().unwrap()[index].clone()
        }

        fn created(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    #[tokio::test]
    async fn test_same_slot_lent_twice_gets_distinct_sessions() {
        let pool = pool(4);
        let driver = Driver::default();

        let a = driver.lend(&pool, true, AckMode::Auto).await;
        let b = driver.lend(&pool, true, AckMode::Auto).await;

        assert_ne!(a.id(), b.id());
        assert_eq!(driver.created(), 2);
        assert_eq!(pool.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_returned_session_is_lent_again() {
        let pool = pool(4);
        let driver = Driver::default();

        let a = driver.lend(&pool, false, AckMode::Auto).await;
        a.close().await.unwrap();
        assert_eq!(pool.idle_count().await, 1);
        let b = driver.lend(&pool, false, AckMode::Auto).await;

        assert_eq!(a.id(), b.id());
        assert_eq!(driver.created(), 1);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_returned_lease_rejects_further_use() {
        let pool = pool(4);
        let driver = Driver::default();
        let lease = driver.lend(&pool, true, AckMode::Auto).await;

        lease.close().await.unwrap();
        lease.close().await.unwrap();

        assert!(lease.is_returned());
        assert!(matches!(lease.commit().await, Err(BrokerError::Closed { .. })));
        assert!(matches!(lease.rollback().await, Err(BrokerError::Closed { .. })));
        assert!(matches!(
            lease.create_producer(&Destination::queue("orders")).await,
            Err(BrokerError::Closed { .. })
        ));
        assert_eq!(driver.physical(0).commits(), 0);
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn test_returning_one_transaction_leaves_another_untouched() {
        let pool = pool(4);
        let driver = Driver::default();
        let a = driver.lend(&pool, true, AckMode::Auto).await;
        let b = driver.lend(&pool, true, AckMode::Auto).await;

        a.close().await.unwrap();
        b.commit().await.unwrap();

        assert_eq!(driver.physical(0).rollbacks(), 1);
        assert_eq!(driver.physical(1).rollbacks(), 0);
        assert_eq!(driver.physical(1).commits(), 1);
        assert_eq!(driver.physical(0).commits(), 0);
    }

    #[tokio::test]
    async fn test_lent_session_is_never_evicted() {
        let pool = pool(1);
        let driver = Driver::default();
        let held = driver.lend(&pool, false, AckMode::Auto).await;

        let overflow = driver.lend(&pool, true, AckMode::Auto).await;

        assert_eq!(driver.created(), 2);
        assert!(!driver.physical(0).is_closed());
        assert!(held.create_producer(&Destination::queue("orders")).await.is_ok());

        // returned while over capacity: closed rather than kept
        overflow.close().await.unwrap();
        assert!(driver.physical(1).is_closed());
        held.close().await.unwrap();
        assert!(!driver.physical(0).is_closed());
        assert_eq!(pool.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_returned_idle_session_before_creating() {
        let pool = pool(2);
        let driver = Driver::default();

        driver.lend(&pool, false, AckMode::Auto).await.close().await.unwrap();
        driver.lend(&pool, false, AckMode::Client).await.close().await.unwrap();
        // returning the auto-ack session again leaves the client-ack one oldest
        driver.lend(&pool, false, AckMode::Auto).await.close().await.unwrap();

        let creator = &driver;
        let lease = pool
            .checkout(SessionSlot::new(true, AckMode::Auto), move || async move {
                assert!(creator.physical(1).is_closed());
                Ok(creator.make(true, AckMode::Auto))
            })
            .await
            .unwrap();

        assert!(lease.is_transacted());
        assert!(!driver.physical(0).is_closed());
        assert!(driver.physical(1).is_closed());
        assert!(!driver.physical(2).is_closed());
        assert_eq!(pool.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_close_hands_over_every_session_and_stops_lending() {
        let pool = pool(4);
        let driver = Driver::default();
        let idle = driver.lend(&pool, false, AckMode::Auto).await;
        idle.close().await.unwrap();
        let lent = driver.lend(&pool, true, AckMode::Auto).await;

        let sessions = pool.close().await;
        let creator = &driver;
        for session in &sessions {
            session.physical_close().await.unwrap();
        }

        assert_eq!(sessions.len(), 2);
        assert!(matches!(
            pool.checkout(SessionSlot::new(false, AckMode::Auto), move || async move {
                Ok(creator.make(false, AckMode::Auto))
            })
            .await,
            Err(BrokerError::Closed { .. })
        ));
        assert!(lent.commit().await.is_err());
        lent.close().await.unwrap();
        assert!(driver.physical(1).is_closed());
        assert_eq!(pool.session_count().await, 0);
    }
}
