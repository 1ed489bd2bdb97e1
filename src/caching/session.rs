//! Cached sessions and the producer/consumer handles they hand out

use super::lru::SessionSlot;
use super::strategy::CachingConfiguration;
use crate::observability::metrics;
use crate::support::{
    BrokerError, BrokerSession, ConsumerSpec, Destination, MessageConsumer, MessageProducer,
    ProtocolSupport,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A physical session kept open by the caching factory
///
/// Callers never see it directly: the session pool lends it out as a
/// [`SessionLease`](super::pool::SessionLease) and takes it back when the lease is
/// closed. The physical session is closed when the pool evicts it or the factory resets.
pub struct CachedSession {
    slot: SessionSlot,
    physical: Arc<dyn BrokerSession>,
    support: Arc<dyn ProtocolSupport>,
    configuration: CachingConfiguration,
    producers: Mutex<HashMap<Destination, Arc<dyn MessageProducer>>>,
    consumers: Mutex<HashMap<ConsumerSpec, Arc<dyn MessageConsumer>>>,
    closed: AtomicBool,
}

impl CachedSession {
    pub fn new(
        slot: SessionSlot,
        physical: Arc<dyn BrokerSession>,
        support: Arc<dyn ProtocolSupport>,
        configuration: CachingConfiguration,
    ) -> Self {
        Self {
            slot,
            physical,
            support,
            configuration,
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.physical.id()
    }

    pub fn slot(&self) -> SessionSlot {
        self.slot
    }

    /// True once the physical session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn cached_producer_count(&self) -> usize {
        self.producers.lock().await.len()
    }

    pub async fn cached_consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::closed(format!(
                "Cached session {} is closed",
                self.physical.id()
            )))
        } else {
            Ok(())
        }
    }

    /// Close consumers, producers and finally the session itself
    ///
    /// Every resource gets a close attempt; the first failure is returned.
    pub async fn physical_close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error: Option<BrokerError> = None;

        let consumers: Vec<_> = self.consumers.lock().await.drain().collect();
        for (spec, consumer) in consumers {
            if let Err(e) = consumer.close().await {
                debug!(destination = %spec.destination, error = %e, "Failed to close cached consumer");
                first_error.get_or_insert(e);
            }
        }

        let producers: Vec<_> = self.producers.lock().await.drain().collect();
        for (destination, producer) in producers {
            if let Err(e) = producer.close().await {
                debug!(destination = %destination, error = %e, "Failed to close cached producer");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.physical.close().await {
            first_error.get_or_insert(e);
        }

        debug!(
            session = %self.physical.id(),
            transacted = self.slot.transacted,
            ack_mode = %self.slot.ack_mode,
            "Cached session closed"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn MessageProducer>, BrokerError> {
        self.ensure_open()?;
        if !self.configuration.cache_producers {
            return self
                .support
                .create_producer(self.physical.as_ref(), destination)
                .await;
        }

        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(destination) {
            metrics().producer_cache_hit();
            return Ok(Arc::new(CachedProducer::new(producer.clone())));
        }

        let producer = self
            .support
            .create_producer(self.physical.as_ref(), destination)
            .await?;
        producers.insert(destination.clone(), producer.clone());
        debug!(destination = %destination, "Cached new producer");
        Ok(Arc::new(CachedProducer::new(producer)))
    }

    pub async fn create_consumer(
        &self,
        spec: &ConsumerSpec,
    ) -> Result<Arc<dyn MessageConsumer>, BrokerError> {
        self.ensure_open()?;
        if !self.configuration.cache_consumers {
            return self
                .support
                .create_consumer(self.physical.as_ref(), spec)
                .await;
        }

        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(spec) {
            metrics().consumer_cache_hit();
            return Ok(Arc::new(CachedConsumer::new(consumer.clone())));
        }

        let consumer = self
            .support
            .create_consumer(self.physical.as_ref(), spec)
            .await?;
        consumers.insert(spec.clone(), consumer.clone());
        debug!(destination = %spec.destination, "Cached new consumer");
        Ok(Arc::new(CachedConsumer::new(consumer)))
    }

    pub async fn commit(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.physical.commit().await
    }

    pub async fn rollback(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.physical.rollback().await
    }

    /// Discard uncommitted work so the next borrower starts clean
    pub(crate) async fn prepare_for_reuse(&self) {
        if self.slot.transacted && !self.is_closed() {
            if let Err(e) = self.physical.rollback().await {
                warn!(session = %self.physical.id(), error = %e, "Rollback on return to cache failed");
            }
        }
    }
}

/// Producer handle whose `close` leaves the physical producer cached
pub struct CachedProducer {
    inner: Arc<dyn MessageProducer>,
}

impl CachedProducer {
    fn new(inner: Arc<dyn MessageProducer>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MessageProducer for CachedProducer {
    fn id(&self) -> Uuid {
        self.inner.id()
    }

    fn destination(&self) -> &Destination {
        self.inner.destination()
    }

    async fn send(&self, body: Bytes) -> Result<(), BrokerError> {
        self.inner.send(body).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Consumer handle whose `close` leaves the physical consumer cached
pub struct CachedConsumer {
    inner: Arc<dyn MessageConsumer>,
}

impl CachedConsumer {
    fn new(inner: Arc<dyn MessageConsumer>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MessageConsumer for CachedConsumer {
    fn id(&self) -> Uuid {
        self.inner.id()
    }

    fn spec(&self) -> &ConsumerSpec {
        self.inner.spec()
    }

    async fn receive_no_wait(&self) -> Result<Option<Bytes>, BrokerError> {
        self.inner.receive_no_wait().await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{support_for, AckMode, ProtocolVersion};
    use crate::testing::mocks::MockSession;

    fn cached(
        physical: Arc<MockSession>,
        configuration: CachingConfiguration,
        version: ProtocolVersion,
    ) -> CachedSession {
        CachedSession::new(
            SessionSlot::new(physical.is_transacted(), physical.ack_mode()),
            physical,
            support_for(version),
            configuration,
        )
    }

    #[tokio::test]
    async fn test_producer_is_reused_after_logical_close() {
        let physical = Arc::new(MockSession::new(false, AckMode::Auto));
        let session = cached(physical.clone(), CachingConfiguration::default(), ProtocolVersion::V11);
        let orders = Destination::queue("orders");

        let first = session.create_producer(&orders).await.unwrap();
        first.send(Bytes::from_static(b"one")).await.unwrap();
        first.close().await.unwrap();
        let second = session.create_producer(&orders).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(physical.producers_created(), 1);
        assert!(!physical.producer(0).unwrap().is_closed());
        assert_eq!(session.cached_producer_count().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_destinations_get_distinct_producers() {
        let physical = Arc::new(MockSession::new(false, AckMode::Auto));
        let session = cached(physical.clone(), CachingConfiguration::default(), ProtocolVersion::V11);

        let orders = session.create_producer(&Destination::queue("orders")).await.unwrap();
        let prices = session.create_producer(&Destination::topic("orders")).await.unwrap();

        assert_ne!(orders.id(), prices.id());
        assert_eq!(physical.producers_created(), 2);
    }

    #[tokio::test]
    async fn test_consumer_cache_key_includes_selector() {
        let physical = Arc::new(MockSession::new(false, AckMode::Client));
        let session = cached(physical.clone(), CachingConfiguration::default(), ProtocolVersion::V11);
        let plain = ConsumerSpec::new(Destination::queue("orders"));
        let filtered = plain.clone().with_selector("priority > 5");

        let a = session.create_consumer(&plain).await.unwrap();
        let b = session.create_consumer(&plain).await.unwrap();
        let c = session.create_consumer(&filtered).await.unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(physical.consumers_created(), 2);
    }

    #[tokio::test]
    async fn test_uncached_producers_are_created_each_time() {
        let physical = Arc::new(MockSession::new(false, AckMode::Auto));
        let configuration = CachingConfiguration {
            cache_producers: false,
            ..CachingConfiguration::default()
        };
        let session = cached(physical.clone(), configuration, ProtocolVersion::V11);
        let orders = Destination::queue("orders");

        let first = session.create_producer(&orders).await.unwrap();
        let second = session.create_producer(&orders).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(session.cached_producer_count().await, 0);
    }

    #[tokio::test]
    async fn test_dialect_rules_apply_to_cached_consumers() {
        let physical = Arc::new(MockSession::new(false, AckMode::Auto));
        let session = cached(physical.clone(), CachingConfiguration::default(), ProtocolVersion::V11);
        let shared = ConsumerSpec::new(Destination::topic("prices")).shared();

        let err = session.create_consumer(&shared).await.err().unwrap();

        assert!(matches!(err, BrokerError::Unsupported { .. }));
        assert_eq!(physical.consumers_created(), 0);
    }

    #[tokio::test]
    async fn test_prepare_for_reuse_rolls_back_transacted_session_only() {
        let transacted = Arc::new(MockSession::new(true, AckMode::Auto));
        let plain = Arc::new(MockSession::new(false, AckMode::Auto));
        let tx_session = cached(transacted.clone(), CachingConfiguration::default(), ProtocolVersion::V11);
        let plain_session = cached(plain.clone(), CachingConfiguration::default(), ProtocolVersion::V11);

        tx_session.prepare_for_reuse().await;
        plain_session.prepare_for_reuse().await;

        assert_eq!(transacted.rollbacks(), 1);
        assert_eq!(plain.rollbacks(), 0);
        assert!(!transacted.is_closed());
        assert!(!tx_session.is_closed());
    }

    #[tokio::test]
    async fn test_physical_close_closes_everything_once() {
        let physical = Arc::new(MockSession::new(false, AckMode::Auto));
        let session = cached(physical.clone(), CachingConfiguration::default(), ProtocolVersion::V11);
        session.create_producer(&Destination::queue("orders")).await.unwrap();
        session
            .create_consumer(&ConsumerSpec::new(Destination::queue("replies")))
            .await
            .unwrap();

        session.physical_close().await.unwrap();
        session.physical_close().await.unwrap();

        assert!(physical.is_closed());
        assert_eq!(physical.close_calls(), 1);
        assert!(physical.producer(0).unwrap().is_closed());
        assert!(physical.consumer(0).unwrap().is_closed());
        assert!(matches!(
            session.create_producer(&Destination::queue("orders")).await,
            Err(BrokerError::Closed { .. })
        ));
    }
}
