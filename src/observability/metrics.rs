//! Thread-safe metrics collection
//!
//! Atomic counters for connection lifecycle, session caching and fault dispatch.
//! A single global collector is shared by every provider in the process.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Connection lifecycle
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    validations: AtomicU64,
    validation_failures: AtomicU64,
    disconnects: AtomicU64,
    last_connection_at: AtomicU64,

    // Session cache
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    session_cache_hits: AtomicU64,
    producer_cache_hits: AtomicU64,
    consumer_cache_hits: AtomicU64,

    // Unit-of-work sessions
    sessions_bound: AtomicU64,
    sessions_released: AtomicU64,

    // Fault dispatch
    faults_delivered: AtomicU64,
    faults_suppressed: AtomicU64,
    observer_failures: AtomicU64,

    provider_state: Mutex<String>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            validations: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            last_connection_at: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            session_cache_hits: AtomicU64::new(0),
            producer_cache_hits: AtomicU64::new(0),
            consumer_cache_hits: AtomicU64::new(0),
            sessions_bound: AtomicU64::new(0),
            sessions_released: AtomicU64::new(0),
            faults_delivered: AtomicU64::new(0),
            faults_suppressed: AtomicU64::new(0),
            observer_failures: AtomicU64::new(0),
            provider_state: Mutex::new("uninitialised".to_string()),
        }
    }

    // Connection lifecycle
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.last_connection_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_validated(&self, success: bool) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.validation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    // Session cache
    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_cache_hit(&self) {
        self.session_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn producer_cache_hit(&self) {
        self.producer_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_cache_hit(&self) {
        self.consumer_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    // Unit-of-work sessions
    pub fn session_bound(&self) {
        self.sessions_bound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_released(&self) {
        self.sessions_released.fetch_add(1, Ordering::Relaxed);
    }

    // Fault dispatch
    pub fn fault_delivered(&self) {
        self.faults_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fault_suppressed(&self) {
        self.faults_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observer_failed(&self) {
        self.observer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_provider_state(&self, state: &str) {
        if let Ok(mut current) = self.provider_state.lock() {
            if *current != state {
                *current = state.to_string();
            }
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.validations,
            &self.validation_failures,
            &self.disconnects,
            &self.last_connection_at,
            &self.sessions_created,
            &self.sessions_evicted,
            &self.session_cache_hits,
            &self.producer_cache_hits,
            &self.consumer_cache_hits,
            &self.sessions_bound,
            &self.sessions_released,
            &self.faults_delivered,
            &self.faults_suppressed,
            &self.observer_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.set_provider_state("uninitialised");
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let provider_state = self
            .provider_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            connections: ConnectionMetrics {
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                validations: self.validations.load(Ordering::Relaxed),
                validation_failures: self.validation_failures.load(Ordering::Relaxed),
                disconnects: self.disconnects.load(Ordering::Relaxed),
                last_connection_at: self.last_connection_at.load(Ordering::Relaxed),
                provider_state,
            },
            cache: CacheMetrics {
                sessions_created: self.sessions_created.load(Ordering::Relaxed),
                sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
                session_hits: self.session_cache_hits.load(Ordering::Relaxed),
                producer_hits: self.producer_cache_hits.load(Ordering::Relaxed),
                consumer_hits: self.consumer_cache_hits.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                bound: self.sessions_bound.load(Ordering::Relaxed),
                released: self.sessions_released.load(Ordering::Relaxed),
            },
            faults: FaultMetrics {
                delivered: self.faults_delivered.load(Ordering::Relaxed),
                suppressed: self.faults_suppressed.load(Ordering::Relaxed),
                observer_failures: self.observer_failures.load(Ordering::Relaxed),
            },
            timestamp: current_timestamp(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections: ConnectionMetrics,
    pub cache: CacheMetrics,
    pub sessions: SessionMetrics,
    pub faults: FaultMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub validations: u64,
    pub validation_failures: u64,
    pub disconnects: u64,
    pub last_connection_at: u64,
    pub provider_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub session_hits: u64,
    pub producer_hits: u64,
    pub consumer_hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub bound: u64,
    pub released: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaultMetrics {
    pub delivered: u64,
    pub suppressed: u64,
    pub observer_failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let collector = MetricsCollector::new();
        collector.connection_attempt();
        collector.connection_attempt();
        collector.connection_established();
        collector.connection_failed();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.connections.attempts, 2);
        assert_eq!(snapshot.connections.established, 1);
        assert_eq!(snapshot.connections.failures, 1);
        assert!(snapshot.connections.last_connection_at > 0);
    }

    #[test]
    fn test_validation_failures_counted_separately() {
        let collector = MetricsCollector::new();
        collector.connection_validated(true);
        collector.connection_validated(false);

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.connections.validations, 2);
        assert_eq!(snapshot.connections.validation_failures, 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let collector = MetricsCollector::new();
        collector.session_created();
        collector.session_evicted();
        collector.fault_delivered();
        collector.set_provider_state("connected");

        collector.reset();
        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.cache.sessions_created, 0);
        assert_eq!(snapshot.cache.sessions_evicted, 0);
        assert_eq!(snapshot.faults.delivered, 0);
        assert_eq!(snapshot.connections.provider_state, "uninitialised");
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let collector = MetricsCollector::new();
        collector.fault_suppressed();
        let json = serde_json::to_value(collector.get_metrics()).unwrap();
        assert_eq!(json["faults"]["suppressed"], 1);
    }
}
