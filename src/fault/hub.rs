//! Multiplexes asynchronous connection faults to a dynamic set of observers

use crate::observability::metrics;
use crate::support::{BrokerFault, ExceptionListener};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result returned by an observer after handling a fault
pub type ObserverResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Something interested in asynchronous connection failures
pub trait FaultObserver: Send + Sync {
    fn on_fault(&self, fault: &BrokerFault) -> ObserverResult;
}

impl<F> FaultObserver for F
where
    F: Fn(&BrokerFault) -> ObserverResult + Send + Sync,
{
    fn on_fault(&self, fault: &BrokerFault) -> ObserverResult {
        self(fault)
    }
}

/// Handle returned by [`FaultListenerHub::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Hub state: faults are forwarded only while `Active`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Active,
    Suppressed,
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub suppressed: bool,
}

/// Ordered, thread-safe observer set
///
/// Dispatch walks a snapshot taken when it starts: observers added later never see
/// that fault, observers removed meanwhile may still see it. A failing or panicking
/// observer is logged and skipped. Once suppressed a hub stays suppressed; a new
/// connect cycle gets a new hub.
pub struct FaultListenerHub {
    id: Uuid,
    observers: RwLock<Vec<(ObserverId, Arc<dyn FaultObserver>)>>,
    next_observer_id: AtomicU64,
    suppressed: AtomicBool,
}

impl FaultListenerHub {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            suppressed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn add_observer(&self, observer: Arc<dyn FaultObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, observer));
        debug!(hub = %self.id, observer = id.0, "Fault observer registered");
        id
    }

    /// Returns false when the observer was not registered
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Stop forwarding faults for the rest of this hub's life
    pub fn suppress(&self) {
        if !self.suppressed.swap(true, Ordering::SeqCst) {
            debug!(hub = %self.id, "Fault dispatch suppressed");
        }
    }

    pub fn state(&self) -> HubState {
        if self.suppressed.load(Ordering::SeqCst) {
            HubState::Suppressed
        } else {
            HubState::Active
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.state() == HubState::Suppressed
    }

    /// Forward `fault` to every observer registered right now, in registration order
    pub fn dispatch(&self, fault: &BrokerFault) -> DispatchReport {
        if self.is_suppressed() {
            metrics().fault_suppressed();
            debug!(hub = %self.id, fault = %fault, "Ignoring fault while disconnecting");
            return DispatchReport {
                suppressed: true,
                ..DispatchReport::default()
            };
        }

        let snapshot: Vec<(ObserverId, Arc<dyn FaultObserver>)> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let _span = crate::fault_span!(hub = %self.id, observers = snapshot.len()).entered();
        let mut report = DispatchReport::default();

        for (id, observer) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer.on_fault(fault))) {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    metrics().fault_delivered();
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    metrics().observer_failed();
                    warn!(observer = id.0, error = %e, "Fault observer failed");
                }
                Err(_) => {
                    report.failed += 1;
                    metrics().observer_failed();
                    warn!(observer = id.0, "Fault observer panicked");
                }
            }
        }

        report
    }
}

impl Default for FaultListenerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FaultListenerHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultListenerHub")
            .field("id", &self.id)
            .field("observers", &self.observer_count())
            .field("state", &self.state())
            .finish()
    }
}

impl ExceptionListener for FaultListenerHub {
    fn on_exception(&self, fault: &BrokerFault) {
        self.dispatch(fault);
    }
}
