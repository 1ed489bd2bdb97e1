//! Stable exception listener that routes faults to the provider's current hub
//!
//! Physical connections register a listener once and keep it for life, while the
//! provider replaces its hub on every disconnect. The relay sits in between: it is what
//! gets registered, and it owns the disconnecting flag that gates forwarding.

use super::hub::FaultListenerHub;
use crate::observability::metrics;
use crate::support::{BrokerFault, ExceptionListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Debug)]
pub struct FaultRelay {
    current: RwLock<Arc<FaultListenerHub>>,
    disconnecting: AtomicBool,
}

impl FaultRelay {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(FaultListenerHub::new())),
            disconnecting: AtomicBool::new(false),
        }
    }

    /// Hub faults are currently routed to
    pub fn current_hub(&self) -> Arc<FaultListenerHub> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Suppress the current hub and install a fresh one for the next cycle
    ///
    /// Faults are dropped from here until [`FaultRelay::begin_connect`].
    pub fn begin_disconnect(&self) -> Arc<FaultListenerHub> {
        self.disconnecting.store(true, Ordering::SeqCst);
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        current.suppress();
        *current = Arc::new(FaultListenerHub::new());
        debug!(hub = %current.id(), "Installed fresh fault hub for next connect cycle");
        current.clone()
    }

    /// Resume forwarding; returns the hub the new cycle reports to
    pub fn begin_connect(&self) -> Arc<FaultListenerHub> {
        let hub = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_suppressed() {
                *current = Arc::new(FaultListenerHub::new());
            }
            current.clone()
        };
        self.disconnecting.store(false, Ordering::SeqCst);
        hub
    }

    /// True between `begin_disconnect` and the next `begin_connect`
    pub fn is_suppressing(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }
}

impl Default for FaultRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionListener for FaultRelay {
    fn on_exception(&self, fault: &BrokerFault) {
        if self.disconnecting.load(Ordering::SeqCst) {
            metrics().fault_suppressed();
            debug!(fault = %fault, "Ignoring fault while disconnecting");
            return;
        }
        self.current_hub().dispatch(fault);
    }
}
