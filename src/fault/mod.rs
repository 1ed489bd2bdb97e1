//! Asynchronous fault delivery
//!
//! - [`hub`] - the observer set faults are multiplexed to
//! - [`relay`] - the listener registered on connections, gating delivery while the
//!   provider disconnects

pub mod hub;
pub mod relay;

pub use hub::{DispatchReport, FaultListenerHub, FaultObserver, HubState, ObserverId, ObserverResult};
pub use relay::FaultRelay;
