//! Connection caching
//!
//! - [`strategy`] decides whether a raw factory gets wrapped
//! - [`factory`] is the wrapper: one shared physical connection per factory
//! - [`pool`] lends sessions to one caller at a time and takes them back on close
//! - [`session`] holds cached sessions and their producers/consumers
//! - [`lru`] orders idle sessions for eviction

pub mod factory;
pub mod lru;
pub mod pool;
pub mod session;
pub mod strategy;

pub use factory::{CachingConnectionFactory, Credentials, SharedConnection};
pub use lru::{LruMap, SessionSlot};
pub use pool::{SessionLease, SessionPool};
pub use session::{CachedConsumer, CachedProducer, CachedSession};
pub use strategy::{CachingConfiguration, CachingStrategy};
