//! Decides whether a raw factory gets wrapped with the session cache

use crate::support::ConnectionFactory;
use serde::Serialize;
use std::num::NonZeroUsize;

/// Resolved caching parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachingConfiguration {
    /// Maximum number of cached sessions; `usize::MAX` means unbounded
    pub session_cache_size: NonZeroUsize,
    pub cache_producers: bool,
    pub cache_consumers: bool,
}

impl Default for CachingConfiguration {
    fn default() -> Self {
        Self {
            session_cache_size: NonZeroUsize::MAX,
            cache_producers: true,
            cache_consumers: true,
        }
    }
}

impl CachingConfiguration {
    pub fn with_session_cache_size(mut self, size: NonZeroUsize) -> Self {
        self.session_cache_size = size;
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.session_cache_size == NonZeroUsize::MAX
    }
}

/// How (and whether) connections are cached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingStrategy {
    /// Cache sessions, producers and consumers with the given parameters
    Default(CachingConfiguration),
    /// Use the raw factory as is
    None,
}

impl Default for CachingStrategy {
    fn default() -> Self {
        CachingStrategy::Default(CachingConfiguration::default())
    }
}

impl CachingStrategy {
    /// XA factories and factories that already cache must never be wrapped
    pub fn applies_to(&self, factory: &dyn ConnectionFactory) -> bool {
        match self {
            CachingStrategy::Default(_) => !(factory.is_xa_capable() || factory.is_caching()),
            CachingStrategy::None => false,
        }
    }

    /// Caching parameters to use for `factory`, if it should be cached at all
    pub fn resolve(&self, factory: &dyn ConnectionFactory) -> Option<CachingConfiguration> {
        match self {
            CachingStrategy::Default(configuration) if self.applies_to(factory) => {
                Some(*configuration)
            }
            _ => None,
        }
    }
}
