//! Bounded least-recently-used map for idle cached sessions
//!
//! Recency is the tick of the last insert or lookup. The session pool inserts a session
//! when it is returned, so the entry evicted at capacity is the one returned longest ago.
//! Ties cannot happen: every touch takes a fresh tick.

use crate::support::AckMode;
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Cache slot of a session: sessions are interchangeable when these match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionSlot {
    pub transacted: bool,
    pub ack_mode: AckMode,
}

impl SessionSlot {
    pub fn new(transacted: bool, ack_mode: AckMode) -> Self {
        Self {
            transacted,
            ack_mode,
        }
    }
}

#[derive(Debug)]
struct Entry<V> {
    last_used: u64,
    value: V,
}

/// LRU map with a fixed capacity
#[derive(Debug)]
pub struct LruMap<K, V> {
    capacity: NonZeroUsize,
    tick: u64,
    entries: HashMap<K, Entry<V>>,
}

impl<K, V> LruMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up `key`, marking it most recently used
    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        self.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity.get()
    }

    /// Remove and return the most recently used entry whose value matches
    pub fn take_most_recent_where<P>(&mut self, mut predicate: P) -> Option<(K, V)>
    where
        P: FnMut(&V) -> bool,
    {
        let key = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.value))
            .max_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&key).map(|entry| (key, entry.value))
    }

    /// Remove and return the least recently used entry
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&key).map(|entry| (key, entry.value))
    }

    /// Insert `value`, evicting the least recently used entry when a new key would
    /// exceed the capacity
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let evicted = if !self.entries.contains_key(&key) && self.is_full() {
            self.pop_lru()
        } else {
            None
        };
        let last_used = self.next_tick();
        self.entries.insert(key, Entry { last_used, value });
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Empty the map, returning every value
    pub fn drain(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, entry)| entry.value).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }
}
