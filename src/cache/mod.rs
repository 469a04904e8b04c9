//! In-memory caches.
//!
//! - [`compute_hash`]: SHA-256 over the JSON form of a value, used to decide
//!   whether a structure snapshot actually changed.
//! - [`ClosedResourceCache`]: last known state of resources whose worker has
//!   gone away, so a reopen can resume from it.
//!
//! # Eviction
//!
//! ```text
//! insert(k3)   [k1, k2] -> [k1, k2, k3]
//! insert(k1)   [k1, k2, k3] -> [k2, k3, k1]     re-insert moves to the back
//! insert(k4)   capacity 3 -> [k3, k1, k4]       oldest entry dropped
//! ```

mod hash;
pub use hash::compute_hash;

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Bounded insertion-ordered map; the oldest entry is evicted first.
#[derive(Debug)]
pub struct ClosedResourceCache<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> ClosedResourceCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key.clone(), value).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
