//! Coalescing batching stage.
//!
//! Bursts of events from a routing peer are absorbed into a batch that is
//! flushed either when it is full or when its time window expires. Events
//! for the same key coalesce: only the latest intent survives, so a route
//! that flaps inside one window costs a single job.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

/// Pending events keyed by `K`, flushed in first-arrival order.
#[derive(Debug)]
pub struct Batcher<K, V> {
    name: String,
    max_batch: usize,
    pending: HashMap<K, V>,
    order: VecDeque<K>,
    coalesced: u64,
}

impl<K, V> Batcher<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Debug,
{
    /// Creates a batcher that reports itself full at `max_batch` keys.
    pub fn new(name: impl Into<String>, max_batch: usize) -> Self {
        Self {
            name: name.into(),
            max_batch: max_batch.max(1),
            pending: HashMap::new(),
            order: VecDeque::new(),
            coalesced: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_batch
    }

    /// Number of events absorbed by coalescing since creation.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Adds an event; a pending event for the same key is replaced.
    ///
    /// Returns true when the batch has reached its size limit.
    pub fn push(&mut self, key: K, value: V) -> bool {
        if self.pending.insert(key.clone(), value).is_some() {
            self.coalesced += 1;
        } else {
            self.order.push_back(key);
        }
        self.is_full()
    }

    /// Takes every pending event, oldest key first.
    /// Like [`push`](Self::push), but a pending value for the same key is
    /// combined with the new one by `merge(pending, new)` instead of being
    /// replaced. The key keeps its place in the batch.
    pub fn push_merge<F>(&mut self, key: K, value: V, merge: F) -> bool
    where
        F: FnOnce(V, V) -> V,
    {
        let value = match self.pending.remove(&key) {
            Some(previous) => {
                self.coalesced += 1;
                merge(previous, value)
            }
            None => {
                self.order.push_back(key.clone());
                value
            }
        };
        self.pending.insert(key, value);
        self.is_full()
    }

    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(value) = self.pending.remove(&key) {
                out.push((key, value));
            }
        }
        out
    }

    /// Dumps pending events for debugging.
    pub fn dump(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|key| {
                self.pending
                    .get(key)
                    .map(|value| format!("{}: {:?} {:?}", self.name, key, value))
            })
            .collect()
    }
}
