//! Reference-counted table that never creates entries implicitly.
//!
//! Shared forwarding resources (next-hop groups, for instance) stay alive
//! only while something points at them. The table makes the three steps of
//! that lifecycle explicit:
//!
//! - `insert()` creates an entry with an initial count
//! - `increment_ref()` only succeeds on an existing entry
//! - `decrement_ref()` removes the entry and hands it back at zero
//!
//! There is no indexing operator, so a lookup of a missing key can never
//! leave a zero-count entry behind.

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Error type for RefCountTable operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefTableError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already present")]
    AlreadyPresent,
}

/// Result of dropping one reference.
#[derive(Debug, PartialEq, Eq)]
pub enum Released<V> {
    /// Other references remain; carries the new count.
    Retained(u32),
    /// That was the last reference; the entry was removed.
    Removed(V),
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    refs: u32,
}

/// A map whose entries carry a reference count.
///
/// ```
/// use overlay_orch_common::{RefCountTable, Released};
///
/// let mut groups: RefCountTable<&str, u32> = RefCountTable::new();
/// groups.insert("10.0.0.5", 7, 1).unwrap();
/// assert_eq!(groups.increment_ref(&"10.0.0.5"), Ok(2));
/// assert_eq!(groups.decrement_ref(&"10.0.0.5"), Ok(Released::Retained(1)));
/// assert_eq!(groups.decrement_ref(&"10.0.0.5"), Ok(Released::Removed(7)));
/// assert!(groups.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct RefCountTable<K, V> {
    inner: HashMap<K, Slot<V>>,
}

impl<K, V> RefCountTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the value for `key`. **Never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key).map(|slot| &slot.value)
    }

    /// Returns a mutable value for `key` without touching its count.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Returns the reference count for `key`, or `None` when absent.
    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|slot| slot.refs)
    }

    /// Creates an entry with `refs` initial references.
    ///
    /// Fails if the key is already present; the existing count is kept.
    pub fn insert(&mut self, key: K, value: V, refs: u32) -> Result<(), RefTableError> {
        if self.inner.contains_key(&key) {
            return Err(RefTableError::AlreadyPresent);
        }
        self.inner.insert(key, Slot { value, refs });
        Ok(())
    }

    /// Adds one reference to an existing entry and returns the new count.
    pub fn increment_ref(&mut self, key: &K) -> Result<u32, RefTableError> {
        let slot = self.inner.get_mut(key).ok_or(RefTableError::KeyNotFound)?;
        slot.refs = slot.refs.saturating_add(1);
        Ok(slot.refs)
    }

    /// Drops one reference; the entry is removed when no reference remains.
    pub fn decrement_ref(&mut self, key: &K) -> Result<Released<V>, RefTableError> {
        let slot = self.inner.get_mut(key).ok_or(RefTableError::KeyNotFound)?;
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return Ok(Released::Retained(slot.refs));
        }
        match self.inner.remove(key) {
            Some(slot) => Ok(Released::Removed(slot.value)),
            None => Err(RefTableError::KeyNotFound),
        }
    }

    /// Removes an entry regardless of its count.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|slot| slot.value)
    }

    /// Removes every entry matching `pred` and returns them.
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<(K, V)>
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        let keys: Vec<K> = self
            .inner
            .iter()
            .filter(|(k, slot)| pred(k, &slot.value))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| self.inner.remove(&k).map(|slot| (k, slot.value)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V, u32)> {
        self.inner.iter().map(|(k, slot)| (k, &slot.value, slot.refs))
    }
}

impl<K, V> Default for RefCountTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_get_never_creates() {
        let mut table: RefCountTable<String, u32> = RefCountTable::new();
        assert!(table.get(&"missing".to_string()).is_none());
        assert!(table.get_mut(&"missing".to_string()).is_none());
        assert_eq!(table.ref_count(&"missing".to_string()), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_increment_requires_existing_key() {
        let mut table: RefCountTable<&str, u32> = RefCountTable::new();
        assert_eq!(table.increment_ref(&"g"), Err(RefTableError::KeyNotFound));
        assert!(table.is_empty());

        table.insert("g", 100, 1).unwrap();
        assert_eq!(table.increment_ref(&"g"), Ok(2));
        assert_eq!(table.ref_count(&"g"), Some(2));
    }

    #[test]
    fn test_insert_twice_keeps_count() {
        let mut table: RefCountTable<&str, u32> = RefCountTable::new();
        table.insert("g", 100, 1).unwrap();
        table.increment_ref(&"g").unwrap();
        assert_eq!(table.insert("g", 200, 1), Err(RefTableError::AlreadyPresent));
        assert_eq!(table.get(&"g"), Some(&100));
        assert_eq!(table.ref_count(&"g"), Some(2));
    }

    #[test]
    fn test_last_release_removes() {
        let mut table: RefCountTable<&str, u32> = RefCountTable::new();
        table.insert("g", 100, 2).unwrap();
        assert_eq!(table.decrement_ref(&"g"), Ok(Released::Retained(1)));
        assert_eq!(table.decrement_ref(&"g"), Ok(Released::Removed(100)));
        assert_eq!(table.decrement_ref(&"g"), Err(RefTableError::KeyNotFound));
    }

    #[test]
    fn test_drain_where() {
        let mut table: RefCountTable<u32, &str> = RefCountTable::new();
        table.insert(1, "s1", 1).unwrap();
        table.insert(2, "s2", 3).unwrap();
        table.insert(3, "s1", 1).unwrap();

        let mut drained = table.drain_where(|_, v| *v == "s1");
        drained.sort();
        assert_eq!(drained, vec![(1, "s1"), (3, "s1")]);
        assert_eq!(table.len(), 1);
    }
}
