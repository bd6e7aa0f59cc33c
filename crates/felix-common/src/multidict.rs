//! Key to set-of-values map that never leaves empty entries behind.
//!
//! `MultiDict` is used for IP set member deltas: one set of pending added
//! members and one of pending removed members per IP set ID.
//!
//! # The Problem
//!
//! A plain `map[key].insert(v)` style helper creates an empty entry on every
//! lookup. Empty entries then show up as "dirty" keys when iterating, which
//! turns into empty delta messages downstream.
//!
//! # The Solution
//!
//! `MultiDict` only creates an entry in [`MultiDict::put`] and removes the
//! entry as soon as its last value is discarded.

use std::collections::{BTreeMap, BTreeSet};

/// Ordered key to set-of-values map.
///
/// # Example
///
/// ```
/// use felix_common::MultiDict;
///
/// let mut dict: MultiDict<&str, u32> = MultiDict::new();
/// dict.put("s1", 1);
/// assert!(dict.contains(&"s1", &1));
///
/// dict.discard(&"s1", &1);
/// assert!(!dict.contains_key(&"s1"));
/// ```
#[derive(Debug, Clone)]
pub struct MultiDict<K, V> {
    inner: BTreeMap<K, BTreeSet<V>>,
}

impl<K, V> MultiDict<K, V>
where
    K: Ord,
    V: Ord,
{
    /// Creates a new empty dict.
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }

    /// Returns the number of keys.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if there are no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the total number of values across all keys.
    pub fn value_count(&self) -> usize {
        self.inner.values().map(BTreeSet::len).sum()
    }

    /// Returns true if the key has at least one value.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns true if the key holds the given value.
    pub fn contains(&self, key: &K, value: &V) -> bool {
        self.inner.get(key).is_some_and(|values| values.contains(value))
    }

    /// Returns the values for a key.
    ///
    /// **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<&BTreeSet<V>> {
        self.inner.get(key)
    }

    /// Adds a value. Returns true if it was not already present.
    pub fn put(&mut self, key: K, value: V) -> bool {
        self.inner.entry(key).or_default().insert(value)
    }

    /// Removes a value. Drops the key once it has no values left.
    pub fn discard(&mut self, key: &K, value: &V) -> bool {
        let Some(values) = self.inner.get_mut(key) else {
            return false;
        };
        let removed = values.remove(value);
        if values.is_empty() {
            self.inner.remove(key);
        }
        removed
    }

    /// Removes a key and all of its values.
    pub fn discard_key(&mut self, key: &K) -> Option<BTreeSet<V>> {
        self.inner.remove(key)
    }

    /// Removes a key and returns its values, or an empty set.
    pub fn take(&mut self, key: &K) -> BTreeSet<V> {
        self.inner.remove(key).unwrap_or_default()
    }

    /// Returns an iterator over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    /// Returns an iterator over keys and their value sets.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &BTreeSet<V>)> {
        self.inner.iter()
    }

    /// Clears all entries.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<K, V> Default for MultiDict<K, V>
where
    K: Ord,
    V: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}
