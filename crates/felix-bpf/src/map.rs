//! Backing map abstraction.
//!
//! The reconciler only needs byte-level iterate/update/delete. Keys and values
//! are fixed-width encodings (see [`crate::entry`]).

use std::collections::{BTreeMap, BTreeSet};

use crate::error::MapError;

/// What to do with the entry just visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterAction {
    Continue,
    Stop,
    /// Delete the current entry, then continue.
    Delete,
}

/// Key/value store the reconciler converges.
pub trait BackingMap {
    fn iter(
        &mut self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> IterAction,
    ) -> Result<(), MapError>;

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), MapError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), MapError>;

    /// Number of resident entries, counted with a full scan.
    fn count_entries(&mut self) -> Result<usize, MapError> {
        let mut count = 0;
        self.iter(&mut |_, _| {
            count += 1;
            IterAction::Continue
        })?;
        Ok(count)
    }
}

impl<M: BackingMap + ?Sized> BackingMap for &mut M {
    fn iter(
        &mut self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> IterAction,
    ) -> Result<(), MapError> {
        (**self).iter(visit)
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        (**self).update(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), MapError> {
        (**self).delete(key)
    }
}

/// Ordered in-memory map with fault injection.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMap {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    fail_updates: BTreeSet<Vec<u8>>,
    fail_deletes: BTreeSet<Vec<u8>>,
    fail_iter: bool,
    num_updates: usize,
    num_deletes: usize,
}

impl InMemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.keys().map(Vec::as_slice)
    }

    /// Inserts directly, bypassing fault injection and write counters.
    /// Used to seed state left behind by a previous process.
    pub fn seed(&mut self, key: &[u8], value: &[u8]) {
        self.entries.insert(key.to_vec(), value.to_vec());
    }

    /// Makes every update of `key` fail until cleared.
    pub fn fail_update_of(&mut self, key: &[u8]) {
        self.fail_updates.insert(key.to_vec());
    }

    /// Makes every delete of `key` fail until cleared.
    pub fn fail_delete_of(&mut self, key: &[u8]) {
        self.fail_deletes.insert(key.to_vec());
    }

    pub fn set_fail_iter(&mut self, fail: bool) {
        self.fail_iter = fail;
    }

    pub fn clear_faults(&mut self) {
        self.fail_updates.clear();
        self.fail_deletes.clear();
        self.fail_iter = false;
    }

    /// Successful updates plus deletes so far.
    pub fn write_count(&self) -> usize {
        self.num_updates + self.num_deletes
    }
}

impl BackingMap for InMemoryMap {
    fn iter(
        &mut self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> IterAction,
    ) -> Result<(), MapError> {
        if self.fail_iter {
            return Err(MapError::Iter("injected failure".to_string()));
        }
        let mut to_delete = Vec::new();
        for (k, v) in &self.entries {
            match visit(k, v) {
                IterAction::Continue => {}
                IterAction::Stop => break,
                IterAction::Delete => to_delete.push(k.clone()),
            }
        }
        for k in to_delete {
            self.entries.remove(&k);
            self.num_deletes += 1;
        }
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        if self.fail_updates.contains(key) {
            return Err(MapError::Update("injected failure".to_string()));
        }
        self.entries.insert(key.to_vec(), value.to_vec());
        self.num_updates += 1;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), MapError> {
        if self.fail_deletes.contains(key) {
            return Err(MapError::Delete("injected failure".to_string()));
        }
        if self.entries.remove(key).is_none() {
            return Err(MapError::NotFound);
        }
        self.num_deletes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_delete_and_stop() {
        let mut map = InMemoryMap::new();
        map.seed(&[1], &[0]);
        map.seed(&[2], &[0]);
        map.seed(&[3], &[0]);

        let mut seen = Vec::new();
        map.iter(&mut |k, _| {
            seen.push(k[0]);
            match k[0] {
                1 => IterAction::Delete,
                2 => IterAction::Stop,
                _ => IterAction::Continue,
            }
        })
        .unwrap();

        assert_eq!(seen, vec![1, 2]);
        assert!(!map.contains_key(&[1]));
        assert_eq!(map.len(), 2);
        assert_eq!(map.count_entries(), Ok(2));
    }

    #[test]
    fn test_fault_injection() {
        let mut map = InMemoryMap::new();
        map.fail_update_of(&[7]);
        assert!(map.update(&[7], &[1]).is_err());
        assert!(map.update(&[8], &[1]).is_ok());
        assert_eq!(map.delete(&[9]), Err(MapError::NotFound));

        map.set_fail_iter(true);
        assert!(map.iter(&mut |_, _| IterAction::Continue).is_err());
        assert!(map.count_entries().is_err());

        map.clear_faults();
        assert!(map.update(&[7], &[1]).is_ok());
        assert_eq!(map.write_count(), 2);
    }
}
