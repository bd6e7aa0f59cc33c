//! Numeric IDs for string-identified IP sets.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::debug;

/// Zero is never handed out; it means "no ID".
pub const NO_ID: u64 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdAllocError {
    #[error("ID {0} is not allocated")]
    NotAllocated(u64),
}

/// Maps string IDs to stable numeric IDs.
pub trait IdAllocator {
    /// Returns the ID for `name`, allocating one if needed. Never [`NO_ID`].
    fn get_or_alloc(&mut self, name: &str) -> u64;

    /// Returns the ID for `name`, or [`NO_ID`]. Never allocates.
    fn get_no_alloc(&self, name: &str) -> u64;

    /// Returns `id` to the free pool.
    fn release_uint_id(&mut self, id: u64) -> Result<(), IdAllocError>;
}

/// Allocator that hands out the smallest free ID, starting at 1.
#[derive(Debug, Default, Clone)]
pub struct DefaultIdAllocator {
    by_name: BTreeMap<String, u64>,
    by_id: BTreeMap<u64, String>,
    free: BTreeSet<u64>,
    next: u64,
}

impl DefaultIdAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            ..Default::default()
        }
    }

    /// Number of IDs currently allocated.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl IdAllocator for DefaultIdAllocator {
    fn get_or_alloc(&mut self, name: &str) -> u64 {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => {
                let id = self.next.max(1);
                self.next = id + 1;
                id
            }
        };
        debug!(name, id, "Allocated IP set ID");
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        id
    }

    fn get_no_alloc(&self, name: &str) -> u64 {
        self.by_name.get(name).copied().unwrap_or(NO_ID)
    }

    fn release_uint_id(&mut self, id: u64) -> Result<(), IdAllocError> {
        let name = self.by_id.remove(&id).ok_or(IdAllocError::NotAllocated(id))?;
        debug!(name = %name, id, "Released IP set ID");
        self.by_name.remove(&name);
        self.free.insert(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_stable() {
        let mut alloc = DefaultIdAllocator::new();
        assert_eq!(alloc.get_no_alloc("s:a"), NO_ID);

        let a = alloc.get_or_alloc("s:a");
        assert_ne!(a, NO_ID);
        assert_eq!(alloc.get_or_alloc("s:a"), a);
        assert_eq!(alloc.get_no_alloc("s:a"), a);
        assert_ne!(alloc.get_or_alloc("s:b"), a);
        assert_eq!(alloc.len(), 2);
    }

    #[test]
    fn test_release_and_reuse() {
        let mut alloc = DefaultIdAllocator::default();
        let a = alloc.get_or_alloc("s:a");
        let b = alloc.get_or_alloc("s:b");
        assert_eq!((a, b), (1, 2));

        alloc.release_uint_id(a).unwrap();
        assert_eq!(alloc.get_no_alloc("s:a"), NO_ID);
        assert_eq!(alloc.get_or_alloc("s:c"), a);
        assert_eq!(alloc.get_or_alloc("s:d"), 3);

        assert_eq!(
            alloc.release_uint_id(42),
            Err(IdAllocError::NotAllocated(42))
        );
    }
}
