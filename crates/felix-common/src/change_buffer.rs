//! Per-kind change buffer with sent-state bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use tracing::debug;

use crate::error::InvariantViolation;

/// Where a key stands relative to the downstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// Never seen, or flushed and removed.
    Absent,
    /// Update queued, never sent.
    PendingNew,
    /// Last sent value is current; nothing queued.
    SentClean,
    /// Sent before; a newer value is queued.
    PendingUpdate,
    /// Sent before; removal queued.
    PendingDelete,
}

/// Buffer of pending changes for one entity kind.
///
/// A ChangeBuffer tracks three things per key:
///
/// - A pending update (the latest value reported since the last flush)
/// - A pending delete (only for keys that were sent downstream)
/// - Whether the key has been sent downstream
///
/// # Coalescing Logic
///
/// When multiple operations arrive for the same key between flushes:
/// - Multiple updates: keep only the latest value
/// - Update then remove of a never-sent key: nothing is emitted
/// - Remove then update of a sent key: the delete is cancelled, an update is emitted
///
/// Keys are held in ordered maps so a flush emits them in key order.
#[derive(Debug, Clone)]
pub struct ChangeBuffer<K, V> {
    kind: &'static str,
    pending_updates: BTreeMap<K, V>,
    pending_deletes: BTreeSet<K>,
    sent: BTreeSet<K>,
}

impl<K, V> ChangeBuffer<K, V>
where
    K: Ord + Clone + Debug,
{
    /// Creates an empty buffer. `kind` is used in logs and errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            pending_updates: BTreeMap::new(),
            pending_deletes: BTreeSet::new(),
            sent: BTreeSet::new(),
        }
    }

    /// Returns the entity kind name.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Returns the state of a key.
    pub fn state(&self, key: &K) -> KeyState {
        let sent = self.sent.contains(key);
        if self.pending_deletes.contains(key) {
            KeyState::PendingDelete
        } else if self.pending_updates.contains_key(key) {
            if sent {
                KeyState::PendingUpdate
            } else {
                KeyState::PendingNew
            }
        } else if sent {
            KeyState::SentClean
        } else {
            KeyState::Absent
        }
    }

    /// Upserts a value.
    ///
    /// Cancels any pending delete for the same key.
    pub fn on_active(&mut self, key: K, value: V) {
        debug!(kind = self.kind, key = ?key, "Buffering update");
        self.pending_deletes.remove(&key);
        self.pending_updates.insert(key, value);
    }

    /// Adds a value for a key that must not currently be live downstream.
    ///
    /// Fails if the key was sent and has no pending delete; replacing a key
    /// that is still pending-new is allowed.
    pub fn on_added(&mut self, key: K, value: V) -> Result<(), InvariantViolation> {
        if self.sent.contains(&key) && !self.pending_deletes.contains(&key) {
            return Err(InvariantViolation::duplicate_add(self.kind, &key));
        }
        self.on_active(key, value);
        Ok(())
    }

    /// Marks a key inactive.
    ///
    /// A pending update is discarded. If the key was sent, a delete is queued.
    /// A key that is neither pending nor sent is a protocol violation.
    pub fn on_inactive(&mut self, key: &K) -> Result<(), InvariantViolation> {
        debug!(kind = self.kind, key = ?key, "Buffering removal");
        let had_update = self.pending_updates.remove(key).is_some();
        if self.sent.contains(key) {
            self.pending_deletes.insert(key.clone());
            return Ok(());
        }
        if had_update {
            // Never sent, so nothing to tell downstream.
            return Ok(());
        }
        Err(InvariantViolation::unknown_key(self.kind, key))
    }

    /// Returns true if the key is sent or has a pending update.
    pub fn is_known(&self, key: &K) -> bool {
        self.sent.contains(key) || self.pending_updates.contains_key(key)
    }

    /// Returns true if the key has been sent downstream.
    pub fn is_sent(&self, key: &K) -> bool {
        self.sent.contains(key)
    }

    /// Returns the pending value for a key.
    pub fn pending_update(&self, key: &K) -> Option<&V> {
        self.pending_updates.get(key)
    }

    /// Returns a mutable reference to the pending value for a key.
    pub fn pending_update_mut(&mut self, key: &K) -> Option<&mut V> {
        self.pending_updates.get_mut(key)
    }

    /// Returns true if there is anything to flush.
    pub fn has_pending(&self) -> bool {
        !self.pending_updates.is_empty() || !self.pending_deletes.is_empty()
    }

    /// Returns the number of pending updates plus pending deletes.
    pub fn pending_count(&self) -> usize {
        self.pending_updates.len() + self.pending_deletes.len()
    }

    /// Returns the number of keys currently live downstream.
    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    /// Emits every pending delete and forgets the key.
    pub fn flush_deletes<F>(&mut self, mut emit: F)
    where
        F: FnMut(&K),
    {
        for key in std::mem::take(&mut self.pending_deletes) {
            emit(&key);
            self.sent.remove(&key);
        }
    }

    /// Emits every pending update and records the key as sent.
    pub fn flush_updates<F>(&mut self, mut emit: F)
    where
        F: FnMut(&K, V),
    {
        for (key, value) in std::mem::take(&mut self.pending_updates) {
            emit(&key, value);
            self.sent.insert(key);
        }
    }

    /// Drops all pending work. Sent state is kept.
    pub fn clear_pending(&mut self) {
        self.pending_updates.clear();
        self.pending_deletes.clear();
    }
}

impl<K, V> ChangeBuffer<K, V>
where
    K: Ord + Clone + Debug,
    V: Debug,
{
    /// Dumps pending entries for debugging.
    pub fn dump(&self) -> Vec<String> {
        let updates = self
            .pending_updates
            .iter()
            .map(|(k, v)| format!("{}: SET {:?} {:?}", self.kind, k, v));
        let deletes = self
            .pending_deletes
            .iter()
            .map(|k| format!("{}: DEL {:?}", self.kind, k));
        updates.chain(deletes).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flushed(buf: &mut ChangeBuffer<String, u32>) -> Vec<String> {
        let mut out = Vec::new();
        buf.flush_deletes(|k| out.push(format!("DEL {}", k)));
        buf.flush_updates(|k, v| out.push(format!("SET {}={}", k, v)));
        out
    }

    #[test]
    fn test_update_coalescing() {
        let mut buf = ChangeBuffer::new("test");
        buf.on_active("a".to_string(), 1);
        buf.on_active("a".to_string(), 2);

        assert_eq!(buf.pending_count(), 1);
        assert_eq!(buf.state(&"a".to_string()), KeyState::PendingNew);
        assert_eq!(flushed(&mut buf), vec!["SET a=2"]);
        assert_eq!(buf.state(&"a".to_string()), KeyState::SentClean);
    }

    #[test]
    fn test_never_sent_delete_is_silent() {
        let mut buf = ChangeBuffer::new("test");
        buf.on_active("a".to_string(), 1);
        buf.on_inactive(&"a".to_string()).unwrap();

        assert!(!buf.has_pending());
        assert_eq!(buf.state(&"a".to_string()), KeyState::Absent);
        assert!(flushed(&mut buf).is_empty());
    }

    #[test]
    fn test_update_cancels_delete() {
        let mut buf = ChangeBuffer::new("test");
        buf.on_active("a".to_string(), 1);
        flushed(&mut buf);

        buf.on_inactive(&"a".to_string()).unwrap();
        assert_eq!(buf.state(&"a".to_string()), KeyState::PendingDelete);

        buf.on_active("a".to_string(), 5);
        assert_eq!(buf.state(&"a".to_string()), KeyState::PendingUpdate);
        assert_eq!(flushed(&mut buf), vec!["SET a=5"]);
    }

    #[test]
    fn test_delete_of_sent_key() {
        let mut buf = ChangeBuffer::new("test");
        buf.on_active("a".to_string(), 1);
        flushed(&mut buf);

        buf.on_active("a".to_string(), 2);
        buf.on_inactive(&"a".to_string()).unwrap();
        assert_eq!(flushed(&mut buf), vec!["DEL a"]);
        assert_eq!(buf.state(&"a".to_string()), KeyState::Absent);
        assert_eq!(buf.sent_count(), 0);
    }

    #[test]
    fn test_unknown_removal_is_violation() {
        let mut buf: ChangeBuffer<String, u32> = ChangeBuffer::new("test");
        let err = buf.on_inactive(&"ghost".to_string()).unwrap_err();
        assert!(matches!(err, InvariantViolation::UnknownKey { kind: "test", .. }));
    }

    #[test]
    fn test_duplicate_add_is_violation() {
        let mut buf = ChangeBuffer::new("test");
        buf.on_added("a".to_string(), 1).unwrap();
        // Replacing a pending-new key is fine.
        buf.on_added("a".to_string(), 2).unwrap();
        flushed(&mut buf);

        assert!(buf.on_added("a".to_string(), 3).is_err());

        buf.on_inactive(&"a".to_string()).unwrap();
        buf.on_added("a".to_string(), 4).unwrap();
        assert_eq!(flushed(&mut buf), vec!["SET a=4"]);
    }

    #[test]
    fn test_flush_order_is_key_order() {
        let mut buf = ChangeBuffer::new("test");
        buf.on_active("c".to_string(), 3);
        buf.on_active("a".to_string(), 1);
        buf.on_active("b".to_string(), 2);
        assert_eq!(flushed(&mut buf), vec!["SET a=1", "SET b=2", "SET c=3"]);
    }

    #[test]
    fn test_dump() {
        let mut buf = ChangeBuffer::new("test");
        buf.on_active("a".to_string(), 1);
        assert_eq!(buf.dump(), vec!["test: SET \"a\" 1"]);
    }
}
