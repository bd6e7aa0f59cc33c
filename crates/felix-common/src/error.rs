//! Invariant violation error kind and poisoning.
//!
//! An invariant violation means the caller broke the ingestion protocol (for
//! example removing a key it never added). The engine that detected it can no
//! longer trust its own bookkeeping, so it poisons itself and refuses further
//! work until it is rebuilt.

use std::fmt;
use thiserror::Error;

/// A protocol violation by the caller of a buffer or reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// Removal for a key that is neither pending nor previously sent.
    #[error("{kind}: removal of unknown key {key}")]
    UnknownKey { kind: &'static str, key: String },

    /// Add for a key that was already sent and has no pending removal.
    #[error("{kind}: duplicate add for already-sent key {key}")]
    DuplicateAdd { kind: &'static str, key: String },

    /// Member delta for a set that was never added.
    #[error("{kind}: member delta for unknown set {key}")]
    UnknownSet { kind: &'static str, key: String },

    /// Operation on a set that is already queued for deletion.
    #[error("{kind}: operation on already-deleted set {key}")]
    AlreadyDeleted { kind: &'static str, key: String },

    /// Value variant does not match the key variant.
    #[error("{kind}: value does not match key {key}")]
    MismatchedValue { kind: &'static str, key: String },

    /// Numeric ID could not be returned to its allocator.
    #[error("{kind}: failed to release id {id}: {reason}")]
    ReleaseFailed {
        kind: &'static str,
        id: u64,
        reason: String,
    },
}

impl InvariantViolation {
    /// Creates an unknown-key violation.
    pub fn unknown_key(kind: &'static str, key: impl fmt::Debug) -> Self {
        InvariantViolation::UnknownKey {
            kind,
            key: format!("{:?}", key),
        }
    }

    /// Creates a duplicate-add violation.
    pub fn duplicate_add(kind: &'static str, key: impl fmt::Debug) -> Self {
        InvariantViolation::DuplicateAdd {
            kind,
            key: format!("{:?}", key),
        }
    }

    /// Creates an unknown-set violation.
    pub fn unknown_set(kind: &'static str, key: impl fmt::Debug) -> Self {
        InvariantViolation::UnknownSet {
            kind,
            key: format!("{:?}", key),
        }
    }

    /// Creates a mismatched-value violation.
    pub fn mismatched_value(kind: &'static str, key: impl fmt::Debug) -> Self {
        InvariantViolation::MismatchedValue {
            kind,
            key: format!("{:?}", key),
        }
    }

    /// Creates an already-deleted violation.
    pub fn already_deleted(kind: &'static str, key: impl fmt::Debug) -> Self {
        InvariantViolation::AlreadyDeleted {
            kind,
            key: format!("{:?}", key),
        }
    }
}

/// Sticky poison flag.
///
/// Once set, the first cause is kept; later causes are ignored.
#[derive(Debug, Clone, Default)]
pub struct Poison {
    cause: Option<String>,
}

impl Poison {
    /// Creates a clean flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`Poison::poison`] has been called.
    pub fn is_poisoned(&self) -> bool {
        self.cause.is_some()
    }

    /// Returns the first recorded cause.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Records a cause. Only the first one sticks.
    pub fn poison(&mut self, cause: impl fmt::Display) {
        if self.cause.is_none() {
            self.cause = Some(cause.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_messages() {
        let err = InvariantViolation::unknown_key("policy", "default/p1");
        assert_eq!(err.to_string(), "policy: removal of unknown key \"default/p1\"");

        let err = InvariantViolation::duplicate_add("ipset", "s:abc");
        assert!(err.to_string().contains("duplicate add"));
    }

    #[test]
    fn test_poison_keeps_first_cause() {
        let mut poison = Poison::new();
        assert!(!poison.is_poisoned());

        poison.poison("first");
        poison.poison("second");

        assert!(poison.is_poisoned());
        assert_eq!(poison.cause(), Some("first"));
    }
}
