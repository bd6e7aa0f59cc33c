//! Error types for the BPF IP set dataplane

use felix_common::InvariantViolation;
use thiserror::Error;

/// Backing map I/O failure. Never fatal to the reconciler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("Map iteration failed: {0}")]
    Iter(String),

    #[error("Map update failed: {0}")]
    Update(String),

    #[error("Map delete failed: {0}")]
    Delete(String),

    #[error("Key not found")]
    NotFound,
}

/// IP set reconciler errors. All of them poison the reconciler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpSetsError {
    /// The caller broke the ingestion protocol
    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// A previous error left the reconciler unusable
    #[error("IP sets poisoned: {cause}")]
    Poisoned { cause: String },
}

/// Result type for IP set operations
pub type Result<T> = std::result::Result<T, IpSetsError>;
