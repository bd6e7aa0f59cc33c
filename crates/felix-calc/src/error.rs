//! Error types for the event sequencer

use felix_common::InvariantViolation;
use thiserror::Error;

use crate::config::ConfigError;

/// Sequencer errors. All of them are fatal for the sequencer instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// The caller broke the ingestion protocol
    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// The merged configuration could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A previous error left the sequencer unusable
    #[error("Sequencer poisoned: {cause}")]
    Poisoned { cause: String },
}

/// Result type for sequencer operations
pub type Result<T> = std::result::Result<T, SequencerError>;
