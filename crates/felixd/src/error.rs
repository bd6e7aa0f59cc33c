//! Error types for felixd

use felix_bpf::{IpSetsError, MapError};
use felix_calc::SequencerError;
use thiserror::Error;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    /// Agent configuration is unreadable or invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line of the fact stream did not parse
    #[error("Bad input at line {line}: {source}")]
    Input {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A fact carried a value that does not parse into its model type
    #[error("Bad value at line {line}: {reason}")]
    Value { line: usize, reason: String },

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    #[error(transparent)]
    IpSets(#[from] IpSetsError),

    /// The BPF map could not be opened or read
    #[error(transparent)]
    Map(#[from] MapError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The dataplane task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::Configuration("ip_version must be 4 or 6".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: ip_version must be 4 or 6"
        );

        let err = AgentError::Value {
            line: 3,
            reason: "invalid member".to_string(),
        };
        assert_eq!(err.to_string(), "Bad value at line 3: invalid member");
    }
}
