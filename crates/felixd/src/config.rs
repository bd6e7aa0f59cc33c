//! Agent configuration file support
//!
//! Loads and validates felixd configuration from TOML files.
//! Default location: /etc/felix/felixd.toml

use crate::error::{AgentError, Result};
use felix_bpf::IpFamily;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/felix/felixd.toml";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Event sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Interval between flushes while facts are arriving
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

/// IP set dataplane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpSetsConfig {
    /// IP version managed by this agent (4 or 6)
    #[serde(default = "default_ip_version")]
    pub ip_version: u8,

    /// Periodic full resync of the map; 0 disables it
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Pinned kernel IP sets map on bpffs. Unset keeps the sets in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_pin_path: Option<PathBuf>,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub listen_port: u16,
}

/// Fact stream source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// JSON-lines file, or `-` for stdin
    #[serde(default = "default_input_path")]
    pub path: String,
}

/// Complete felixd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sequencer: SequencerConfig,

    #[serde(default)]
    pub ipsets: IpSetsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub input: InputConfig,
}

// Default functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_interval() -> u64 {
    100
}

fn default_ip_version() -> u8 {
    4
}

fn default_resync_interval() -> u64 {
    90
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_port() -> u16 {
    9091
}

fn default_input_path() -> String {
    "-".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl Default for IpSetsConfig {
    fn default() -> Self {
        Self {
            ip_version: default_ip_version(),
            resync_interval_secs: default_resync_interval(),
            map_pin_path: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_port: default_metrics_port(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: default_input_path(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                AgentError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "felixd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            AgentError::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Get flush interval as Duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.sequencer.flush_interval_ms)
    }

    /// Get resync interval, `None` when periodic resync is off
    pub fn resync_interval(&self) -> Option<Duration> {
        match self.ipsets.resync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// IP family managed by the reconciler
    pub fn ip_family(&self) -> Result<IpFamily> {
        IpFamily::from_version(self.ipsets.ip_version).ok_or_else(|| {
            AgentError::Configuration(format!(
                "ip_version must be 4 or 6, got {}",
                self.ipsets.ip_version
            ))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.ip_family()?;

        if self.sequencer.flush_interval_ms == 0 {
            return Err(AgentError::Configuration(
                "flush_interval_ms must be > 0".to_string(),
            ));
        }

        if self.metrics.enabled && self.metrics.listen_port == 0 {
            return Err(AgentError::Configuration(
                "listen_port must be > 0 when metrics are enabled".to_string(),
            ));
        }

        if self.ipsets.map_pin_path.is_some() && !cfg!(feature = "aya") {
            return Err(AgentError::Configuration(
                "map_pin_path requires felixd built with the aya feature".to_string(),
            ));
        }

        if self.input.path.is_empty() {
            return Err(AgentError::Configuration(
                "input path must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
