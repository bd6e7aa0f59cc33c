//! Dataplane configuration merge.
//!
//! Felix configuration arrives as raw string maps from two datastore layers:
//! cluster-global and per-host. The per-host layer overrides the global one.
//! The sequencer only emits a [`ConfigUpdate`](crate::messages::ConfigUpdate)
//! when the merged view actually changes.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::messages::ConfigUpdate;

/// Raw configuration map, parameter name to value.
pub type RawConfig = BTreeMap<String, String>;

/// Which datastore layer a raw map came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    DatastoreGlobal,
    DatastorePerHost,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::DatastoreGlobal => f.write_str("datastore-global"),
            Source::DatastorePerHost => f.write_str("datastore-per-host"),
        }
    }
}

/// Errors from parsing a configuration layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name} from {layer}: expected {expected}")]
    InvalidValue {
        name: String,
        value: String,
        layer: Source,
        expected: &'static str,
    },
}

/// Merge layer used by the sequencer.
pub trait ConfigInterface {
    /// Replaces one layer. Returns true if the merged view changed.
    fn update_from(&mut self, raw: &RawConfig, source: Source) -> Result<bool, ConfigError>;

    /// Returns the merged view.
    fn raw_values(&self) -> RawConfig;

    /// Builds the message announcing the merged view.
    fn to_config_update(&self) -> ConfigUpdate;
}

#[derive(Debug, Clone, Copy)]
enum ParamKind {
    Bool,
    Int,
    Severity,
}

impl ParamKind {
    fn expected(&self) -> &'static str {
        match self {
            ParamKind::Bool => "a boolean",
            ParamKind::Int => "an integer",
            ParamKind::Severity => "a log severity",
        }
    }

    /// Returns the canonical form of a valid value.
    fn normalize(&self, value: &str) -> Option<String> {
        let v = value.trim();
        match self {
            ParamKind::Bool => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "t" => Some("true".to_string()),
                "false" | "0" | "no" | "n" | "f" => Some("false".to_string()),
                _ => None,
            },
            ParamKind::Int => v.parse::<i64>().ok().map(|n| n.to_string()),
            ParamKind::Severity => match v.to_ascii_uppercase().as_str() {
                "DEBUG" => Some("DEBUG".to_string()),
                "INFO" => Some("INFO".to_string()),
                "WARN" | "WARNING" => Some("WARNING".to_string()),
                "ERROR" => Some("ERROR".to_string()),
                "FATAL" => Some("FATAL".to_string()),
                "PANIC" => Some("PANIC".to_string()),
                _ => None,
            },
        }
    }
}

/// Typed parameters. Anything else passes through untouched.
const KNOWN_PARAMS: &[(&str, ParamKind)] = &[
    ("BPFEnabled", ParamKind::Bool),
    ("IPv6Support", ParamKind::Bool),
    ("WireguardEnabled", ParamKind::Bool),
    ("WireguardEnabledV6", ParamKind::Bool),
    ("BPFMapSizeIPSets", ParamKind::Int),
    ("IpsetsRefreshInterval", ParamKind::Int),
    ("RouteRefreshInterval", ParamKind::Int),
    ("LogSeverityScreen", ParamKind::Severity),
    ("LogSeverityFile", ParamKind::Severity),
    ("LogSeveritySys", ParamKind::Severity),
];

fn param_kind(name: &str) -> Option<ParamKind> {
    KNOWN_PARAMS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, kind)| *kind)
}

/// Default [`ConfigInterface`]: validated two-layer merge.
#[derive(Debug, Clone, Default)]
pub struct Config {
    global: RawConfig,
    per_host: RawConfig,
    merged: RawConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns one merged value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.merged.get(name).map(String::as_str)
    }

    fn validate(raw: &RawConfig, source: Source) -> Result<RawConfig, ConfigError> {
        raw.iter()
            .map(|(name, value)| {
                let Some(kind) = param_kind(name) else {
                    return Ok((name.clone(), value.clone()));
                };
                kind.normalize(value)
                    .map(|v| (name.clone(), v))
                    .ok_or_else(|| ConfigError::InvalidValue {
                        name: name.clone(),
                        value: value.clone(),
                        layer: source,
                        expected: kind.expected(),
                    })
            })
            .collect()
    }

    fn remerge(&mut self) -> bool {
        let mut merged = self.global.clone();
        merged.extend(self.per_host.iter().map(|(k, v)| (k.clone(), v.clone())));
        if merged == self.merged {
            return false;
        }
        self.merged = merged;
        true
    }
}

impl ConfigInterface for Config {
    fn update_from(&mut self, raw: &RawConfig, source: Source) -> Result<bool, ConfigError> {
        let parsed = Self::validate(raw, source)?;
        debug!(%source, params = parsed.len(), "Applying config layer");
        match source {
            Source::DatastoreGlobal => self.global = parsed,
            Source::DatastorePerHost => self.per_host = parsed,
        }
        let changed = self.remerge();
        if changed {
            info!(%source, "Merged config changed");
        }
        Ok(changed)
    }

    fn raw_values(&self) -> RawConfig {
        self.merged.clone()
    }

    fn to_config_update(&self) -> ConfigUpdate {
        ConfigUpdate {
            config: self.merged.clone(),
        }
    }
}
