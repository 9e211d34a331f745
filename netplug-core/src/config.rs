//! Plugin configuration.
//!
//! The configuration is a JSON document. Well-known sections are typed;
//! driver specific sections are kept as raw JSON and decoded on demand by the
//! driver that owns them:
//!
//! ```json
//! {
//!   "drivers": { "network": "ovs", "endpoint": "ovs", "state": "mem" },
//!   "plugin-instance": { "host-label": "host1" },
//!   "state": { "watch-buffer": 1024 },
//!   "ovs": { "bridge": "contivbr", "vlan-range": "1-4094" }
//! }
//! ```

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default size of the shared watch buffer.
pub const DEFAULT_WATCH_BUFFER: usize = 1024;

/// Top-level plugin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub drivers: DriverNames,
    #[serde(default)]
    pub plugin_instance: InstanceConfig,
    #[serde(default)]
    pub state: StateConfig,
    /// Driver specific sections, keyed by section name.
    #[serde(flatten)]
    pub sections: serde_json::Map<String, serde_json::Value>,
}

/// Names of the drivers composed into a plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DriverNames {
    pub network: String,
    pub endpoint: String,
    pub state: String,
}

impl Default for DriverNames {
    fn default() -> Self {
        Self {
            network: "ovs".to_string(),
            endpoint: "ovs".to_string(),
            state: "mem".to_string(),
        }
    }
}

/// Per-host identity of this plugin instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    #[serde(default)]
    pub host_label: String,
}

/// State driver settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StateConfig {
    /// Number of change events buffered for watchers before the oldest are
    /// dropped.
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

fn default_watch_buffer() -> usize {
    DEFAULT_WATCH_BUFFER
}

impl Config {
    /// Parse a configuration from its JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Decode a driver specific section. A missing section yields the
    /// section type's default.
    pub fn section<T>(&self, name: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default,
    {
        match self.sections.get(name) {
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|e| ConfigError::Section {
                    section: name.to_string(),
                    reason: e.to_string(),
                })
            }
            None => Ok(T::default()),
        }
    }

    /// Replace a driver specific section.
    pub fn set_section<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), ConfigError> {
        let value = serde_json::to_value(value).map_err(|e| ConfigError::Section {
            section: name.to_string(),
            reason: e.to_string(),
        })?;
        self.sections.insert(name.to_string(), value);
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.state.watch_buffer == 0 {
            return Err(ConfigError::Invalid(
                "state.watch-buffer must be greater than zero".to_string(),
            ));
        }
        for (kind, name) in [
            ("network", &self.drivers.network),
            ("endpoint", &self.drivers.endpoint),
            ("state", &self.drivers.state),
        ] {
            if name.is_empty() {
                return Err(ConfigError::Invalid(format!("{} driver name is empty", kind)));
            }
        }
        Ok(())
    }
}
