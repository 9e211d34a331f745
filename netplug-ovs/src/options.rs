//! The `ovs` config section.

use serde::{Deserialize, Serialize};

use netplug_core::error::ConfigError;
use netplug_core::resource::{MAX_VLAN_TAG, MAX_VXLAN_TAG};
use netplug_core::{Config, ResourceConfig};

/// Name of the section in the plugin config.
pub const SECTION: &str = "ovs";

pub const DEFAULT_BRIDGE: &str = "contivbr";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OvsOptions {
    /// Bridge endpoint ports are attached to.
    pub bridge: String,
    /// Tags the global VLAN pool hands out, as `start-end`.
    pub vlan_range: String,
    /// VNIs the global VXLAN pool hands out, as `start-end`.
    pub vxlan_range: String,
    pub vsctl: String,
    pub tc: String,
}

impl Default for OvsOptions {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            vlan_range: format!("1-{}", MAX_VLAN_TAG),
            vxlan_range: "1-10000".to_string(),
            vsctl: "ovs-vsctl".to_string(),
            tc: "tc".to_string(),
        }
    }
}

impl OvsOptions {
    /// Read and validate the section from a plugin config.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let options: OvsOptions = config.section(SECTION)?;
        options.validate()?;
        Ok(options)
    }

    pub fn vlan_pool(&self) -> Result<ResourceConfig, ConfigError> {
        let (start, end) = self.range("vlan-range", &self.vlan_range, MAX_VLAN_TAG)?;
        Ok(ResourceConfig::VlanTags { start, end })
    }

    pub fn vxlan_pool(&self) -> Result<ResourceConfig, ConfigError> {
        let (start, end) = self.range("vxlan-range", &self.vxlan_range, MAX_VXLAN_TAG)?;
        Ok(ResourceConfig::VxlanTags { start, end })
    }

    fn range(&self, field: &str, value: &str, max: u32) -> Result<(u32, u32), ConfigError> {
        let section_err = |reason: String| ConfigError::Section {
            section: SECTION.to_string(),
            reason: format!("{}: {}", field, reason),
        };
        let (start, end) =
            ResourceConfig::parse_tag_range(value).map_err(|e| section_err(e.to_string()))?;
        if start == 0 || start > end || end > max {
            return Err(section_err(format!("{} is outside 1-{}", value, max)));
        }
        Ok((start, end))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.is_empty() {
            return Err(ConfigError::Section {
                section: SECTION.to_string(),
                reason: "bridge must not be empty".to_string(),
            });
        }
        self.vlan_pool()?;
        self.vxlan_pool()?;
        Ok(())
    }
}
