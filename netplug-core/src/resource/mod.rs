//! Allocatable resources.
//!
//! A resource pool hands out scarce values (VLAN tags, VXLAN VNIs, subnet
//! addresses) from a fixed-size allocation bitmap, always choosing the lowest
//! free slot. The [`ResourceManager`] keeps named pools and makes each
//! allocation a single-key atomic update of the pool's persisted record.

mod manager;
mod pools;

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

pub use manager::{PoolUsage, StateResourceManager};
pub use pools::{ResourcePool, SubnetResource, TagResource};

/// Pool kind handing out 802.1Q VLAN ids.
pub const VLAN_TAG_POOL: &str = "vlan-tag-pool";
/// Pool kind handing out VXLAN network identifiers.
pub const VXLAN_TAG_POOL: &str = "vxlan-tag-pool";
/// Pool kind handing out host addresses of an IPv4 subnet.
pub const SUBNET_POOL: &str = "subnet-pool";

pub const MAX_VLAN_TAG: u32 = 4094;
pub const MAX_VXLAN_TAG: u32 = (1 << 24) - 1;

/// A value handed out by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceValue {
    Tag(u32),
    Address(Ipv4Addr),
}

impl ResourceValue {
    pub fn as_tag(&self) -> Option<u32> {
        match self {
            ResourceValue::Tag(tag) => Some(*tag),
            ResourceValue::Address(_) => None,
        }
    }

    pub fn as_address(&self) -> Option<Ipv4Addr> {
        match self {
            ResourceValue::Address(addr) => Some(*addr),
            ResourceValue::Tag(_) => None,
        }
    }
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::Tag(tag) => write!(f, "{}", tag),
            ResourceValue::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// Pool definition. The variant decides the pool kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceConfig {
    /// Inclusive range of VLAN ids.
    VlanTags { start: u32, end: u32 },
    /// Inclusive range of VXLAN VNIs.
    VxlanTags { start: u32, end: u32 },
    /// Host addresses of a subnet, excluding network and broadcast.
    Subnet { subnet: Ipv4Net },
}

impl ResourceConfig {
    /// Kind of pool this config defines.
    pub fn description(&self) -> &'static str {
        match self {
            ResourceConfig::VlanTags { .. } => VLAN_TAG_POOL,
            ResourceConfig::VxlanTags { .. } => VXLAN_TAG_POOL,
            ResourceConfig::Subnet { .. } => SUBNET_POOL,
        }
    }

    /// Parse a `start-end` tag range.
    pub fn parse_tag_range(range: &str) -> Result<(u32, u32), ResourceError> {
        let invalid = || ResourceError::InvalidConfig(format!("invalid tag range '{}'", range));
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse().map_err(|_| invalid())?;
        let end = end.trim().parse().map_err(|_| invalid())?;
        Ok((start, end))
    }
}

/// An allocatable unit with bounded capacity.
///
/// The allocation structure is sized once from the pool's config and never
/// resized.
pub trait Resource: Send + Sync {
    /// Pool instance id.
    fn id(&self) -> &str;

    /// Pool kind.
    fn description(&self) -> &str;

    /// Total number of values the pool can hand out.
    fn capacity(&self) -> usize;

    /// Number of values currently handed out.
    fn allocated(&self) -> usize;

    /// Take the lowest free value.
    fn allocate(&mut self) -> Result<ResourceValue, ResourceError>;

    /// Take a specific value.
    fn reserve(&mut self, value: &ResourceValue) -> Result<(), ResourceError>;

    /// Return a previously allocated value.
    fn deallocate(&mut self, value: &ResourceValue) -> Result<(), ResourceError>;

    /// Whether `value` is one this pool hands out, taken or not.
    fn contains(&self, value: &ResourceValue) -> bool;
}

/// Registry of named resource pools, addressed by `(id, description)`.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Create a pool. Fails with `AlreadyDefined` if it exists.
    async fn define_resource(
        &self,
        id: &str,
        desc: &str,
        config: &ResourceConfig,
    ) -> Result<(), ResourceError>;

    /// Remove a pool. Fails with `ResourceBusy` while values are allocated.
    async fn undefine_resource(&self, id: &str, desc: &str) -> Result<(), ResourceError>;

    /// Allocate the lowest free value of a pool.
    async fn allocate_resource_val(
        &self,
        id: &str,
        desc: &str,
    ) -> Result<ResourceValue, ResourceError>;

    /// Return a value to its pool.
    async fn deallocate_resource_val(
        &self,
        id: &str,
        desc: &str,
        value: &ResourceValue,
    ) -> Result<(), ResourceError>;
}
