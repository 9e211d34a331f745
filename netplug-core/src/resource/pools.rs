//! Concrete resource pools.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::{
    MAX_VLAN_TAG, MAX_VXLAN_TAG, Resource, ResourceConfig, ResourceValue, SUBNET_POOL,
    VLAN_TAG_POOL, VXLAN_TAG_POOL,
};
use crate::bitmap::AllocBitmap;
use crate::error::ResourceError;
use crate::state::State;
use crate::state::keys::RESOURCE_OPER_PREFIX;

const MIN_SUBNET_PREFIX: u8 = 16;
const MAX_SUBNET_PREFIX: u8 = 30;

/// Contiguous range of numeric tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagResource {
    id: String,
    description: String,
    start: u32,
    end: u32,
    alloc_map: AllocBitmap,
}

impl TagResource {
    pub fn new(id: &str, description: &str, start: u32, end: u32) -> Result<Self, ResourceError> {
        let max = match description {
            VLAN_TAG_POOL => MAX_VLAN_TAG,
            VXLAN_TAG_POOL => MAX_VXLAN_TAG,
            other => {
                return Err(ResourceError::InvalidConfig(format!(
                    "'{}' is not a tag pool kind",
                    other
                )));
            }
        };
        if start == 0 || start > end || end > max {
            return Err(ResourceError::InvalidConfig(format!(
                "tag range {}-{} is outside 1-{} for {}",
                start, end, max, description
            )));
        }
        Ok(Self {
            id: id.to_string(),
            description: description.to_string(),
            start,
            end,
            alloc_map: AllocBitmap::new((end - start + 1) as usize),
        })
    }

    fn slot_of(&self, value: &ResourceValue) -> Result<usize, ResourceError> {
        match value.as_tag() {
            Some(tag) if (self.start..=self.end).contains(&tag) => Ok((tag - self.start) as usize),
            _ => Err(invalid_value(self, value)),
        }
    }
}

impl Resource for TagResource {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn capacity(&self) -> usize {
        self.alloc_map.len()
    }

    fn allocated(&self) -> usize {
        self.alloc_map.count_set()
    }

    fn allocate(&mut self) -> Result<ResourceValue, ResourceError> {
        let slot = self.alloc_map.first_clear().ok_or_else(|| exhausted(&*self))?;
        self.alloc_map.set(slot);
        Ok(ResourceValue::Tag(self.start + slot as u32))
    }

    fn reserve(&mut self, value: &ResourceValue) -> Result<(), ResourceError> {
        let slot = self.slot_of(value)?;
        if !self.alloc_map.set(slot) {
            return Err(ResourceError::InvalidValue {
                id: self.id.clone(),
                desc: self.description.clone(),
                value: format!("{} (already allocated)", value),
            });
        }
        Ok(())
    }

    fn deallocate(&mut self, value: &ResourceValue) -> Result<(), ResourceError> {
        let slot = self.slot_of(value)?;
        if !self.alloc_map.clear(slot) {
            return Err(double_free(&*self, value));
        }
        Ok(())
    }

    fn contains(&self, value: &ResourceValue) -> bool {
        self.slot_of(value).is_ok()
    }
}

/// Host addresses of one IPv4 subnet.
///
/// Slot `n` maps to the address `network + 1 + n`; the network and broadcast
/// addresses are never handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetResource {
    id: String,
    subnet: Ipv4Net,
    alloc_map: AllocBitmap,
}

impl SubnetResource {
    pub fn new(id: &str, subnet: Ipv4Net) -> Result<Self, ResourceError> {
        let prefix = subnet.prefix_len();
        if !(MIN_SUBNET_PREFIX..=MAX_SUBNET_PREFIX).contains(&prefix) {
            return Err(ResourceError::InvalidConfig(format!(
                "subnet {} must have a prefix length between /{} and /{}",
                subnet, MIN_SUBNET_PREFIX, MAX_SUBNET_PREFIX
            )));
        }
        let subnet = subnet.trunc();
        Ok(Self {
            id: id.to_string(),
            subnet,
            alloc_map: AllocBitmap::new(host_count(&subnet)),
        })
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    fn slot_of(&self, value: &ResourceValue) -> Result<usize, ResourceError> {
        let addr = value.as_address().ok_or_else(|| invalid_value(self, value))?;
        let offset = u32::from(addr).wrapping_sub(u32::from(self.subnet.network()));
        if !self.subnet.contains(&addr) || offset == 0 {
            return Err(invalid_value(self, value));
        }
        let slot = (offset - 1) as usize;
        if slot >= self.alloc_map.len() {
            return Err(invalid_value(self, value));
        }
        Ok(slot)
    }
}

/// Usable host addresses of a subnet, excluding network and broadcast.
fn host_count(subnet: &Ipv4Net) -> usize {
    (1usize << (32 - subnet.prefix_len())) - 2
}

impl Resource for SubnetResource {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        SUBNET_POOL
    }

    fn capacity(&self) -> usize {
        self.alloc_map.len()
    }

    fn allocated(&self) -> usize {
        self.alloc_map.count_set()
    }

    fn allocate(&mut self) -> Result<ResourceValue, ResourceError> {
        let slot = self.alloc_map.first_clear().ok_or_else(|| exhausted(&*self))?;
        self.alloc_map.set(slot);
        let addr = u32::from(self.subnet.network()) + 1 + slot as u32;
        Ok(ResourceValue::Address(Ipv4Addr::from(addr)))
    }

    fn reserve(&mut self, value: &ResourceValue) -> Result<(), ResourceError> {
        let slot = self.slot_of(value)?;
        if !self.alloc_map.set(slot) {
            return Err(ResourceError::InvalidValue {
                id: self.id.clone(),
                desc: SUBNET_POOL.to_string(),
                value: format!("{} (already allocated)", value),
            });
        }
        Ok(())
    }

    fn deallocate(&mut self, value: &ResourceValue) -> Result<(), ResourceError> {
        let slot = self.slot_of(value)?;
        if !self.alloc_map.clear(slot) {
            return Err(double_free(&*self, value));
        }
        Ok(())
    }

    fn contains(&self, value: &ResourceValue) -> bool {
        self.slot_of(value).is_ok()
    }
}

/// Persisted form of a pool: its config and allocation map in one record.
///
/// Stored as a single key so every allocation is a single-key update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pool", rename_all = "kebab-case")]
pub enum ResourcePool {
    Tags(TagResource),
    Subnet(SubnetResource),
}

impl ResourcePool {
    /// Build an empty pool from its definition.
    pub fn define(id: &str, config: &ResourceConfig) -> Result<Self, ResourceError> {
        match config {
            ResourceConfig::VlanTags { start, end } => {
                TagResource::new(id, VLAN_TAG_POOL, *start, *end).map(ResourcePool::Tags)
            }
            ResourceConfig::VxlanTags { start, end } => {
                TagResource::new(id, VXLAN_TAG_POOL, *start, *end).map(ResourcePool::Tags)
            }
            ResourceConfig::Subnet { subnet } => {
                SubnetResource::new(id, *subnet).map(ResourcePool::Subnet)
            }
        }
    }

    pub fn as_resource(&self) -> &dyn Resource {
        match self {
            ResourcePool::Tags(r) => r,
            ResourcePool::Subnet(r) => r,
        }
    }

    pub fn as_resource_mut(&mut self) -> &mut dyn Resource {
        match self {
            ResourcePool::Tags(r) => r,
            ResourcePool::Subnet(r) => r,
        }
    }
}

impl State for ResourcePool {
    /// Pools are always accessed under their kind's sub-prefix.
    const PREFIX: &'static str = RESOURCE_OPER_PREFIX;

    fn id(&self) -> &str {
        self.as_resource().id()
    }
}

fn exhausted(r: &dyn Resource) -> ResourceError {
    ResourceError::ResourceExhausted {
        id: r.id().to_string(),
        desc: r.description().to_string(),
    }
}

fn double_free(r: &dyn Resource, value: &ResourceValue) -> ResourceError {
    ResourceError::DoubleFree {
        id: r.id().to_string(),
        desc: r.description().to_string(),
        value: value.to_string(),
    }
}

fn invalid_value(r: &dyn Resource, value: &ResourceValue) -> ResourceError {
    ResourceError::InvalidValue {
        id: r.id().to_string(),
        desc: r.description().to_string(),
        value: value.to_string(),
    }
}
