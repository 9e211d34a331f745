//! OVS state entities.
//!
//! Config entities live under `/contiv/config/{nets,eps}/`, oper entities
//! under `/contiv/oper/{nets,eps}/`. A network is active once its oper entity
//! exists.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use netplug_core::bitmap::AllocBitmap;
use netplug_core::error::ResourceError;
use netplug_core::state::State;
use netplug_core::state::keys::{
    ENDPOINT_CONFIG_PREFIX, ENDPOINT_OPER_PREFIX, NETWORK_CONFIG_PREFIX, NETWORK_OPER_PREFIX,
};

/// Pool-like name used in errors about a network's address map.
const NETWORK_IP_POOL: &str = "network-ip";

/// Maximum length of a Linux interface name.
const IFNAMSIZ: usize = 15;

const PORT_PREFIX: &str = "cv-";
const PORT_DIGEST_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PktTagType {
    Vlan,
    Vxlan,
}

impl fmt::Display for PktTagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PktTagType::Vlan => write!(f, "vlan"),
            PktTagType::Vxlan => write!(f, "vxlan"),
        }
    }
}

// ============================================================================
// Networks
// ============================================================================

/// Requested network.
///
/// A tag of 0 asks the network driver to allocate one from the global pools.
/// `ip_alloc_map` holds one bit per usable host address, bit `n` standing
/// for `subnet_ip + 1 + n`. The default gateway is never handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvsCfgNetworkState {
    pub id: String,
    #[serde(default)]
    pub tenant: String,
    pub pkt_tag_type: PktTagType,
    #[serde(default)]
    pub pkt_tag: u32,
    #[serde(default)]
    pub ext_pkt_tag: u32,
    pub subnet_ip: Ipv4Addr,
    pub subnet_len: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_gw: Option<Ipv4Addr>,
    #[serde(default)]
    pub ep_count: u32,
    pub ip_alloc_map: AllocBitmap,
    /// Set while an agent tears the network down; endpoints may not join.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleting: bool,
}

impl OvsCfgNetworkState {
    /// A network with no endpoints and an empty address map.
    pub fn new(id: &str, pkt_tag_type: PktTagType, subnet: Ipv4Net) -> Self {
        let subnet = subnet.trunc();
        let hosts = (1u64 << (32 - subnet.prefix_len())).saturating_sub(2) as usize;
        Self {
            id: id.to_string(),
            tenant: String::new(),
            pkt_tag_type,
            pkt_tag: 0,
            ext_pkt_tag: 0,
            subnet_ip: subnet.network(),
            subnet_len: subnet.prefix_len(),
            default_gw: None,
            ep_count: 0,
            ip_alloc_map: AllocBitmap::new(hosts),
            deleting: false,
        }
    }

    pub fn with_tenant(mut self, tenant: &str) -> Self {
        self.tenant = tenant.to_string();
        self
    }

    pub fn with_tags(mut self, pkt_tag: u32, ext_pkt_tag: u32) -> Self {
        self.pkt_tag = pkt_tag;
        self.ext_pkt_tag = ext_pkt_tag;
        self
    }

    pub fn with_gateway(mut self, gw: Ipv4Addr) -> Self {
        self.default_gw = Some(gw);
        self
    }

    pub fn subnet(&self) -> Result<Ipv4Net, ResourceError> {
        Ipv4Net::new(self.subnet_ip, self.subnet_len).map_err(|_| {
            ResourceError::InvalidConfig(format!(
                "network {} has invalid subnet {}/{}",
                self.id, self.subnet_ip, self.subnet_len
            ))
        })
    }

    /// Number of addresses endpoints may still take.
    pub fn free_ips(&self) -> usize {
        let gw_free = self
            .gateway_slot()
            .is_some_and(|slot| !self.ip_alloc_map.is_set(slot));
        self.ip_alloc_map.count_clear() - usize::from(gw_free)
    }

    /// Take the lowest free address.
    pub fn allocate_ip(&mut self) -> Result<Ipv4Addr, ResourceError> {
        let gw = self.gateway_slot();
        let mut start = 0;
        loop {
            let slot = self
                .ip_alloc_map
                .first_clear_from(start)
                .ok_or_else(|| ResourceError::ResourceExhausted {
                    id: self.id.clone(),
                    desc: NETWORK_IP_POOL.to_string(),
                })?;
            if Some(slot) == gw {
                start = slot + 1;
                continue;
            }
            self.ip_alloc_map.set(slot);
            return Ok(self.addr_of(slot));
        }
    }

    /// Take a specific address.
    pub fn reserve_ip(&mut self, addr: Ipv4Addr) -> Result<(), ResourceError> {
        let slot = self.slot_of(addr)?;
        if Some(addr) == self.default_gw || !self.ip_alloc_map.set(slot) {
            return Err(self.invalid(format!("{} (unavailable)", addr)));
        }
        Ok(())
    }

    /// Return an address to the network.
    pub fn release_ip(&mut self, addr: Ipv4Addr) -> Result<(), ResourceError> {
        let slot = self.slot_of(addr)?;
        if !self.ip_alloc_map.clear(slot) {
            return Err(ResourceError::DoubleFree {
                id: self.id.clone(),
                desc: NETWORK_IP_POOL.to_string(),
                value: addr.to_string(),
            });
        }
        Ok(())
    }

    fn addr_of(&self, slot: usize) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet_ip) + 1 + slot as u32)
    }

    fn slot_of(&self, addr: Ipv4Addr) -> Result<usize, ResourceError> {
        let subnet = self.subnet()?;
        let offset = u32::from(addr).wrapping_sub(u32::from(subnet.network()));
        if !subnet.contains(&addr) || offset == 0 || offset as usize > self.ip_alloc_map.len() {
            return Err(self.invalid(addr.to_string()));
        }
        Ok(offset as usize - 1)
    }

    fn gateway_slot(&self) -> Option<usize> {
        self.default_gw.and_then(|gw| self.slot_of(gw).ok())
    }

    fn invalid(&self, value: String) -> ResourceError {
        ResourceError::InvalidValue {
            id: self.id.clone(),
            desc: NETWORK_IP_POOL.to_string(),
            value,
        }
    }
}

impl State for OvsCfgNetworkState {
    const PREFIX: &'static str = NETWORK_CONFIG_PREFIX;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Provisioned network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvsOperNetworkState {
    pub id: String,
    pub pkt_tag_type: PktTagType,
    pub pkt_tag: u32,
    pub ext_pkt_tag: u32,
    /// The internal tag came from the global pool and goes back on delete.
    pub pkt_tag_pooled: bool,
    pub ext_pkt_tag_pooled: bool,
    pub bridge: String,
    pub provisioned_at: DateTime<Utc>,
}

impl State for OvsOperNetworkState {
    const PREFIX: &'static str = NETWORK_OPER_PREFIX;

    fn id(&self) -> &str {
        &self.id
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Requested endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvsCfgEndpointState {
    pub id: String,
    pub net_id: String,
    /// Host label of the agent that provisions this endpoint.
    #[serde(default)]
    pub home_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Egress rate limit in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
}

impl OvsCfgEndpointState {
    pub fn new(id: &str, net_id: &str, home_host: &str) -> Self {
        Self {
            id: id.to_string(),
            net_id: net_id.to_string(),
            home_host: home_host.to_string(),
            ip_address: None,
            mac_address: None,
            bandwidth: None,
        }
    }
}

impl State for OvsCfgEndpointState {
    const PREFIX: &'static str = ENDPOINT_CONFIG_PREFIX;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Provisioned endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvsOperEndpointState {
    pub id: String,
    pub net_id: String,
    pub port_name: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
    pub pkt_tag: u32,
    pub home_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    pub provisioned_at: DateTime<Utc>,
}

impl State for OvsOperEndpointState {
    const PREFIX: &'static str = ENDPOINT_OPER_PREFIX;

    fn id(&self) -> &str {
        &self.id
    }
}

/// OVS port name of endpoint `id`, kept within the kernel's name limit.
///
/// Ids that do not fit as-is keep a short prefix followed by a digest of the
/// full id, so distinct ids map to distinct ports.
pub fn port_name(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if sanitized == id && PORT_PREFIX.len() + id.len() <= IFNAMSIZ {
        return format!("{}{}", PORT_PREFIX, id);
    }

    let digest = format!("{:x}", Sha256::digest(id.as_bytes()));
    let keep = IFNAMSIZ - PORT_PREFIX.len() - PORT_DIGEST_LEN;
    let prefix: String = sanitized.chars().take(keep).collect();
    format!("{}{}{}", PORT_PREFIX, prefix, &digest[..PORT_DIGEST_LEN])
}
