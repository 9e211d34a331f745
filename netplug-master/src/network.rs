//! North-bound network and endpoint configuration.
//!
//! Writes config entities only; agents watching the config subtree provision
//! them and report back through the oper subtree.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use netplug_core::resource::{MAX_VLAN_TAG, MAX_VXLAN_TAG};
use netplug_core::{StateAccess, StateError};
use netplug_ovs::{OvsCfgEndpointState, OvsCfgNetworkState, PktTagType};

use crate::error::{MasterError, Result};

/// Request to create a network. Tags left at 0 are allocated by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkSpec {
    pub id: String,
    #[serde(default)]
    pub tenant: String,
    pub pkt_tag_type: PktTagType,
    #[serde(default)]
    pub pkt_tag: u32,
    #[serde(default)]
    pub ext_pkt_tag: u32,
    pub subnet: Ipv4Net,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

/// Request to create an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointSpec {
    pub id: String,
    pub network: String,
    pub host: String,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub bandwidth: Option<u64>,
}

pub struct NetworkConfigurator {
    nets: StateAccess<OvsCfgNetworkState>,
    eps: StateAccess<OvsCfgEndpointState>,
}

impl NetworkConfigurator {
    pub fn new(
        nets: StateAccess<OvsCfgNetworkState>,
        eps: StateAccess<OvsCfgEndpointState>,
    ) -> Self {
        Self { nets, eps }
    }

    pub async fn create_network(&self, spec: &NetworkSpec) -> Result<OvsCfgNetworkState> {
        validate_network(spec)?;

        let mut net = OvsCfgNetworkState::new(&spec.id, spec.pkt_tag_type, spec.subnet)
            .with_tenant(&spec.tenant)
            .with_tags(spec.pkt_tag, spec.ext_pkt_tag);
        if let Some(gw) = spec.gateway {
            net = net.with_gateway(gw);
        }

        match self.nets.create(&net).await {
            Ok(()) => {}
            Err(StateError::Conflict(_)) => {
                return Err(MasterError::AlreadyExists(format!("network {}", spec.id)));
            }
            Err(e) => return Err(e.into()),
        }
        info!(network = %spec.id, subnet = %spec.subnet, tag_type = %spec.pkt_tag_type, "Network configured");
        Ok(net)
    }

    /// Remove a network's config. Refused while any endpoint references it.
    ///
    /// Only the config entity is removed here. Each agent sees the removal
    /// through its config watch and then deletes the oper entity and returns
    /// the network's tags, so oper outlives config by one watch round trip.
    /// The agent side tolerates the config already being gone.
    pub async fn delete_network(&self, id: &str) -> Result<()> {
        let referencing = self
            .eps
            .read_all()
            .await?
            .into_iter()
            .filter_map(|ep| ep.ok())
            .filter(|ep| ep.net_id == id)
            .count();
        if referencing > 0 {
            return Err(MasterError::InUse(format!(
                "network {} ({} endpoints)",
                id, referencing
            )));
        }

        // The count is checked against the exact record removed, so an
        // address claim landing in between makes the removal fail.
        let removed = self
            .nets
            .remove_if(id, |net| {
                if net.ep_count > 0 {
                    return Err(MasterError::InUse(format!(
                        "network {} ({} endpoints)",
                        id, net.ep_count
                    )));
                }
                Ok(())
            })
            .await?;
        if removed.is_none() {
            return Err(MasterError::NotFound(format!("network {}", id)));
        }
        info!(network = %id, "Network config removed");
        Ok(())
    }

    pub async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<OvsCfgEndpointState> {
        if spec.host.is_empty() {
            return Err(MasterError::Invalid(format!(
                "endpoint {} has no home host",
                spec.id
            )));
        }
        let net = self
            .nets
            .try_read(&spec.network)
            .await?
            .ok_or_else(|| MasterError::NotFound(format!("network {}", spec.network)))?;

        if let Some(ip) = spec.ip_address {
            let subnet = net.subnet()?;
            if !subnet.hosts().any(|host| host == ip) || Some(ip) == net.default_gw {
                return Err(MasterError::Invalid(format!(
                    "address {} is not a usable host of network {}",
                    ip, spec.network
                )));
            }
        }
        if spec.bandwidth == Some(0) {
            return Err(MasterError::Invalid(format!(
                "endpoint {} bandwidth must be greater than zero",
                spec.id
            )));
        }

        let ep = OvsCfgEndpointState {
            ip_address: spec.ip_address,
            mac_address: spec.mac_address.clone(),
            bandwidth: spec.bandwidth,
            ..OvsCfgEndpointState::new(&spec.id, &spec.network, &spec.host)
        };
        match self.eps.create(&ep).await {
            Ok(()) => {}
            Err(StateError::Conflict(_)) => {
                return Err(MasterError::AlreadyExists(format!("endpoint {}", spec.id)));
            }
            Err(e) => return Err(e.into()),
        }
        info!(endpoint = %spec.id, network = %spec.network, host = %spec.host, "Endpoint configured");
        Ok(ep)
    }

    pub async fn delete_endpoint(&self, id: &str) -> Result<()> {
        match self.eps.clear(id).await {
            Ok(()) => {
                info!(endpoint = %id, "Endpoint config removed");
                Ok(())
            }
            Err(StateError::NotFound(_)) => {
                Err(MasterError::NotFound(format!("endpoint {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_networks(&self) -> Result<Vec<OvsCfgNetworkState>> {
        Ok(self
            .nets
            .read_all()
            .await?
            .into_iter()
            .filter_map(|net| net.ok())
            .collect())
    }
}

fn validate_network(spec: &NetworkSpec) -> Result<()> {
    let invalid = |reason: String| MasterError::Invalid(format!("network {}: {}", spec.id, reason));

    let prefix = spec.subnet.prefix_len();
    if !(16..=30).contains(&prefix) {
        return Err(invalid(format!("subnet {} must be between /16 and /30", spec.subnet)));
    }
    if let Some(gw) = spec.gateway
        && !spec.subnet.trunc().hosts().any(|host| host == gw)
    {
        return Err(invalid(format!("gateway {} is not a host of {}", gw, spec.subnet)));
    }
    if spec.pkt_tag > MAX_VLAN_TAG {
        return Err(invalid(format!("vlan tag {} is out of range", spec.pkt_tag)));
    }
    let ext_max = match spec.pkt_tag_type {
        PktTagType::Vlan => MAX_VLAN_TAG,
        PktTagType::Vxlan => MAX_VXLAN_TAG,
    };
    if spec.ext_pkt_tag > ext_max {
        return Err(invalid(format!("external tag {} is out of range", spec.ext_pkt_tag)));
    }
    Ok(())
}
