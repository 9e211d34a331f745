//! OVS endpoint driver.
//!
//! ```text
//! create_endpoint:
//!   config/eps/<id> ─▶ network active? ─▶ IP + epCount (one update of config/nets/<net>)
//!                   ─▶ access port ─▶ bandwidth ─▶ oper/eps/<id>
//! ```
//!
//! Every step is undone if a later one fails, so a failed create leaves no
//! port, no address and no endpoint count behind.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use netplug_core::error::StateError;
use netplug_core::{Address, Config, DriverError, EndpointDriver, StateAccess, StateDriver};

use crate::ovs::OvsSwitch;
use crate::state::{
    OvsCfgEndpointState, OvsCfgNetworkState, OvsOperEndpointState, OvsOperNetworkState, port_name,
};
use crate::traffic::TrafficShaper;

#[derive(Clone)]
struct Context {
    nets: StateAccess<OvsCfgNetworkState>,
    net_oper: StateAccess<OvsOperNetworkState>,
    eps: StateAccess<OvsCfgEndpointState>,
    ep_oper: StateAccess<OvsOperEndpointState>,
    host_label: String,
}

impl Context {
    /// Take an address on the network and count the endpoint, as one
    /// update of the network's config entity.
    async fn claim_ip(&self, cfg: &OvsCfgEndpointState) -> Result<Ipv4Addr, DriverError> {
        let (_, ip) = self
            .nets
            .update(&cfg.net_id, |net| -> Result<Ipv4Addr, DriverError> {
                if net.deleting {
                    return Err(DriverError::NotReady(format!(
                        "network {} is being deleted",
                        net.id
                    )));
                }
                let ip = match cfg.ip_address {
                    Some(ip) => {
                        net.reserve_ip(ip)?;
                        ip
                    }
                    None => net.allocate_ip()?,
                };
                net.ep_count += 1;
                Ok(ip)
            })
            .await?;
        Ok(ip)
    }

    async fn release_ip(&self, net_id: &str, ip: Ipv4Addr) -> Result<(), DriverError> {
        self.nets
            .update(net_id, |net| -> Result<(), DriverError> {
                net.release_ip(ip)?;
                net.ep_count = net.ep_count.saturating_sub(1);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Undo `claim_ip` after a failed or lost create.
    async fn unclaim_ip(&self, id: &str, net_id: &str, ip: Ipv4Addr) {
        if let Err(e) = self.release_ip(net_id, ip).await {
            warn!(endpoint = %id, %ip, error = %e, "Failed to release address during rollback");
        }
    }
}

pub struct OvsEndpointDriver {
    switch: Arc<dyn OvsSwitch>,
    shaper: Arc<dyn TrafficShaper>,
    ctx: RwLock<Option<Context>>,
}

impl OvsEndpointDriver {
    pub fn new(switch: Arc<dyn OvsSwitch>, shaper: Arc<dyn TrafficShaper>) -> Self {
        Self {
            switch,
            shaper,
            ctx: RwLock::new(None),
        }
    }

    async fn ctx(&self) -> Result<Context, DriverError> {
        self.ctx.read().await.clone().ok_or(DriverError::NotInitialized)
    }

    /// Port and bandwidth steps of a create, undoing the port on failure.
    async fn plumb(
        &self,
        ctx: &Context,
        cfg: &OvsCfgEndpointState,
        port: &str,
        tag: u32,
    ) -> Result<(), DriverError> {
        self.switch.add_port(port, tag).await?;

        if let Some(bandwidth) = cfg.bandwidth
            && let Err(e) = self.shaper.set_bandwidth(port, bandwidth).await
        {
            self.unplumb(ctx, &cfg.id, port).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove the port of a failed create, unless a concurrent create of the
    /// same endpoint has since recorded it as its own.
    async fn unplumb(&self, ctx: &Context, id: &str, port: &str) {
        match ctx.ep_oper.try_read(id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                debug!(endpoint = %id, port, "Port belongs to a concurrent create, keeping it");
                return;
            }
            Err(e) => {
                warn!(endpoint = %id, port, error = %e, "Cannot tell whether port is in use, keeping it");
                return;
            }
        }
        if let Err(e) = self.switch.delete_port(port).await {
            warn!(endpoint = %id, port, error = %e, "Failed to remove port during rollback");
        }
    }
}

fn ignore_not_found(result: Result<(), StateError>) -> Result<(), StateError> {
    match result {
        Err(StateError::NotFound(_)) => Ok(()),
        other => other,
    }
}

/// Random locally administered unicast MAC.
fn random_mac() -> String {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut mac);
    mac[0] = (mac[0] & 0xfe) | 0x02;
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl EndpointDriver for OvsEndpointDriver {
    fn name(&self) -> &'static str {
        "ovs"
    }

    async fn init(&self, config: &Config, state: Arc<dyn StateDriver>) -> Result<(), DriverError> {
        *self.ctx.write().await = Some(Context {
            nets: StateAccess::new(Arc::clone(&state)),
            net_oper: StateAccess::new(Arc::clone(&state)),
            eps: StateAccess::new(Arc::clone(&state)),
            ep_oper: StateAccess::new(state),
            host_label: config.plugin_instance.host_label.clone(),
        });
        info!(host = %config.plugin_instance.host_label, "OVS endpoint driver initialized");
        Ok(())
    }

    async fn deinit(&self) {
        if self.ctx.write().await.take().is_some() {
            info!("OVS endpoint driver deinitialized");
        }
    }

    async fn create_endpoint(&self, id: &str) -> Result<(), DriverError> {
        let ctx = self.ctx().await?;

        if ctx.ep_oper.try_read(id).await?.is_some() {
            debug!(endpoint = %id, "Endpoint already provisioned");
            return Ok(());
        }

        let cfg = ctx.eps.read(id).await?;
        let net = ctx
            .net_oper
            .try_read(&cfg.net_id)
            .await?
            .ok_or_else(|| DriverError::NotReady(format!("network {}", cfg.net_id)))?;

        let ip = ctx.claim_ip(&cfg).await?;
        let port = port_name(id);

        if let Err(e) = self.plumb(&ctx, &cfg, &port, net.pkt_tag).await {
            ctx.unclaim_ip(id, &cfg.net_id, ip).await;
            return Err(e);
        }

        let mac = match &cfg.mac_address {
            Some(mac) => mac.clone(),
            None => random_mac(),
        };
        let oper = OvsOperEndpointState {
            id: id.to_string(),
            net_id: cfg.net_id.clone(),
            port_name: port.clone(),
            ip_address: ip,
            mac_address: mac,
            pkt_tag: net.pkt_tag,
            home_host: ctx.host_label.clone(),
            bandwidth: cfg.bandwidth,
            provisioned_at: Utc::now(),
        };

        match ctx.ep_oper.create(&oper).await {
            Ok(()) => {}
            Err(StateError::Conflict(_)) => {
                // Another create of this endpoint won; the port is now its.
                ctx.unclaim_ip(id, &cfg.net_id, ip).await;
                debug!(endpoint = %id, "Endpoint provisioned concurrently");
                return Ok(());
            }
            Err(e) => {
                self.unplumb(&ctx, id, &port).await;
                ctx.unclaim_ip(id, &cfg.net_id, ip).await;
                return Err(e.into());
            }
        }

        info!(
            endpoint = %id,
            network = %cfg.net_id,
            %ip,
            port = %port,
            tag = net.pkt_tag,
            "Endpoint created"
        );
        Ok(())
    }

    async fn delete_endpoint(&self, id: &str) -> Result<(), DriverError> {
        let ctx = self.ctx().await?;

        if let Some(oper) = ctx.ep_oper.try_read(id).await? {
            self.switch.delete_port(&oper.port_name).await?;

            // Only the caller that removes the oper entity returns the
            // address, so a retried delete cannot free it twice.
            if let Some(oper) = ctx.ep_oper.remove(id).await? {
                match ctx.release_ip(&oper.net_id, oper.ip_address).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        warn!(endpoint = %id, network = %oper.net_id, "Network config already gone");
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %id,
                            ip = %oper.ip_address,
                            error = %e,
                            "Address leaked, endpoint record already removed"
                        );
                        return Err(e);
                    }
                }
            }
        }

        ignore_not_found(ctx.eps.clear(id).await)?;
        info!(endpoint = %id, "Endpoint deleted");
        Ok(())
    }

    fn make_endpoint_address(&self) -> Result<Address, DriverError> {
        Ok(Address::new(random_mac()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = random_mac();
            assert_eq!(mac.len(), 17);
            let first = u8::from_str_radix(&mac[..2], 16).unwrap();
            assert_eq!(first & 0x01, 0, "multicast bit set in {}", mac);
            assert_eq!(first & 0x02, 0x02, "local bit clear in {}", mac);
        }
    }
}
