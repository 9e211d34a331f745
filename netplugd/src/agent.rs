//! Host agent: drives the plugin from the config subtree.
//!
//! ```text
//! config/nets/*  ──watch──▶ create_network / delete_network
//! config/eps/*   ──watch──▶ create_endpoint / delete_endpoint   (home host only)
//! ```
//!
//! Both watches are opened before the initial sync so nothing written in
//! between is missed. A lagged watch falls back to a full resync; config is
//! level-triggered so replaying it is safe.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use netplug_core::{StateAccess, StateDriver, StateError, WatchState};
use netplug_ovs::{
    OvsCfgEndpointState, OvsCfgNetworkState, OvsOperEndpointState, OvsOperNetworkState, OvsPlugin,
};

/// Outcome of one full resync.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub networks: usize,
    pub endpoints: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct Agent {
    plugin: Arc<OvsPlugin>,
    host_label: String,
    nets: StateAccess<OvsCfgNetworkState>,
    net_oper: StateAccess<OvsOperNetworkState>,
    eps: StateAccess<OvsCfgEndpointState>,
    ep_oper: StateAccess<OvsOperEndpointState>,
}

impl Agent {
    pub fn new(plugin: Arc<OvsPlugin>, state: Arc<dyn StateDriver>, host_label: &str) -> Self {
        Self {
            plugin,
            host_label: host_label.to_string(),
            nets: StateAccess::new(Arc::clone(&state)),
            net_oper: StateAccess::new(Arc::clone(&state)),
            eps: StateAccess::new(Arc::clone(&state)),
            ep_oper: StateAccess::new(state),
        }
    }

    /// Watch config until `shutdown` flips or a watch ends.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut net_watch = self
            .nets
            .watch_all()
            .await
            .context("Failed to watch network config")?;
        let mut ep_watch = self
            .eps
            .watch_all()
            .await
            .context("Failed to watch endpoint config")?;

        self.sync().await?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Agent stopping");
                    return Ok(());
                }
                event = net_watch.next() => match event {
                    Some(Ok(change)) => self.on_network(change).await,
                    Some(Err(e)) => self.on_watch_error(e).await?,
                    None => anyhow::bail!("network config watch ended"),
                },
                event = ep_watch.next() => match event {
                    Some(Ok(change)) => self.on_endpoint(change).await,
                    Some(Err(e)) => self.on_watch_error(e).await?,
                    None => anyhow::bail!("endpoint config watch ended"),
                },
            }
        }
    }

    async fn on_watch_error(&self, err: StateError) -> Result<()> {
        match err {
            StateError::WatchLagged { prefix, skipped } => {
                warn!(%prefix, skipped, "Watch lagged, resyncing");
                self.sync().await?;
            }
            e => warn!(error = %e, "Skipping unreadable config change"),
        }
        Ok(())
    }

    /// Bring the dataplane in line with the whole config subtree.
    ///
    /// Creates every configured network and every endpoint homed on this
    /// host, then removes oper entries whose config is gone.
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let nets = self.nets.read_all().await.context("Failed to list networks")?;
        let mut configured_nets = BTreeSet::new();
        for net in nets {
            match net {
                // A delete that stopped half way; finish it.
                Ok(net) if net.deleting => match self.plugin.delete_network(&net.id).await {
                    Ok(()) => report.removed += 1,
                    Err(e) => {
                        warn!(network = %net.id, error = %e, "Interrupted network delete failed");
                        report.failed += 1;
                    }
                },
                Ok(net) => {
                    configured_nets.insert(net.id.clone());
                    match self.plugin.create_network(&net.id).await {
                        Ok(()) => report.networks += 1,
                        Err(e) => {
                            warn!(network = %net.id, error = %e, "Network sync failed");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Skipping unreadable network config"),
            }
        }

        let eps = self.eps.read_all().await.context("Failed to list endpoints")?;
        let mut configured_eps = BTreeSet::new();
        for ep in eps {
            match ep {
                Ok(ep) => {
                    configured_eps.insert(ep.id.clone());
                    if ep.home_host != self.host_label {
                        continue;
                    }
                    match self.plugin.create_endpoint(&ep.id).await {
                        Ok(()) => report.endpoints += 1,
                        Err(e) => {
                            warn!(endpoint = %ep.id, error = %e, "Endpoint sync failed");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Skipping unreadable endpoint config"),
            }
        }

        for oper in self.ep_oper.read_all().await?.into_iter().flatten() {
            if oper.home_host == self.host_label && !configured_eps.contains(&oper.id) {
                match self.plugin.delete_endpoint(&oper.id).await {
                    Ok(()) => report.removed += 1,
                    Err(e) => {
                        warn!(endpoint = %oper.id, error = %e, "Orphaned endpoint removal failed");
                        report.failed += 1;
                    }
                }
            }
        }
        for oper in self.net_oper.read_all().await?.into_iter().flatten() {
            if !configured_nets.contains(&oper.id) {
                match self.plugin.delete_network(&oper.id).await {
                    Ok(()) => report.removed += 1,
                    Err(e) => {
                        warn!(network = %oper.id, error = %e, "Orphaned network removal failed");
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            networks = report.networks,
            endpoints = report.endpoints,
            removed = report.removed,
            failed = report.failed,
            "Config sync complete"
        );
        Ok(report)
    }

    async fn on_network(&self, change: WatchState<OvsCfgNetworkState>) {
        let id = change.id;
        if change.curr.is_none() {
            if let Err(e) = self.plugin.delete_network(&id).await {
                warn!(network = %id, error = %e, "Network delete failed");
            }
            return;
        }

        // Address claims rewrite the network config; only a fresh one needs work.
        if change.prev.is_some() {
            return;
        }
        if let Err(e) = self.plugin.create_network(&id).await {
            warn!(network = %id, error = %e, "Network create failed");
            return;
        }
        self.provision_waiting(&id).await;
    }

    /// Endpoints that arrived before their network was active.
    async fn provision_waiting(&self, net_id: &str) {
        let eps = match self.eps.read_all().await {
            Ok(eps) => eps,
            Err(e) => {
                warn!(network = %net_id, error = %e, "Failed to list endpoints");
                return;
            }
        };
        for ep in eps.into_iter().flatten() {
            if ep.net_id == net_id
                && ep.home_host == self.host_label
                && let Err(e) = self.plugin.create_endpoint(&ep.id).await
            {
                warn!(endpoint = %ep.id, error = %e, "Endpoint create failed");
            }
        }
    }

    async fn on_endpoint(&self, change: WatchState<OvsCfgEndpointState>) {
        let id = change.id;
        match change.curr {
            Some(ep) => {
                if ep.home_host != self.host_label {
                    debug!(endpoint = %id, host = %ep.home_host, "Endpoint homed elsewhere");
                    return;
                }
                if let Err(e) = self.plugin.create_endpoint(&id).await {
                    warn!(endpoint = %id, error = %e, "Endpoint create failed");
                }
            }
            None => {
                // Only the home host owns the port.
                match self.ep_oper.try_read(&id).await {
                    Ok(Some(oper)) if oper.home_host == self.host_label => {
                        if let Err(e) = self.plugin.delete_endpoint(&id).await {
                            warn!(endpoint = %id, error = %e, "Endpoint delete failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(endpoint = %id, error = %e, "Failed to read endpoint oper"),
                }
            }
        }
    }
}
