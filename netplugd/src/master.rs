//! In-process master tasks: the profile association cache and the periodic
//! drift report.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use netplug_core::{StateAccess, StateDriver, StateError};
use netplug_master::{ProfileRegistry, Reconciler};

pub async fn run(
    state: Arc<dyn StateDriver>,
    drift_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let registry = ProfileRegistry::new(
        StateAccess::new(Arc::clone(&state)),
        StateAccess::new(Arc::clone(&state)),
    );
    let mut profiles = registry
        .access()
        .watch_all()
        .await
        .context("Failed to watch profile associations")?;
    registry.load().await?;

    let reconciler = Reconciler::new(state);
    let mut ticker = tokio::time::interval(drift_interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = profiles.next() => match event {
                Some(Ok(change)) => registry.apply(change).await,
                Some(Err(StateError::WatchLagged { skipped, .. })) => {
                    warn!(skipped, "Profile watch lagged, reloading");
                    registry.load().await?;
                }
                Some(Err(e)) => warn!(error = %e, "Skipping unreadable profile change"),
                None => anyhow::bail!("profile association watch ended"),
            },
            _ = ticker.tick() => match reconciler.drift().await {
                Ok(drift) if drift.is_empty() => debug!("No config drift"),
                Ok(drift) => info!(
                    pending_networks = ?drift.networks.pending,
                    orphaned_networks = ?drift.networks.orphaned,
                    pending_endpoints = ?drift.endpoints.pending,
                    orphaned_endpoints = ?drift.endpoints.orphaned,
                    "Config drift"
                ),
                Err(e) => warn!(error = %e, "Drift check failed"),
            },
        }
    }

    registry.clear().await;
    info!("Master stopped");
    Ok(())
}
