//! netplugd: per-host network plugin daemon.
//!
//! This daemon:
//! - Loads the plugin config and composes the configured drivers
//! - Provisions networks and local endpoints from the config subtree
//! - Optionally runs the master tasks in the same process
//! - Tears the drivers down in reverse order on SIGINT/SIGTERM

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netplug_core::{Config, EndpointDriver, MemStateDriver, NetworkDriver, StateDriver};
use netplug_ovs::options::SECTION as OVS_SECTION;
use netplug_ovs::{
    OvsEndpointDriver, OvsNetworkDriver, OvsOptions, OvsPlugin, OvsSwitch, TcShaper, VsctlSwitch,
};

mod agent;
mod master;

use agent::Agent;

/// netplug daemon
#[derive(Parser, Debug)]
#[command(name = "netplugd", version, about)]
struct Args {
    /// Plugin config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host label endpoints are homed on (defaults to hostname)
    #[arg(long)]
    host_label: Option<String>,

    /// OVS bridge, overrides the config file
    #[arg(long)]
    bridge: Option<String>,

    /// Also run the master tasks in this process
    #[arg(long)]
    with_master: bool,

    /// Seconds between config drift reports (master only)
    #[arg(long, default_value = "30")]
    drift_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "netplugd=info,netplug_core=info,netplug_ovs=info,netplug_master=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let host_label = config.plugin_instance.host_label.clone();

    info!(
        host = %host_label,
        network = %config.drivers.network,
        endpoint = %config.drivers.endpoint,
        state = %config.drivers.state,
        "Starting netplugd"
    );

    let plugin = Arc::new(build_plugin(&config)?);
    plugin
        .init(&config)
        .await
        .context("Failed to initialize plugin")?;
    let state = Arc::clone(plugin.state_driver());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let agent = Agent::new(Arc::clone(&plugin), Arc::clone(&state), &host_label);
    let agent_shutdown = shutdown_rx.clone();
    let agent_handle = tokio::spawn(async move { agent.run(agent_shutdown).await });

    let master_handle = args.with_master.then(|| {
        let state = Arc::clone(&state);
        let interval = Duration::from_secs(args.drift_interval.max(1));
        let shutdown = shutdown_rx.clone();
        info!(drift_interval = interval.as_secs(), "Running master tasks");
        tokio::spawn(async move { master::run(state, interval, shutdown).await })
    });

    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);

    match agent_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Agent failed"),
        Err(e) => error!(error = %e, "Agent task panicked"),
    }
    if let Some(handle) = master_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Master failed"),
            Err(e) => error!(error = %e, "Master task panicked"),
        }
    }

    plugin.deinit().await;
    info!("Shutdown complete");
    Ok(())
}

/// Read the config file and apply command line overrides.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(label) = &args.host_label {
        config.plugin_instance.host_label = label.clone();
    }
    if config.plugin_instance.host_label.is_empty() {
        config.plugin_instance.host_label = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .context("Failed to determine hostname, pass --host-label")?;
    }

    if let Some(bridge) = &args.bridge {
        let mut ovs: OvsOptions = config.section(OVS_SECTION)?;
        ovs.bridge = bridge.clone();
        config.set_section(OVS_SECTION, &ovs)?;
    }
    Ok(config)
}

/// Map the configured driver names to instances.
fn build_plugin(config: &Config) -> Result<OvsPlugin> {
    let state: Arc<dyn StateDriver> = match config.drivers.state.as_str() {
        "mem" => Arc::new(MemStateDriver::with_watch_buffer(config.state.watch_buffer)),
        other => bail!("unknown state driver '{}'", other),
    };

    let options = OvsOptions::from_config(config)?;
    let switch: Arc<dyn OvsSwitch> =
        Arc::new(VsctlSwitch::new(&options.vsctl, options.bridge.clone()));

    let network: Arc<dyn NetworkDriver> = match config.drivers.network.as_str() {
        "ovs" => Arc::new(OvsNetworkDriver::new(Arc::clone(&switch))),
        other => bail!("unknown network driver '{}'", other),
    };
    let endpoint: Arc<dyn EndpointDriver> = match config.drivers.endpoint.as_str() {
        "ovs" => Arc::new(OvsEndpointDriver::new(
            switch,
            Arc::new(TcShaper::new(&options.tc)),
        )),
        other => bail!("unknown endpoint driver '{}'", other),
    };

    Ok(OvsPlugin::new(state, network, endpoint))
}
