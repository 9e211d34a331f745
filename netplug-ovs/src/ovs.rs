//! Open vSwitch boundary.
//!
//! Only bridge and port plumbing is done here; flow programming belongs to
//! the switch itself.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use netplug_core::DriverError;

#[derive(Debug, Error)]
pub enum OvsError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

impl From<OvsError> for DriverError {
    fn from(e: OvsError) -> Self {
        DriverError::Switch(e.to_string())
    }
}

/// Bridge and port operations on one OVS bridge.
#[async_trait]
pub trait OvsSwitch: Send + Sync {
    /// Name of the bridge all ports are attached to.
    fn bridge(&self) -> &str;

    /// Create the bridge unless it exists.
    async fn ensure_bridge(&self) -> Result<(), OvsError>;

    /// Add an internal access port carrying VLAN `tag`. Adding an existing
    /// port is not an error.
    async fn add_port(&self, name: &str, tag: u32) -> Result<(), OvsError>;

    /// Remove a port. Removing a missing port is not an error.
    async fn delete_port(&self, name: &str) -> Result<(), OvsError>;
}

/// [`OvsSwitch`] driving `ovs-vsctl`.
pub struct VsctlSwitch {
    vsctl: PathBuf,
    bridge: String,
}

impl VsctlSwitch {
    pub fn new(vsctl: impl Into<PathBuf>, bridge: impl Into<String>) -> Self {
        Self {
            vsctl: vsctl.into(),
            bridge: bridge.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<(), OvsError> {
        let command = format!("{} {}", self.vsctl.display(), args.join(" "));
        debug!(%command, "Running ovs-vsctl");

        let output = Command::new(&self.vsctl)
            .args(&args)
            .output()
            .await
            .map_err(|source| OvsError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(OvsError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn add_bridge_args(bridge: &str) -> Vec<String> {
    vec!["--may-exist".into(), "add-br".into(), bridge.into()]
}

fn add_port_args(bridge: &str, port: &str, tag: u32) -> Vec<String> {
    vec![
        "--may-exist".into(),
        "add-port".into(),
        bridge.into(),
        port.into(),
        format!("tag={}", tag),
        "--".into(),
        "set".into(),
        "Interface".into(),
        port.into(),
        "type=internal".into(),
    ]
}

fn del_port_args(bridge: &str, port: &str) -> Vec<String> {
    vec![
        "--if-exists".into(),
        "del-port".into(),
        bridge.into(),
        port.into(),
    ]
}

#[async_trait]
impl OvsSwitch for VsctlSwitch {
    fn bridge(&self) -> &str {
        &self.bridge
    }

    async fn ensure_bridge(&self) -> Result<(), OvsError> {
        self.run(add_bridge_args(&self.bridge)).await
    }

    async fn add_port(&self, name: &str, tag: u32) -> Result<(), OvsError> {
        self.run(add_port_args(&self.bridge, name, tag)).await
    }

    async fn delete_port(&self, name: &str) -> Result<(), OvsError> {
        self.run(del_port_args(&self.bridge, name)).await
    }
}
