//! Egress bandwidth shaping with a token bucket filter.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use netplug_core::DriverError;

/// Bytes the bucket may hold.
const TBF_BURST: u32 = 32768;
/// Bytes that may queue waiting for tokens.
const TBF_LIMIT: u32 = 1_500_000;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("bandwidth for {iface} must be greater than zero")]
    InvalidRate { iface: String },

    #[error("failed to run tc for {iface}: {source}")]
    Spawn {
        iface: String,
        source: std::io::Error,
    },

    #[error("failed to install tbf qdisc on {iface}: {stderr}")]
    Install { iface: String, stderr: String },
}

impl From<TrafficError> for DriverError {
    fn from(e: TrafficError) -> Self {
        DriverError::Traffic(e.to_string())
    }
}

/// Rate limiting of one interface.
#[async_trait]
pub trait TrafficShaper: Send + Sync {
    /// Replace any root qdisc of `iface` with a limit of `bits_per_sec`.
    async fn set_bandwidth(&self, iface: &str, bits_per_sec: u64) -> Result<(), TrafficError>;
}

/// [`TrafficShaper`] driving `tc`.
pub struct TcShaper {
    tc: PathBuf,
}

impl TcShaper {
    pub fn new(tc: impl Into<PathBuf>) -> Self {
        Self { tc: tc.into() }
    }
}

impl Default for TcShaper {
    fn default() -> Self {
        Self::new("tc")
    }
}

fn del_qdisc_args(iface: &str) -> Vec<String> {
    ["qdisc", "del", "dev", iface, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn tbf_args(iface: &str, bits_per_sec: u64) -> Vec<String> {
    vec![
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        iface.into(),
        "root".into(),
        "handle".into(),
        "1:".into(),
        "tbf".into(),
        "rate".into(),
        format!("{}bit", bits_per_sec),
        "burst".into(),
        TBF_BURST.to_string(),
        "limit".into(),
        TBF_LIMIT.to_string(),
    ]
}

#[async_trait]
impl TrafficShaper for TcShaper {
    async fn set_bandwidth(&self, iface: &str, bits_per_sec: u64) -> Result<(), TrafficError> {
        if bits_per_sec == 0 {
            return Err(TrafficError::InvalidRate {
                iface: iface.to_string(),
            });
        }

        // No qdisc installed yet is the common case.
        match Command::new(&self.tc).args(del_qdisc_args(iface)).output().await {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!(iface, stderr = %stderr.trim(), "No root qdisc removed");
            }
            Ok(_) => {}
            Err(e) => debug!(iface, error = %e, "Removing root qdisc failed"),
        }

        let output = Command::new(&self.tc)
            .args(tbf_args(iface, bits_per_sec))
            .output()
            .await
            .map_err(|source| TrafficError::Spawn {
                iface: iface.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(TrafficError::Install {
                iface: iface.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(iface, bits_per_sec, "Bandwidth limit applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tbf_args() {
        assert_eq!(
            tbf_args("cv-ep1", 10_000_000).join(" "),
            "qdisc add dev cv-ep1 root handle 1: tbf rate 10000000bit burst 32768 limit 1500000"
        );
        assert_eq!(del_qdisc_args("cv-ep1").join(" "), "qdisc del dev cv-ep1 root");
    }

    #[tokio::test]
    async fn test_zero_rate_rejected() {
        let shaper = TcShaper::new("/nonexistent/tc");
        assert!(matches!(
            shaper.set_bandwidth("cv-ep1", 0).await,
            Err(TrafficError::InvalidRate { .. })
        ));
    }

    #[tokio::test]
    async fn test_removal_failure_tolerated_install_failure_reported() {
        // `false` fails both the delete and the add.
        let shaper = TcShaper::new("false");
        let err = shaper.set_bandwidth("cv-ep1", 1000).await.unwrap_err();
        assert!(matches!(err, TrafficError::Install { ref iface, .. } if iface == "cv-ep1"));

        let shaper = TcShaper::new("/nonexistent/tc");
        assert!(matches!(
            shaper.set_bandwidth("cv-ep1", 1000).await,
            Err(TrafficError::Spawn { .. })
        ));
    }
}
