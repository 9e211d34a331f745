//! Config versus oper drift.
//!
//! A crash between writing a config entity and its oper counterpart leaves
//! the two subtrees out of step. [`Reconciler::drift`] reports the
//! difference; re-driving provisioning is left to the agents.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use netplug_core::StateDriver;
use netplug_core::state::keys::{
    ENDPOINT_CONFIG_PREFIX, ENDPOINT_OPER_PREFIX, NETWORK_CONFIG_PREFIX, NETWORK_OPER_PREFIX,
    id_from_key,
};

use crate::error::Result;

/// Ids present in only one of the two subtrees of one entity kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindDrift {
    /// Configured but not provisioned.
    pub pending: Vec<String>,
    /// Provisioned but no longer configured.
    pub orphaned: Vec<String>,
}

impl KindDrift {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.orphaned.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub networks: KindDrift,
    pub endpoints: KindDrift,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.endpoints.is_empty()
    }
}

pub struct Reconciler {
    driver: Arc<dyn StateDriver>,
}

impl Reconciler {
    pub fn new(driver: Arc<dyn StateDriver>) -> Self {
        Self { driver }
    }

    /// Compare config and oper subtrees of networks and endpoints.
    ///
    /// Only keys are compared, so records that fail to decode still count.
    pub async fn drift(&self) -> Result<Drift> {
        Ok(Drift {
            networks: self
                .kind_drift(NETWORK_CONFIG_PREFIX, NETWORK_OPER_PREFIX)
                .await?,
            endpoints: self
                .kind_drift(ENDPOINT_CONFIG_PREFIX, ENDPOINT_OPER_PREFIX)
                .await?,
        })
    }

    async fn kind_drift(&self, config_prefix: &str, oper_prefix: &str) -> Result<KindDrift> {
        let configured = self.ids(config_prefix).await?;
        let active = self.ids(oper_prefix).await?;
        Ok(KindDrift {
            pending: configured.difference(&active).cloned().collect(),
            orphaned: active.difference(&configured).cloned().collect(),
        })
    }

    async fn ids(&self, prefix: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .driver
            .read_all(prefix)
            .await?
            .into_iter()
            .filter_map(|(key, _)| id_from_key(prefix, &key).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplug_core::MemStateDriver;

    #[tokio::test]
    async fn test_drift_between_subtrees() {
        let driver: Arc<dyn StateDriver> = Arc::new(MemStateDriver::new());
        for key in [
            "/contiv/config/nets/a",
            "/contiv/config/nets/b",
            "/contiv/oper/nets/b",
            "/contiv/oper/nets/c",
            "/contiv/config/eps/e1",
        ] {
            driver.write(key, b"{}".to_vec()).await.unwrap();
        }

        let drift = Reconciler::new(driver).drift().await.unwrap();
        assert_eq!(drift.networks.pending, vec!["a"]);
        assert_eq!(drift.networks.orphaned, vec!["c"]);
        assert_eq!(drift.endpoints.pending, vec!["e1"]);
        assert!(drift.endpoints.orphaned.is_empty());
        assert!(!drift.is_empty());
    }

    #[tokio::test]
    async fn test_no_drift() {
        let driver: Arc<dyn StateDriver> = Arc::new(MemStateDriver::new());
        driver
            .write("/contiv/config/nets/a", b"{}".to_vec())
            .await
            .unwrap();
        driver
            .write("/contiv/oper/nets/a", b"{}".to_vec())
            .await
            .unwrap();
        assert!(Reconciler::new(driver).drift().await.unwrap().is_empty());
    }
}
