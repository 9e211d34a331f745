//! Policy profile associations.
//!
//! An [`EpgNetProfile`] attaches a named network profile to an endpoint
//! group. The entity is a passive record; the group's existence is checked
//! by [`ProfileRegistry::associate`] before the record is written.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use netplug_core::state::keys::NET_PROFILE_CONFIG_PREFIX;
use netplug_core::{State, StateAccess, StateError, WatchState};

use crate::epg::EndpointGroup;
use crate::error::{MasterError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpgNetProfile {
    pub id: String,
    #[serde(rename = "EpgNetProfileKey")]
    pub epg_net_profile_key: String,
    #[serde(rename = "EndpointGroupID")]
    pub endpoint_group_id: u32,
}

impl EpgNetProfile {
    pub fn new(key: &str, endpoint_group_id: u32) -> Self {
        Self {
            id: key.to_string(),
            epg_net_profile_key: key.to_string(),
            endpoint_group_id,
        }
    }
}

impl State for EpgNetProfile {
    const PREFIX: &'static str = NET_PROFILE_CONFIG_PREFIX;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Owned cache of profile associations, backed by the state store.
///
/// Construct one per master and pass it to whatever needs lookups; call
/// [`ProfileRegistry::clear`] on teardown.
pub struct ProfileRegistry {
    profiles: StateAccess<EpgNetProfile>,
    groups: StateAccess<EndpointGroup>,
    cache: RwLock<BTreeMap<String, EpgNetProfile>>,
}

impl ProfileRegistry {
    pub fn new(profiles: StateAccess<EpgNetProfile>, groups: StateAccess<EndpointGroup>) -> Self {
        Self {
            profiles,
            groups,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Handle for watching association changes.
    pub fn access(&self) -> &StateAccess<EpgNetProfile> {
        &self.profiles
    }

    /// Replace the cache with what the store holds.
    ///
    /// Records that fail to decode are logged and skipped. Returns the number
    /// of associations loaded.
    pub async fn load(&self) -> Result<usize> {
        let mut loaded = BTreeMap::new();
        for entry in self.profiles.read_all().await? {
            match entry {
                Ok(profile) => {
                    loaded.insert(profile.id.clone(), profile);
                }
                Err(e) => warn!(error = %e, "Skipping unreadable profile association"),
            }
        }
        let count = loaded.len();
        *self.cache.write().await = loaded;
        info!(count, "Profile associations loaded");
        Ok(count)
    }

    /// Attach profile `key` to endpoint group `group_id`.
    pub async fn associate(&self, key: &str, group_id: u32) -> Result<EpgNetProfile> {
        if self
            .groups
            .try_read(&group_id.to_string())
            .await?
            .is_none()
        {
            return Err(MasterError::NotFound(format!("endpoint group {}", group_id)));
        }

        let profile = EpgNetProfile::new(key, group_id);
        self.profiles.write(&profile).await?;
        self.cache
            .write()
            .await
            .insert(profile.id.clone(), profile.clone());
        info!(profile = %key, group_id, "Profile associated");
        Ok(profile)
    }

    /// Remove the association stored under `key`.
    pub async fn dissociate(&self, key: &str) -> Result<()> {
        match self.profiles.clear(key).await {
            Ok(()) => {}
            Err(StateError::NotFound(_)) => {
                return Err(MasterError::NotFound(format!("profile association {}", key)));
            }
            Err(e) => return Err(e.into()),
        }
        self.cache.write().await.remove(key);
        info!(profile = %key, "Profile dissociated");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<EpgNetProfile> {
        self.cache.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<EpgNetProfile> {
        self.cache.read().await.values().cloned().collect()
    }

    /// Associations attached to one endpoint group.
    pub async fn for_group(&self, group_id: u32) -> Vec<EpgNetProfile> {
        self.cache
            .read()
            .await
            .values()
            .filter(|p| p.endpoint_group_id == group_id)
            .cloned()
            .collect()
    }

    /// Apply one watched change to the cache.
    pub async fn apply(&self, change: WatchState<EpgNetProfile>) {
        let mut cache = self.cache.write().await;
        match change.curr {
            Some(profile) => {
                debug!(profile = %change.id, "Profile association updated");
                cache.insert(change.id, profile);
            }
            None => {
                debug!(profile = %change.id, "Profile association removed");
                cache.remove(&change.id);
            }
        }
    }

    /// Drop all cached associations.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}
