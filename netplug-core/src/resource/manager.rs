//! State-backed resource manager.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    Resource, ResourceConfig, ResourceManager, ResourcePool, ResourceValue, SUBNET_POOL,
    VLAN_TAG_POOL, VXLAN_TAG_POOL,
};
use crate::error::{ResourceError, StateError};
use crate::state::keys::resource_prefix;
use crate::state::{StateAccess, StateDriver};

const POOL_KINDS: [&str; 3] = [VLAN_TAG_POOL, VXLAN_TAG_POOL, SUBNET_POOL];

/// Usage summary of one defined pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub id: String,
    pub description: String,
    pub capacity: usize,
    pub allocated: usize,
}

/// Resource manager persisting every pool as one key of the state store.
///
/// Each pool lives at `/contiv/oper/resources/<kind>/<id>` together with its
/// allocation bitmap. Allocations in this process are serialized by a
/// per-pool mutex; across processes the compare-and-swap of the pool key
/// decides which writer wins, the loser sees `Conflict`.
pub struct StateResourceManager {
    driver: Arc<dyn StateDriver>,
    locks: std::sync::Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl StateResourceManager {
    pub fn new(driver: Arc<dyn StateDriver>) -> Self {
        Self {
            driver,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn pools(&self, desc: &str) -> Result<StateAccess<ResourcePool>, ResourceError> {
        if !POOL_KINDS.contains(&desc) {
            return Err(ResourceError::InvalidConfig(format!(
                "unknown resource kind '{}'",
                desc
            )));
        }
        Ok(StateAccess::with_prefix(
            Arc::clone(&self.driver),
            resource_prefix(desc)?,
        ))
    }

    /// In-process lock of one pool. Kind and id are validated first so
    /// malformed requests never add entries.
    fn pool_lock(&self, id: &str, desc: &str) -> Result<Arc<Mutex<()>>, ResourceError> {
        self.pools(desc)?.key(id)?;
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(locks
            .entry((id.to_string(), desc.to_string()))
            .or_default()
            .clone())
    }

    fn forget_lock(&self, id: &str, desc: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&(id.to_string(), desc.to_string()));
    }

    /// Fetch a pool's current record.
    pub async fn pool(&self, id: &str, desc: &str) -> Result<ResourcePool, ResourceError> {
        self.pools(desc)?
            .read(id)
            .await
            .map_err(|e| not_defined(e.into(), id, desc))
    }

    /// Mark a specific value of a pool as taken.
    ///
    /// Used when a value was chosen outside the pool, e.g. an explicitly
    /// configured tag that must not be handed out again.
    pub async fn reserve_resource_val(
        &self,
        id: &str,
        desc: &str,
        value: &ResourceValue,
    ) -> Result<(), ResourceError> {
        let lock = self.pool_lock(id, desc)?;
        let _guard = lock.lock().await;

        self.pools(desc)?
            .update(id, |pool| pool.as_resource_mut().reserve(value))
            .await
            .map_err(|e| not_defined(e, id, desc))?;
        debug!(pool = %id, kind = %desc, %value, "Resource value reserved");
        Ok(())
    }

    /// Enumerate all defined pools with their usage.
    pub async fn list_resources(&self) -> Result<Vec<PoolUsage>, ResourceError> {
        let mut usage = Vec::new();
        for desc in POOL_KINDS {
            for entry in self.pools(desc)?.read_all().await? {
                match entry {
                    Ok(pool) => {
                        let r = pool.as_resource();
                        usage.push(PoolUsage {
                            id: r.id().to_string(),
                            description: r.description().to_string(),
                            capacity: r.capacity(),
                            allocated: r.allocated(),
                        });
                    }
                    Err(e) => warn!(kind = %desc, error = %e, "Skipping unreadable resource pool"),
                }
            }
        }
        Ok(usage)
    }
}

/// Map a missing pool key to `NotDefined`.
fn not_defined(err: ResourceError, id: &str, desc: &str) -> ResourceError {
    match err {
        ResourceError::State(StateError::NotFound(_)) => ResourceError::NotDefined {
            id: id.to_string(),
            desc: desc.to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl ResourceManager for StateResourceManager {
    async fn define_resource(
        &self,
        id: &str,
        desc: &str,
        config: &ResourceConfig,
    ) -> Result<(), ResourceError> {
        if config.description() != desc {
            return Err(ResourceError::InvalidConfig(format!(
                "config of kind {} cannot define a {}",
                config.description(),
                desc
            )));
        }
        let pool = ResourcePool::define(id, config)?;
        let capacity = pool.as_resource().capacity();

        let lock = self.pool_lock(id, desc)?;
        let _guard = lock.lock().await;

        match self.pools(desc)?.create(&pool).await {
            Ok(()) => {
                info!(pool = %id, kind = %desc, capacity, "Resource pool defined");
                Ok(())
            }
            Err(StateError::Conflict(_)) => Err(ResourceError::AlreadyDefined {
                id: id.to_string(),
                desc: desc.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn undefine_resource(&self, id: &str, desc: &str) -> Result<(), ResourceError> {
        let lock = self.pool_lock(id, desc)?;
        let _guard = lock.lock().await;

        let removed = self
            .pools(desc)?
            .remove_if(id, |pool| {
                let allocated = pool.as_resource().allocated();
                if allocated > 0 {
                    return Err(ResourceError::ResourceBusy {
                        id: id.to_string(),
                        desc: desc.to_string(),
                        allocated,
                    });
                }
                Ok(())
            })
            .await?;
        if removed.is_none() {
            return Err(ResourceError::NotDefined {
                id: id.to_string(),
                desc: desc.to_string(),
            });
        }

        self.forget_lock(id, desc);
        info!(pool = %id, kind = %desc, "Resource pool undefined");
        Ok(())
    }

    async fn allocate_resource_val(
        &self,
        id: &str,
        desc: &str,
    ) -> Result<ResourceValue, ResourceError> {
        let lock = self.pool_lock(id, desc)?;
        let _guard = lock.lock().await;

        let (_, value) = self
            .pools(desc)?
            .update(id, |pool| pool.as_resource_mut().allocate())
            .await
            .map_err(|e| not_defined(e, id, desc))?;
        debug!(pool = %id, kind = %desc, %value, "Resource value allocated");
        Ok(value)
    }

    async fn deallocate_resource_val(
        &self,
        id: &str,
        desc: &str,
        value: &ResourceValue,
    ) -> Result<(), ResourceError> {
        let lock = self.pool_lock(id, desc)?;
        let _guard = lock.lock().await;

        self.pools(desc)?
            .update(id, |pool| pool.as_resource_mut().deallocate(value))
            .await
            .map_err(|e| not_defined(e, id, desc))?;
        debug!(pool = %id, kind = %desc, %value, "Resource value released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemStateDriver;
    use std::collections::HashSet;

    fn manager() -> StateResourceManager {
        StateResourceManager::new(Arc::new(MemStateDriver::new()))
    }

    fn subnet(s: &str) -> ResourceConfig {
        ResourceConfig::Subnet {
            subnet: s.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_subnet_pool_exhaustion_and_reuse() {
        let rm = manager();
        rm.define_resource("net1", SUBNET_POOL, &subnet("10.0.0.0/24"))
            .await
            .unwrap();

        let mut seen = HashSet::new();
        for _ in 0..254 {
            let value = rm.allocate_resource_val("net1", SUBNET_POOL).await.unwrap();
            assert!(seen.insert(value), "{} handed out twice", value);
        }
        assert!(matches!(
            rm.allocate_resource_val("net1", SUBNET_POOL).await,
            Err(ResourceError::ResourceExhausted { .. })
        ));

        let freed = ResourceValue::Address("10.0.0.77".parse().unwrap());
        rm.deallocate_resource_val("net1", SUBNET_POOL, &freed)
            .await
            .unwrap();
        let pool = rm.pool("net1", SUBNET_POOL).await.unwrap();
        assert_eq!(
            pool.as_resource().capacity() - pool.as_resource().allocated(),
            1
        );
        assert_eq!(
            rm.allocate_resource_val("net1", SUBNET_POOL).await.unwrap(),
            freed
        );
    }

    #[tokio::test]
    async fn test_double_free_and_invalid_value() {
        let rm = manager();
        rm.define_resource("global", VLAN_TAG_POOL, &ResourceConfig::VlanTags { start: 10, end: 20 })
            .await
            .unwrap();

        let tag = rm.allocate_resource_val("global", VLAN_TAG_POOL).await.unwrap();
        assert_eq!(tag, ResourceValue::Tag(10));
        rm.deallocate_resource_val("global", VLAN_TAG_POOL, &tag)
            .await
            .unwrap();
        assert!(matches!(
            rm.deallocate_resource_val("global", VLAN_TAG_POOL, &tag).await,
            Err(ResourceError::DoubleFree { .. })
        ));
        assert!(matches!(
            rm.deallocate_resource_val("global", VLAN_TAG_POOL, &ResourceValue::Tag(21))
                .await,
            Err(ResourceError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_define_undefine_lifecycle() {
        let rm = manager();
        let config = ResourceConfig::VxlanTags { start: 1, end: 100 };
        rm.define_resource("global", VXLAN_TAG_POOL, &config)
            .await
            .unwrap();
        assert!(matches!(
            rm.define_resource("global", VXLAN_TAG_POOL, &config).await,
            Err(ResourceError::AlreadyDefined { .. })
        ));
        // Same id under another kind is a different pool.
        rm.define_resource("global", VLAN_TAG_POOL, &ResourceConfig::VlanTags { start: 1, end: 2 })
            .await
            .unwrap();

        let tag = rm.allocate_resource_val("global", VXLAN_TAG_POOL).await.unwrap();
        assert!(matches!(
            rm.undefine_resource("global", VXLAN_TAG_POOL).await,
            Err(ResourceError::ResourceBusy { allocated: 1, .. })
        ));
        rm.deallocate_resource_val("global", VXLAN_TAG_POOL, &tag)
            .await
            .unwrap();
        rm.undefine_resource("global", VXLAN_TAG_POOL).await.unwrap();

        assert!(matches!(
            rm.allocate_resource_val("global", VXLAN_TAG_POOL).await,
            Err(ResourceError::NotDefined { .. })
        ));
        assert!(matches!(
            rm.undefine_resource("global", VXLAN_TAG_POOL).await,
            Err(ResourceError::NotDefined { .. })
        ));
    }

    #[tokio::test]
    async fn test_reserve_resource_val() {
        let rm = manager();
        rm.define_resource("global", VLAN_TAG_POOL, &ResourceConfig::VlanTags { start: 10, end: 12 })
            .await
            .unwrap();

        rm.reserve_resource_val("global", VLAN_TAG_POOL, &ResourceValue::Tag(10))
            .await
            .unwrap();
        assert_eq!(
            rm.allocate_resource_val("global", VLAN_TAG_POOL).await.unwrap(),
            ResourceValue::Tag(11)
        );

        // Taken, either by reservation or by allocation.
        for taken in [10, 11] {
            assert!(matches!(
                rm.reserve_resource_val("global", VLAN_TAG_POOL, &ResourceValue::Tag(taken))
                    .await,
                Err(ResourceError::InvalidValue { .. })
            ));
        }
        assert!(matches!(
            rm.reserve_resource_val("global", VLAN_TAG_POOL, &ResourceValue::Tag(13))
                .await,
            Err(ResourceError::InvalidValue { .. })
        ));
        assert!(matches!(
            rm.reserve_resource_val("missing", VLAN_TAG_POOL, &ResourceValue::Tag(10))
                .await,
            Err(ResourceError::NotDefined { .. })
        ));

        let pool = rm.pool("global", VLAN_TAG_POOL).await.unwrap();
        assert_eq!(pool.as_resource().allocated(), 2);
        assert!(pool.as_resource().contains(&ResourceValue::Tag(12)));
        assert!(!pool.as_resource().contains(&ResourceValue::Tag(13)));
    }

    #[tokio::test]
    async fn test_pool_locks_are_released() {
        let rm = manager();
        let config = ResourceConfig::VlanTags { start: 1, end: 4 };
        rm.define_resource("global", VLAN_TAG_POOL, &config)
            .await
            .unwrap();
        rm.allocate_resource_val("global", VLAN_TAG_POOL).await.unwrap();
        assert!(rm.allocate_resource_val("x", "mac-pool").await.is_err());
        assert!(rm.allocate_resource_val("a/b", VLAN_TAG_POOL).await.is_err());
        assert_eq!(rm.locks.lock().unwrap().len(), 1);

        rm.deallocate_resource_val("global", VLAN_TAG_POOL, &ResourceValue::Tag(1))
            .await
            .unwrap();
        rm.undefine_resource("global", VLAN_TAG_POOL).await.unwrap();
        assert!(rm.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_kind_is_rejected() {
        let rm = manager();
        assert!(matches!(
            rm.define_resource("x", VLAN_TAG_POOL, &subnet("10.0.0.0/24")).await,
            Err(ResourceError::InvalidConfig(_))
        ));
        assert!(matches!(
            rm.allocate_resource_val("x", "mac-pool").await,
            Err(ResourceError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let rm = Arc::new(manager());
        rm.define_resource("global", VLAN_TAG_POOL, &ResourceConfig::VlanTags { start: 1, end: 64 })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let rm = Arc::clone(&rm);
            handles.push(tokio::spawn(async move {
                rm.allocate_resource_val("global", VLAN_TAG_POOL).await
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert!(seen.insert(value));
        }
        assert_eq!(seen.len(), 64);
    }

    #[tokio::test]
    async fn test_list_resources() {
        let rm = manager();
        rm.define_resource("net1", SUBNET_POOL, &subnet("10.1.0.0/24"))
            .await
            .unwrap();
        rm.define_resource("global", VLAN_TAG_POOL, &ResourceConfig::VlanTags { start: 1, end: 4094 })
            .await
            .unwrap();
        rm.allocate_resource_val("net1", SUBNET_POOL).await.unwrap();

        let mut usage = rm.list_resources().await.unwrap();
        usage.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(
            usage,
            vec![
                PoolUsage {
                    id: "global".into(),
                    description: VLAN_TAG_POOL.into(),
                    capacity: 4094,
                    allocated: 0,
                },
                PoolUsage {
                    id: "net1".into(),
                    description: SUBNET_POOL.into(),
                    capacity: 254,
                    allocated: 1,
                },
            ]
        );
    }
}
