//! OVS network driver.
//!
//! A network becomes active when its tags are chosen, the bridge exists and
//! the oper entity is written:
//!
//! ```text
//! config/nets/<id> ──create_network──▶ tags from pools ─▶ bridge ─▶ oper/nets/<id>
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use netplug_core::error::{ResourceError, StateError};
use netplug_core::resource::{Resource, VLAN_TAG_POOL, VXLAN_TAG_POOL};
use netplug_core::{
    Config, DriverError, NetworkDriver, ResourceConfig, ResourceManager, ResourceValue, StateAccess,
    StateDriver, StateResourceManager,
};

use crate::ovs::OvsSwitch;
use crate::options::OvsOptions;
use crate::state::{OvsCfgNetworkState, OvsOperNetworkState, PktTagType};

/// Id of the tag pools shared by all networks.
pub const GLOBAL_POOL: &str = "global";

#[derive(Clone)]
struct Context {
    nets: StateAccess<OvsCfgNetworkState>,
    oper: StateAccess<OvsOperNetworkState>,
    resources: Arc<StateResourceManager>,
}

/// Tags picked for a network, remembering which ones came from a pool.
struct Tags {
    pkt_tag_type: PktTagType,
    pkt_tag: u32,
    ext_pkt_tag: u32,
    pkt_tag_pooled: bool,
    ext_pkt_tag_pooled: bool,
}

impl Tags {
    fn ext_pool(&self) -> &'static str {
        match self.pkt_tag_type {
            PktTagType::Vlan => VLAN_TAG_POOL,
            PktTagType::Vxlan => VXLAN_TAG_POOL,
        }
    }
}

impl From<&OvsOperNetworkState> for Tags {
    fn from(oper: &OvsOperNetworkState) -> Self {
        Self {
            pkt_tag_type: oper.pkt_tag_type,
            pkt_tag: oper.pkt_tag,
            ext_pkt_tag: oper.ext_pkt_tag,
            pkt_tag_pooled: oper.pkt_tag_pooled,
            ext_pkt_tag_pooled: oper.ext_pkt_tag_pooled,
        }
    }
}

pub struct OvsNetworkDriver {
    switch: Arc<dyn OvsSwitch>,
    ctx: RwLock<Option<Context>>,
}

impl OvsNetworkDriver {
    pub fn new(switch: Arc<dyn OvsSwitch>) -> Self {
        Self {
            switch,
            ctx: RwLock::new(None),
        }
    }

    async fn ctx(&self) -> Result<Context, DriverError> {
        self.ctx.read().await.clone().ok_or(DriverError::NotInitialized)
    }

    async fn choose_tags(ctx: &Context, cfg: &OvsCfgNetworkState) -> Result<Tags, DriverError> {
        let mut tags = Tags {
            pkt_tag_type: cfg.pkt_tag_type,
            pkt_tag: cfg.pkt_tag,
            ext_pkt_tag: cfg.ext_pkt_tag,
            pkt_tag_pooled: false,
            ext_pkt_tag_pooled: false,
        };

        if tags.pkt_tag == 0 {
            tags.pkt_tag = allocate_tag(&ctx.resources, VLAN_TAG_POOL).await?;
            tags.pkt_tag_pooled = true;
        } else {
            tags.pkt_tag_pooled = reserve_tag(&ctx.resources, VLAN_TAG_POOL, tags.pkt_tag).await?;
        }

        let ext = match (cfg.pkt_tag_type, tags.ext_pkt_tag) {
            (PktTagType::Vlan, 0) => {
                tags.ext_pkt_tag = tags.pkt_tag;
                return Ok(tags);
            }
            (PktTagType::Vlan, tag) if tag == tags.pkt_tag => return Ok(tags),
            (PktTagType::Vlan, tag) => reserve_tag(&ctx.resources, VLAN_TAG_POOL, tag)
                .await
                .map(|pooled| (tag, pooled)),
            (PktTagType::Vxlan, 0) => allocate_tag(&ctx.resources, VXLAN_TAG_POOL)
                .await
                .map(|vni| (vni, true)),
            (PktTagType::Vxlan, vni) => reserve_tag(&ctx.resources, VXLAN_TAG_POOL, vni)
                .await
                .map(|pooled| (vni, pooled)),
        };
        match ext {
            Ok((tag, pooled)) => {
                tags.ext_pkt_tag = tag;
                tags.ext_pkt_tag_pooled = pooled;
                Ok(tags)
            }
            Err(e) => {
                Self::release_tags(ctx, &cfg.id, &tags).await;
                Err(e)
            }
        }
    }

    /// Return pooled tags. Failures are logged; the tag stays taken.
    async fn release_tags(ctx: &Context, id: &str, tags: &Tags) {
        let pooled = [
            (tags.pkt_tag_pooled, VLAN_TAG_POOL, tags.pkt_tag),
            (tags.ext_pkt_tag_pooled, tags.ext_pool(), tags.ext_pkt_tag),
        ];
        for (_, pool, tag) in pooled.into_iter().filter(|(pooled, _, _)| *pooled) {
            if let Err(e) = ctx
                .resources
                .deallocate_resource_val(GLOBAL_POOL, pool, &ResourceValue::Tag(tag))
                .await
            {
                warn!(network = %id, pool, tag, error = %e, "Failed to release tag");
            }
        }
    }
}

async fn allocate_tag(resources: &StateResourceManager, pool: &str) -> Result<u32, DriverError> {
    let value = resources.allocate_resource_val(GLOBAL_POOL, pool).await?;
    value.as_tag().ok_or_else(|| {
        DriverError::Resource(ResourceError::InvalidValue {
            id: GLOBAL_POOL.to_string(),
            desc: pool.to_string(),
            value: value.to_string(),
        })
    })
}

/// Reserve an explicitly configured tag if it falls inside the pool.
///
/// Returns whether the tag was pooled. Tags outside the pool range belong to
/// the operator and are used as-is.
async fn reserve_tag(
    resources: &StateResourceManager,
    pool: &str,
    tag: u32,
) -> Result<bool, DriverError> {
    let value = ResourceValue::Tag(tag);
    if !resources
        .pool(GLOBAL_POOL, pool)
        .await?
        .as_resource()
        .contains(&value)
    {
        return Ok(false);
    }
    resources
        .reserve_resource_val(GLOBAL_POOL, pool, &value)
        .await?;
    Ok(true)
}

/// Define a global pool unless an earlier run (or another agent) did.
async fn ensure_pool(
    resources: &StateResourceManager,
    pool: &str,
    config: &ResourceConfig,
) -> Result<(), DriverError> {
    match resources.define_resource(GLOBAL_POOL, pool, config).await {
        Ok(()) | Err(ResourceError::AlreadyDefined { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn ignore_not_found(result: Result<(), StateError>) -> Result<(), StateError> {
    match result {
        Err(StateError::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl NetworkDriver for OvsNetworkDriver {
    fn name(&self) -> &'static str {
        "ovs"
    }

    async fn init(&self, config: &Config, state: Arc<dyn StateDriver>) -> Result<(), DriverError> {
        let options = OvsOptions::from_config(config)?;
        let resources = Arc::new(StateResourceManager::new(Arc::clone(&state)));

        ensure_pool(&resources, VLAN_TAG_POOL, &options.vlan_pool()?).await?;
        ensure_pool(&resources, VXLAN_TAG_POOL, &options.vxlan_pool()?).await?;
        self.switch.ensure_bridge().await?;

        *self.ctx.write().await = Some(Context {
            nets: StateAccess::new(Arc::clone(&state)),
            oper: StateAccess::new(state),
            resources,
        });
        info!(bridge = %self.switch.bridge(), "OVS network driver initialized");
        Ok(())
    }

    async fn deinit(&self) {
        if self.ctx.write().await.take().is_some() {
            info!("OVS network driver deinitialized");
        }
    }

    async fn create_network(&self, id: &str) -> Result<(), DriverError> {
        let ctx = self.ctx().await?;

        if ctx.oper.try_read(id).await?.is_some() {
            debug!(network = %id, "Network already active");
            return Ok(());
        }

        let cfg = ctx.nets.read(id).await?;
        if cfg.deleting {
            return Err(DriverError::NotReady(format!("network {} is being deleted", id)));
        }
        cfg.subnet()?;

        let tags = Self::choose_tags(&ctx, &cfg).await?;

        let oper = OvsOperNetworkState {
            id: id.to_string(),
            pkt_tag_type: cfg.pkt_tag_type,
            pkt_tag: tags.pkt_tag,
            ext_pkt_tag: tags.ext_pkt_tag,
            pkt_tag_pooled: tags.pkt_tag_pooled,
            ext_pkt_tag_pooled: tags.ext_pkt_tag_pooled,
            bridge: self.switch.bridge().to_string(),
            provisioned_at: Utc::now(),
        };

        let provisioned = match self.switch.ensure_bridge().await {
            Ok(()) => ctx.oper.create(&oper).await.map_err(DriverError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = provisioned {
            Self::release_tags(&ctx, id, &tags).await;
            return Err(e);
        }

        info!(
            network = %id,
            tag_type = %cfg.pkt_tag_type,
            pkt_tag = tags.pkt_tag,
            ext_pkt_tag = tags.ext_pkt_tag,
            "Network created"
        );
        Ok(())
    }

    async fn delete_network(&self, id: &str) -> Result<(), DriverError> {
        let ctx = self.ctx().await?;

        // Marking the config makes endpoint claims refuse the network, so the
        // endpoint count cannot grow once this check passes.
        let marked = ctx
            .nets
            .update(id, |cfg| {
                if cfg.ep_count > 0 {
                    return Err(DriverError::InUse(format!(
                        "network {} ({} endpoints)",
                        id, cfg.ep_count
                    )));
                }
                cfg.deleting = true;
                Ok(())
            })
            .await;
        match marked {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // Only the caller that removes the oper entity returns its tags.
        if let Some(oper) = ctx.oper.remove(id).await? {
            Self::release_tags(&ctx, id, &Tags::from(&oper)).await;
        }

        ignore_not_found(ctx.nets.clear(id).await)?;
        info!(network = %id, "Network deleted");
        Ok(())
    }
}
