//! Endpoint groups.

use serde::{Deserialize, Serialize};

use netplug_core::State;
use netplug_core::state::keys::ENDPOINT_GROUP_CONFIG_PREFIX;

/// A set of endpoints sharing policy, addressed by its numeric group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointGroup {
    /// Decimal form of `group_id`; the key of the entity.
    pub id: String,
    pub group_id: u32,
    pub group_name: String,
    #[serde(default)]
    pub tenant_name: String,
    pub network_name: String,
}

impl EndpointGroup {
    pub fn new(group_id: u32, group_name: &str, tenant_name: &str, network_name: &str) -> Self {
        Self {
            id: group_id.to_string(),
            group_id,
            group_name: group_name.to_string(),
            tenant_name: tenant_name.to_string(),
            network_name: network_name.to_string(),
        }
    }
}

impl State for EndpointGroup {
    const PREFIX: &'static str = ENDPOINT_GROUP_CONFIG_PREFIX;

    fn id(&self) -> &str {
        &self.id
    }
}
