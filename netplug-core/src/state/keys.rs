//! Key layout of the shared state store.
//!
//! ```text
//! /contiv/
//!   config/                 desired state, written by API callers
//!     nets/<id>
//!     eps/<id>
//!     endpointGroups/<id>
//!     netProfile/<id>
//!   oper/                   observed state, written by drivers
//!     nets/<id>
//!     eps/<id>
//!     resources/<kind>/<id>
//! ```

use crate::error::{Result, StateError};

pub const BASE_PATH: &str = "/contiv/";
pub const CONFIG_PATH: &str = "/contiv/config/";
pub const OPER_PATH: &str = "/contiv/oper/";

pub const NETWORK_CONFIG_PREFIX: &str = "/contiv/config/nets/";
pub const ENDPOINT_CONFIG_PREFIX: &str = "/contiv/config/eps/";
pub const ENDPOINT_GROUP_CONFIG_PREFIX: &str = "/contiv/config/endpointGroups/";
pub const NET_PROFILE_CONFIG_PREFIX: &str = "/contiv/config/netProfile/";

pub const NETWORK_OPER_PREFIX: &str = "/contiv/oper/nets/";
pub const ENDPOINT_OPER_PREFIX: &str = "/contiv/oper/eps/";
pub const RESOURCE_OPER_PREFIX: &str = "/contiv/oper/resources/";

/// Build the key of entity `id` under `prefix`.
pub fn entity_key(prefix: &str, id: &str) -> Result<String> {
    validate_id(id)?;
    Ok(format!("{}{}", prefix, id))
}

/// Key prefix of all pools of one resource kind.
pub fn resource_prefix(kind: &str) -> Result<String> {
    validate_id(kind)?;
    Ok(format!("{}{}/", RESOURCE_OPER_PREFIX, kind))
}

/// Strip `prefix` from a full key, returning the entity id.
pub fn id_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|id| !id.is_empty())
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') {
        return Err(StateError::InvalidKey(id.to_string()));
    }
    Ok(())
}
