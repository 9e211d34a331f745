//! Driver capability sets.
//!
//! A plugin is assembled from one network driver, one endpoint driver and one
//! state driver. Each driver only implements the operations of its
//! capability; the plugin never inspects which concrete driver it holds.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::DriverError;
use crate::state::StateDriver;

/// Opaque textual network address (MAC, IP, DNS name or URL), interpreted by
/// the driver that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Programming logic for networks.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Short name used in logs and in the `drivers` config section.
    fn name(&self) -> &'static str;

    async fn init(&self, config: &Config, state: Arc<dyn StateDriver>) -> Result<(), DriverError>;

    async fn deinit(&self);

    /// Provision the network whose config entity is stored under `id`.
    async fn create_network(&self, id: &str) -> Result<(), DriverError>;

    /// Tear down the network `id` and release everything it holds.
    async fn delete_network(&self, id: &str) -> Result<(), DriverError>;
}

/// Programming logic for endpoints.
#[async_trait]
pub trait EndpointDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn init(&self, config: &Config, state: Arc<dyn StateDriver>) -> Result<(), DriverError>;

    async fn deinit(&self);

    /// Provision the endpoint whose config entity is stored under `id`.
    async fn create_endpoint(&self, id: &str) -> Result<(), DriverError>;

    async fn delete_endpoint(&self, id: &str) -> Result<(), DriverError>;

    /// Generate an address for a new endpoint.
    fn make_endpoint_address(&self) -> Result<Address, DriverError>;
}
