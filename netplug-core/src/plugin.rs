//! Plugin: one network, one endpoint and one state driver behind a single
//! lifecycle.
//!
//! ```text
//! init:   state → network → endpoint
//! deinit: endpoint → network → state
//! ```
//!
//! North-bound calls are forwarded to the matching driver. Fetches read the
//! entity through the state layer; they never query the dataplane.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

use crate::config::Config;
use crate::driver::{Address, EndpointDriver, NetworkDriver};
use crate::error::DriverError;
use crate::state::{State, StateAccess, StateDriver};

/// Driver composition, generic over the entity types its fetches return.
pub struct Plugin<N, E> {
    state: Arc<dyn StateDriver>,
    network: Arc<dyn NetworkDriver>,
    endpoint: Arc<dyn EndpointDriver>,
    initialized: AtomicBool,
    _entities: PhantomData<fn() -> (N, E)>,
}

impl<N: State, E: State> Plugin<N, E> {
    pub fn new(
        state: Arc<dyn StateDriver>,
        network: Arc<dyn NetworkDriver>,
        endpoint: Arc<dyn EndpointDriver>,
    ) -> Self {
        Self {
            state,
            network,
            endpoint,
            initialized: AtomicBool::new(false),
            _entities: PhantomData,
        }
    }

    /// Parse a JSON config and initialize all drivers.
    pub async fn init_from_str(&self, config: &str) -> Result<(), DriverError> {
        let config = Config::from_json(config)?;
        self.init(&config).await
    }

    /// Initialize state, network and endpoint drivers in that order.
    ///
    /// If a driver fails, the ones already initialized are torn down again
    /// before the error is returned.
    pub async fn init(&self, config: &Config) -> Result<(), DriverError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        self.state.init(&config.state).await?;

        if let Err(e) = self.network.init(config, Arc::clone(&self.state)).await {
            error!(driver = self.network.name(), error = %e, "Network driver init failed");
            self.state.deinit().await;
            return Err(e);
        }

        if let Err(e) = self.endpoint.init(config, Arc::clone(&self.state)).await {
            error!(driver = self.endpoint.name(), error = %e, "Endpoint driver init failed");
            self.network.deinit().await;
            self.state.deinit().await;
            return Err(e);
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            network = self.network.name(),
            endpoint = self.endpoint.name(),
            host = %config.plugin_instance.host_label,
            "Plugin initialized"
        );
        Ok(())
    }

    /// Tear down endpoint, network and state drivers in that order.
    pub async fn deinit(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.endpoint.deinit().await;
        self.network.deinit().await;
        self.state.deinit().await;
        info!("Plugin deinitialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The state driver shared by all drivers of this plugin.
    pub fn state_driver(&self) -> &Arc<dyn StateDriver> {
        &self.state
    }

    fn ensure_initialized(&self) -> Result<(), DriverError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }

    pub async fn create_network(&self, id: &str) -> Result<(), DriverError> {
        self.ensure_initialized()?;
        self.network.create_network(id).await
    }

    pub async fn delete_network(&self, id: &str) -> Result<(), DriverError> {
        self.ensure_initialized()?;
        self.network.delete_network(id).await
    }

    /// Current state of network `id` as stored in the state store.
    pub async fn fetch_network(&self, id: &str) -> Result<N, DriverError> {
        self.ensure_initialized()?;
        Ok(StateAccess::<N>::new(Arc::clone(&self.state)).read(id).await?)
    }

    pub async fn create_endpoint(&self, id: &str) -> Result<(), DriverError> {
        self.ensure_initialized()?;
        self.endpoint.create_endpoint(id).await
    }

    pub async fn delete_endpoint(&self, id: &str) -> Result<(), DriverError> {
        self.ensure_initialized()?;
        self.endpoint.delete_endpoint(id).await
    }

    /// Current state of endpoint `id` as stored in the state store.
    pub async fn fetch_endpoint(&self, id: &str) -> Result<E, DriverError> {
        self.ensure_initialized()?;
        Ok(StateAccess::<E>::new(Arc::clone(&self.state)).read(id).await?)
    }

    pub fn make_endpoint_address(&self) -> Result<Address, DriverError> {
        self.ensure_initialized()?;
        self.endpoint.make_endpoint_address()
    }
}
