//! netplug core: the orchestration layer shared by agents and the master.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Plugin ────────────────────────────┐
//! │  NetworkDriver            EndpointDriver          StateDriver  │
//! └───────┬──────────────────────────┬──────────────────────▲──────┘
//!         │                          │                      │
//!         ├──── StateAccess<S> ──────┴──────────────────────┤
//!         │      (typed entities under /contiv/{config,oper}/…)
//!         │                                                 │
//!         └──── ResourceManager ──── one key per pool ──────┘
//!                (vlan / vxlan tags, subnet addresses)
//! ```
//!
//! Processes cooperate only through the state store: the config subtree
//! holds what was requested, the oper subtree what was provisioned.

pub mod bitmap;
pub mod config;
pub mod driver;
pub mod error;
pub mod plugin;
pub mod resource;
pub mod state;

pub use config::Config;
pub use driver::{Address, EndpointDriver, NetworkDriver};
pub use error::{ConfigError, DriverError, ResourceError, StateError};
pub use plugin::Plugin;
pub use resource::{ResourceConfig, ResourceManager, ResourceValue, StateResourceManager};
pub use state::{MemStateDriver, State, StateAccess, StateDriver, WatchState, WatchStream};
