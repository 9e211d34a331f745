//! netplug OVS drivers.
//!
//! Networks are VLAN or VXLAN segments on one Open vSwitch bridge; endpoints
//! are internal access ports on that bridge carrying the network's tag.
//! Tags come from the global pools of the resource manager, endpoint
//! addresses from the network's own allocation map.

pub mod endpoint;
pub mod network;
pub mod options;
pub mod ovs;
pub mod state;
pub mod traffic;

pub use endpoint::OvsEndpointDriver;
pub use network::{GLOBAL_POOL, OvsNetworkDriver};
pub use options::OvsOptions;
pub use ovs::{OvsError, OvsSwitch, VsctlSwitch};
pub use state::{
    OvsCfgEndpointState, OvsCfgNetworkState, OvsOperEndpointState, OvsOperNetworkState,
    PktTagType,
};
pub use traffic::{TcShaper, TrafficError, TrafficShaper};

/// Plugin whose fetches return OVS config entities.
pub type OvsPlugin = netplug_core::Plugin<OvsCfgNetworkState, OvsCfgEndpointState>;
