//! netplug master: the north-bound side of the control plane.
//!
//! The master writes desired state (networks, endpoints, endpoint groups,
//! profile associations) into the config subtree and reads the oper subtree
//! to see what agents have provisioned. It never talks to agents directly.

pub mod epg;
pub mod error;
pub mod network;
pub mod profile;
pub mod reconcile;

pub use epg::EndpointGroup;
pub use error::MasterError;
pub use network::{EndpointSpec, NetworkConfigurator, NetworkSpec};
pub use profile::{EpgNetProfile, ProfileRegistry};
pub use reconcile::{Drift, KindDrift, Reconciler};
