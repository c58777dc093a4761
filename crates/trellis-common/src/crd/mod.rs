//! Custom Resource Definitions for Trellis
//!
//! `ManagedCluster` is the parent resource. `ClusterNetwork`, `ControlPlane`
//! and `NodePool` are the child components it is composed of.

mod child;
mod cluster;
mod control_plane;
mod network;
mod node_pool;
mod types;

pub use child::{ChildResource, COMPONENT_LABEL};
pub use cluster::{
    AddonSpec, ControlPlaneSettings, ManagedCluster, ManagedClusterSpec, ManagedClusterStatus,
    NetworkSpec, NodePoolSettings,
};
pub use control_plane::{ControlPlane, ControlPlaneSpec, ENDPOINT_OUTPUT};
pub use network::{ClusterNetwork, ClusterNetworkSpec, SUBNET_IDS_OUTPUT};
pub use node_pool::{NodePool, NodePoolSpec};
pub use types::{
    preserve_unknown_fields, ChildStatus, ComponentPhase, ComponentStatus, CompositeStatus,
    OverallStatus, ResourceRef,
};
