//! ClusterNetwork Custom Resource Definition
//!
//! The network a cluster lives in (VPC plus subnets). Reconciled by the
//! per-cloud infrastructure controllers; Trellis only creates it and reads
//! its status. On success the status outputs carry `subnetIds`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ChildStatus;

/// Output key holding a comma separated list of subnet ids
pub const SUBNET_IDS_OUTPUT: &str = "subnetIds";

/// Specification for a ClusterNetwork
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "ClusterNetwork",
    plural = "clusternetworks",
    status = "ChildStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkSpec {
    /// Provider kind that owns this network
    pub provider: String,
    /// Cloud region
    pub region: String,
    /// Primary CIDR block
    pub cidr: String,
    /// Subnet CIDR blocks
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Create a NAT gateway for private subnets
    #[serde(default)]
    pub nat_gateway: bool,
}
