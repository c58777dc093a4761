//! NodePool Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ChildStatus;

/// Specification for a NodePool
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "NodePool",
    plural = "nodepools",
    status = "ChildStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.instanceType"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Provider kind that owns this pool
    pub provider: String,
    /// Name of the control plane object this pool joins
    pub control_plane: String,
    /// Kubernetes version
    pub version: String,
    /// Machine type
    pub instance_type: String,
    /// Minimum node count
    pub min_replicas: u32,
    /// Maximum node count
    pub max_replicas: u32,
    /// Subnets nodes are placed in (filled from the network)
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// API server endpoint nodes register with (filled from the control plane)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}
