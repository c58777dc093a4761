//! ControlPlane Custom Resource Definition
//!
//! A managed Kubernetes control plane (GKE cluster, EKS cluster). Needs the
//! network's subnet ids before it can be created; publishes its API
//! endpoint as the `endpoint` output.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ChildStatus;

/// Output key holding the API server endpoint
pub const ENDPOINT_OUTPUT: &str = "endpoint";

/// Specification for a ControlPlane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "ControlPlane",
    plural = "controlplanes",
    status = "ChildStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Provider kind that owns this control plane
    pub provider: String,
    /// Cloud region
    pub region: String,
    /// Kubernetes version
    pub version: String,
    /// Subnets the control plane attaches to (filled from the network)
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Expose the API server only inside the network
    #[serde(default)]
    pub private_endpoint: bool,
    /// IAM role assumed by the control plane (EKS only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_role: Option<String>,
}
