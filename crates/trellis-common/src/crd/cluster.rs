//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster is the parent resource: one Kubernetes cluster composed
//! of a network, a control plane, node pools and in-cluster add-ons. The
//! controller expands it into child resources and aggregates their status.

use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, CompositeStatus};
use crate::Error;

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.overallStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Provider kind registered with the operator (e.g. "gke", "eks")
    pub provider: String,

    /// Cloud region
    pub region: String,

    /// Kubernetes version for the control plane and node pools
    pub kubernetes_version: String,

    /// Network layout
    pub network: NetworkSpec,

    /// Control plane settings
    #[serde(default)]
    pub control_plane: ControlPlaneSettings,

    /// Worker node pools
    pub node_pools: Vec<NodePoolSettings>,

    /// In-cluster add-ons, applied once the infrastructure converged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<AddonSpec>,
}

/// Network layout for the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Primary CIDR block
    pub cidr: String,
    /// Subnet CIDR blocks carved out of the primary block
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Control plane settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSettings {
    /// Expose the API server only inside the network
    #[serde(default)]
    pub private_endpoint: bool,
}

/// A worker node pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSettings {
    /// Pool name, unique within the cluster
    pub name: String,
    /// Machine type
    pub instance_type: String,
    /// Minimum node count
    pub min_replicas: u32,
    /// Maximum node count
    pub max_replicas: u32,
}

/// An in-cluster add-on
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// Add-on name, unique within the cluster
    pub name: String,
    /// Object applied for this add-on; must carry apiVersion, kind and metadata.name
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub manifest: serde_json::Value,
    /// Add-ons that must be applied first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ManagedClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self, cluster: &str) -> Result<(), Error> {
        if self.provider.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.provider",
                "provider cannot be empty",
            ));
        }
        if self.region.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.region",
                "region cannot be empty",
            ));
        }
        if self.network.cidr.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.network.cidr",
                "network CIDR cannot be empty",
            ));
        }
        if self.node_pools.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.nodePools",
                "at least one node pool is required",
            ));
        }

        let mut pools = BTreeSet::new();
        for (i, pool) in self.node_pools.iter().enumerate() {
            let field = format!("spec.nodePools[{}]", i);
            if pool.name.is_empty() {
                return Err(Error::validation_for_field(cluster, field, "name cannot be empty"));
            }
            if !pools.insert(pool.name.as_str()) {
                return Err(Error::validation_for_field(
                    cluster,
                    field,
                    format!("duplicate node pool {:?}", pool.name),
                ));
            }
            if pool.min_replicas > pool.max_replicas {
                return Err(Error::validation_for_field(
                    cluster,
                    field,
                    "minReplicas cannot exceed maxReplicas",
                ));
            }
        }

        let mut addons = BTreeSet::new();
        for (i, addon) in self.addons.iter().enumerate() {
            let field = format!("spec.addons[{}]", i);
            if !addons.insert(addon.name.as_str()) {
                return Err(Error::validation_for_field(
                    cluster,
                    field,
                    format!("duplicate add-on {:?}", addon.name),
                ));
            }
            let has = |key: &str| addon.manifest.get(key).is_some_and(|v| v.is_string());
            let named = addon
                .manifest
                .pointer("/metadata/name")
                .is_some_and(|v| v.is_string());
            if !has("apiVersion") || !has("kind") || !named {
                return Err(Error::validation_for_field(
                    cluster,
                    field,
                    "manifest must set apiVersion, kind and metadata.name",
                ));
            }
        }

        for (i, addon) in self.addons.iter().enumerate() {
            if let Some(dep) = addon.depends_on.iter().find(|d| !addons.contains(d.as_str())) {
                return Err(Error::validation_for_field(
                    cluster,
                    format!("spec.addons[{}].dependsOn", i),
                    format!("add-on {:?} depends on unknown add-on {:?}", addon.name, dep),
                ));
            }
        }

        let cyclic = addon_cycle(&self.addons);
        if !cyclic.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.addons",
                format!("add-on dependency cycle: {}", cyclic.join(", ")),
            ));
        }

        Ok(())
    }
}

/// Add-ons that can never be ordered because they sit on or behind a cycle
///
/// Kahn's algorithm over `dependsOn`: whatever never reaches in-degree zero
/// is returned, sorted. Unknown dependencies are ignored here.
fn addon_cycle(addons: &[AddonSpec]) -> Vec<String> {
    let names: BTreeSet<&str> = addons.iter().map(|a| a.name.as_str()).collect();
    let mut pending: BTreeMap<&str, usize> = addons
        .iter()
        .map(|a| {
            let deps: BTreeSet<&str> = a
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| names.contains(d))
                .collect();
            (a.name.as_str(), deps.len())
        })
        .collect();

    let mut ready: Vec<&str> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(name, _)| *name)
        .collect();
    while let Some(done) = ready.pop() {
        pending.remove(done);
        for addon in addons {
            let waits = addon.depends_on.iter().any(|d| d == done);
            if let Some(n) = pending.get_mut(addon.name.as_str()).filter(|_| waits) {
                *n -= 1;
                if *n == 0 {
                    ready.push(addon.name.as_str());
                }
            }
        }
    }

    pending.into_keys().map(str::to_string).collect()
}

/// Status for a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Aggregated component status
    #[serde(flatten)]
    pub composite: CompositeStatus,

    /// The generation of the spec last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
