//! CRD installation
//!
//! The operator installs its own CRDs on startup using server-side apply so
//! the schema always matches the running binary, then waits for the API
//! server to report them established before any watch starts.

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use trellis_common::crd::{ClusterNetwork, ControlPlane, ManagedCluster, NodePool};
use trellis_common::kube_utils::wait_for_crd;
use trellis_common::retry::{retry_with_backoff, RetryConfig};
use trellis_common::FIELD_MANAGER;

/// CRD definition with name and resource
pub struct CrdDef {
    pub name: String,
    pub crd: CustomResourceDefinition,
}

impl CrdDef {
    fn of<K: CustomResourceExt>() -> Self {
        Self {
            name: K::crd_name().to_string(),
            crd: K::crd(),
        }
    }
}

/// Every CRD the operator owns, parent first
pub fn all_crds() -> Vec<CrdDef> {
    vec![
        CrdDef::of::<ManagedCluster>(),
        CrdDef::of::<ClusterNetwork>(),
        CrdDef::of::<ControlPlane>(),
        CrdDef::of::<NodePool>(),
    ]
}

/// Render every CRD as a multi-document YAML stream
pub fn crds_yaml() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for def in all_crds() {
        let doc = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        docs.push(doc);
    }
    Ok(docs.join("---\n"))
}

/// Install all CRDs and wait for them to be established
pub async fn ensure_crds_installed(
    client: &Client,
    wait: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let retry = RetryConfig::with_max_attempts(10);

    let defs = all_crds();
    for def in &defs {
        info!(crd = %def.name, "installing CRD");
        retry_with_backoff(&retry, &def.name, || async {
            crds.patch(&def.name, &params, &Patch::Apply(&def.crd)).await
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    for def in &defs {
        wait_for_crd(client, &def.name, wait, cancel).await?;
    }

    info!(count = defs.len(), "all Trellis CRDs installed and established");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_names_follow_plural_and_group() {
        let names: Vec<_> = all_crds().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            [
                "managedclusters.trellis.dev",
                "clusternetworks.trellis.dev",
                "controlplanes.trellis.dev",
                "nodepools.trellis.dev",
            ]
        );
    }

    #[test]
    fn names_match_crd_metadata() {
        for def in all_crds() {
            assert_eq!(def.crd.metadata.name.as_deref(), Some(def.name.as_str()));
        }
    }

    #[test]
    fn yaml_contains_every_kind() {
        let yaml = crds_yaml().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 4);
        for kind in ["ManagedCluster", "ClusterNetwork", "ControlPlane", "NodePool"] {
            assert!(yaml.contains(&format!("kind: {}", kind)), "missing {}", kind);
        }
    }
}
