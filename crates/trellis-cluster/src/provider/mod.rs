//! Cloud provider abstraction
//!
//! A provider expands a [`ManagedCluster`] into the graph of child
//! resources its infrastructure controllers understand, and copies outputs
//! from converged children into the ones that consume them.
//!
//! # Supported Providers
//!
//! - [`GkeProvider`] - Google Kubernetes Engine
//! - [`EksProvider`] - Amazon Elastic Kubernetes Service

mod eks;
mod gke;

pub use eks::EksProvider;
pub use gke::GkeProvider;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use trellis_common::crd::{
    ClusterNetwork, ClusterNetworkSpec, ControlPlane, ControlPlaneSpec, ManagedCluster, NodePool,
    NodePoolSettings, NodePoolSpec, COMPONENT_LABEL, ENDPOINT_OUTPUT, SUBNET_IDS_OUTPUT,
};
use trellis_common::{Error, PARENT_LABEL};
use trellis_engine::{Graph, PostDeleteHook, ResourceStore, Vertex};

/// Condition name of the network component
pub const NETWORK_COMPONENT: &str = "network";

/// Condition name of the control plane component
pub const CONTROL_PLANE_COMPONENT: &str = "control-plane";

/// Condition name of a node pool component
pub fn node_pool_component(pool: &str) -> String {
    format!("nodepool/{}", pool)
}

/// Turns a cluster spec into a graph of child resources
#[async_trait]
pub trait Provider: Send + Sync {
    /// Value of `spec.provider` this provider handles
    fn kind(&self) -> &'static str;

    /// Build the desired graph for `cluster`
    fn build(&self, cluster: &ManagedCluster) -> Result<Graph, Error>;

    /// Copy outputs of loaded children into their consumers
    fn patch(&self, cluster: &ManagedCluster, graph: &mut Graph) -> Result<(), Error>;

    /// Cleanup once a child is confirmed gone during teardown
    async fn post_delete(
        &self,
        _store: &dyn ResourceStore,
        _cluster: &ManagedCluster,
        _vertex: &Vertex,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Providers known to the operator, keyed by kind
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in provider
    pub fn with_defaults() -> Self {
        let builtin: [Arc<dyn Provider>; 2] = [Arc::new(GkeProvider), Arc::new(EksProvider)];
        Self {
            providers: builtin
                .into_iter()
                .map(|p| (p.kind().to_string(), p))
                .collect(),
        }
    }

    /// Add a provider
    ///
    /// # Errors
    /// [`Error::Wiring`] if a provider of the same kind is registered.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), Error> {
        let kind = provider.kind().to_string();
        if self.providers.contains_key(&kind) {
            return Err(Error::wiring(format!("provider {} registered twice", kind)));
        }
        self.providers.insert(kind, provider);
        Ok(())
    }

    /// Look up the provider for `kind`
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(kind).cloned()
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Adapts a provider's `post_delete` to the delete walker's hook
pub struct ProviderDeleteHook<'a> {
    /// Provider owning the graph
    pub provider: &'a dyn Provider,
    /// Store the hook may clean up in
    pub store: &'a dyn ResourceStore,
    /// Cluster being torn down
    pub cluster: &'a ManagedCluster,
}

#[async_trait]
impl PostDeleteHook for ProviderDeleteHook<'_> {
    async fn after_delete(&self, vertex: &Vertex) -> Result<(), Error> {
        self.provider
            .post_delete(self.store, self.cluster, vertex)
            .await
    }
}

fn child_meta(cluster: &ManagedCluster, suffix: &str, component: String) -> ObjectMeta {
    let name = cluster.name_any();
    ObjectMeta {
        name: Some(format!("{}-{}", name, suffix)),
        namespace: cluster.namespace(),
        labels: Some(BTreeMap::from([
            (PARENT_LABEL.to_string(), name),
            (COMPONENT_LABEL.to_string(), component),
        ])),
        ..Default::default()
    }
}

pub(crate) fn network_for(cluster: &ManagedCluster, nat_gateway: bool) -> ClusterNetwork {
    let spec = &cluster.spec;
    ClusterNetwork {
        metadata: child_meta(cluster, "network", NETWORK_COMPONENT.to_string()),
        spec: ClusterNetworkSpec {
            provider: spec.provider.clone(),
            region: spec.region.clone(),
            cidr: spec.network.cidr.clone(),
            subnets: spec.network.subnets.clone(),
            nat_gateway,
        },
        status: None,
    }
}

pub(crate) fn control_plane_for(cluster: &ManagedCluster, service_role: Option<String>) -> ControlPlane {
    let spec = &cluster.spec;
    ControlPlane {
        metadata: child_meta(cluster, "control-plane", CONTROL_PLANE_COMPONENT.to_string()),
        spec: ControlPlaneSpec {
            provider: spec.provider.clone(),
            region: spec.region.clone(),
            version: spec.kubernetes_version.clone(),
            subnet_ids: Vec::new(),
            private_endpoint: spec.control_plane.private_endpoint,
            service_role,
        },
        status: None,
    }
}

pub(crate) fn node_pool_for(cluster: &ManagedCluster, pool: &NodePoolSettings) -> NodePool {
    let spec = &cluster.spec;
    NodePool {
        metadata: child_meta(cluster, &pool.name, node_pool_component(&pool.name)),
        spec: NodePoolSpec {
            provider: spec.provider.clone(),
            control_plane: format!("{}-control-plane", cluster.name_any()),
            version: spec.kubernetes_version.clone(),
            instance_type: pool.instance_type.clone(),
            min_replicas: pool.min_replicas,
            max_replicas: pool.max_replicas,
            subnet_ids: Vec::new(),
            endpoint: None,
        },
        status: None,
    }
}

/// Subnet ids published by the loaded network, if it reported them
pub(crate) fn network_subnets(graph: &Graph) -> Option<Vec<String>> {
    let outputs = &graph.get_first::<ClusterNetwork>()?.status.as_ref()?.outputs;
    let ids: Vec<String> = outputs
        .get(SUBNET_IDS_OUTPUT)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    (!ids.is_empty()).then_some(ids)
}

/// API endpoint published by the loaded control plane, if it reported one
pub(crate) fn control_plane_endpoint(graph: &Graph) -> Option<String> {
    graph
        .get_first::<ControlPlane>()?
        .status
        .as_ref()?
        .outputs
        .get(ENDPOINT_OUTPUT)
        .filter(|e| !e.is_empty())
        .cloned()
}
