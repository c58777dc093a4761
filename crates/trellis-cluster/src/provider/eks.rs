//! Amazon Elastic Kubernetes Service provider
//!
//! EKS managed node groups are placed into subnets directly, so every pool
//! depends on the network as well as on the control plane.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::core::ApiResource;
use kube::ResourceExt;
use tracing::info;
use trellis_common::crd::{ControlPlane, ManagedCluster, NodePool};
use trellis_common::Error;
use trellis_engine::{Graph, ResourceStore, Vertex};

use super::{
    control_plane_endpoint, control_plane_for, network_for, network_subnets, node_pool_for,
    Provider,
};

/// Name of the kubeconfig Secret the EKS control plane controller leaves behind
pub fn kubeconfig_secret_name(control_plane: &str) -> String {
    format!("{}-kubeconfig", control_plane)
}

/// EKS provider
#[derive(Clone, Copy, Debug, Default)]
pub struct EksProvider;

#[async_trait]
impl Provider for EksProvider {
    fn kind(&self) -> &'static str {
        "eks"
    }

    fn build(&self, cluster: &ManagedCluster) -> Result<Graph, Error> {
        let mut graph = Graph::new();

        // private subnets always egress through NAT on EKS
        let network = graph.add_vertex(network_for(cluster, true))?;
        let role = format!("{}-eks-cluster-role", cluster.name_any());
        let control_plane = graph.add_vertex(control_plane_for(cluster, Some(role)))?;
        graph.add_edge(network, control_plane)?;

        for pool in &cluster.spec.node_pools {
            let key = graph.add_vertex(node_pool_for(cluster, pool))?;
            graph.add_edge(network, key)?;
            graph.add_edge(control_plane, key)?;
        }

        Ok(graph)
    }

    fn patch(&self, _cluster: &ManagedCluster, graph: &mut Graph) -> Result<(), Error> {
        if let Some(subnets) = network_subnets(graph) {
            if let Some(cp) = graph.get_first_mut::<ControlPlane>() {
                cp.spec.subnet_ids = subnets.clone();
            }
            for pool in graph.get_mut::<NodePool>() {
                pool.spec.subnet_ids = subnets.clone();
            }
        }
        if let Some(endpoint) = control_plane_endpoint(graph) {
            for pool in graph.get_mut::<NodePool>() {
                pool.spec.endpoint = Some(endpoint.clone());
            }
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        store: &dyn ResourceStore,
        cluster: &ManagedCluster,
        vertex: &Vertex,
    ) -> Result<(), Error> {
        let resource = vertex.resource();
        if resource.as_any().downcast_ref::<ControlPlane>().is_none() {
            return Ok(());
        }
        let Some(cp_name) = resource.object_name() else {
            return Ok(());
        };

        let secret = kubeconfig_secret_name(&cp_name);
        let namespace = cluster.namespace().unwrap_or_default();
        store
            .delete(&ApiResource::erase::<Secret>(&()), &namespace, &secret)
            .await?;
        info!(cluster = %cluster.name_any(), secret = %secret, "removed control plane kubeconfig");
        Ok(())
    }
}
