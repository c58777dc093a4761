//! Google Kubernetes Engine provider
//!
//! GKE node pools attach to the cluster rather than to subnets, so the chain
//! is strictly linear: network, control plane, pools.

use trellis_common::crd::{ControlPlane, ManagedCluster, NodePool};
use trellis_common::Error;
use trellis_engine::Graph;

use super::{
    control_plane_endpoint, control_plane_for, network_for, network_subnets, node_pool_for,
    Provider,
};

/// GKE provider
#[derive(Clone, Copy, Debug, Default)]
pub struct GkeProvider;

impl Provider for GkeProvider {
    fn kind(&self) -> &'static str {
        "gke"
    }

    fn build(&self, cluster: &ManagedCluster) -> Result<Graph, Error> {
        let mut graph = Graph::new();

        // Cloud NAT only matters when nodes have no public addresses
        let network = graph.add_vertex(network_for(
            cluster,
            cluster.spec.control_plane.private_endpoint,
        ))?;
        let control_plane = graph.add_vertex(control_plane_for(cluster, None))?;
        graph.add_edge(network, control_plane)?;

        for pool in &cluster.spec.node_pools {
            let key = graph.add_vertex(node_pool_for(cluster, pool))?;
            graph.add_edge(control_plane, key)?;
        }

        Ok(graph)
    }

    fn patch(&self, _cluster: &ManagedCluster, graph: &mut Graph) -> Result<(), Error> {
        if let Some(subnets) = network_subnets(graph) {
            if let Some(cp) = graph.get_first_mut::<ControlPlane>() {
                cp.spec.subnet_ids = subnets;
            }
        }
        if let Some(endpoint) = control_plane_endpoint(graph) {
            for pool in graph.get_mut::<NodePool>() {
                pool.spec.endpoint = Some(endpoint.clone());
            }
        }
        Ok(())
    }
}
