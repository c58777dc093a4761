//! Dependency graph of the resources composing a parent
//!
//! Every vertex hangs off a sentinel root until it is given a real
//! predecessor, so a walk from the root reaches the whole graph. The walk
//! is Kahn's algorithm with ties broken by insertion order, which keeps the
//! creation order stable across reconciles of the same spec.

use std::collections::{HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::algo::has_path_connecting;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::trace;
use trellis_common::Error;

use crate::store::ResourceStore;
use crate::vertex::{ManagedResource, Vertex};

/// Handle to a vertex returned by [`Graph::add_vertex`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexKey(NodeIndex);

/// A DAG of resources rooted at a sentinel
#[derive(Debug)]
pub struct Graph {
    dag: DiGraph<Option<Vertex>, ()>,
    root: NodeIndex,
    ids: HashMap<String, NodeIndex>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// An empty graph holding only the root
    pub fn new() -> Self {
        let mut dag = DiGraph::new();
        let root = dag.add_node(None);
        Self {
            dag,
            root,
            ids: HashMap::new(),
        }
    }

    /// Number of vertices, not counting the root
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when no vertex was added
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Add a resource as a new vertex depending only on the root
    ///
    /// # Errors
    /// [`Error::Wiring`] if the resource has no name or a vertex with the
    /// same identity already exists.
    pub fn add_vertex<R: ManagedResource>(&mut self, resource: R) -> Result<VertexKey, Error> {
        let vertex = Vertex::new(Box::new(resource))?;
        if self.ids.contains_key(vertex.id()) {
            return Err(Error::wiring(format!("duplicate vertex {}", vertex.id())));
        }
        if self.contains_name(vertex.display_name()) {
            return Err(Error::wiring(format!(
                "duplicate component name {}",
                vertex.display_name()
            )));
        }
        let id = vertex.id().to_string();
        let idx = self.dag.add_node(Some(vertex));
        self.dag.add_edge(self.root, idx, ());
        self.ids.insert(id, idx);
        Ok(VertexKey(idx))
    }

    /// Declare that `from` must be created before `to`
    ///
    /// `to` loses its implicit edge from the root. Adding an edge that
    /// already exists is a no-op.
    ///
    /// # Errors
    /// [`Error::Wiring`] for unknown keys or when the edge would close a cycle.
    pub fn add_edge(&mut self, from: VertexKey, to: VertexKey) -> Result<(), Error> {
        let from_id = self.vertex(from).map(|v| v.id().to_string());
        let to_id = self.vertex(to).map(|v| v.id().to_string());
        let (Some(from_id), Some(to_id)) = (from_id, to_id) else {
            return Err(Error::wiring("edge references an unknown vertex"));
        };
        if from == to || has_path_connecting(&self.dag, to.0, from.0, None) {
            return Err(Error::wiring(format!(
                "edge {} -> {} would create a cycle",
                from_id, to_id
            )));
        }
        if self.dag.find_edge(from.0, to.0).is_some() {
            return Ok(());
        }
        if let Some(edge) = self.dag.find_edge(self.root, to.0) {
            self.dag.remove_edge(edge);
        }
        self.dag.add_edge(from.0, to.0, ());
        Ok(())
    }

    /// Vertices in dependency order (every vertex after its predecessors)
    pub fn walk(&self) -> Vec<VertexKey> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::with_capacity(self.dag.node_count());
        for edge in self.dag.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut order = Vec::with_capacity(self.len());
        let mut queue = VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            if idx != self.root {
                order.push(VertexKey(idx));
            }
            // node indices are never reused, so index order is insertion order
            let mut next: Vec<NodeIndex> = self
                .dag
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            next.sort();
            for n in next {
                if let Some(deg) = in_degree.get_mut(&n) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(n);
                    }
                }
            }
        }
        order
    }

    /// Vertices in teardown order (every vertex after its dependents)
    pub fn reverse_walk(&self) -> Vec<VertexKey> {
        let mut order = self.walk();
        order.reverse();
        order
    }

    /// Look up a vertex
    pub fn vertex(&self, key: VertexKey) -> Option<&Vertex> {
        self.dag.node_weight(key.0).and_then(Option::as_ref)
    }

    /// Look up a vertex mutably
    pub fn vertex_mut(&mut self, key: VertexKey) -> Option<&mut Vertex> {
        self.dag.node_weight_mut(key.0).and_then(Option::as_mut)
    }

    /// Vertices in walk order
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> + '_ {
        self.walk().into_iter().filter_map(|k| self.vertex(k))
    }

    /// True if some vertex tracks a condition with this name
    pub fn contains_name(&self, name: &str) -> bool {
        self.dag
            .node_weights()
            .flatten()
            .any(|v| v.display_name() == name)
    }

    /// Every resource of type `K`, in walk order
    pub fn get<K: ManagedResource>(&self) -> Vec<&K> {
        self.vertices()
            .filter_map(|v| v.resource().as_any().downcast_ref::<K>())
            .collect()
    }

    /// First resource of type `K` in walk order
    pub fn get_first<K: ManagedResource>(&self) -> Option<&K> {
        self.vertices()
            .find_map(|v| v.resource().as_any().downcast_ref::<K>())
    }

    /// Every resource of type `K`, mutably, in insertion order
    pub fn get_mut<K: ManagedResource>(&mut self) -> Vec<&mut K> {
        self.dag
            .node_weights_mut()
            .flatten()
            .filter_map(|v| v.resource_mut().as_any_mut().downcast_mut::<K>())
            .collect()
    }

    /// First resource of type `K` in walk order, mutably
    pub fn get_first_mut<K: ManagedResource>(&mut self) -> Option<&mut K> {
        let key = self.walk().into_iter().find(|k| {
            self.vertex(*k)
                .is_some_and(|v| v.resource().as_any().is::<K>())
        })?;
        self.vertex_mut(key)?
            .resource_mut()
            .as_any_mut()
            .downcast_mut::<K>()
    }

    /// Refresh every vertex from the store
    ///
    /// Stored bookkeeping and status are merged into the desired objects and
    /// `exists` is set on each vertex. Nothing else in the engine sets it.
    pub async fn load(&mut self, store: &dyn ResourceStore) -> Result<(), Error> {
        for key in self.walk() {
            let Some(vertex) = self.vertex_mut(key) else {
                continue;
            };
            let ar = vertex.resource().api_resource();
            let namespace = vertex.resource().object_namespace();
            let name = vertex.resource().object_name().unwrap_or_default();

            match store.get(&ar, &namespace, &name).await? {
                Some(stored) => {
                    vertex.resource_mut().absorb(stored)?;
                    vertex.set_exists(true);
                }
                None => vertex.set_exists(false),
            }
            trace!(vertex = %vertex.id(), exists = vertex.exists(), "loaded vertex");
        }
        Ok(())
    }
}
