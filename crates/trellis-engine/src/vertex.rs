//! Graph vertices and the capability trait they wrap

use std::any::Any;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use trellis_common::crd::{ChildResource, ChildStatus, ResourceRef};
use trellis_common::{Error, PARENT_GENERATION_ANNOTATION};

/// What the walkers need from a resource, independent of its concrete kind
///
/// Implemented for every [`ChildResource`] through a blanket impl; the
/// walkers only ever see `dyn ManagedResource`.
pub trait ManagedResource: Send + Sync + Debug + 'static {
    /// How the resource is addressed in the store
    fn api_resource(&self) -> ApiResource;

    /// Object name, `None` if unset
    fn object_name(&self) -> Option<String>;

    /// Namespace, empty for cluster-scoped
    fn object_namespace(&self) -> String;

    /// Name of the status condition tracked for this resource
    fn component_name(&self) -> Option<String>;

    /// Parent generation stamped on the object, if any
    fn parent_generation(&self) -> Option<i64>;

    /// Stamp the parent generation and owner on the object
    fn stamp(&mut self, generation: i64, owner: Option<&OwnerReference>);

    /// Status reported by the resource's own controller
    fn observed_status(&self) -> Option<&ChildStatus>;

    /// True once the store has accepted a delete for this object
    fn is_deleting(&self) -> bool;

    /// Serialize for a store write
    fn to_object(&self) -> Result<DynamicObject, Error>;

    /// Merge the stored copy's bookkeeping into the desired object
    ///
    /// Keeps the desired spec but takes the stored resourceVersion, uid,
    /// deletion state, generation stamp and status.
    fn absorb(&mut self, stored: DynamicObject) -> Result<(), Error>;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<K: ChildResource> ManagedResource for K {
    fn api_resource(&self) -> ApiResource {
        ApiResource::erase::<K>(&())
    }

    fn object_name(&self) -> Option<String> {
        self.meta().name.clone()
    }

    fn object_namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    fn component_name(&self) -> Option<String> {
        ChildResource::component_name(self)
    }

    fn parent_generation(&self) -> Option<i64> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(PARENT_GENERATION_ANNOTATION))
            .and_then(|v| v.parse().ok())
    }

    fn stamp(&mut self, generation: i64, owner: Option<&OwnerReference>) {
        let meta = self.meta_mut();
        meta.annotations
            .get_or_insert_with(Default::default)
            .insert(PARENT_GENERATION_ANNOTATION.to_string(), generation.to_string());
        if let Some(owner) = owner {
            let refs = meta.owner_references.get_or_insert_with(Vec::new);
            refs.retain(|r| r.uid != owner.uid);
            refs.push(owner.clone());
        }
    }

    fn observed_status(&self) -> Option<&ChildStatus> {
        self.child_status()
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn to_object(&self) -> Result<DynamicObject, Error> {
        let value = serde_json::to_value(self)
            .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
    }

    fn absorb(&mut self, stored: DynamicObject) -> Result<(), Error> {
        let value = serde_json::to_value(&stored)
            .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
        let stored: K = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;

        let stored_meta = stored.meta();
        let stamped = stored_meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(PARENT_GENERATION_ANNOTATION))
            .cloned();

        let meta = self.meta_mut();
        meta.resource_version = stored_meta.resource_version.clone();
        meta.uid = stored_meta.uid.clone();
        meta.generation = stored_meta.generation;
        meta.creation_timestamp = stored_meta.creation_timestamp.clone();
        meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
        meta.finalizers = stored_meta.finalizers.clone();
        if meta.owner_references.is_none() {
            meta.owner_references = stored_meta.owner_references.clone();
        }
        let annotations = meta.annotations.get_or_insert_with(Default::default);
        match stamped {
            Some(generation) => {
                annotations.insert(PARENT_GENERATION_ANNOTATION.to_string(), generation);
            }
            None => {
                annotations.remove(PARENT_GENERATION_ANNOTATION);
            }
        }

        self.set_child_status(stored.child_status().cloned());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A resource placed in a [`Graph`](crate::Graph)
#[derive(Debug)]
pub struct Vertex {
    id: String,
    display_name: String,
    resource: Box<dyn ManagedResource>,
    exists: bool,
}

impl Vertex {
    /// Wrap a resource; fails if it has no name
    pub fn new(resource: Box<dyn ManagedResource>) -> Result<Self, Error> {
        let ar = resource.api_resource();
        let name = resource
            .object_name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::wiring(format!("{} resource has no name", ar.kind)))?;
        let id = format!(
            "{}/{}/{}/{}/{}",
            ar.group,
            ar.version,
            ar.kind,
            resource.object_namespace(),
            name
        );
        let display_name = resource.component_name().unwrap_or(name);
        Ok(Self {
            id,
            display_name,
            resource,
            exists: false,
        })
    }

    /// Stable identity: `group/version/kind/namespace/name`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the status condition tracked for this vertex
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The wrapped resource
    pub fn resource(&self) -> &dyn ManagedResource {
        self.resource.as_ref()
    }

    /// The wrapped resource, mutably
    pub fn resource_mut(&mut self) -> &mut dyn ManagedResource {
        self.resource.as_mut()
    }

    /// Whether the last load found the object in the store
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub(crate) fn set_exists(&mut self, exists: bool) {
        self.exists = exists;
    }

    /// Pointer recorded on the parent's condition for this vertex
    pub fn resource_ref(&self) -> ResourceRef {
        let ar = self.resource.api_resource();
        ResourceRef {
            api_version: ar.api_version,
            kind: ar.kind,
            namespace: self.resource.object_namespace(),
            name: self.resource.object_name().unwrap_or_default(),
        }
    }
}

/// The parent a graph is reconciled on behalf of
#[derive(Clone, Debug, Default)]
pub struct Parent {
    /// Parent name
    pub name: String,
    /// Parent namespace
    pub namespace: String,
    /// `metadata.generation`, stamped on every child
    pub generation: i64,
    /// Controller owner reference placed on every child
    pub owner: Option<OwnerReference>,
}

impl Parent {
    /// Describe a kube resource as a parent
    pub fn of<R: Resource<DynamicType = ()>>(resource: &R) -> Self {
        let meta = resource.meta();
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            generation: meta.generation.unwrap_or_default(),
            owner: resource.controller_owner_ref(&()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::crd::{ClusterNetwork, ClusterNetworkSpec, ComponentPhase, COMPONENT_LABEL};

    fn network(name: &str) -> ClusterNetwork {
        let mut net = ClusterNetwork::new(
            name,
            ClusterNetworkSpec {
                provider: "gke".to_string(),
                region: "us-central1".to_string(),
                cidr: "10.0.0.0/16".to_string(),
                subnets: vec!["10.0.1.0/24".to_string()],
                nat_gateway: false,
            },
        );
        net.metadata.namespace = Some("default".to_string());
        net
    }

    #[test]
    fn vertex_id_and_display_name() {
        let mut net = network("prod-network");
        net.metadata.labels = Some([(COMPONENT_LABEL.to_string(), "network".to_string())].into());

        let v = Vertex::new(Box::new(net)).unwrap();
        assert_eq!(
            v.id(),
            "trellis.dev/v1alpha1/ClusterNetwork/default/prod-network"
        );
        assert_eq!(v.display_name(), "network");
        assert!(!v.exists());

        let r = v.resource_ref();
        assert_eq!(r.api_version, "trellis.dev/v1alpha1");
        assert_eq!(r.kind, "ClusterNetwork");
        assert_eq!(r.name, "prod-network");
    }

    #[test]
    fn unnamed_resource_is_a_wiring_error() {
        let mut net = network("x");
        net.metadata.name = None;
        let err = Vertex::new(Box::new(net)).unwrap_err();
        assert!(matches!(err, Error::Wiring { .. }));
    }

    #[test]
    fn stamp_sets_generation_and_owner_once() {
        let mut net = network("prod-network");
        let owner = OwnerReference {
            api_version: "trellis.dev/v1alpha1".to_string(),
            kind: "ManagedCluster".to_string(),
            name: "prod".to_string(),
            uid: "uid-prod".to_string(),
            controller: Some(true),
            ..Default::default()
        };

        assert_eq!(net.parent_generation(), None);
        net.stamp(3, Some(&owner));
        net.stamp(4, Some(&owner));
        assert_eq!(net.parent_generation(), Some(4));
        assert_eq!(net.metadata.owner_references.as_ref().map(Vec::len), Some(1));
    }

    /// Story: The stored copy carries the child's status and bookkeeping,
    /// the desired copy carries the spec; load merges the two
    #[test]
    fn story_absorb_keeps_desired_spec() {
        let mut stored = network("prod-network");
        stored.spec.cidr = "10.9.0.0/16".to_string();
        stored.metadata.resource_version = Some("42".to_string());
        stored.stamp(2, None);
        stored.status = Some(ChildStatus::with_phase(ComponentPhase::Success));
        let stored = stored.to_object().unwrap();

        let mut desired = network("prod-network");
        desired.absorb(stored).unwrap();

        assert_eq!(desired.spec.cidr, "10.0.0.0/16");
        assert_eq!(desired.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(desired.parent_generation(), Some(2));
        assert_eq!(
            desired.observed_status().map(|s| s.phase),
            Some(ComponentPhase::Success)
        );
        assert!(!desired.is_deleting());
    }

    #[test]
    fn to_object_carries_type_information() {
        let obj = network("prod-network").to_object().unwrap();
        let types = obj.types.unwrap();
        assert_eq!(types.api_version, "trellis.dev/v1alpha1");
        assert_eq!(types.kind, "ClusterNetwork");
        assert_eq!(obj.data["spec"]["cidr"], "10.0.0.0/16");
    }

    #[test]
    fn parent_from_resource() {
        let mut net = network("prod-network");
        net.metadata.generation = Some(7);
        net.metadata.uid = Some("uid-1".to_string());
        let parent = Parent::of(&net);
        assert_eq!(parent.name, "prod-network");
        assert_eq!(parent.generation, 7);
        assert_eq!(parent.owner.map(|o| o.uid), Some("uid-1".to_string()));
    }
}
