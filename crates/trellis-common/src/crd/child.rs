//! Capability shared by every child component kind
//!
//! Child kinds all report a [`ChildStatus`] at `.status` and carry the
//! component name they play in their parent as a label. This trait is the
//! single place the engine learns that about a concrete type, so the
//! engine never has to switch over kinds.

use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::ChildStatus;
use super::{ClusterNetwork, ControlPlane, NodePool};

/// Label holding the component name a child plays within its parent
pub const COMPONENT_LABEL: &str = "trellis.dev/component";

/// A typed child resource the engine can create, watch and delete
pub trait ChildResource:
    Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Status reported by the child's own controller, if populated
    fn child_status(&self) -> Option<&ChildStatus>;

    /// Replace the status (used when merging the stored object)
    fn set_child_status(&mut self, status: Option<ChildStatus>);

    /// Component name used for the parent's status condition
    fn component_name(&self) -> Option<String> {
        let meta = self.meta();
        meta.labels
            .as_ref()
            .and_then(|l| l.get(COMPONENT_LABEL).cloned())
            .or_else(|| meta.name.clone())
    }
}

macro_rules! child_resource {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl ChildResource for $kind {
                fn child_status(&self) -> Option<&ChildStatus> {
                    self.status.as_ref()
                }

                fn set_child_status(&mut self, status: Option<ChildStatus>) {
                    self.status = status;
                }
            }
        )+
    };
}

child_resource!(ClusterNetwork, ControlPlane, NodePool);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ComponentPhase, NodePoolSpec};

    fn pool(name: &str) -> NodePool {
        NodePool::new(
            name,
            NodePoolSpec {
                provider: "gke".to_string(),
                control_plane: "prod-control-plane".to_string(),
                version: "1.31".to_string(),
                instance_type: "e2-standard-4".to_string(),
                min_replicas: 1,
                max_replicas: 3,
                subnet_ids: vec![],
                endpoint: None,
            },
        )
    }

    #[test]
    fn component_name_prefers_label() {
        let mut np = pool("prod-ng1");
        assert_eq!(np.component_name().as_deref(), Some("prod-ng1"));

        np.metadata.labels = Some([(COMPONENT_LABEL.to_string(), "ng1".to_string())].into());
        assert_eq!(np.component_name().as_deref(), Some("ng1"));
    }

    #[test]
    fn status_accessors_round_trip() {
        let mut np = pool("prod-ng1");
        assert!(np.child_status().is_none());
        np.set_child_status(Some(ChildStatus::with_phase(ComponentPhase::Success)));
        assert_eq!(
            np.child_status().map(|s| s.phase),
            Some(ComponentPhase::Success)
        );
    }
}
