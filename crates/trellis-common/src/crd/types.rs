//! Shared status vocabulary for the parent cluster and its child components

use std::collections::BTreeMap;

use kube::core::{ApiResource, GroupVersion};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Observed state of one tracked component
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ComponentPhase {
    /// Created or updated, not yet converged
    #[default]
    Pending,
    /// Converged to the desired state
    Success,
    /// Reported a terminal provisioning failure
    Failure,
    /// Delete issued, waiting for the resource to go away
    Deleting,
    /// Confirmed gone from the store
    Deleted,
    /// Reported a terminal deletion failure
    DeleteFailed,
    /// Converged with a non-fatal problem
    Warning,
    /// Could not be evaluated
    Error,
}

impl ComponentPhase {
    /// True for phases that need an operator or a spec change to move on
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Failure | Self::DeleteFailed)
    }
}

impl std::fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Success => write!(f, "Success"),
            Self::Failure => write!(f, "Failure"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
            Self::DeleteFailed => write!(f, "DeleteFailed"),
            Self::Warning => write!(f, "Warning"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Aggregate status of a composite resource
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OverallStatus {
    /// Provisioning in progress
    #[default]
    Pending,
    /// Every component converged
    Success,
    /// A component failed; waiting for a spec change
    Failure,
    /// Teardown in progress
    Deleting,
    /// Every component is gone
    Deleted,
    /// A component failed to delete; operator intervention required
    DeleteFailed,
    /// Converged with warnings
    Warning,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Success => write!(f, "Success"),
            Self::Failure => write!(f, "Failure"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
            Self::DeleteFailed => write!(f, "DeleteFailed"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

/// Pointer to the external object backing a component
///
/// Stored on every condition so a component can still be found (and
/// deleted) after it disappears from the desired spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API version, e.g. "trellis.dev/v1alpha1"
    pub api_version: String,
    /// Kind, e.g. "ClusterNetwork"
    pub kind: String,
    /// Namespace of the object (empty for cluster-scoped)
    #[serde(default)]
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ResourceRef {
    /// Resolve the API resource used to address this object in the store
    pub fn api_resource(&self) -> Result<ApiResource, Error> {
        let gv: GroupVersion = self.api_version.parse().map_err(|e| {
            Error::serialization_for_kind(
                self.kind.clone(),
                format!("invalid apiVersion {:?}: {}", self.api_version, e),
            )
        })?;
        Ok(ApiResource::from_gvk(&gv.with_kind(&self.kind)))
    }
}

/// Per-component status condition tracked on the parent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Component name, unique within the parent
    pub name: String,
    /// Last observed phase
    pub status: ComponentPhase,
    /// Human-readable summary
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Extended failure detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// The object backing this component
    pub resource_ref: ResourceRef,
}

impl ComponentStatus {
    /// A fresh Pending condition for the given object
    pub fn pending(name: impl Into<String>, resource_ref: ResourceRef) -> Self {
        Self {
            name: name.into(),
            status: ComponentPhase::Pending,
            message: String::new(),
            detail: String::new(),
            resource_ref,
        }
    }
}

/// Status shape shared by every composite parent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositeStatus {
    /// Aggregate status across all components
    #[serde(default)]
    pub overall_status: OverallStatus,
    /// Human-readable summary
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// One entry per tracked component
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentStatus>,
}

/// Status reported by every child component kind at `.status`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildStatus {
    /// Phase as reported by the component's own controller
    #[serde(default)]
    pub phase: ComponentPhase,
    /// Human-readable summary
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Extended failure detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// Values consumed by dependent components (subnet ids, endpoints)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl ChildStatus {
    /// Status with only a phase set
    pub fn with_phase(phase: ComponentPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Read the status of an arbitrary stored object, if populated
    pub fn from_object(data: &serde_json::Value) -> Option<Self> {
        data.get("status")
            .filter(|s| !s.is_null())
            .and_then(|s| serde_json::from_value(s.clone()).ok())
    }
}

/// Schema for free-form embedded objects
pub fn preserve_unknown_fields(
    _: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    use schemars::schema::{InstanceType, Schema, SchemaObject};

    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ref_resolves_api_resource() {
        let r = ResourceRef {
            api_version: "trellis.dev/v1alpha1".to_string(),
            kind: "NodePool".to_string(),
            namespace: "default".to_string(),
            name: "prod-ng1".to_string(),
        };
        let ar = r.api_resource().unwrap();
        assert_eq!(ar.group, "trellis.dev");
        assert_eq!(ar.version, "v1alpha1");
        assert_eq!(ar.kind, "NodePool");
        assert_eq!(ar.plural, "nodepools");
    }

    #[test]
    fn core_group_resource_ref_resolves() {
        let r = ResourceRef {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "kube-system".to_string(),
            name: "cni".to_string(),
        };
        let ar = r.api_resource().unwrap();
        assert_eq!(ar.group, "");
        assert_eq!(ar.plural, "configmaps");
    }

    #[test]
    fn child_status_reads_from_object() {
        let obj = serde_json::json!({
            "spec": {},
            "status": {"phase": "DeleteFailed", "message": "dependency violation"}
        });
        let status = ChildStatus::from_object(&obj).unwrap();
        assert_eq!(status.phase, ComponentPhase::DeleteFailed);
        assert!(status.phase.is_terminal_failure());

        assert!(ChildStatus::from_object(&serde_json::json!({"spec": {}})).is_none());
        assert!(ChildStatus::from_object(&serde_json::json!({"status": null})).is_none());
    }

    #[test]
    fn composite_status_omits_empty_fields() {
        let json = serde_json::to_value(CompositeStatus::default()).unwrap();
        assert_eq!(json, serde_json::json!({"overallStatus": "Pending"}));
    }
}
