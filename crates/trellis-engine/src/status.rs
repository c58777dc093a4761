//! Per-component conditions on a parent's status

use trellis_common::crd::{ComponentPhase, ComponentStatus, CompositeStatus, OverallStatus, ResourceRef};

/// Condition bookkeeping on a [`CompositeStatus`]
///
/// Conditions are keyed by component name and outlive graph membership:
/// a condition is only dropped once its object is confirmed gone.
pub trait ComponentConditions {
    /// Look up a condition
    fn condition(&self, name: &str) -> Option<&ComponentStatus>;

    /// Look up a condition mutably
    fn condition_mut(&mut self, name: &str) -> Option<&mut ComponentStatus>;

    /// Return the condition for `name`, inserting a Pending one if missing
    ///
    /// An existing condition has its `resource_ref` refreshed.
    fn ensure_condition(&mut self, name: &str, resource_ref: ResourceRef) -> &mut ComponentStatus;

    /// Drop a condition, returning whether it was present
    fn remove_condition(&mut self, name: &str) -> bool;

    /// Set the overall status and message together
    fn set_overall(&mut self, status: OverallStatus, message: impl Into<String>);

    /// Names of conditions currently in `phase`
    fn names_in(&self, phase: ComponentPhase) -> Vec<String>;
}

impl ComponentConditions for CompositeStatus {
    fn condition(&self, name: &str) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| c.name == name)
    }

    fn condition_mut(&mut self, name: &str) -> Option<&mut ComponentStatus> {
        self.components.iter_mut().find(|c| c.name == name)
    }

    fn ensure_condition(&mut self, name: &str, resource_ref: ResourceRef) -> &mut ComponentStatus {
        let idx = match self.components.iter().position(|c| c.name == name) {
            Some(idx) => {
                self.components[idx].resource_ref = resource_ref;
                idx
            }
            None => {
                self.components
                    .push(ComponentStatus::pending(name, resource_ref));
                self.components.len() - 1
            }
        };
        &mut self.components[idx]
    }

    fn remove_condition(&mut self, name: &str) -> bool {
        let before = self.components.len();
        self.components.retain(|c| c.name != name);
        self.components.len() != before
    }

    fn set_overall(&mut self, status: OverallStatus, message: impl Into<String>) {
        self.overall_status = status;
        self.message = message.into();
    }

    fn names_in(&self, phase: ComponentPhase) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| c.status == phase)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str) -> ResourceRef {
        ResourceRef {
            api_version: "trellis.dev/v1alpha1".to_string(),
            kind: "NodePool".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn ensure_inserts_once_and_refreshes_reference() {
        let mut status = CompositeStatus::default();
        status.ensure_condition("ng1", reference("prod-ng1")).status = ComponentPhase::Success;
        let cond = status.ensure_condition("ng1", reference("prod-ng1-v2"));

        assert_eq!(cond.status, ComponentPhase::Success);
        assert_eq!(cond.resource_ref.name, "prod-ng1-v2");
        assert_eq!(status.components.len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let mut status = CompositeStatus::default();
        status.ensure_condition("ng1", reference("prod-ng1"));
        assert!(status.remove_condition("ng1"));
        assert!(!status.remove_condition("ng1"));
        assert!(status.condition("ng1").is_none());
    }

    #[test]
    fn names_in_phase() {
        let mut status = CompositeStatus::default();
        status.ensure_condition("a", reference("a")).status = ComponentPhase::Deleting;
        status.ensure_condition("b", reference("b"));
        assert_eq!(status.names_in(ComponentPhase::Deleting), ["a"]);
    }
}
