//! Kubernetes Event recording for Trellis controllers.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A child component reported Failure
    pub const COMPONENT_FAILED: &str = "ComponentFailed";
    /// A child component reported DeleteFailed
    pub const DELETE_FAILED: &str = "DeleteFailed";
    /// The add-on scheduler found components that can never run
    pub const DEPENDENCY_DEADLOCK: &str = "DependencyDeadlock";
    /// The spec failed validation or names an unknown provider
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// Every component converged
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// Every component was removed and the finalizer released
    pub const CLUSTER_DELETED: &str = "ClusterDeleted";
}

/// Well-known event action strings.
pub mod actions {
    /// Forward reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Teardown
    pub const DELETE: &str = "Delete";
}
