//! Error types for the Trellis operator
//!
//! Every error carries enough context to be surfaced on a ManagedCluster's
//! status. The engine drives all control flow off two classes:
//!
//! - **recoverable**: transient conditions (API conflicts, network blips,
//!   a component that is not ready yet). Logged, accumulated, retried by
//!   requeue.
//! - **critical**: configuration problems or unresolvable states (unknown
//!   provider, dependency deadlock, a child reporting Failure). These halt
//!   the current round and wait for a spec change or operator action.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a ManagedCluster spec
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.nodePools[0].replicas")
        field: Option<String>,
    },

    /// Infrastructure provider error
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Provider kind (gke, eks)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A component's reconcile or delete failed
    #[error("component {component} failed: {message}")]
    Component {
        /// Name of the failing component
        component: String,
        /// Description of what failed
        message: String,
        /// Critical errors halt the round
        critical: bool,
    },

    /// No component could make progress while some remain unfinished
    #[error("deadlock: components {} can never become ready", components.join(", "))]
    Deadlock {
        /// Names of the stuck components, sorted
        components: Vec<String>,
    },

    /// Several independent recoverable failures from a single round
    #[error("{} errors: {}", errors.len(), join_errors(errors))]
    Aggregate {
        /// The collected errors
        errors: Vec<Error>,
    },

    /// Construction-time wiring bug (duplicate registration, cycle, unnamed resource)
    #[error("wiring error: {message}")]
    Wiring {
        /// Description of the wiring mistake
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A bounded wait ran out of time
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: String,
    },

    /// A bounded wait was cancelled by shutdown
    #[error("cancelled while waiting for {operation}")]
    Cancelled {
        /// What was being waited on
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "store")
        context: String,
    },
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error without cluster context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., unknown provider kind)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// A transient component failure; the round continues with siblings
    pub fn recoverable(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Component {
            component: component.into(),
            message: msg.into(),
            critical: false,
        }
    }

    /// A terminal component failure; the round is aborted
    pub fn critical(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Component {
            component: component.into(),
            message: msg.into(),
            critical: true,
        }
    }

    /// Create a wiring error
    pub fn wiring(msg: impl Into<String>) -> Self {
        Self::Wiring {
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse a list of errors: none -> `None`, one -> itself, many -> `Aggregate`
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate { errors }),
        }
    }

    /// Check if this error is retryable
    ///
    /// Conflicts (409), throttling (429), server errors and transport errors
    /// are retryable; any other 4xx from the API server is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Component { critical, .. } => !critical,
            Error::Deadlock { .. } => false,
            Error::Aggregate { errors } => errors.iter().all(Error::is_retryable),
            Error::Wiring { .. } => false,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Critical errors halt the current round and wait for a spec change
    pub fn is_critical(&self) -> bool {
        !self.is_retryable()
    }

    /// True if the API server reported an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provider { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            kind: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Test".to_string(),
                code,
            }),
        }
    }

    /// Story: A user typo in the spec must not be retried on a timer
    #[test]
    fn story_validation_errors_are_critical() {
        let err = Error::validation_for("prod", "nodePools must not be empty");
        assert!(err.is_critical());
        assert_eq!(err.cluster(), Some("prod"));
        assert!(err.to_string().contains("nodePools must not be empty"));

        let err = Error::validation_for_field("prod", "spec.region", "must be set");
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.region")),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: Concurrent edits surface as conflicts and are retried
    #[test]
    fn story_api_conflicts_are_retryable() {
        assert!(api_error(409).is_retryable());
        assert!(api_error(409).is_conflict());
        assert!(api_error(429).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(api_error(422).is_critical());
        assert!(!api_error(422).is_conflict());
    }

    #[test]
    fn component_error_classification() {
        assert!(Error::recoverable("vpc", "not ready").is_retryable());
        assert!(Error::critical("vpc", "quota exhausted").is_critical());
    }

    #[test]
    fn deadlock_names_components() {
        let err = Error::Deadlock {
            components: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.is_critical());
        assert_eq!(
            err.to_string(),
            "deadlock: components a, b can never become ready"
        );
    }

    #[test]
    fn aggregate_collapses_and_classifies() {
        assert!(Error::aggregate(vec![]).is_none());

        let single = Error::aggregate(vec![Error::recoverable("a", "x")]);
        assert!(matches!(single, Some(Error::Component { .. })));

        let many = Error::aggregate(vec![
            Error::recoverable("a", "x"),
            Error::recoverable("b", "y"),
        ]);
        let many = many.unwrap();
        assert!(many.is_retryable());
        assert!(many.to_string().starts_with("2 errors"));

        let mixed = Error::Aggregate {
            errors: vec![Error::recoverable("a", "x"), Error::wiring("dup")],
        };
        assert!(mixed.is_critical());
    }

    #[test]
    fn provider_errors_respect_retryable_flag() {
        assert!(Error::provider_for("c", "gke", "quota").is_retryable());
        assert!(Error::provider_permanent("c", "azure", "unknown provider").is_critical());
    }
}
