//! Common types for Trellis: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write Trellis issues
pub const FIELD_MANAGER: &str = "trellis-controller";

/// Finalizer guarding a ManagedCluster until its components are torn down
pub const CLUSTER_FINALIZER: &str = "trellis.dev/cluster-cleanup";

/// Annotation stamped on children with the parent generation that produced them
pub const PARENT_GENERATION_ANNOTATION: &str = "trellis.dev/parent-generation";

/// Label linking a child resource to its parent ManagedCluster
pub const PARENT_LABEL: &str = "trellis.dev/cluster";
