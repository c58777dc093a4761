//! Cluster lifecycle management for Trellis
//!
//! This crate provides the Kubernetes controller for ManagedCluster CRDs,
//! the cloud providers that turn a cluster spec into a component graph, and
//! the add-on bootstrap that runs once the infrastructure is up.
//!
//! Related crates:
//! - `trellis-engine`: graph walkers and the composite scheduler
//! - `trellis-common`: CRDs, errors and shared utilities

pub mod addons;
pub mod controller;
pub mod provider;

// Re-export controller types
pub use controller::{
    error_policy, reconcile, ClusterClient, ClusterClientImpl, Context, ContextBuilder,
};

pub use provider::{EksProvider, GkeProvider, Provider, ProviderRegistry};

// Re-export common error types
pub use trellis_common::{Error, Result};
