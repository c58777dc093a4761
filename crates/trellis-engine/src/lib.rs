//! Dependency-ordered orchestration of the components that make up a parent
//!
//! Two engines live here:
//!
//! - the **graph walkers** ([`apply()`], [`cleanup()`], [`delete()`]) drive
//!   declarative child resources held in a [`Graph`], one step per call
//! - the **[`Composite`] scheduler** drives arbitrary [`Component`]s with
//!   declared dependencies, one round per call
//!
//! Neither blocks waiting for a child to settle. Every call returns what the
//! caller should do next and the work queue brings it back.

#![deny(missing_docs)]

pub mod apply;
pub mod cleanup;
pub mod component;
pub mod composite;
pub mod delete;
pub mod graph;
pub mod outcome;
pub mod status;
pub mod store;
pub mod vertex;

pub use apply::apply;
pub use cleanup::{cleanup, reap};
pub use component::Component;
pub use composite::Composite;
pub use delete::{delete, PostDeleteHook};
pub use graph::{Graph, VertexKey};
pub use outcome::{Outcome, Requeue, STATUS_POLL_INTERVAL};
pub use status::ComponentConditions;
pub use store::{KubeStore, ResourceStore};
pub use vertex::{ManagedResource, Parent, Vertex};

#[cfg(any(test, feature = "test-util"))]
pub use store::{MemoryStore, StoreOp};
