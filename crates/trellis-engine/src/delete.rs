//! Reverse walk: tear a graph down, dependents first

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use trellis_common::crd::{ComponentPhase, CompositeStatus, OverallStatus};
use trellis_common::Error;

use crate::graph::Graph;
use crate::outcome::Outcome;
use crate::status::ComponentConditions;
use crate::store::ResourceStore;
use crate::vertex::Vertex;

/// Work to run once a vertex is confirmed gone from the store
///
/// Runs every time the walker finds the vertex missing and its condition
/// not yet Deleted, so it must be idempotent.
#[async_trait]
pub trait PostDeleteHook: Send + Sync {
    /// Called after `vertex` disappeared
    async fn after_delete(&self, vertex: &Vertex) -> Result<(), Error>;
}

/// Delete a loaded graph in reverse dependency order
///
/// Only one vertex is in flight at a time: the walk stops at the first
/// vertex that still exists. [`Outcome::Converged`] means every vertex is
/// gone and the parent may release its finalizer.
#[instrument(skip_all)]
pub async fn delete(
    graph: &Graph,
    store: &dyn ResourceStore,
    status: &mut CompositeStatus,
    hook: Option<&dyn PostDeleteHook>,
) -> Result<Outcome, Error> {
    for key in graph.reverse_walk() {
        let Some(vertex) = graph.vertex(key) else {
            continue;
        };
        let name = vertex.display_name();
        let cond = status.ensure_condition(name, vertex.resource_ref());
        if cond.status == ComponentPhase::Deleted {
            continue;
        }

        if !vertex.exists() {
            if let Some(hook) = hook {
                hook.after_delete(vertex).await?;
            }
            if let Some(cond) = status.condition_mut(name) {
                cond.status = ComponentPhase::Deleted;
                cond.message.clear();
                cond.detail.clear();
            }
            info!(component = %name, "component deleted");
            continue;
        }

        let resource = vertex.resource();
        if !resource.is_deleting() {
            let ar = resource.api_resource();
            let ns = resource.object_namespace();
            let obj_name = resource.object_name().unwrap_or_default();
            store.delete(&ar, &ns, &obj_name).await?;
            info!(component = %name, vertex = %vertex.id(), "deleting component");

            if let Some(cond) = status.condition_mut(name) {
                cond.status = ComponentPhase::Deleting;
                cond.message.clear();
            }
            status.set_overall(OverallStatus::Deleting, format!("deleting {}", name));
            return Ok(Outcome::now());
        }

        match resource.observed_status() {
            Some(observed) if observed.phase == ComponentPhase::DeleteFailed => {
                warn!(component = %name, reason = %observed.message, "component failed to delete");
                if let Some(cond) = status.condition_mut(name) {
                    cond.status = ComponentPhase::DeleteFailed;
                    cond.message = observed.message.clone();
                    cond.detail = observed.detail.clone();
                }
                status.set_overall(
                    OverallStatus::DeleteFailed,
                    format!("component {} failed to delete: {}", name, observed.message),
                );
                return Ok(Outcome::Blocked);
            }
            _ => {
                debug!(component = %name, "waiting for component to go away");
                if let Some(cond) = status.condition_mut(name) {
                    cond.status = ComponentPhase::Deleting;
                }
                status.set_overall(OverallStatus::Deleting, format!("waiting for {} to be deleted", name));
                return Ok(Outcome::poll());
            }
        }
    }

    status.set_overall(OverallStatus::Deleted, String::new());
    Ok(Outcome::Converged)
}
