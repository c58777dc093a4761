//! Forward walk: create and update a graph's resources in dependency order
//!
//! The walk stops at the first vertex that has not converged yet. A parent
//! therefore never gets ahead of its children: node pools are not created
//! until the control plane they join reports Success.

use tracing::{debug, info, instrument, warn};
use trellis_common::crd::{ComponentPhase, CompositeStatus, OverallStatus};
use trellis_common::Error;

use crate::graph::Graph;
use crate::outcome::Outcome;
use crate::status::ComponentConditions;
use crate::store::ResourceStore;
use crate::vertex::Parent;

/// Apply a loaded graph on behalf of `parent`, recording progress in `status`
///
/// Expects [`Graph::load`] to have run so each vertex knows whether it
/// exists and what its controller reported.
#[instrument(skip_all, fields(parent = %parent.name))]
pub async fn apply(
    graph: &mut Graph,
    store: &dyn ResourceStore,
    parent: &Parent,
    status: &mut CompositeStatus,
) -> Result<Outcome, Error> {
    for key in graph.walk() {
        let Some(vertex) = graph.vertex_mut(key) else {
            continue;
        };
        let name = vertex.display_name().to_string();
        let ar = vertex.resource().api_resource();
        status.ensure_condition(&name, vertex.resource_ref());

        if !vertex.exists() {
            vertex.resource_mut().stamp(parent.generation, parent.owner.as_ref());
            let obj = vertex.resource().to_object()?;
            store.create(&ar, &obj).await?;
            info!(component = %name, vertex = %vertex.id(), "created component");

            if let Some(cond) = status.condition_mut(&name) {
                cond.status = ComponentPhase::Pending;
                cond.message = "created".to_string();
                cond.detail.clear();
            }
            status.set_overall(OverallStatus::Pending, format!("creating {}", name));
            return Ok(Outcome::now());
        }

        if vertex.resource().parent_generation() != Some(parent.generation) {
            vertex.resource_mut().stamp(parent.generation, parent.owner.as_ref());
            let obj = vertex.resource().to_object()?;
            store.update(&ar, &obj).await?;
            info!(
                component = %name,
                generation = parent.generation,
                "updated component to new parent generation"
            );
        }

        let observed = vertex.resource().observed_status().cloned();
        let Some(cond) = status.condition_mut(&name) else {
            continue;
        };
        match observed {
            None => {
                debug!(component = %name, "component has not reported status yet");
                status.set_overall(OverallStatus::Pending, format!("waiting for {}", name));
                return Ok(Outcome::poll());
            }
            Some(observed) if observed.phase == ComponentPhase::Success => {
                cond.message.clear();
                cond.detail.clear();
                if cond.status != ComponentPhase::Success {
                    cond.status = ComponentPhase::Success;
                    info!(component = %name, "component ready");
                    return Ok(Outcome::now());
                }
            }
            Some(observed) if observed.phase == ComponentPhase::Failure => {
                warn!(component = %name, reason = %observed.message, "component failed");
                cond.status = ComponentPhase::Failure;
                cond.message = observed.message.clone();
                cond.detail = observed.detail;
                let message = if observed.message.is_empty() {
                    format!("component {} failed", name)
                } else {
                    format!("component {} failed: {}", name, observed.message)
                };
                status.set_overall(OverallStatus::Failure, message);
                return Ok(Outcome::Blocked);
            }
            Some(observed) => {
                debug!(component = %name, phase = %observed.phase, "component still settling");
                cond.status = observed.phase;
                cond.message = observed.message;
                cond.detail = observed.detail;
                status.set_overall(OverallStatus::Pending, format!("waiting for {}", name));
                return Ok(Outcome::poll());
            }
        }
    }

    status.set_overall(OverallStatus::Success, String::new());
    Ok(Outcome::Converged)
}
