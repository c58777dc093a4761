//! Orphan reaping: delete tracked components that left the desired graph
//!
//! A condition outlives its vertex. When the spec drops a component, the
//! freshly built graph no longer contains it but the parent's status still
//! does, together with the `resource_ref` needed to find the object. The
//! reaper deletes such orphans and drops their conditions once the store
//! confirms they are gone.

use tracing::{debug, info, instrument, warn};
use trellis_common::crd::{ChildStatus, ComponentPhase, ComponentStatus, CompositeStatus, OverallStatus};
use trellis_common::Error;

use crate::graph::Graph;
use crate::outcome::Outcome;
use crate::status::ComponentConditions;
use crate::store::ResourceStore;

/// Reap every condition whose component is not in `graph`
pub async fn cleanup(
    graph: &Graph,
    store: &dyn ResourceStore,
    status: &mut CompositeStatus,
) -> Result<Outcome, Error> {
    reap(store, status, |c| !graph.contains_name(&c.name)).await
}

/// Reap every condition selected by `is_orphan`
///
/// Orphans are handled independently of one another. Store errors do not
/// stop the sweep; they are returned together once every orphan has been
/// visited. Otherwise the most urgent requeue across orphans is returned,
/// or [`Outcome::Converged`] when no orphan remains.
#[instrument(skip_all)]
pub async fn reap<F>(
    store: &dyn ResourceStore,
    status: &mut CompositeStatus,
    is_orphan: F,
) -> Result<Outcome, Error>
where
    F: Fn(&ComponentStatus) -> bool,
{
    let orphans: Vec<ComponentStatus> = status
        .components
        .iter()
        .filter(|c| is_orphan(c))
        .cloned()
        .collect();

    let mut outcome = Outcome::Converged;
    let mut errors = Vec::new();

    for orphan in orphans {
        match reap_one(store, status, &orphan).await {
            Ok(o) => outcome = outcome.merge(o),
            Err(e) => {
                warn!(component = %orphan.name, error = %e, "failed to reap orphan");
                errors.push(e);
            }
        }
    }

    match Error::aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

async fn reap_one(
    store: &dyn ResourceStore,
    status: &mut CompositeStatus,
    orphan: &ComponentStatus,
) -> Result<Outcome, Error> {
    let name = orphan.name.as_str();

    if orphan.status != ComponentPhase::Deleting && orphan.status != ComponentPhase::DeleteFailed {
        info!(component = %name, "component left the spec, deleting");
        if let Some(cond) = status.condition_mut(name) {
            cond.status = ComponentPhase::Deleting;
            cond.message = "removed from spec".to_string();
        }
        return Ok(Outcome::now());
    }

    let r = &orphan.resource_ref;
    let ar = r.api_resource()?;
    let Some(obj) = store.get(&ar, &r.namespace, &r.name).await? else {
        info!(component = %name, "orphan gone");
        status.remove_condition(name);
        return Ok(Outcome::now());
    };

    let observed = ChildStatus::from_object(&obj.data);
    if let Some(observed) = observed.filter(|s| s.phase == ComponentPhase::DeleteFailed) {
        warn!(component = %name, reason = %observed.message, "orphan failed to delete");
        if let Some(cond) = status.condition_mut(name) {
            cond.status = ComponentPhase::DeleteFailed;
            cond.message = observed.message.clone();
            cond.detail = observed.detail;
        }
        status.set_overall(
            OverallStatus::Failure,
            format!("component {} failed to delete: {}", name, observed.message),
        );
        return Ok(Outcome::Blocked);
    }

    if obj.metadata.deletion_timestamp.is_none() {
        store.delete(&ar, &r.namespace, &r.name).await?;
        info!(component = %name, kind = %r.kind, object = %r.name, "deleted orphan");
    } else {
        debug!(component = %name, "orphan deletion in progress");
    }
    Ok(Outcome::poll())
}
