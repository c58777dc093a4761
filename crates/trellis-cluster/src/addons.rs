//! Add-on bootstrap
//!
//! Add-ons are arbitrary manifests listed in `spec.addons` with their own
//! dependencies. They are applied once the infrastructure graph converged,
//! driven through a [`Composite`] so `dependsOn` is honoured, and tracked
//! on the parent status as `addon/<name>` conditions.
//!
//! A [`Composite`] runs a single round per call, so progress carried across
//! reconciles lives in the conditions: a `Success` add-on that is still in
//! sync with the live object counts as finished before the round starts.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use trellis_common::crd::{
    AddonSpec, ComponentPhase, CompositeStatus, ManagedCluster, OverallStatus, ResourceRef,
};
use trellis_common::{Error, PARENT_LABEL};
use trellis_engine::{reap, Component, ComponentConditions, Composite, Outcome, ResourceStore};

/// Prefix distinguishing add-on conditions from graph components
pub const ADDON_PREFIX: &str = "addon/";

/// Condition name of an add-on
pub fn condition_name(addon: &str) -> String {
    format!("{}{}", ADDON_PREFIX, addon)
}

/// True if a condition tracks an add-on
pub fn is_addon_condition(name: &str) -> bool {
    name.starts_with(ADDON_PREFIX)
}

/// True when every field set in `want` has the same value in `have`
///
/// Lets the API server default and extend objects without that being
/// mistaken for drift.
fn contains_json(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(k, w)| have.get(k).is_some_and(|h| contains_json(h, w))),
        _ => have == want,
    }
}

/// A single add-on manifest applied to the store
pub struct AddonComponent {
    name: String,
    dependencies: Vec<String>,
    object: DynamicObject,
    api: ApiResource,
    store: Arc<dyn ResourceStore>,
}

impl AddonComponent {
    /// Prepare an add-on of `cluster`
    ///
    /// The manifest is labelled with the owning cluster. A manifest without
    /// `metadata.namespace` addresses a cluster-scoped object.
    pub fn new(
        cluster: &ManagedCluster,
        spec: &AddonSpec,
        store: Arc<dyn ResourceStore>,
    ) -> Result<Self, Error> {
        let mut object: DynamicObject = serde_json::from_value(spec.manifest.clone())
            .map_err(|e| {
                Error::serialization_for_kind("addon", format!("add-on {}: {}", spec.name, e))
            })?;
        let types = object.types.clone().ok_or_else(|| {
            Error::validation_for_field(
                cluster.name_any(),
                "spec.addons",
                format!("add-on {} has no apiVersion/kind", spec.name),
            )
        })?;
        if object.metadata.name.is_none() {
            return Err(Error::validation_for_field(
                cluster.name_any(),
                "spec.addons",
                format!("add-on {} has no metadata.name", spec.name),
            ));
        }
        object
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(PARENT_LABEL.to_string(), cluster.name_any());

        let api = ResourceRef {
            api_version: types.api_version,
            kind: types.kind,
            ..Default::default()
        }
        .api_resource()?;

        Ok(Self {
            name: spec.name.clone(),
            dependencies: spec.depends_on.clone(),
            object,
            api,
            store,
        })
    }

    fn namespace(&self) -> &str {
        self.object.metadata.namespace.as_deref().unwrap_or_default()
    }

    fn object_name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    /// Pointer recorded on the add-on's condition
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            api_version: self.api.api_version.clone(),
            kind: self.api.kind.clone(),
            namespace: self.namespace().to_string(),
            name: self.object_name().to_string(),
        }
    }

    fn in_sync_with(&self, live: &DynamicObject) -> bool {
        let labels = live.labels();
        let labelled = self
            .object
            .labels()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));
        labelled && contains_json(&live.data, &self.object.data)
    }

    /// True when the live object exists and matches the manifest
    pub async fn in_sync(&self) -> Result<bool, Error> {
        let live = self
            .store
            .get(&self.api, self.namespace(), self.object_name())
            .await?;
        Ok(live.is_some_and(|l| l.metadata.deletion_timestamp.is_none() && self.in_sync_with(&l)))
    }

    /// Attribute a store failure to this add-on, keeping its class
    fn attribute(&self, e: Error) -> Error {
        if e.is_critical() {
            Error::critical(&self.name, e.to_string())
        } else {
            Error::recoverable(&self.name, e.to_string())
        }
    }

    async fn apply(&self) -> Result<bool, Error> {
        let (ns, name) = (self.namespace(), self.object_name());
        match self.store.get(&self.api, ns, name).await? {
            None => {
                self.store.create(&self.api, &self.object).await?;
                info!(addon = %self.name, kind = %self.api.kind, object = %name, "add-on created");
            }
            Some(live) if self.in_sync_with(&live) => {
                debug!(addon = %self.name, "add-on up to date");
            }
            Some(live) => {
                let mut desired = self.object.clone();
                desired.metadata.resource_version = live.metadata.resource_version.clone();
                desired.metadata.finalizers = live.metadata.finalizers.clone();
                self.store.update(&self.api, &desired).await?;
                info!(addon = %self.name, kind = %self.api.kind, object = %name, "add-on updated");
            }
        }
        Ok(false)
    }

    async fn remove(&self) -> Result<bool, Error> {
        let (ns, name) = (self.namespace(), self.object_name());
        let Some(live) = self.store.get(&self.api, ns, name).await? else {
            return Ok(false);
        };
        if live.metadata.deletion_timestamp.is_none() {
            self.store.delete(&self.api, ns, name).await?;
            info!(addon = %self.name, object = %name, "add-on deletion requested");
        }
        Ok(true)
    }
}

#[async_trait]
impl Component for AddonComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn reconcile(&self) -> Result<bool, Error> {
        self.apply().await.map_err(|e| self.attribute(e))
    }

    async fn delete(&self) -> Result<bool, Error> {
        self.remove().await.map_err(|e| self.attribute(e))
    }
}

fn components(
    cluster: &ManagedCluster,
    store: &Arc<dyn ResourceStore>,
) -> Result<Vec<AddonComponent>, Error> {
    cluster
        .spec
        .addons
        .iter()
        .map(|spec| AddonComponent::new(cluster, spec, store.clone()))
        .collect()
}

fn failed_components(e: &Error) -> Vec<(String, String)> {
    match e {
        Error::Component {
            component,
            message,
            critical: true,
        } => vec![(component.clone(), message.clone())],
        Error::Deadlock { components } => components
            .iter()
            .map(|c| (c.clone(), "dependencies can never be satisfied".to_string()))
            .collect(),
        Error::Aggregate { errors } => errors.iter().flat_map(failed_components).collect(),
        _ => Vec::new(),
    }
}

/// Drive the add-ons of `cluster` one round toward their manifests
///
/// Add-ons removed from the spec are deleted through their conditions.
/// Critical failures and deadlocks mark the affected conditions `Failure`
/// and are returned; the caller decides how the parent reflects them.
#[instrument(skip_all, fields(cluster = %cluster.name_any()))]
pub async fn reconcile_addons(
    cluster: &ManagedCluster,
    store: &Arc<dyn ResourceStore>,
    status: &mut CompositeStatus,
) -> Result<Outcome, Error> {
    let addons = components(cluster, store)?;
    let wanted: BTreeSet<String> = addons.iter().map(|a| condition_name(a.name())).collect();

    let reaped = reap(store.as_ref(), status, |c| {
        is_addon_condition(&c.name) && !wanted.contains(&c.name)
    })
    .await?;

    let mut composite = Composite::new(format!("{}/addons", cluster.name_any()));
    for addon in addons {
        let cond_name = condition_name(addon.name());
        let cond = status.ensure_condition(&cond_name, addon.resource_ref());
        if cond.status == ComponentPhase::Success {
            if addon.in_sync().await? {
                composite.mark_finished(addon.name());
            } else {
                info!(addon = %addon.name(), "add-on drifted, reapplying");
                if let Some(cond) = status.condition_mut(&cond_name) {
                    cond.status = ComponentPhase::Pending;
                    cond.message = "drifted from manifest".to_string();
                }
            }
        }
        composite.register(Box::new(addon))?;
    }

    let result = composite.reconcile().await;

    for name in composite.finished() {
        if let Some(cond) = status.condition_mut(&condition_name(name)) {
            cond.status = ComponentPhase::Success;
            cond.message.clear();
        }
    }

    match result {
        Ok(false) => Ok(reaped),
        Ok(true) => {
            status.set_overall(OverallStatus::Pending, "applying add-ons");
            Ok(reaped.merge(Outcome::now()))
        }
        Err(e) => {
            for (name, message) in failed_components(&e) {
                if let Some(cond) = status.condition_mut(&condition_name(&name)) {
                    cond.status = ComponentPhase::Failure;
                    cond.message = message;
                }
            }
            Err(e)
        }
    }
}

/// Run one round of add-on removal, dependents first
///
/// Add-ons whose condition is already gone count as removed.
#[instrument(skip_all, fields(cluster = %cluster.name_any()))]
pub async fn delete_addons(
    cluster: &ManagedCluster,
    store: &Arc<dyn ResourceStore>,
    status: &mut CompositeStatus,
) -> Result<Outcome, Error> {
    let mut composite = Composite::new(format!("{}/addons", cluster.name_any()));
    for addon in components(cluster, store)? {
        if status.condition(&condition_name(addon.name())).is_none() {
            composite.mark_finished(addon.name());
        }
        composite.register(Box::new(addon))?;
    }
    let before = composite.finished().len();

    let result = composite.delete().await;

    for name in composite.finished() {
        if status.remove_condition(&condition_name(name)) {
            debug!(addon = %name, "add-on removed");
        }
    }

    match result {
        Ok(false) => Ok(Outcome::Converged),
        Ok(true) => {
            for addon in &cluster.spec.addons {
                if let Some(cond) = status.condition_mut(&condition_name(&addon.name)) {
                    if !composite.is_finished(&addon.name) {
                        cond.status = ComponentPhase::Deleting;
                    }
                }
            }
            status.set_overall(OverallStatus::Deleting, "removing add-ons");
            if composite.finished().len() > before {
                Ok(Outcome::now())
            } else {
                Ok(Outcome::poll())
            }
        }
        Err(e) => {
            warn!(error = %e, "add-on removal failed");
            for (name, message) in failed_components(&e) {
                if let Some(cond) = status.condition_mut(&condition_name(&name)) {
                    cond.status = ComponentPhase::DeleteFailed;
                    cond.message = message;
                }
            }
            Err(e)
        }
    }
}
