//! ManagedCluster controller implementation
//!
//! Each reconcile builds the cluster's component graph from its spec, loads
//! what exists, and takes one step: create or update the next component,
//! reap components that left the spec, then bootstrap add-ons once the
//! infrastructure converged. Deletion walks the same graph in reverse.
//! Nothing here waits on a child; the returned [`Action`] brings the
//! cluster back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use trellis_common::crd::{CompositeStatus, ManagedCluster, ManagedClusterStatus, OverallStatus};
use trellis_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use trellis_common::{Error, CLUSTER_FINALIZER, FIELD_MANAGER};
use trellis_engine::{
    apply, delete, reap, ComponentConditions, Graph, KubeStore, Outcome, Parent, Requeue,
    ResourceStore,
};

use crate::addons::{delete_addons, is_addon_condition, reconcile_addons};
use crate::provider::{Provider, ProviderDeleteHook, ProviderRegistry};

/// Trait abstracting the writes the controller makes to ManagedCluster itself
///
/// Child resources go through [`ResourceStore`]; this covers the parent's
/// status and finalizer so tests can capture them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Merge-patch the status of a ManagedCluster
    ///
    /// When `resource_version` is set the patch is rejected with a 409 if
    /// the cluster changed since it was read.
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ManagedClusterStatus,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Add a finalizer to a ManagedCluster
    async fn add_finalizer(&self, cluster: &ManagedCluster, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a ManagedCluster
    async fn remove_finalizer(&self, cluster: &ManagedCluster, finalizer: &str)
        -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ClusterClientImpl {
    client: Client,
}

impl ClusterClientImpl {
    /// Create a new ClusterClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ManagedCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        cluster: &ManagedCluster,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let mut patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        if let Some(rv) = cluster.resource_version() {
            patch["metadata"]["resourceVersion"] = serde_json::Value::String(rv);
        }

        self.api(&cluster.namespace().unwrap_or_default())
            .patch(
                &cluster.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for ClusterClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &ManagedClusterStatus,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let mut patch = serde_json::json!({
            "status": status
        });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &ManagedCluster, finalizer: &str) -> Result<(), Error> {
        let mut finalizers = cluster.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(cluster, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        cluster: &ManagedCluster,
        finalizer: &str,
    ) -> Result<(), Error> {
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(cluster, finalizers).await
    }
}

/// Controller context shared by every reconcile
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .providers(Arc::new(ProviderRegistry::with_defaults()))
///     .build();
/// ```
pub struct Context {
    /// Writes to the ManagedCluster itself (trait object for testability)
    pub kube: Arc<dyn ClusterClient>,
    /// Store holding child resources and add-on objects
    pub store: Arc<dyn ResourceStore>,
    /// Providers by kind
    pub providers: Arc<ProviderRegistry>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context with the built-in providers
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context for testing without a Kubernetes client
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ClusterClient>,
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            store,
            providers: Arc::new(ProviderRegistry::with_defaults()),
            events,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn ClusterClient>>,
    store: Option<Arc<dyn ResourceStore>>,
    providers: Option<Arc<ProviderRegistry>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            store: None,
            providers: None,
            events: None,
        }
    }

    /// Override the cluster client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn ClusterClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the resource store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom provider registry
    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(ClusterClientImpl::new(self.client.clone()))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeStore::new(self.client.clone()))),
            providers: self
                .providers
                .unwrap_or_else(|| Arc::new(ProviderRegistry::with_defaults())),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), FIELD_MANAGER))
            }),
        }
    }
}

/// Reconcile a ManagedCluster
///
/// Critical failures are recorded on the status and answered with
/// `await_change`; recoverable ones are returned so [`error_policy`]
/// requeues. Status is persisted before either happens.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx).await;
    }

    if !has_finalizer(&cluster) {
        info!("adding cleanup finalizer");
        ctx.kube.add_finalizer(&cluster, CLUSTER_FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    debug!("reconciling cluster");
    let previous = cluster.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    status.observed_generation = cluster.metadata.generation;

    let result = match provision(&cluster, &ctx, &mut status.composite).await {
        Err(e) if e.is_critical() => {
            warn!(error = %e, "cluster reconcile failed permanently");
            status.composite.set_overall(OverallStatus::Failure, e.to_string());
            if status.composite.message != previous.composite.message {
                let reason = failure_reason(&e);
                publish(
                    &ctx,
                    &cluster,
                    EventType::Warning,
                    reason,
                    actions::RECONCILE,
                    e.to_string(),
                )
                .await;
            }
            Ok(Outcome::Blocked)
        }
        Ok(Outcome::Blocked) => {
            if status.composite.message != previous.composite.message {
                let note = status.composite.message.clone();
                publish(
                    &ctx,
                    &cluster,
                    EventType::Warning,
                    reasons::COMPONENT_FAILED,
                    actions::RECONCILE,
                    note,
                )
                .await;
            }
            Ok(Outcome::Blocked)
        }
        other => other,
    };

    persist_status(&cluster, &ctx, &status).await?;
    let outcome = result?;

    if outcome.is_converged() && previous.composite.overall_status != OverallStatus::Success {
        info!("cluster ready");
        let note = "all components converged".to_string();
        publish(
            &ctx,
            &cluster,
            EventType::Normal,
            reasons::CLUSTER_READY,
            actions::RECONCILE,
            note,
        )
        .await;
    }

    Ok(action_for(outcome))
}

/// Error policy for the controller
///
/// Retryable errors requeue after 5 seconds; anything else waits for the
/// cluster to change.
pub fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::await_change()
    }
}

fn action_for(outcome: Outcome) -> Action {
    match outcome {
        Outcome::Converged | Outcome::Blocked => Action::await_change(),
        Outcome::Requeue(Requeue::Now) => Action::requeue(Duration::from_secs(1)),
        Outcome::Requeue(Requeue::After(delay)) => Action::requeue(delay),
    }
}

fn failure_reason(e: &Error) -> &'static str {
    match e {
        Error::Validation { .. } | Error::Provider { .. } => reasons::INVALID_SPEC,
        Error::Deadlock { .. } => reasons::DEPENDENCY_DEADLOCK,
        _ => reasons::COMPONENT_FAILED,
    }
}

fn has_finalizer(cluster: &ManagedCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
}

fn provider_for(cluster: &ManagedCluster, ctx: &Context) -> Result<Arc<dyn Provider>, Error> {
    let kind = cluster.spec.provider.as_str();
    ctx.providers.get(kind).ok_or_else(|| {
        Error::provider_permanent(
            cluster.name_any(),
            kind,
            format!(
                "unknown provider, expected one of: {}",
                ctx.providers.kinds().join(", ")
            ),
        )
    })
}

async fn build_and_load(
    cluster: &ManagedCluster,
    provider: &dyn Provider,
    store: &dyn ResourceStore,
) -> Result<Graph, Error> {
    let mut graph = provider.build(cluster)?;
    graph.load(store).await?;
    provider.patch(cluster, &mut graph)?;
    Ok(graph)
}

/// One forward step: infrastructure graph, orphans, then add-ons
async fn provision(
    cluster: &ManagedCluster,
    ctx: &Context,
    status: &mut CompositeStatus,
) -> Result<Outcome, Error> {
    let name = cluster.name_any();
    cluster.spec.validate(&name)?;
    let provider = provider_for(cluster, ctx)?;
    let store = ctx.store.as_ref();

    let mut graph = build_and_load(cluster, provider.as_ref(), store).await?;
    let parent = Parent::of(cluster);
    let applied = apply(&mut graph, store, &parent, status).await?;
    let reaped = reap(store, status, |c| {
        !is_addon_condition(&c.name) && !graph.contains_name(&c.name)
    })
    .await?;

    let outcome = applied.merge(reaped);
    if !outcome.is_converged() {
        return Ok(outcome);
    }

    let addons = reconcile_addons(cluster, &ctx.store, status).await?;
    if addons.is_converged() {
        status.set_overall(OverallStatus::Success, String::new());
    }
    Ok(addons)
}

#[instrument(skip_all)]
async fn handle_deletion(cluster: &ManagedCluster, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(cluster) {
        return Ok(Action::await_change());
    }

    let previous = cluster.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    let result = match teardown(cluster, ctx, &mut status.composite).await {
        Err(e) if e.is_critical() => {
            warn!(error = %e, "cluster teardown failed permanently");
            status
                .composite
                .set_overall(OverallStatus::DeleteFailed, e.to_string());
            if status.composite.message != previous.composite.message {
                publish(
                    ctx,
                    cluster,
                    EventType::Warning,
                    reasons::DELETE_FAILED,
                    actions::DELETE,
                    e.to_string(),
                )
                .await;
            }
            persist_status(cluster, ctx, &status).await?;
            return Ok(Action::await_change());
        }
        other => other,
    };
    persist_status(cluster, ctx, &status).await?;
    let outcome = result?;

    if outcome.is_converged() {
        ctx.kube.remove_finalizer(cluster, CLUSTER_FINALIZER).await?;
        info!("cluster deleted, finalizer released");
        publish(
            ctx,
            cluster,
            EventType::Normal,
            reasons::CLUSTER_DELETED,
            actions::DELETE,
            "all components removed".to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    if outcome == Outcome::Blocked && previous.composite.message != status.composite.message {
        publish(
            ctx,
            cluster,
            EventType::Warning,
            reasons::DELETE_FAILED,
            actions::DELETE,
            status.composite.message.clone(),
        )
        .await;
    }
    Ok(action_for(outcome))
}

/// One teardown step: add-ons first, then the graph in reverse
///
/// When the graph cannot be rebuilt (invalid spec, unknown provider) every
/// tracked condition is reaped instead, so a broken spec never strands its
/// finalizer.
async fn teardown(
    cluster: &ManagedCluster,
    ctx: &Context,
    status: &mut CompositeStatus,
) -> Result<Outcome, Error> {
    let name = cluster.name_any();
    let store = ctx.store.as_ref();
    let buildable = cluster.spec.validate(&name).and_then(|_| provider_for(cluster, ctx));

    let provider = match buildable {
        Ok(provider) => provider,
        Err(e) => {
            warn!(error = %e, "spec unusable, reaping tracked components");
            let reaped = reap(store, status, |_| true).await?;
            if reaped.is_converged() {
                status.set_overall(OverallStatus::Deleted, String::new());
            } else if reaped != Outcome::Blocked {
                status.set_overall(OverallStatus::Deleting, "removing tracked components");
            }
            return Ok(reaped);
        }
    };

    let addons = delete_addons(cluster, &ctx.store, status).await?;
    if !addons.is_converged() {
        return Ok(addons);
    }

    let graph = build_and_load(cluster, provider.as_ref(), store).await?;
    let reaped = reap(store, status, |c| !graph.contains_name(&c.name)).await?;
    let hook = ProviderDeleteHook {
        provider: provider.as_ref(),
        store,
        cluster,
    };
    let deleted = delete(&graph, store, status, Some(&hook)).await?;

    if deleted.is_converged() && !reaped.is_converged() && reaped != Outcome::Blocked {
        status.set_overall(OverallStatus::Deleting, "removing orphaned components");
    }
    Ok(deleted.merge(reaped))
}

async fn persist_status(
    cluster: &ManagedCluster,
    ctx: &Context,
    status: &ManagedClusterStatus,
) -> Result<(), Error> {
    if cluster.status.as_ref() == Some(status) {
        return Ok(());
    }
    ctx.kube
        .patch_status(
            &cluster.name_any(),
            &cluster.namespace().unwrap_or_default(),
            status,
            cluster.resource_version(),
        )
        .await
}

async fn publish(
    ctx: &Context,
    cluster: &ManagedCluster,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&cluster.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::sample_cluster;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ApiResource;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use trellis_common::crd::{
        AddonSpec, ChildStatus, ClusterNetwork, ComponentPhase, ControlPlane, NodePool,
        SUBNET_IDS_OUTPUT,
    };
    use trellis_engine::{MemoryStore, StoreOp};

    const HOLD: &str = "infra.example.com/teardown";

    /// Captured status updates, so tests assert on what was written rather
    /// than on how the mock was called
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<ManagedClusterStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: ManagedClusterStatus) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(status);
        }

        fn last(&self) -> Option<ManagedClusterStatus> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }

        fn count(&self) -> usize {
            self.updates.lock().expect("mutex should not be poisoned").len()
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        reasons: Mutex<Vec<String>>,
    }

    impl RecordingEvents {
        fn reasons(&self) -> Vec<String> {
            self.reasons.lock().expect("mutex should not be poisoned").clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons
                .lock()
                .expect("mutex should not be poisoned")
                .push(reason.to_string());
        }
    }

    struct Harness {
        ctx: Arc<Context>,
        store: Arc<MemoryStore>,
        capture: StatusCapture,
        events: Arc<RecordingEvents>,
        released: Arc<AtomicBool>,
    }

    fn harness() -> Harness {
        let capture = StatusCapture::default();
        let capture_clone = capture.clone();
        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let mut mock = MockClusterClient::new();
        mock.expect_patch_status()
            .returning(move |_, _, status, _| {
                capture_clone.record(status.clone());
                Ok(())
            });
        mock.expect_remove_finalizer().returning(move |_, _| {
            released_clone.store(true, Ordering::SeqCst);
            Ok(())
        });

        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingEvents::default());
        let ctx = Arc::new(Context::for_testing(
            Arc::new(mock),
            store.clone(),
            events.clone(),
        ));
        Harness {
            ctx,
            store,
            capture,
            events,
            released,
        }
    }

    /// A cluster that already carries the cleanup finalizer
    fn cluster(provider: &str) -> ManagedCluster {
        let mut cluster = sample_cluster(provider);
        cluster.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
        cluster
    }

    /// Stand-in for the infrastructure controllers
    fn settle(store: &MemoryStore) {
        for ar in [
            ApiResource::erase::<ClusterNetwork>(&()),
            ApiResource::erase::<ControlPlane>(&()),
            ApiResource::erase::<NodePool>(&()),
        ] {
            let names: Vec<(String, bool, bool)> = store_objects(store, &ar);
            for (name, deleting, reported) in names {
                if deleting {
                    store.release_finalizers(&ar, "fleet", &name);
                } else if !reported {
                    let mut status = ChildStatus::with_phase(ComponentPhase::Success);
                    if ar.kind == "ClusterNetwork" {
                        status
                            .outputs
                            .insert(SUBNET_IDS_OUTPUT.to_string(), "subnet-1,subnet-2".to_string());
                    }
                    store.add_finalizer(&ar, "fleet", &name, HOLD);
                    store.set_child_status(&ar, "fleet", &name, status);
                }
            }
        }
    }

    fn store_objects(store: &MemoryStore, ar: &ApiResource) -> Vec<(String, bool, bool)> {
        ["prod-network", "prod-control-plane", "prod-general", "prod-gpu"]
            .iter()
            .filter_map(|n| store.object(ar, "fleet", n))
            .map(|obj| {
                (
                    obj.metadata.name.clone().unwrap_or_default(),
                    obj.metadata.deletion_timestamp.is_some(),
                    ChildStatus::from_object(&obj.data).is_some(),
                )
            })
            .collect()
    }

    fn created(store: &MemoryStore) -> Vec<String> {
        store
            .journal()
            .into_iter()
            .filter_map(|op| match op {
                StoreOp::Create(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn deleted(store: &MemoryStore) -> Vec<String> {
        store
            .journal()
            .into_iter()
            .filter_map(|op| match op {
                StoreOp::Delete(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    /// Reconcile until the controller stops asking to be requeued, feeding
    /// each persisted status back like the watcher would
    async fn drive(h: &Harness, cluster: &mut ManagedCluster) -> Action {
        for _ in 0..40 {
            let action = reconcile(Arc::new(cluster.clone()), h.ctx.clone())
                .await
                .expect("reconcile should succeed");
            if let Some(status) = h.capture.last() {
                cluster.status = Some(status);
            }
            if action == Action::await_change() || h.released.load(Ordering::SeqCst) {
                return action;
            }
            settle(&h.store);
        }
        panic!("cluster did not settle");
    }

    fn overall(cluster: &ManagedCluster) -> OverallStatus {
        cluster
            .status
            .as_ref()
            .map(|s| s.composite.overall_status)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn missing_finalizer_is_added_first() {
        let mut mock = MockClusterClient::new();
        mock.expect_add_finalizer()
            .withf(|_, f| f == CLUSTER_FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_patch_status().never();
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(Context::for_testing(
            Arc::new(mock),
            store.clone(),
            Arc::new(trellis_common::events::NoopEventPublisher),
        ));

        let action = reconcile(Arc::new(sample_cluster("gke")), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalid_spec_fails_without_touching_the_store() {
        let h = harness();
        let mut bad = cluster("gke");
        bad.spec.node_pools.clear();

        let action = reconcile(Arc::new(bad), h.ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = h.capture.last().expect("status should be persisted");
        assert_eq!(status.composite.overall_status, OverallStatus::Failure);
        assert!(status.composite.message.contains("at least one node pool"));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(h.events.reasons(), [reasons::INVALID_SPEC]);
        assert!(h.store.journal().is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_is_permanent() {
        let h = harness();

        let action = reconcile(Arc::new(cluster("azure")), h.ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        let status = h.capture.last().unwrap();
        assert_eq!(status.composite.overall_status, OverallStatus::Failure);
        assert!(status.composite.message.contains("eks, gke"));
        assert_eq!(h.events.reasons(), [reasons::INVALID_SPEC]);
    }

    /// Story: A GKE cluster comes up network first, then the control plane
    /// with the network's subnets, then its pools
    #[tokio::test]
    async fn story_cluster_provisions_in_order() {
        let h = harness();
        let mut cluster = cluster("gke");

        let action = drive(&h, &mut cluster).await;

        assert_eq!(action, Action::await_change());
        assert_eq!(overall(&cluster), OverallStatus::Success);
        assert_eq!(
            created(&h.store),
            ["prod-network", "prod-control-plane", "prod-general", "prod-gpu"]
        );
        let cp = h
            .store
            .object(&ApiResource::erase::<ControlPlane>(&()), "fleet", "prod-control-plane")
            .unwrap();
        assert_eq!(cp.data["spec"]["subnetIds"], json!(["subnet-1", "subnet-2"]));
        assert_eq!(h.events.reasons(), [reasons::CLUSTER_READY]);

        // converged: another pass writes nothing
        h.store.clear_journal();
        let writes = h.capture.count();
        let action = reconcile(Arc::new(cluster.clone()), h.ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(h.store.journal().is_empty());
        assert_eq!(h.capture.count(), writes);
    }

    /// Story: Removing a pool from the spec deletes only that pool
    #[tokio::test]
    async fn story_removed_pool_is_deleted() {
        let h = harness();
        let mut cluster = cluster("eks");
        drive(&h, &mut cluster).await;
        h.store.clear_journal();

        cluster.spec.node_pools.retain(|p| p.name != "gpu");
        cluster.metadata.generation = Some(2);
        drive(&h, &mut cluster).await;

        assert_eq!(deleted(&h.store), ["prod-gpu"]);
        let status = cluster.status.clone().unwrap();
        assert!(status.composite.condition("nodepool/gpu").is_none());
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(overall(&cluster), OverallStatus::Success);
    }

    fn manifest(name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "fleet" }
        })
    }

    fn addon(name: &str, deps: &[&str]) -> AddonSpec {
        AddonSpec {
            name: name.to_string(),
            manifest: manifest(name),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    /// A converged GKE cluster running cni and mesh (mesh after cni)
    async fn cluster_with_addons(h: &Harness) -> ManagedCluster {
        let mut cluster = cluster("gke");
        cluster.spec.addons = vec![addon("cni", &[]), addon("mesh", &["cni"])];
        drive(h, &mut cluster).await;
        cluster
    }

    /// Story: Add-ons go on only after the infrastructure is up, and a
    /// dependency cycle introduced later fails the cluster instead of
    /// being reported as converged
    #[tokio::test]
    async fn story_addons_after_infrastructure() {
        let h = harness();
        let mut cluster = cluster_with_addons(&h).await;

        assert_eq!(
            created(&h.store),
            ["prod-network", "prod-control-plane", "prod-general", "prod-gpu", "cni", "mesh"]
        );
        assert_eq!(overall(&cluster), OverallStatus::Success);

        cluster.spec.addons[0].depends_on = vec!["mesh".to_string()];
        cluster.metadata.generation = Some(2);
        h.store.clear_journal();
        let action = reconcile(Arc::new(cluster.clone()), h.ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        let status = h.capture.last().unwrap();
        assert_eq!(status.composite.overall_status, OverallStatus::Failure);
        assert!(status.composite.message.contains("cycle: cni, mesh"));
        assert_eq!(
            h.events.reasons(),
            [reasons::CLUSTER_READY, reasons::INVALID_SPEC]
        );
        assert!(h.store.journal().is_empty());
    }

    #[tokio::test]
    async fn unknown_addon_dependency_fails_the_cluster() {
        let h = harness();
        let mut cluster = cluster_with_addons(&h).await;

        cluster.spec.addons.push(addon("gateway", &["ghost"]));
        cluster.metadata.generation = Some(2);
        let action = reconcile(Arc::new(cluster.clone()), h.ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        let status = h.capture.last().unwrap();
        assert_eq!(status.composite.overall_status, OverallStatus::Failure);
        assert!(status.composite.message.contains("unknown add-on"));
        assert!(h.events.reasons().contains(&reasons::INVALID_SPEC.to_string()));
    }

    /// Story: A cluster whose add-ons were edited into a cycle can still be
    /// deleted; everything it tracked is removed and the finalizer released
    #[tokio::test]
    async fn story_cyclic_addons_still_tear_down() {
        let h = harness();
        let mut cluster = cluster_with_addons(&h).await;
        cluster.spec.addons[0].depends_on = vec!["mesh".to_string()];
        cluster.metadata.generation = Some(2);
        drive(&h, &mut cluster).await;
        assert_eq!(overall(&cluster), OverallStatus::Failure);
        h.store.clear_journal();

        cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        drive(&h, &mut cluster).await;

        assert!(h.released.load(Ordering::SeqCst));
        let mut removed = deleted(&h.store);
        removed.sort();
        assert_eq!(
            removed,
            ["cni", "mesh", "prod-control-plane", "prod-general", "prod-gpu", "prod-network"]
        );
        assert!(h.store.is_empty());
    }

    /// Story: An add-on the operator may not delete surfaces as
    /// DeleteFailed on the cluster and holds the finalizer until fixed
    #[tokio::test]
    async fn story_critical_teardown_error_is_reported() {
        let h = harness();
        let mut cluster = cluster_with_addons(&h).await;
        h.store.forbid_for("cni");

        cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        let action = drive(&h, &mut cluster).await;

        assert_eq!(action, Action::await_change());
        assert!(!h.released.load(Ordering::SeqCst));
        let status = cluster.status.clone().unwrap();
        assert_eq!(status.composite.overall_status, OverallStatus::DeleteFailed);
        assert!(status.composite.message.contains("cni"));
        let cni = status.composite.condition("addon/cni").unwrap();
        assert_eq!(cni.status, ComponentPhase::DeleteFailed);
        assert!(h.events.reasons().contains(&reasons::DELETE_FAILED.to_string()));

        // same failure again: no duplicate event
        let events = h.events.reasons().len();
        reconcile(Arc::new(cluster.clone()), h.ctx.clone())
            .await
            .unwrap();
        assert_eq!(h.events.reasons().len(), events);

        h.store.heal("cni");
        drive(&h, &mut cluster).await;
        assert!(h.released.load(Ordering::SeqCst));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried() {
        let h = harness();
        h.store.fail_for("prod-network");

        let err = reconcile(Arc::new(cluster("gke")), h.ctx.clone())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(
            error_policy(Arc::new(cluster("gke")), &err, h.ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert!(h.events.reasons().is_empty());
    }

    #[test]
    fn critical_errors_wait_for_a_change() {
        let h = harness();
        let err = Error::validation_for("prod", "bad");
        assert_eq!(
            error_policy(Arc::new(cluster("gke")), &err, h.ctx.clone()),
            Action::await_change()
        );
    }

    /// Story: Deleting an EKS cluster removes pools, control plane and
    /// network in that order, then releases the finalizer
    #[tokio::test]
    async fn story_cluster_teardown() {
        let h = harness();
        let mut cluster = cluster("eks");
        drive(&h, &mut cluster).await;
        h.store.clear_journal();

        cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        drive(&h, &mut cluster).await;

        assert!(h.released.load(Ordering::SeqCst));
        assert_eq!(
            deleted(&h.store),
            ["prod-gpu", "prod-general", "prod-control-plane", "prod-network"]
        );
        assert_eq!(overall(&cluster), OverallStatus::Deleted);
        assert!(h.store.is_empty());
        assert!(h.events.reasons().contains(&reasons::CLUSTER_DELETED.to_string()));
    }

    #[tokio::test]
    async fn broken_spec_still_tears_down() {
        let h = harness();
        let mut cluster = cluster("gke");
        drive(&h, &mut cluster).await;
        h.store.clear_journal();

        cluster.spec.provider = "unknown".to_string();
        cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        drive(&h, &mut cluster).await;

        assert!(h.released.load(Ordering::SeqCst));
        assert_eq!(deleted(&h.store).len(), 4);
        assert!(h.store.is_empty());
    }
}
