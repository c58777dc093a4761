//! Boundary to the declarative resource store
//!
//! The engine never talks to the API server directly: every read and write
//! goes through [`ResourceStore`]. [`KubeStore`] is the production
//! implementation; `MemoryStore` (feature `test-util`) keeps objects in a
//! map and mimics the API server's optimistic concurrency and finalizer
//! semantics closely enough for the walkers to be exercised end to end.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use serde_json::json;
use tracing::debug;
use trellis_common::{Error, FIELD_MANAGER};

/// Storage operations the walkers depend on
///
/// An empty namespace addresses cluster-scoped objects (or all namespaces
/// for `list`).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List objects, optionally filtered by an equality label selector
    async fn list(
        &self,
        api: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Create a new object
    async fn create(&self, api: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject, Error>;

    /// Replace an existing object
    ///
    /// Rejected with a 409 conflict when `metadata.resourceVersion` is set
    /// and no longer matches the stored object.
    async fn update(&self, api: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject, Error>;

    /// Request deletion; deleting a missing object succeeds
    async fn delete(&self, api: &ApiResource, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge-patch the status subresource, guarded by `resource_version`
    async fn patch_status(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
        resource_version: Option<&str>,
    ) -> Result<DynamicObject, Error>;
}

fn name_of(obj: &DynamicObject) -> Result<&str, Error> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("store", "object has no metadata.name"))
}

fn namespace_of(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or_default()
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.api(api, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        api: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        Ok(self.api(api, namespace).list(&lp).await?.items)
    }

    async fn create(
        &self,
        api: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let created = self
            .api(api, namespace_of(obj))
            .create(&post_params(), obj)
            .await?;
        debug!(kind = %api.kind, name = ?created.metadata.name, "created object");
        Ok(created)
    }

    async fn update(
        &self,
        api: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = name_of(obj)?;
        Ok(self
            .api(api, namespace_of(obj))
            .replace(name, &post_params(), obj)
            .await?)
    }

    async fn delete(&self, api: &ApiResource, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api(api, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
        resource_version: Option<&str>,
    ) -> Result<DynamicObject, Error> {
        let mut body = json!({ "status": status });
        if let Some(rv) = resource_version {
            body["metadata"] = json!({ "resourceVersion": rv });
        }
        Ok(self
            .api(api, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryStore, StoreOp};

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use std::collections::BTreeMap;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::{ApiResource, DynamicObject};
    use kube::error::ErrorResponse;
    use trellis_common::crd::ChildStatus;
    use trellis_common::Error;

    use super::{name_of, namespace_of, ResourceStore};

    type ObjectKey = (String, String, String, String);

    fn key(api: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
        (
            api.api_version.clone(),
            api.kind.clone(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    fn api_error(code: u16, reason: &str, message: String) -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message,
                reason: reason.to_string(),
                code,
            }),
        }
    }

    fn matches_selector(obj: &DynamicObject, selector: Option<&str>) -> bool {
        let Some(selector) = selector else {
            return true;
        };
        let labels = obj.metadata.labels.clone().unwrap_or_default();
        selector
            .split(',')
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
                None => labels.contains_key(term.trim()),
            })
    }

    /// A mutating call observed by the [`MemoryStore`]
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum StoreOp {
        /// Object created
        Create(String),
        /// Object replaced
        Update(String),
        /// Deletion requested
        Delete(String),
        /// Status patched
        PatchStatus(String),
    }

    #[derive(Default)]
    struct State {
        objects: BTreeMap<ObjectKey, DynamicObject>,
        version: u64,
        failing: BTreeMap<String, (u16, &'static str)>,
        journal: Vec<StoreOp>,
    }

    impl State {
        fn next_version(&mut self) -> String {
            self.version += 1;
            self.version.to_string()
        }

        fn check_failing(&self, name: &str) -> Result<(), Error> {
            if let Some((code, reason)) = self.failing.get(name) {
                return Err(api_error(
                    *code,
                    reason,
                    format!("injected failure for {}", name),
                ));
            }
            Ok(())
        }
    }

    /// In-memory [`ResourceStore`] with API-server-like semantics
    ///
    /// - every write bumps `metadata.resourceVersion`
    /// - updates and status patches carrying a stale version get a 409
    /// - deleting an object that has finalizers only marks it with a
    ///   deletion timestamp; it disappears once the finalizers are released
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
    }

    impl MemoryStore {
        /// An empty store
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Seed an object as if some other actor had created it
        pub fn insert(&self, api: &ApiResource, mut obj: DynamicObject) {
            let mut state = self.state();
            obj.metadata.resource_version = Some(state.next_version());
            let k = key(
                api,
                namespace_of(&obj),
                obj.metadata.name.as_deref().unwrap_or_default(),
            );
            state.objects.insert(k, obj);
        }

        /// Snapshot of a stored object
        pub fn object(&self, api: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
            self.state().objects.get(&key(api, namespace, name)).cloned()
        }

        /// True when the object is present (including mid-deletion)
        pub fn contains(&self, api: &ApiResource, namespace: &str, name: &str) -> bool {
            self.object(api, namespace, name).is_some()
        }

        /// Number of stored objects
        pub fn len(&self) -> usize {
            self.state().objects.len()
        }

        /// True when nothing is stored
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Report a status on a child, standing in for its own controller
        pub fn set_child_status(
            &self,
            api: &ApiResource,
            namespace: &str,
            name: &str,
            status: ChildStatus,
        ) {
            let mut state = self.state();
            let version = state.next_version();
            if let Some(obj) = state.objects.get_mut(&key(api, namespace, name)) {
                obj.data["status"] = serde_json::to_value(status).unwrap_or_default();
                obj.metadata.resource_version = Some(version);
            }
        }

        /// Add a finalizer so a later delete leaves the object mid-deletion
        pub fn add_finalizer(&self, api: &ApiResource, namespace: &str, name: &str, finalizer: &str) {
            let mut state = self.state();
            if let Some(obj) = state.objects.get_mut(&key(api, namespace, name)) {
                obj.metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .push(finalizer.to_string());
            }
        }

        /// Drop every finalizer, completing a pending deletion
        pub fn release_finalizers(&self, api: &ApiResource, namespace: &str, name: &str) {
            let mut state = self.state();
            let k = key(api, namespace, name);
            let deleting = match state.objects.get_mut(&k) {
                Some(obj) => {
                    obj.metadata.finalizers = None;
                    obj.metadata.deletion_timestamp.is_some()
                }
                None => false,
            };
            if deleting {
                state.objects.remove(&k);
            }
        }

        /// Make every call touching `name` fail with a transient 503
        pub fn fail_for(&self, name: &str) {
            self.state()
                .failing
                .insert(name.to_string(), (503, "ServiceUnavailable"));
        }

        /// Make every call touching `name` fail with a permanent 403
        pub fn forbid_for(&self, name: &str) {
            self.state()
                .failing
                .insert(name.to_string(), (403, "Forbidden"));
        }

        /// Stop injecting failures for `name`
        pub fn heal(&self, name: &str) {
            self.state().failing.remove(name);
        }

        /// Mutating calls observed so far, in order
        pub fn journal(&self) -> Vec<StoreOp> {
            self.state().journal.clone()
        }

        /// Forget the recorded journal
        pub fn clear_journal(&self) {
            self.state().journal.clear();
        }
    }

    #[async_trait]
    impl ResourceStore for MemoryStore {
        async fn get(
            &self,
            api: &ApiResource,
            namespace: &str,
            name: &str,
        ) -> Result<Option<DynamicObject>, Error> {
            let state = self.state();
            state.check_failing(name)?;
            Ok(state.objects.get(&key(api, namespace, name)).cloned())
        }

        async fn list(
            &self,
            api: &ApiResource,
            namespace: &str,
            label_selector: Option<&str>,
        ) -> Result<Vec<DynamicObject>, Error> {
            let state = self.state();
            Ok(state
                .objects
                .iter()
                .filter(|((av, kind, ns, _), _)| {
                    *av == api.api_version
                        && *kind == api.kind
                        && (namespace.is_empty() || ns == namespace)
                })
                .map(|(_, obj)| obj)
                .filter(|obj| matches_selector(obj, label_selector))
                .cloned()
                .collect())
        }

        async fn create(
            &self,
            api: &ApiResource,
            obj: &DynamicObject,
        ) -> Result<DynamicObject, Error> {
            let name = name_of(obj)?.to_string();
            let mut state = self.state();
            state.check_failing(&name)?;
            let k = key(api, namespace_of(obj), &name);
            if state.objects.contains_key(&k) {
                return Err(api_error(
                    409,
                    "AlreadyExists",
                    format!("{} {} already exists", api.kind, name),
                ));
            }
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(state.next_version());
            stored.metadata.generation = Some(1);
            stored.metadata.uid = Some(format!("uid-{}", name));
            state.objects.insert(k, stored.clone());
            state.journal.push(StoreOp::Create(name));
            Ok(stored)
        }

        async fn update(
            &self,
            api: &ApiResource,
            obj: &DynamicObject,
        ) -> Result<DynamicObject, Error> {
            let name = name_of(obj)?.to_string();
            let mut state = self.state();
            state.check_failing(&name)?;
            let k = key(api, namespace_of(obj), &name);
            let Some(current) = state.objects.get(&k).cloned() else {
                return Err(api_error(404, "NotFound", format!("{} {} not found", api.kind, name)));
            };
            if let Some(rv) = obj.metadata.resource_version.as_deref() {
                if current.metadata.resource_version.as_deref() != Some(rv) {
                    return Err(api_error(
                        409,
                        "Conflict",
                        format!("{} {} has been modified", api.kind, name),
                    ));
                }
            }
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(state.next_version());
            stored.metadata.generation = current.metadata.generation.map(|g| g + 1);
            stored.metadata.uid = current.metadata.uid.clone();
            stored.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
            // status is a subresource; replace never touches it
            match current.data.get("status") {
                Some(status) => stored.data["status"] = status.clone(),
                None => {
                    if let Some(data) = stored.data.as_object_mut() {
                        data.remove("status");
                    }
                }
            }
            state.objects.insert(k, stored.clone());
            state.journal.push(StoreOp::Update(name));
            Ok(stored)
        }

        async fn delete(&self, api: &ApiResource, namespace: &str, name: &str) -> Result<(), Error> {
            let mut state = self.state();
            state.check_failing(name)?;
            let k = key(api, namespace, name);
            let has_finalizers = match state.objects.get_mut(&k) {
                Some(obj) => {
                    let has = obj.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty());
                    if has && obj.metadata.deletion_timestamp.is_none() {
                        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                    }
                    has
                }
                None => return Ok(()),
            };
            if !has_finalizers {
                state.objects.remove(&k);
            }
            state.journal.push(StoreOp::Delete(name.to_string()));
            Ok(())
        }

        async fn patch_status(
            &self,
            api: &ApiResource,
            namespace: &str,
            name: &str,
            status: &serde_json::Value,
            resource_version: Option<&str>,
        ) -> Result<DynamicObject, Error> {
            let mut state = self.state();
            state.check_failing(name)?;
            let version = state.next_version();
            let Some(obj) = state.objects.get_mut(&key(api, namespace, name)) else {
                return Err(api_error(404, "NotFound", format!("{} {} not found", api.kind, name)));
            };
            if let Some(rv) = resource_version {
                if obj.metadata.resource_version.as_deref() != Some(rv) {
                    return Err(api_error(
                        409,
                        "Conflict",
                        format!("{} {} has been modified", api.kind, name),
                    ));
                }
            }
            obj.data["status"] = status.clone();
            obj.metadata.resource_version = Some(version);
            let patched = obj.clone();
            state.journal.push(StoreOp::PatchStatus(name.to_string()));
            Ok(patched)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::GroupVersionKind;
    use serde_json::json;

    fn config_maps() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"))
    }

    fn config_map(name: &str) -> DynamicObject {
        DynamicObject::new(name, &config_maps())
            .within("default")
            .data(json!({ "data": { "key": "value" } }))
    }

    #[tokio::test]
    async fn create_then_get_assigns_versions() {
        let store = MemoryStore::new();
        let ar = config_maps();

        let created = store.create(&ar, &config_map("cni")).await.unwrap();
        assert!(created.metadata.resource_version.is_some());

        let fetched = store.get(&ar, "default", "cni").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.resource_version, created.metadata.resource_version);
        assert!(store.get(&ar, "default", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_rejects_duplicates_as_conflict() {
        let store = MemoryStore::new();
        let ar = config_maps();
        store.create(&ar, &config_map("cni")).await.unwrap();

        let err = store.create(&ar, &config_map("cni")).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    /// Story: Two writers racing on the same object; the stale one loses
    #[tokio::test]
    async fn story_stale_update_is_rejected() {
        let store = MemoryStore::new();
        let ar = config_maps();
        let first = store.create(&ar, &config_map("cni")).await.unwrap();

        let mut a = first.clone();
        a.data["data"]["key"] = json!("a");
        store.update(&ar, &a).await.unwrap();

        let mut b = first;
        b.data["data"]["key"] = json!("b");
        let err = store.update(&ar, &b).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.get(&ar, "default", "cni").await.unwrap().unwrap();
        assert_eq!(stored.data["data"]["key"], json!("a"));
    }

    #[tokio::test]
    async fn delete_respects_finalizers() {
        let store = MemoryStore::new();
        let ar = config_maps();
        store.create(&ar, &config_map("cni")).await.unwrap();
        store.add_finalizer(&ar, "default", "cni", "example.com/hold");

        store.delete(&ar, "default", "cni").await.unwrap();
        let obj = store.get(&ar, "default", "cni").await.unwrap().unwrap();
        assert!(obj.metadata.deletion_timestamp.is_some());

        store.release_finalizers(&ar, "default", "cni");
        assert!(!store.contains(&ar, "default", "cni"));

        // deleting something already gone is fine
        store.delete(&ar, "default", "cni").await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryStore::new();
        let ar = config_maps();
        store.fail_for("cni");

        let err = store.get(&ar, "default", "cni").await.unwrap_err();
        assert!(err.is_retryable());

        store.heal("cni");
        assert!(store.get(&ar, "default", "cni").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forbidden_failures_are_critical() {
        let store = MemoryStore::new();
        let ar = config_maps();
        store.forbid_for("cni");

        let err = store.delete(&ar, "default", "cni").await.unwrap_err();
        assert!(err.is_critical());

        store.heal("cni");
        store.delete(&ar, "default", "cni").await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = MemoryStore::new();
        let ar = config_maps();
        let mut labelled = config_map("a");
        labelled.metadata.labels = Some([("tier".to_string(), "infra".to_string())].into());
        store.create(&ar, &labelled).await.unwrap();
        store.create(&ar, &config_map("b")).await.unwrap();
        store
            .create(&ar, &config_map("c").within("other"))
            .await
            .unwrap();

        assert_eq!(store.list(&ar, "", None).await.unwrap().len(), 3);
        assert_eq!(store.list(&ar, "default", None).await.unwrap().len(), 2);
        let infra = store.list(&ar, "", Some("tier=infra")).await.unwrap();
        assert_eq!(infra.len(), 1);
        assert_eq!(infra[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn patch_status_checks_resource_version() {
        let store = MemoryStore::new();
        let ar = config_maps();
        let created = store.create(&ar, &config_map("cni")).await.unwrap();
        let rv = created.metadata.resource_version.clone();

        let patched = store
            .patch_status(&ar, "default", "cni", &json!({"phase": "Success"}), rv.as_deref())
            .await
            .unwrap();
        assert_eq!(patched.data["status"]["phase"], json!("Success"));

        let err = store
            .patch_status(&ar, "default", "cni", &json!({}), rv.as_deref())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
