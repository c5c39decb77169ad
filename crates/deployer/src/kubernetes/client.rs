//! Cluster API used by the rollout executor.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "deployer";

/// Identity of a single cluster object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
}

impl ResourceIdentity {
    /// Read identity fields out of a manifest or API object
    pub fn from_manifest(manifest: &Value) -> Result<Self> {
        let field = |pointer: &str| manifest.pointer(pointer).and_then(Value::as_str);
        let (Some(api_version), Some(kind), Some(name)) = (
            field("/apiVersion"),
            field("/kind"),
            field("/metadata/name"),
        ) else {
            return Err(Error::user(
                "Manifest needs apiVersion, kind and metadata.name",
            ));
        };
        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: field("/metadata/namespace").map(str::to_string),
            uid: field("/metadata/uid").map(str::to_string),
        })
    }

    fn gvk(&self) -> GroupVersionKind {
        match self.api_version.split_once('/') {
            Some((group, version)) => GroupVersionKind::gvk(group, version, &self.kind),
            None => GroupVersionKind::gvk("", &self.api_version, &self.kind),
        }
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Operations the executor needs from a cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or update an object, returning its identity (with uid)
    async fn apply(&self, manifest: &Value) -> Result<ResourceIdentity>;

    /// Current state of an object, `None` when it does not exist
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<Value>>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, identity: &ResourceIdentity) -> Result<()>;

    /// Pods matching a label selector, across all namespaces when `namespace` is `None`
    async fn list_pods(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Pod>>;

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<String>;
}

/// `ClusterApi` backed by a kube-rs client
#[derive(Clone)]
pub struct KubeCluster {
    name: String,
    client: Client,
}

impl KubeCluster {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn dynamic_api(&self, identity: &ResourceIdentity) -> Result<Api<DynamicObject>> {
        let (resource, capabilities) = discovery::pinned_kind(&self.client, &identity.gvk())
            .await
            .map_err(|e| Error::from_kube("discovery", e))?;

        let api = match (&capabilities.scope, identity.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            (Scope::Namespaced, None) => {
                Api::default_namespaced_with(self.client.clone(), &resource)
            }
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        };
        Ok(api)
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn apply(&self, manifest: &Value) -> Result<ResourceIdentity> {
        let identity = ResourceIdentity::from_manifest(manifest)?;
        let api = self.dynamic_api(&identity).await?;
        let object: DynamicObject = serde_json::from_value(manifest.clone())?;

        debug!(cluster = %self.name, resource = %identity, "Applying resource");
        let applied = api
            .patch(
                &identity.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            )
            .await
            .map_err(|e| Error::from_kube("apply", e))?;

        Ok(ResourceIdentity {
            uid: applied.metadata.uid,
            ..identity
        })
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<Value>> {
        let api = self.dynamic_api(identity).await?;
        let object = api
            .get_opt(&identity.name)
            .await
            .map_err(|e| Error::from_kube("get", e))?;
        object
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .transpose()
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        let api = self.dynamic_api(identity).await?;
        debug!(cluster = %self.name, resource = %identity, "Deleting resource");
        match api
            .delete(&identity.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube("delete", e)),
        }
    }

    async fn list_pods(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| Error::from_kube("list pods", e))?;
        Ok(list.items)
    }

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let list = events
            .list(&ListParams::default().fields(field_selector))
            .await
            .map_err(|e| Error::from_kube("list events", e))?;
        Ok(list.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            previous,
            ..LogParams::default()
        };
        self.pods(Some(namespace))
            .logs(pod, &params)
            .await
            .map_err(|e| Error::from_kube("pod logs", e))
    }
}

/// Retries transient connection failures of the wrapped cluster.
///
/// Every `ClusterApi` call is idempotent (server-side apply, delete of a
/// missing object succeeds) so all of them are retried.
pub struct RetryingCluster {
    inner: Arc<dyn ClusterApi>,
    retries: u32,
    backoff: Duration,
}

impl RetryingCluster {
    pub fn new(inner: Arc<dyn ClusterApi>, retries: u32) -> Self {
        Self {
            inner,
            retries,
            backoff: Duration::from_millis(500),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn retry<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        error = %e,
                        "Transient cluster error, retrying"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl ClusterApi for RetryingCluster {
    async fn apply(&self, manifest: &Value) -> Result<ResourceIdentity> {
        self.retry("apply", || self.inner.apply(manifest)).await
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<Value>> {
        self.retry("get", || self.inner.get(identity)).await
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        self.retry("delete", || self.inner.delete(identity)).await
    }

    async fn list_pods(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Pod>> {
        self.retry("list pods", || self.inner.list_pods(namespace, label_selector))
            .await
    }

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>> {
        self.retry("list events", || {
            self.inner.list_events(namespace, field_selector)
        })
        .await
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<String> {
        self.retry("pod logs", || {
            self.inner.pod_logs(namespace, pod, container, previous)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use serde_json::json;

    #[test]
    fn test_identity_from_manifest() {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" }
        });
        let identity = ResourceIdentity::from_manifest(&manifest).unwrap();
        assert_eq!(identity.kind, "Deployment");
        assert_eq!(identity.namespace.as_deref(), Some("prod"));
        assert_eq!(identity.to_string(), "Deployment prod/web");
        assert_eq!(identity.gvk().group, "apps");
    }

    #[test]
    fn test_identity_core_group() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "web" }
        });
        let identity = ResourceIdentity::from_manifest(&manifest).unwrap();
        let gvk = identity.gvk();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn test_identity_requires_name() {
        let manifest = json!({ "apiVersion": "v1", "kind": "Service", "metadata": {} });
        assert!(matches!(
            ResourceIdentity::from_manifest(&manifest),
            Err(Error::User(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_pod_listing() {
        let fake = FakeCluster::new();
        fake.fail_next_pod_lists(2);
        let cluster = RetryingCluster::new(Arc::new(fake.clone()), 3);

        let pods = cluster.list_pods(None, "release_id=1").await.unwrap();
        assert!(pods.is_empty());
        assert_eq!(fake.pod_list_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_budget() {
        let fake = FakeCluster::new();
        fake.fail_next_pod_lists(5);
        let cluster = RetryingCluster::new(Arc::new(fake.clone()), 2);

        let err = cluster.list_pods(None, "release_id=1").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fake.pod_list_calls(), 3);
    }
}
