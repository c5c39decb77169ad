//! A single manifest bound to a cluster and namespace.

use super::client::{ClusterApi, ResourceIdentity};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// How long to wait for an immutable object to disappear before recreating it
const DELETION_POLL_ATTEMPTS: u32 = 60;
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Kind of a cluster object, reduced to what the executor cares about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "category", content = "kind")]
pub enum ResourceKind {
    /// Traffic entrypoint, switched last under blue/green
    Service,
    /// Immutable run-to-completion workload
    Job,
    Pod,
    /// Long-running pod controller (Deployment, StatefulSet, ...)
    Workload(String),
    Other(String),
}

impl ResourceKind {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "Service" => Self::Service,
            "Job" => Self::Job,
            "Pod" => Self::Pod,
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" => {
                Self::Workload(kind.to_string())
            }
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Service => "Service",
            Self::Job => "Job",
            Self::Pod => "Pod",
            Self::Workload(kind) | Self::Other(kind) => kind,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Self::Service)
    }

    /// Kinds that run the role's pods; a role has at most one
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Job | Self::Pod | Self::Workload(_))
    }

    /// Kinds whose spec cannot be updated in place
    pub fn recreate_on_update(&self) -> bool {
        matches!(self, Self::Job | Self::Pod)
    }

    /// Kinds carrying `spec.template` with pod labels
    pub fn has_pod_template(&self) -> bool {
        matches!(self, Self::Job | Self::Workload(_))
    }

    /// Kinds whose pod count is `spec.replicas`
    pub fn has_replicas(&self) -> bool {
        matches!(self, Self::Workload(kind) if kind != "DaemonSet")
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of deploying one resource, kept for diagnostics and rollback
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedResource {
    /// uid of the object after apply
    pub uid: Option<String>,
    /// Object as it existed before this deploy, sanitized for re-apply
    pub previous: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cluster: String,
    pub kind: ResourceKind,
    pub identity: ResourceIdentity,
    pub manifest: Value,
}

impl Resource {
    pub fn from_manifest(cluster: impl Into<String>, manifest: Value) -> Result<Self> {
        let identity = ResourceIdentity::from_manifest(&manifest)?;
        Ok(Self {
            cluster: cluster.into(),
            kind: ResourceKind::from_kind(&identity.kind),
            identity,
            manifest,
        })
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.identity.namespace.as_deref()
    }

    pub fn is_service(&self) -> bool {
        self.kind.is_service()
    }

    /// Apply the manifest, remembering what was there before
    pub async fn deploy(&self, api: &dyn ClusterApi) -> Result<AppliedResource> {
        let previous = api.get(&self.identity).await?;

        if previous.is_some() && self.kind.recreate_on_update() {
            info!(resource = %self.identity, "Recreating immutable resource");
            self.delete_and_wait(api).await?;
        }

        let applied = api.apply(&self.manifest).await?;
        debug!(resource = %self.identity, uid = ?applied.uid, "Resource applied");

        Ok(AppliedResource {
            uid: applied.uid,
            previous: previous.map(sanitize),
        })
    }

    pub async fn delete(&self, api: &dyn ClusterApi) -> Result<()> {
        api.delete(&self.identity).await
    }

    /// Restore the pre-deploy object, or delete when there was none
    pub async fn revert(&self, api: &dyn ClusterApi, previous: Option<&Value>) -> Result<()> {
        match previous {
            Some(previous) => {
                if self.kind.recreate_on_update() {
                    self.delete_and_wait(api).await?;
                }
                api.apply(previous).await?;
                Ok(())
            }
            None => self.delete(api).await,
        }
    }

    async fn delete_and_wait(&self, api: &dyn ClusterApi) -> Result<()> {
        api.delete(&self.identity).await?;
        for _ in 0..DELETION_POLL_ATTEMPTS {
            if api.get(&self.identity).await?.is_none() {
                return Ok(());
            }
            tokio::time::sleep(DELETION_POLL_INTERVAL).await;
        }
        Err(Error::user(format!(
            "{} was not deleted in time, cannot recreate it",
            self.identity
        )))
    }
}

/// Strip server-populated fields so an object read back can be re-applied
pub fn sanitize(mut object: Value) -> Value {
    if let Some(map) = object.as_object_mut() {
        map.remove("status");
    }
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in [
            "uid",
            "resourceVersion",
            "managedFields",
            "creationTimestamp",
            "generation",
            "selfLink",
        ] {
            metadata.remove(field);
        }
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use serde_json::json;

    fn job() -> Resource {
        Resource::from_manifest(
            "pod1",
            json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": { "name": "migrate", "namespace": "prod" },
                "spec": { "template": { "spec": { "containers": [] } } }
            }),
        )
        .unwrap()
    }

    fn service() -> Resource {
        Resource::from_manifest(
            "pod1",
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": "web", "namespace": "prod" },
                "spec": { "selector": { "role": "web" } }
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_kind_capabilities() {
        assert!(ResourceKind::from_kind("Service").is_service());
        assert!(ResourceKind::from_kind("Deployment").is_primary());
        assert!(ResourceKind::from_kind("Deployment").has_replicas());
        assert!(!ResourceKind::from_kind("DaemonSet").has_replicas());
        assert!(ResourceKind::from_kind("Job").recreate_on_update());
        assert!(!ResourceKind::from_kind("ConfigMap").is_primary());
        assert_eq!(ResourceKind::from_kind("ConfigMap").as_str(), "ConfigMap");
    }

    #[test]
    fn test_sanitize_strips_server_fields() {
        let object = json!({
            "kind": "Service",
            "metadata": { "name": "web", "uid": "abc", "resourceVersion": "7" },
            "status": { "loadBalancer": {} }
        });
        let clean = sanitize(object);
        assert!(clean.get("status").is_none());
        assert!(clean["metadata"].get("uid").is_none());
        assert_eq!(clean["metadata"]["name"], "web");
    }

    #[tokio::test]
    async fn test_deploy_new_resource_has_no_previous() {
        let cluster = FakeCluster::new();
        let applied = service().deploy(&cluster).await.unwrap();
        assert!(applied.previous.is_none());
        assert!(applied.uid.is_some());
        assert!(cluster.object("Service", "prod", "web").is_some());
    }

    #[tokio::test]
    async fn test_deploy_captures_previous_and_reverts() {
        let cluster = FakeCluster::new();
        let old = service();
        old.deploy(&cluster).await.unwrap();

        let mut new = service();
        new.manifest["spec"]["selector"]["role"] = json!("web-v2");
        let applied = new.deploy(&cluster).await.unwrap();
        let previous = applied.previous.clone().unwrap();
        assert_eq!(previous["spec"]["selector"]["role"], "web");
        assert!(previous["metadata"].get("uid").is_none());

        new.revert(&cluster, applied.previous.as_ref()).await.unwrap();
        let restored = cluster.object("Service", "prod", "web").unwrap();
        assert_eq!(restored["spec"]["selector"]["role"], "web");
    }

    #[tokio::test]
    async fn test_revert_without_previous_deletes() {
        let cluster = FakeCluster::new();
        let svc = service();
        svc.deploy(&cluster).await.unwrap();
        svc.revert(&cluster, None).await.unwrap();
        assert!(cluster.object("Service", "prod", "web").is_none());
    }

    #[tokio::test]
    async fn test_existing_job_is_recreated() {
        let cluster = FakeCluster::new();
        job().deploy(&cluster).await.unwrap();
        job().deploy(&cluster).await.unwrap();

        let deleted = cluster.deleted();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "migrate");
        assert!(cluster.object("Job", "prod", "migrate").is_some());
    }
}
