//! In-memory cluster and fixture builders for tests.

use crate::error::{Error, Result};
use crate::kubernetes::{labels, ClusterApi, ResourceIdentity};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

type ObjectKey = (String, String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, Value>,
    applied: Vec<ResourceIdentity>,
    deleted: Vec<ResourceIdentity>,
    next_uid: u64,
    pod_frames: VecDeque<Vec<Pod>>,
    pod_list_calls: usize,
    failing_pod_lists: usize,
    events: Vec<Event>,
    logs: HashMap<(String, String, bool), String>,
    failing_logs: bool,
    failing_applies: HashSet<String>,
    failing_deletes: HashSet<String>,
}

/// `ClusterApi` keeping objects in memory and serving scripted pod lists.
///
/// Each `list_pods` call consumes one queued frame; the last frame keeps
/// being served once the queue is down to one.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

fn key(kind: &str, namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        kind.to_string(),
        namespace.unwrap_or("default").to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, message: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "Fake".to_string(),
        code,
    }))
}

impl FakeCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Serve `pods` for every pod listing from now on
    pub fn set_pods(&self, pods: Vec<Pod>) {
        let mut state = self.state();
        state.pod_frames.clear();
        state.pod_frames.push_back(pods);
    }

    /// Queue one pod listing result
    pub fn push_pods(&self, pods: Vec<Pod>) {
        self.state().pod_frames.push_back(pods);
    }

    pub fn fail_next_pod_lists(&self, count: usize) {
        self.state().failing_pod_lists = count;
    }

    pub fn pod_list_calls(&self) -> usize {
        self.state().pod_list_calls
    }

    pub fn add_event(&self, event: Event) {
        self.state().events.push(event);
    }

    pub fn set_logs(&self, pod: &str, container: &str, previous: bool, logs: &str) {
        self.state().logs.insert(
            (pod.to_string(), container.to_string(), previous),
            logs.to_string(),
        );
    }

    pub fn fail_logs(&self) {
        self.state().failing_logs = true;
    }

    pub fn fail_apply_of(&self, name: &str) {
        self.state().failing_applies.insert(name.to_string());
    }

    pub fn fail_delete_of(&self, name: &str) {
        self.state().failing_deletes.insert(name.to_string());
    }

    /// Store an object directly, as if it existed before the rollout
    pub fn seed(&self, manifest: Value) {
        if let Ok(identity) = ResourceIdentity::from_manifest(&manifest) {
            self.state().objects.insert(
                key(&identity.kind, identity.namespace.as_deref(), &identity.name),
                manifest,
            );
        }
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.state()
            .objects
            .get(&key(kind, Some(namespace), name))
            .cloned()
    }

    pub fn applied(&self) -> Vec<ResourceIdentity> {
        self.state().applied.clone()
    }

    pub fn applied_names(&self) -> Vec<String> {
        self.applied().into_iter().map(|i| i.name).collect()
    }

    pub fn deleted(&self) -> Vec<ResourceIdentity> {
        self.state().deleted.clone()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted().into_iter().map(|i| i.name).collect()
    }
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())).map(String::as_str) == Some(v.trim()),
            None => false,
        })
}

fn matches_field_selector(event: &Event, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some(("involvedObject.name", v)) => event.involved_object.name.as_deref() == Some(v),
            Some(("involvedObject.uid", v)) => event.involved_object.uid.as_deref() == Some(v),
            Some(("involvedObject.kind", v)) => event.involved_object.kind.as_deref() == Some(v),
            _ => false,
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(&self, manifest: &Value) -> Result<ResourceIdentity> {
        let mut identity = ResourceIdentity::from_manifest(manifest)?;
        let mut state = self.state();
        if state.failing_applies.contains(&identity.name) {
            return Err(api_error(422, "apply rejected"));
        }
        let object_key = key(&identity.kind, identity.namespace.as_deref(), &identity.name);
        let uid = match state
            .objects
            .get(&object_key)
            .and_then(|o| o.pointer("/metadata/uid"))
            .and_then(Value::as_str)
        {
            Some(uid) => uid.to_string(),
            None => {
                state.next_uid += 1;
                format!("uid-{}", state.next_uid)
            }
        };
        let mut stored = manifest.clone();
        stored["metadata"]["uid"] = json!(uid);
        stored["metadata"]["resourceVersion"] = json!("1");
        state.objects.insert(object_key, stored);
        identity.uid = Some(uid);
        state.applied.push(identity.clone());
        Ok(identity)
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<Value>> {
        Ok(self
            .state()
            .objects
            .get(&key(&identity.kind, identity.namespace.as_deref(), &identity.name))
            .cloned())
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        let mut state = self.state();
        if state.failing_deletes.contains(&identity.name) {
            return Err(api_error(500, "delete failed"));
        }
        state
            .objects
            .remove(&key(&identity.kind, identity.namespace.as_deref(), &identity.name));
        state.deleted.push(identity.clone());
        Ok(())
    }

    async fn list_pods(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Pod>> {
        let mut state = self.state();
        state.pod_list_calls += 1;
        if state.failing_pod_lists > 0 {
            state.failing_pod_lists -= 1;
            return Err(Error::ClusterTransient {
                operation: "list pods".to_string(),
                message: "connection reset".to_string(),
            });
        }
        let frame = if state.pod_frames.len() > 1 {
            state.pod_frames.pop_front().unwrap_or_default()
        } else {
            state.pod_frames.front().cloned().unwrap_or_default()
        };
        Ok(frame
            .into_iter()
            .filter(|pod| {
                namespace.map_or(true, |ns| pod.metadata.namespace.as_deref() == Some(ns))
                    && matches_selector(pod.metadata.labels.as_ref(), label_selector)
            })
            .collect())
    }

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>> {
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| e.involved_object.namespace.as_deref().unwrap_or("default") == namespace)
            .filter(|e| matches_field_selector(e, field_selector))
            .cloned()
            .collect())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<String> {
        let state = self.state();
        if state.failing_logs {
            return Err(api_error(500, "log stream unavailable"));
        }
        Ok(state
            .logs
            .get(&(pod.to_string(), container.to_string(), previous))
            .cloned()
            .unwrap_or_default())
    }
}

/// Builder for pods in a given role and deploy group
pub struct PodBuilder {
    pod: Value,
}

/// Start a pod owned by `role` in `deploy_group` of project `shop`, namespace
/// `default`, release 1
pub fn pod(name: &str, role: &str, deploy_group: &str) -> PodBuilder {
    PodBuilder {
        pod: json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": format!("{name}-uid"),
                "labels": {
                    (labels::PROJECT): "shop",
                    (labels::ROLE): role,
                    (labels::DEPLOY_GROUP): deploy_group,
                    (labels::RELEASE_ID): "1",
                }
            },
            "spec": { "containers": [ { "name": "app", "image": "app:latest" } ] },
            "status": {
                "phase": "Pending",
                "conditions": [],
                "containerStatuses": [ {
                    "name": "app",
                    "image": "app:latest",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": {}
                } ]
            }
        }),
    }
}

impl PodBuilder {
    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.pod["metadata"]["namespace"] = json!(namespace);
        self
    }

    #[must_use]
    pub fn project(mut self, project: &str) -> Self {
        self.pod["metadata"]["labels"][labels::PROJECT] = json!(project);
        self
    }

    #[must_use]
    pub fn release(mut self, release_id: &str) -> Self {
        self.pod["metadata"]["labels"][labels::RELEASE_ID] = json!(release_id);
        self
    }

    #[must_use]
    pub fn running(mut self) -> Self {
        self.pod["status"]["phase"] = json!("Running");
        self.pod["status"]["containerStatuses"][0]["state"] =
            json!({ "running": { "startedAt": "2026-01-01T00:00:00Z" } });
        self
    }

    #[must_use]
    pub fn ready(mut self) -> Self {
        self.pod["status"]["conditions"] = json!([ { "type": "Ready", "status": "True" } ]);
        self.pod["status"]["containerStatuses"][0]["ready"] = json!(true);
        self
    }

    #[must_use]
    pub fn succeeded(mut self) -> Self {
        self.pod["status"]["phase"] = json!("Succeeded");
        self.pod["status"]["containerStatuses"][0]["state"] =
            json!({ "terminated": { "exitCode": 0, "reason": "Completed" } });
        self
    }

    #[must_use]
    pub fn failed(mut self) -> Self {
        self.pod["status"]["phase"] = json!("Failed");
        self.pod["status"]["containerStatuses"][0]["state"] =
            json!({ "terminated": { "exitCode": 1, "reason": "Error" } });
        self
    }

    #[must_use]
    pub fn restarts(mut self, count: i32) -> Self {
        self.pod["status"]["containerStatuses"][0]["restartCount"] = json!(count);
        self
    }

    #[must_use]
    pub fn terminated_reason(mut self, reason: &str) -> Self {
        self.pod["status"]["containerStatuses"][0]["lastState"] =
            json!({ "terminated": { "exitCode": 137, "reason": reason } });
        self
    }

    #[must_use]
    pub fn waiting(mut self, reason: &str) -> Self {
        self.pod["status"]["containerStatuses"][0]["state"] =
            json!({ "waiting": { "reason": reason } });
        self
    }

    #[must_use]
    pub fn init_container(mut self, name: &str) -> Self {
        self.pod["spec"]["initContainers"] = json!([ { "name": name, "image": "setup:latest" } ]);
        self.pod["status"]["initContainerStatuses"] = json!([ {
            "name": name,
            "image": "setup:latest",
            "imageID": "",
            "ready": true,
            "restartCount": 0,
            "state": { "terminated": { "exitCode": 0, "reason": "Completed" } }
        } ]);
        self
    }

    pub fn build(self) -> Pod {
        serde_json::from_value(self.pod).unwrap_or_default()
    }
}

/// Event about object `name` in namespace `default`
pub fn event(name: &str, type_: &str, reason: &str, message: &str) -> Event {
    serde_json::from_value(json!({
        "metadata": { "name": format!("{name}.{reason}"), "namespace": "default" },
        "involvedObject": { "name": name, "namespace": "default" },
        "type": type_,
        "reason": reason,
        "message": message,
        "count": 1,
        "lastTimestamp": "2026-01-01T00:00:00Z"
    }))
    .unwrap_or_default()
}
