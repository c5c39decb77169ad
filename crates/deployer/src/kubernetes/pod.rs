//! Read-only view of a pod, derived from cluster API data.

use super::labels;
use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};

/// Event reasons from the cluster autoscaler that explain a pending pod
const SCALE_UP_REASON: &str = "TriggeredScaleUp";
const FAILED_SCHEDULING_REASON: &str = "FailedScheduling";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub name: String,
    pub restart_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub role: Option<String>,
    pub deploy_group: Option<String>,
    pub phase: String,
    pub ready: bool,
    pub restart_count: i32,
    pub termination_reason: Option<String>,
    pub waiting_reason: Option<String>,
    pub init_containers: Vec<ContainerSnapshot>,
    pub containers: Vec<ContainerSnapshot>,
}

impl PodSnapshot {
    pub fn restarted(&self) -> bool {
        self.restart_count > 0
    }

    pub fn failed(&self) -> bool {
        self.phase == "Failed"
    }

    /// Prerequisite pods are live once completed, everything else once running and ready
    pub fn live(&self, prerequisite: bool) -> bool {
        if prerequisite {
            self.phase == "Succeeded"
        } else {
            self.phase == "Running" && self.ready
        }
    }

    /// Whether the pod's events show a failure the pod will not recover from by waiting
    pub fn events_indicate_failure(&self, events: &[Event]) -> bool {
        let scaling_up = events
            .iter()
            .any(|e| e.reason.as_deref() == Some(SCALE_UP_REASON));

        events.iter().any(|event| {
            if event.type_.as_deref() == Some("Normal") {
                return false;
            }
            let reason = event.reason.as_deref().unwrap_or_default();
            let message = event.message.as_deref().unwrap_or_default();
            if reason == "Unhealthy" && message.starts_with("Readiness probe") {
                return false;
            }
            !(scaling_up && reason == FAILED_SCHEDULING_REASON)
        })
    }

    /// Human readable reason the pod is not live yet
    pub fn waiting_detail(&self) -> String {
        let reason = self
            .waiting_reason
            .as_deref()
            .or(self.termination_reason.as_deref())
            .unwrap_or("Unknown");
        format!("Waiting ({}, {reason})", self.phase)
    }

    /// Container names with whether their previous instance should be inspected
    pub fn containers_for_logs(&self) -> impl Iterator<Item = (&str, bool)> {
        self.init_containers
            .iter()
            .chain(self.containers.iter())
            .map(|c| (c.name.as_str(), c.restart_count > 0))
    }
}

impl From<&Pod> for PodSnapshot {
    fn from(pod: &Pod) -> Self {
        let metadata = &pod.metadata;
        let label = |key: &str| {
            metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(key))
                .cloned()
        };
        let status = pod.status.as_ref();

        let statuses = |list: Option<&Vec<ContainerStatus>>| -> Vec<ContainerStatus> {
            list.cloned().unwrap_or_default()
        };
        let init_statuses = statuses(status.and_then(|s| s.init_container_statuses.as_ref()));
        let main_statuses = statuses(status.and_then(|s| s.container_statuses.as_ref()));

        let spec_names = |init: bool| -> Vec<String> {
            pod.spec
                .as_ref()
                .map(|spec| {
                    if init {
                        spec.init_containers
                            .as_ref()
                            .map(|c| c.iter().map(|c| c.name.clone()).collect())
                            .unwrap_or_default()
                    } else {
                        spec.containers.iter().map(|c| c.name.clone()).collect()
                    }
                })
                .unwrap_or_default()
        };
        let snapshot = |names: Vec<String>, statuses: &[ContainerStatus]| {
            names
                .into_iter()
                .map(|name| {
                    let restart_count = statuses
                        .iter()
                        .find(|s| s.name == name)
                        .map_or(0, |s| s.restart_count);
                    ContainerSnapshot {
                        name,
                        restart_count,
                    }
                })
                .collect::<Vec<_>>()
        };

        let all_statuses = || init_statuses.iter().chain(main_statuses.iter());

        let waiting_reason = all_statuses().find_map(|s| {
            s.state
                .as_ref()
                .and_then(|state| state.waiting.as_ref())
                .and_then(|w| w.reason.clone())
        });
        let termination_reason = all_statuses()
            .find_map(|s| {
                let current = s.state.as_ref().and_then(|st| st.terminated.as_ref());
                let last = s.last_state.as_ref().and_then(|st| st.terminated.as_ref());
                current.or(last).and_then(|t| t.reason.clone())
            })
            .or_else(|| status.and_then(|s| s.reason.clone()));

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            });

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata.namespace.clone().unwrap_or_default(),
            uid: metadata.uid.clone(),
            role: label(labels::ROLE),
            deploy_group: label(labels::DEPLOY_GROUP),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Pending".to_string()),
            ready,
            restart_count: all_statuses().map(|s| s.restart_count).sum(),
            termination_reason,
            waiting_reason,
            init_containers: snapshot(spec_names(true), &init_statuses),
            containers: snapshot(spec_names(false), &main_statuses),
        }
    }
}
