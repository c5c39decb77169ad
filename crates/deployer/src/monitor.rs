//! Stability monitor: polls pods of a batch of release docs until the
//! rollout succeeds, fails, times out or is cancelled.
//!
//! Every tick evaluates all docs against one pod listing per cluster
//! namespace, selected by project and release id. Each doc gets
//! `desired_pod_count` status slots, filled with its pods sorted by name; a
//! slot without a pod is `Missing`.

use crate::config::DeployerConfig;
use crate::error::Result;
use crate::kubernetes::{labels, ClusterContext, PodSnapshot};
use crate::output::OutputSink;
use crate::release::ReleaseDoc;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const AUTOSCALED_NOTE: &str = "(autoscaled role, only showing one pod)";

/// cluster, namespace, deploy group, role
type PodKey = (String, String, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    WaitingForCreation,
    WaitingForLive,
    StabilityCheck,
    Success,
    Unstable,
    Timeout,
    Cancelled,
}

impl RolloutState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Unstable | Self::Timeout | Self::Cancelled
        )
    }

    /// Unstable and timed out rollouts are handled the same way downstream
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Unstable | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForCreation => "WAITING_FOR_CREATION",
            Self::WaitingForLive => "WAITING_FOR_LIVE",
            Self::StabilityCheck => "STABILITY_CHECK",
            Self::Success => "SUCCESS",
            Self::Unstable => "UNSTABLE",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one status slot of one doc, recomputed every tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseStatus {
    pub role: String,
    pub deploy_group: String,
    pub pod: Option<PodSnapshot>,
    pub live: bool,
    /// Waiting longer will not help
    pub stop: bool,
    pub details: String,
}

impl ReleaseStatus {
    fn new(doc: &ReleaseDoc, pod: Option<PodSnapshot>, live: bool, stop: bool, details: impl Into<String>) -> Self {
        Self {
            role: doc.role.clone(),
            deploy_group: doc.deploy_group.name.clone(),
            pod,
            live,
            stop,
            details: details.into(),
        }
    }

    /// Lower is better: live, then waiting, then stopped
    pub fn rank(&self) -> u8 {
        if self.live {
            0
        } else if self.stop {
            2
        } else {
            1
        }
    }

    pub fn pod_name(&self) -> &str {
        self.pod.as_ref().map_or("-", |p| p.name.as_str())
    }
}

/// Terminal state of a wait plus the statuses of its last tick
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub state: RolloutState,
    pub statuses: Vec<ReleaseStatus>,
}

impl WaitOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RolloutState::Success
    }
}

/// Timing for one wait
#[derive(Debug, Clone, Copy)]
pub struct WaitSettings {
    pub timeout: Duration,
    pub stability_check: Duration,
    pub tick: Duration,
    pub status_print_interval: Duration,
}

impl WaitSettings {
    pub fn from_config(config: &DeployerConfig, prerequisite: bool) -> Self {
        Self {
            timeout: if prerequisite {
                config.wait_for_prerequisites()
            } else {
                config.wait_for_live()
            },
            stability_check: config.stability_check(),
            tick: config.tick(),
            status_print_interval: config.status_print_interval(),
        }
    }
}

pub struct StabilityMonitor<'a> {
    context: &'a ClusterContext,
    output: &'a dyn OutputSink,
}

impl<'a> StabilityMonitor<'a> {
    pub fn new(context: &'a ClusterContext, output: &'a dyn OutputSink) -> Self {
        Self { context, output }
    }

    /// Poll until every pod of `docs` is live (and stays live for the
    /// stability window unless `prerequisite`), or the rollout fails.
    pub async fn wait(
        &self,
        project: &str,
        release_id: u64,
        docs: &[&ReleaseDoc],
        prerequisite: bool,
        settings: WaitSettings,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        if docs.iter().all(|doc| doc.desired_pod_count == 0) {
            self.output.puts("No pods to wait for");
            return Ok(WaitOutcome {
                state: RolloutState::Success,
                statuses: Vec::new(),
            });
        }

        let started = Instant::now();
        let mut stable_since: Option<Instant> = None;
        let mut last_print: Option<Instant> = None;
        let mut state = RolloutState::WaitingForCreation;
        let mut statuses = Vec::new();

        self.output.puts(&format!(
            "Waiting for {} pods to be {}",
            docs.iter().map(|d| d.desired_pod_count).sum::<u32>(),
            if prerequisite { "completed" } else { "live" }
        ));

        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish(RolloutState::Cancelled, statuses, started));
            }

            statuses = self.statuses(project, release_id, docs, prerequisite).await?;
            let next = decide(&statuses, prerequisite, started, &mut stable_since, settings);
            if next != state {
                info!(release_id, from = %state, to = %next, "Rollout state changed");
                if next == RolloutState::StabilityCheck {
                    self.output.puts(&format!(
                        "All pods are live, checking stability for {}s",
                        settings.stability_check.as_secs()
                    ));
                }
                state = next;
            }

            if state.is_terminal() {
                return Ok(self.finish(state, statuses, started));
            }

            let print_due = last_print.map_or(true, |at| at.elapsed() >= settings.status_print_interval);
            if print_due {
                self.print_statuses(&statuses, started);
                last_print = Some(Instant::now());
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Ok(self.finish(RolloutState::Cancelled, statuses, started));
                }
                () = tokio::time::sleep(settings.tick) => {}
            }
        }
    }

    fn finish(&self, state: RolloutState, statuses: Vec<ReleaseStatus>, started: Instant) -> WaitOutcome {
        self.print_statuses(&statuses, started);
        match state {
            RolloutState::Success => self.output.puts("SUCCESS"),
            RolloutState::Unstable => self.output.puts("UNSTABLE, see above for details"),
            RolloutState::Timeout => self.output.puts(&format!(
                "TIMEOUT, pods took too long to get live ({}s)",
                started.elapsed().as_secs()
            )),
            RolloutState::Cancelled => self.output.puts("CANCELLED, stopped waiting"),
            _ => {}
        }
        if state.is_failure() {
            warn!(state = %state, "Rollout did not stabilize");
        }
        WaitOutcome { state, statuses }
    }

    fn print_statuses(&self, statuses: &[ReleaseStatus], started: Instant) {
        if statuses.is_empty() {
            return;
        }
        self.output.puts(&format!(
            "Deploy status after {}s:",
            started.elapsed().as_secs()
        ));
        for status in statuses {
            self.output.puts(&format!(
                "  {} {} {}: {}",
                status.deploy_group,
                status.role,
                status.pod_name(),
                status.details
            ));
        }
    }

    /// One status slot per desired pod of every doc, from a single pod
    /// listing per cluster namespace
    async fn statuses(
        &self,
        project: &str,
        release_id: u64,
        docs: &[&ReleaseDoc],
        prerequisite: bool,
    ) -> Result<Vec<ReleaseStatus>> {
        let selector = format!(
            "{}={project},{}={release_id}",
            labels::PROJECT,
            labels::RELEASE_ID
        );
        let scopes: BTreeSet<(&str, &str)> = docs
            .iter()
            .map(|d| (d.cluster(), d.deploy_group.namespace.as_str()))
            .collect();

        let mut pods: HashMap<PodKey, Vec<PodSnapshot>> = HashMap::new();
        for (cluster, namespace) in scopes {
            let api = self.context.client(cluster).await?;
            for pod in api.list_pods(Some(namespace), &selector).await? {
                let snapshot = PodSnapshot::from(&pod);
                let (Some(group), Some(role)) = (snapshot.deploy_group.clone(), snapshot.role.clone())
                else {
                    continue;
                };
                pods.entry((cluster.to_string(), namespace.to_string(), group, role))
                    .or_default()
                    .push(snapshot);
            }
        }
        for group in pods.values_mut() {
            group.sort_by(|a, b| a.name.cmp(&b.name));
        }
        debug!(release_id, groups = pods.len(), "Fetched pods");

        let mut statuses = Vec::new();
        for doc in docs {
            let key = (
                doc.cluster().to_string(),
                doc.deploy_group.namespace.clone(),
                doc.deploy_group.name.clone(),
                doc.role.clone(),
            );
            let doc_pods = pods.get(&key).map_or(&[][..], Vec::as_slice);
            let mut slots = Vec::with_capacity(doc.desired_pod_count as usize);
            for index in 0..doc.desired_pod_count as usize {
                slots.push(self.classify(doc, doc_pods.get(index), prerequisite).await?);
            }
            if doc.autoscaled {
                if let Some(mut best) = slots.into_iter().min_by_key(ReleaseStatus::rank) {
                    best.details = format!("{} {AUTOSCALED_NOTE}", best.details);
                    statuses.push(best);
                }
            } else {
                statuses.extend(slots);
            }
        }
        Ok(statuses)
    }

    async fn classify(
        &self,
        doc: &ReleaseDoc,
        pod: Option<&PodSnapshot>,
        prerequisite: bool,
    ) -> Result<ReleaseStatus> {
        let Some(pod) = pod else {
            return Ok(ReleaseStatus::new(doc, None, false, false, "Missing"));
        };
        let owned = Some(pod.clone());
        if pod.restarted() {
            return Ok(ReleaseStatus::new(doc, owned, false, true, "Restarted"));
        }
        if pod.failed() {
            return Ok(ReleaseStatus::new(doc, owned, false, true, "Failed"));
        }
        if pod.live(prerequisite) {
            return Ok(ReleaseStatus::new(doc, owned, true, false, "Live"));
        }

        let api = self.context.client(doc.cluster()).await?;
        let events = api
            .list_events(&pod.namespace, &format!("involvedObject.name={}", pod.name))
            .await?;
        if pod.events_indicate_failure(&events) {
            return Ok(ReleaseStatus::new(doc, owned, false, true, "Error"));
        }
        Ok(ReleaseStatus::new(doc, owned, false, false, pod.waiting_detail()))
    }
}

/// State after one tick
fn decide(
    statuses: &[ReleaseStatus],
    prerequisite: bool,
    started: Instant,
    stable_since: &mut Option<Instant>,
    settings: WaitSettings,
) -> RolloutState {
    if statuses.iter().any(|s| s.stop) {
        return RolloutState::Unstable;
    }

    if statuses.iter().any(|s| !s.live) {
        if started.elapsed() >= settings.timeout {
            return RolloutState::Timeout;
        }
        if stable_since.is_some() {
            return RolloutState::Unstable;
        }
        return if statuses.iter().any(|s| s.pod.is_some()) {
            RolloutState::WaitingForLive
        } else {
            RolloutState::WaitingForCreation
        };
    }

    if prerequisite {
        return RolloutState::Success;
    }
    match stable_since {
        None => {
            *stable_since = Some(Instant::now());
            RolloutState::StabilityCheck
        }
        Some(since) if since.elapsed() >= settings.stability_check => RolloutState::Success,
        Some(_) => RolloutState::StabilityCheck,
    }
}
