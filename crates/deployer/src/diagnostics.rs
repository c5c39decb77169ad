//! Explains a failed rollout: resource events, then events and logs of the
//! worst pod of each role. Nothing in here aborts the rollout; errors are
//! reported and printed inline.

use crate::applier::AppliedDoc;
use crate::config::DeployerConfig;
use crate::error::Error;
use crate::kubernetes::{ClusterContext, PodSnapshot, Resource};
use crate::monitor::ReleaseStatus;
use crate::output::OutputSink;
use crate::parallel::parallel_map;
use crate::release::ReleaseDoc;
use crate::reporter::{ErrorReporter, ReportedError};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use std::time::Duration;
use tracing::{debug, warn};

/// Events sharing a reason and message, collapsed into one line
#[derive(Debug, Clone, PartialEq, Eq)]
struct EventSummary {
    type_: String,
    reason: String,
    message: String,
    count: i32,
    last_seen: Option<DateTime<Utc>>,
}

fn summarize_events(events: &[Event]) -> Vec<EventSummary> {
    let mut summaries: Vec<EventSummary> = Vec::new();
    for event in events {
        let reason = event.reason.clone().unwrap_or_default();
        let message = event.message.clone().unwrap_or_default();
        let count = event.count.unwrap_or(1).max(1);
        let seen = event
            .last_timestamp
            .as_ref()
            .map(|t| t.0)
            .or_else(|| event.event_time.as_ref().map(|t| t.0));

        if let Some(existing) = summaries
            .iter_mut()
            .find(|s| s.reason == reason && s.message == message)
        {
            existing.count += count;
            existing.last_seen = existing.last_seen.max(seen);
        } else {
            summaries.push(EventSummary {
                type_: event.type_.clone().unwrap_or_else(|| "Normal".to_string()),
                reason,
                message,
                count,
                last_seen: seen,
            });
        }
    }
    summaries.sort_by_key(|s| s.last_seen);
    summaries
}

/// First and last `budget / 2` lines around a `...` marker when over budget
pub fn truncate_log(log: &str, budget: usize) -> Vec<String> {
    let lines: Vec<&str> = log.lines().collect();
    if lines.len() <= budget {
        return lines.into_iter().map(str::to_string).collect();
    }
    let half = budget / 2;
    lines[..half]
        .iter()
        .map(|l| (*l).to_string())
        .chain(std::iter::once("...".to_string()))
        .chain(lines[lines.len() - half..].iter().map(|l| (*l).to_string()))
        .collect()
}

pub struct FailureDiagnostics<'a> {
    context: &'a ClusterContext,
    output: &'a dyn OutputSink,
    reporter: &'a dyn ErrorReporter,
    log_lines: usize,
    log_timeout: Duration,
    concurrency: usize,
}

impl<'a> FailureDiagnostics<'a> {
    pub fn new(
        context: &'a ClusterContext,
        output: &'a dyn OutputSink,
        reporter: &'a dyn ErrorReporter,
        config: &DeployerConfig,
    ) -> Self {
        Self {
            context,
            output,
            reporter,
            log_lines: config.log_lines,
            log_timeout: config.log_timeout(),
            concurrency: config.concurrency,
        }
    }

    /// Print everything known about why `docs` did not stabilize
    pub async fn print(&self, docs: &[&ReleaseDoc], applied: &[AppliedDoc], statuses: &[ReleaseStatus]) {
        self.output.puts("");
        self.output.puts("Debug:");

        // (doc, resource index, uid) of every resource that exists on the cluster
        let targets: Vec<(&ReleaseDoc, usize, Option<String>)> = docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| !doc.delete_resource)
            .flat_map(|(d, doc)| {
                let applied = applied.get(d);
                (0..doc.resources.len()).map(move |r| {
                    (*doc, r, applied.and_then(|a| a.uid(r)).map(str::to_string))
                })
            })
            .collect();

        let this = self;
        let fetched = parallel_map(&targets, self.concurrency, move |(doc, r, uid)| {
            let doc: &ReleaseDoc = *doc;
            let resource = &doc.resources[*r];
            let uid = uid.clone();
            async move { this.resource_events(resource, uid.as_deref()).await }
        })
        .await;
        for ((doc, r, _), events) in targets.iter().zip(fetched) {
            let resource = &doc.resources[*r];
            match events {
                Ok(events) if events.is_empty() => {}
                Ok(events) => {
                    self.output.puts(&format!(
                        "Events for {} {} {}:",
                        doc.label(),
                        resource.kind,
                        resource.name()
                    ));
                    self.print_events(&events);
                }
                Err(err) => self.swallow(
                    &format!("fetching events of {}", resource.identity),
                    &err,
                    doc,
                ),
            }
        }

        for status in worst_per_role(statuses) {
            if let Some(pod) = &status.pod {
                self.print_pod(status, pod, docs).await;
            }
        }
    }

    async fn resource_events(&self, resource: &Resource, uid: Option<&str>) -> Result<Vec<Event>, Error> {
        let api = self.context.client(&resource.cluster).await?;
        let mut selector = format!("involvedObject.name={}", resource.name());
        if let Some(uid) = uid {
            selector.push_str(&format!(",involvedObject.uid={uid}"));
        }
        api.list_events(resource.namespace().unwrap_or("default"), &selector)
            .await
    }

    async fn print_pod(&self, status: &ReleaseStatus, pod: &PodSnapshot, docs: &[&ReleaseDoc]) {
        let Some(doc) = docs
            .iter()
            .find(|d| d.role == status.role && d.deploy_group.name == status.deploy_group)
        else {
            return;
        };
        self.output.puts(&format!(
            "Pod {} of {} ({}):",
            pod.name,
            doc.label(),
            status.details
        ));

        let api = match self.context.client(doc.cluster()).await {
            Ok(api) => api,
            Err(err) => {
                self.swallow(&format!("connecting for pod {}", pod.name), &err, doc);
                return;
            }
        };

        match api
            .list_events(&pod.namespace, &format!("involvedObject.name={}", pod.name))
            .await
        {
            Ok(events) if events.is_empty() => {}
            Ok(events) => {
                self.output.puts("  EVENTS:");
                self.print_events(&events);
            }
            Err(err) => self.swallow(&format!("fetching events of pod {}", pod.name), &err, doc),
        }

        for (container, previous) in pod.containers_for_logs() {
            let fetch = api.pod_logs(&pod.namespace, &pod.name, container, previous);
            let heading = if previous {
                format!("  LOGS for {container} (previous instance):")
            } else {
                format!("  LOGS for {container}:")
            };
            match tokio::time::timeout(self.log_timeout, fetch).await {
                Ok(Ok(logs)) => {
                    self.output.puts(&heading);
                    if logs.trim().is_empty() {
                        self.output.puts("    No logs found");
                    }
                    for line in truncate_log(&logs, self.log_lines) {
                        self.output.puts(&format!("    {line}"));
                    }
                }
                Ok(Err(err)) => self.swallow(
                    &format!("fetching logs of {}/{container}", pod.name),
                    &err,
                    doc,
                ),
                Err(_) => {
                    let err = Error::ClusterTransient {
                        operation: "pod logs".to_string(),
                        message: format!("no response within {}s", self.log_timeout.as_secs()),
                    };
                    self.swallow(&format!("fetching logs of {}/{container}", pod.name), &err, doc);
                }
            }
        }
        debug!(pod = %pod.name, "Printed pod diagnostics");
    }

    fn print_events(&self, events: &[Event]) {
        for summary in summarize_events(events) {
            self.output.puts(&format!(
                "  {} {}: {} (x{})",
                summary.type_, summary.reason, summary.message, summary.count
            ));
        }
    }

    fn swallow(&self, action: &str, err: &Error, doc: &ReleaseDoc) {
        warn!(error = %err, action, "Diagnostics failed");
        self.output.puts(&format!("  Error {action}: {err}"));
        self.reporter.report(
            ReportedError::new(format!("Diagnostics failed {action}: {err}"))
                .with_context("role", doc.role.clone())
                .with_context("deploy_group", doc.deploy_group.name.clone()),
        );
    }
}

/// Least live status of each role, in order of first appearance
fn worst_per_role(statuses: &[ReleaseStatus]) -> Vec<&ReleaseStatus> {
    let mut worst: Vec<&ReleaseStatus> = Vec::new();
    for status in statuses {
        match worst.iter_mut().find(|w| w.role == status.role) {
            Some(current) if status.rank() > current.rank() => *current = status,
            Some(_) => {}
            None => worst.push(status),
        }
    }
    worst.retain(|s| !s.live);
    worst
}
