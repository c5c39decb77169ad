//! Reverts a batch of release docs after an unstable rollout.

use crate::applier::AppliedDoc;
use crate::error::Result;
use crate::kubernetes::ClusterContext;
use crate::output::OutputSink;
use crate::release::ReleaseDoc;
use crate::reporter::{ErrorReporter, ReportedError};
use tracing::{info, warn};

pub struct RollbackManager<'a> {
    context: &'a ClusterContext,
    output: &'a dyn OutputSink,
    reporter: &'a dyn ErrorReporter,
}

impl<'a> RollbackManager<'a> {
    pub fn new(
        context: &'a ClusterContext,
        output: &'a dyn OutputSink,
        reporter: &'a dyn ErrorReporter,
    ) -> Self {
        Self {
            context,
            output,
            reporter,
        }
    }

    /// Roll back every doc of the batch; a failing doc does not stop the others.
    /// Returns how many docs could not be rolled back.
    pub async fn rollback(&self, docs: &[&ReleaseDoc], applied: &[AppliedDoc]) -> usize {
        self.output.puts("");
        self.output.puts("Rolling back");
        let mut failures = 0;
        for (index, doc) in docs.iter().enumerate() {
            let empty = AppliedDoc::default();
            let applied = applied.get(index).unwrap_or(&empty);
            if let Err(err) = self.rollback_doc(doc, applied).await {
                failures += 1;
                warn!(doc = %doc.label(), error = %err, "Rollback failed");
                self.output.puts(&format!("FAILED: {err}"));
                self.reporter.report(
                    ReportedError::new(format!("Rollback of {} failed: {err}", doc.label()))
                        .with_context("role", doc.role.clone())
                        .with_context("deploy_group", doc.deploy_group.name.clone()),
                );
            }
        }
        info!(docs = docs.len(), failures, "↩️ Rollback finished");
        failures
    }

    async fn rollback_doc(&self, doc: &ReleaseDoc, applied: &AppliedDoc) -> Result<()> {
        let api = self.context.client(doc.cluster()).await?;

        if doc.delete_resource {
            self.output
                .puts(&format!("Not restoring deleted resources of {}", doc.label()));
            return Ok(());
        }

        if let Some(color) = doc.blue_green_color {
            self.output
                .puts(&format!("Deleting {color} resources for {}", doc.label()));
            for resource in doc.non_services() {
                resource.delete(api.as_ref()).await?;
            }
            return Ok(());
        }

        for (index, resource) in doc.resources.iter().enumerate() {
            match applied.previous(index) {
                Some(_) => self.output.puts(&format!(
                    "Rolling back {} {} for {}",
                    resource.kind,
                    resource.name(),
                    doc.label()
                )),
                None => self.output.puts(&format!(
                    "Deleting {} {} for {}",
                    resource.kind,
                    resource.name(),
                    doc.label()
                )),
            }
            resource.revert(api.as_ref(), applied.previous(index)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::{Resource, StaticConnector};
    use crate::output::BufferSink;
    use crate::release::{Color, DeployGroup};
    use crate::reporter::RecordingReporter;
    use crate::testing::FakeCluster;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(role: &str, color: Option<Color>) -> ReleaseDoc {
        let name = match color {
            Some(c) => format!("{role}-{c}"),
            None => role.to_string(),
        };
        ReleaseDoc {
            role: role.to_string(),
            deploy_group: DeployGroup {
                name: "pod1".to_string(),
                cluster: "east".to_string(),
                namespace: "prod".to_string(),
            },
            desired_pod_count: 1,
            prerequisite: false,
            autoscaled: false,
            delete_resource: false,
            blue_green_color: color,
            resources: vec![
                Resource::from_manifest(
                    "east",
                    json!({
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "metadata": { "name": name, "namespace": "prod" },
                        "spec": { "replicas": 2 }
                    }),
                )
                .unwrap(),
                Resource::from_manifest(
                    "east",
                    json!({
                        "apiVersion": "v1",
                        "kind": "Service",
                        "metadata": { "name": role, "namespace": "prod" }
                    }),
                )
                .unwrap(),
            ],
        }
    }

    struct Setup {
        cluster: FakeCluster,
        context: ClusterContext,
        sink: BufferSink,
        reporter: RecordingReporter,
    }

    fn setup() -> Setup {
        let cluster = FakeCluster::new();
        let context = ClusterContext::new(Arc::new(
            StaticConnector::new().with_cluster("east", Arc::new(cluster.clone())),
        ));
        Setup {
            cluster,
            context,
            sink: BufferSink::new(),
            reporter: RecordingReporter::new(),
        }
    }

    #[tokio::test]
    async fn test_restores_previous_and_deletes_new() {
        let s = setup();
        let web = doc("web", None);
        let api = s.context.client("east").await.unwrap();

        let mut old_deployment = web.resources[0].manifest.clone();
        old_deployment["spec"]["replicas"] = json!(5);
        s.cluster.seed(old_deployment);
        let applied = AppliedDoc {
            resources: vec![
                Some(web.resources[0].deploy(api.as_ref()).await.unwrap()),
                Some(web.resources[1].deploy(api.as_ref()).await.unwrap()),
            ],
        };

        let failures = RollbackManager::new(&s.context, &s.sink, &s.reporter)
            .rollback(&[&web], &[applied])
            .await;

        assert_eq!(failures, 0);
        let restored = s.cluster.object("Deployment", "prod", "web").unwrap();
        assert_eq!(restored["spec"]["replicas"], 5);
        assert!(s.cluster.object("Service", "prod", "web").is_none());
        assert!(s.sink.contains("Rolling back Deployment web for pod1 web"));
        assert!(s.sink.contains("Deleting Service web for pod1 web"));
    }

    #[tokio::test]
    async fn test_blue_green_deletes_only_non_services() {
        let s = setup();
        let green = doc("web", Some(Color::Green));
        for resource in &green.resources {
            s.cluster.seed(resource.manifest.clone());
        }

        RollbackManager::new(&s.context, &s.sink, &s.reporter)
            .rollback(&[&green], &[AppliedDoc::default()])
            .await;

        assert_eq!(s.cluster.deleted_names(), vec!["web-green"]);
        assert!(s.cluster.object("Service", "prod", "web").is_some());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_remaining_docs() {
        let s = setup();
        s.cluster.fail_delete_of("api");
        let docs = [doc("api", None), doc("web", None), doc("worker", None)];
        let refs: Vec<&ReleaseDoc> = docs.iter().collect();

        let failures = RollbackManager::new(&s.context, &s.sink, &s.reporter)
            .rollback(&refs, &[])
            .await;

        assert_eq!(failures, 1);
        let deleted = s.cluster.deleted_names();
        assert!(deleted.contains(&"web".to_string()));
        assert!(deleted.contains(&"worker".to_string()));
        assert!(s.sink.contains("FAILED:"));
        assert_eq!(s.reporter.reported().len(), 1);
        assert_eq!(s.reporter.reported()[0].context["role"], "api");
    }
}
