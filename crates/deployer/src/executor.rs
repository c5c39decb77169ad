//! Deploy executor: sequences one rollout from assembly to verdict.
//!
//! assemble → validate → persist → deploy prerequisites → wait → deploy
//! remaining roles → wait → blue/green finalize or diagnostics + rollback.

use crate::applier::ResourceApplier;
use crate::blue_green::BlueGreenFinalizer;
use crate::config::DeployerConfig;
use crate::diagnostics::FailureDiagnostics;
use crate::error::Result;
use crate::kubernetes::{ClusterConnector, ClusterContext};
use crate::monitor::{RolloutState, StabilityMonitor, WaitSettings};
use crate::output::{OutputSink, StdoutSink};
use crate::release::{
    BuildResolver, Release, ReleaseBuilder, ReleaseDoc, ReleaseRequest, ReleaseStore,
    RoleConfigSource,
};
use crate::reporter::{ErrorReporter, TracingReporter};
use crate::rollback::RollbackManager;
use crate::validator::TemplateValidator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// How a rollout ended. Failure is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl DeployOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rollout policy chosen by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployOptions {
    /// Revert or delete the batch when it does not stabilize
    pub rollback: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self { rollback: true }
    }
}

pub struct DeployExecutor {
    config: DeployerConfig,
    connector: Arc<dyn ClusterConnector>,
    store: Arc<dyn ReleaseStore>,
    config_source: Arc<dyn RoleConfigSource>,
    build_resolver: Arc<dyn BuildResolver>,
    output: Arc<dyn OutputSink>,
    reporter: Arc<dyn ErrorReporter>,
}

impl DeployExecutor {
    pub fn new(
        config: DeployerConfig,
        connector: Arc<dyn ClusterConnector>,
        store: Arc<dyn ReleaseStore>,
        config_source: Arc<dyn RoleConfigSource>,
        build_resolver: Arc<dyn BuildResolver>,
    ) -> Self {
        Self {
            config,
            connector,
            store,
            config_source,
            build_resolver,
            output: Arc::new(StdoutSink),
            reporter: Arc::new(TracingReporter),
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run one rollout. Errors are reserved for problems that stop the
    /// rollout before or while touching the cluster; an unstable rollout is
    /// `Ok(DeployOutcome::Failed)`.
    #[instrument(skip(self, request, cancel), fields(project = %request.project, git_ref = %request.git_ref))]
    pub async fn execute(
        &self,
        request: &ReleaseRequest,
        options: DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome> {
        let output = self.output.as_ref();
        let builder = ReleaseBuilder::new(
            self.config_source.as_ref(),
            self.build_resolver.as_ref(),
            self.store.as_ref(),
        );

        output.puts(&format!(
            "Creating release for {} at {} ({})",
            request.project, request.git_ref, request.git_sha
        ));
        let release = builder.assemble(request).await?;
        TemplateValidator::new(&request.deploy_group_roles)?.validate(&release)?;
        builder.persist(&release).await?;
        if let Some(color) = release.blue_green_color {
            output.puts(&format!("Deploying {color} resources"));
        }

        let context = ClusterContext::new(Arc::clone(&self.connector));
        context.warm(release.clusters()).await?;

        let (prerequisites, roles): (Vec<&ReleaseDoc>, Vec<&ReleaseDoc>) =
            release.docs.iter().partition(|doc| doc.prerequisite);

        if !prerequisites.is_empty() {
            output.puts("First deploying prerequisite roles");
            let outcome = self
                .deploy_and_wait(&context, &release, &prerequisites, true, options, cancel)
                .await?;
            if outcome != DeployOutcome::Succeeded {
                return Ok(log_outcome(&release, outcome));
            }
            output.puts("Now deploying other roles");
        }

        let outcome = self
            .deploy_and_wait(&context, &release, &roles, false, options, cancel)
            .await?;
        if outcome == DeployOutcome::Succeeded {
            let all_docs: Vec<&ReleaseDoc> = release.docs.iter().collect();
            BlueGreenFinalizer::new(&context, output, self.store.as_ref())
                .finalize(&release, &all_docs)
                .await?;
            self.store.mark_succeeded(release.id).await?;
        }
        Ok(log_outcome(&release, outcome))
    }

    async fn deploy_and_wait(
        &self,
        context: &ClusterContext,
        release: &Release,
        docs: &[&ReleaseDoc],
        prerequisite: bool,
        options: DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome> {
        if cancel.is_cancelled() {
            return Ok(DeployOutcome::Cancelled);
        }
        let output = self.output.as_ref();

        let applied = ResourceApplier::new(context, output, self.config.concurrency)
            .deploy(docs)
            .await?;

        let wait = StabilityMonitor::new(context, output)
            .wait(
                &release.project,
                release.id,
                docs,
                prerequisite,
                WaitSettings::from_config(&self.config, prerequisite),
                cancel,
            )
            .await?;

        match wait.state {
            RolloutState::Success => Ok(DeployOutcome::Succeeded),
            RolloutState::Cancelled => Ok(DeployOutcome::Cancelled),
            _ => {
                FailureDiagnostics::new(context, output, self.reporter.as_ref(), &self.config)
                    .print(docs, &applied, &wait.statuses)
                    .await;
                if options.rollback {
                    RollbackManager::new(context, output, self.reporter.as_ref())
                        .rollback(docs, &applied)
                        .await;
                } else {
                    output.puts("Rollback disabled, leaving resources in place");
                }
                Ok(DeployOutcome::Failed)
            }
        }
    }
}

fn log_outcome(release: &Release, outcome: DeployOutcome) -> DeployOutcome {
    match outcome {
        DeployOutcome::Succeeded => info!(release_id = release.id, "✅ Rollout succeeded"),
        DeployOutcome::Failed => warn!(release_id = release.id, "❌ Rollout failed"),
        DeployOutcome::Cancelled => info!(release_id = release.id, "🛑 Rollout cancelled"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kubernetes::StaticConnector;
    use crate::output::BufferSink;
    use crate::release::{
        Build, DeployGroup, DeployGroupRole, InMemoryReleaseStore, Role,
        StaticBuildResolver,
    };
    use crate::reporter::RecordingReporter;
    use crate::testing::{pod, FakeCluster};
    use async_trait::async_trait;
    use std::collections::HashMap;

    const WEB: &str = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  labels: {project: shop, role: web}
spec:
  selector:
    matchLabels: {project: shop, role: web}
  template:
    metadata:
      labels: {project: shop, role: web}
    spec:
      containers:
      - name: app
        image: shop/web:latest
";

    const MIGRATE: &str = "apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  labels: {project: shop, role: migrate}
spec:
  template:
    metadata:
      labels: {project: shop, role: migrate}
    spec:
      restartPolicy: Never
      containers:
      - name: migrate
        image: shop/web:latest
";

    struct MapSource(HashMap<String, String>);

    #[async_trait]
    impl RoleConfigSource for MapSource {
        async fn list_files(&self, _git_sha: &str) -> Result<Vec<String>> {
            Ok(self.0.keys().cloned().collect())
        }

        async fn read(&self, _git_sha: &str, path: &str) -> Result<Option<String>> {
            Ok(self.0.get(path).cloned())
        }
    }

    struct Fixture {
        cluster: FakeCluster,
        sink: BufferSink,
        reporter: RecordingReporter,
        store: Arc<InMemoryReleaseStore>,
        executor: DeployExecutor,
    }

    fn fixture(with_migrate: bool) -> Fixture {
        let mut files = HashMap::from([("kubernetes/web.yml".to_string(), WEB.to_string())]);
        if with_migrate {
            files.insert("kubernetes/migrate.yml".to_string(), MIGRATE.to_string());
        }
        fixture_with(files)
    }

    fn fixture_with(files: HashMap<String, String>) -> Fixture {
        let cluster = FakeCluster::new();
        let sink = BufferSink::new();
        let reporter = RecordingReporter::new();
        let store = Arc::new(InMemoryReleaseStore::new());
        let executor = DeployExecutor::new(
            DeployerConfig::default(),
            Arc::new(StaticConnector::new().with_cluster("east", Arc::new(cluster.clone()))),
            store.clone(),
            Arc::new(MapSource(files)),
            Arc::new(StaticBuildResolver::new(vec![Build {
                image_name: "shop/web".to_string(),
                reference: "shop/web@sha256:1111".to_string(),
                git_sha: None,
            }])),
        )
        .with_output(Arc::new(sink.clone()))
        .with_reporter(Arc::new(reporter.clone()));
        Fixture {
            cluster,
            sink,
            reporter,
            store,
            executor,
        }
    }

    fn request(with_migrate: bool) -> ReleaseRequest {
        let role = |name: &str, prerequisite| Role {
            name: name.to_string(),
            config_file: format!("kubernetes/{name}.yml"),
            prerequisite,
            autoscaled: false,
        };
        let wire = |role: &str| DeployGroupRole {
            deploy_group: "pod1".to_string(),
            role: role.to_string(),
            replicas: 1,
            delete_resource: false,
        };
        let mut request = ReleaseRequest {
            project: "shop".to_string(),
            git_ref: "main".to_string(),
            git_sha: "abc123".to_string(),
            job_id: None,
            blue_green: false,
            roles: vec![role("web", false)],
            deploy_groups: vec![DeployGroup {
                name: "pod1".to_string(),
                cluster: "east".to_string(),
                namespace: "default".to_string(),
            }],
            deploy_group_roles: vec![wire("web")],
        };
        if with_migrate {
            request.roles.push(role("migrate", true));
            request.deploy_group_roles.push(wire("migrate"));
        }
        request
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_rollout_marks_release_succeeded() {
        let f = fixture(false);
        f.cluster
            .set_pods(vec![pod("web-1", "web", "pod1").running().ready().build()]);

        let outcome = f
            .executor
            .execute(&request(false), DeployOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Succeeded);
        assert_eq!(f.cluster.applied_names(), vec!["web"]);
        assert_eq!(
            f.store.previous_succeeded("shop", 99).await.unwrap().unwrap().id,
            1
        );
        assert!(f.sink.contains("SUCCESS"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prerequisites_deploy_first() {
        let f = fixture(true);
        f.cluster.set_pods(vec![
            pod("migrate-1", "migrate", "pod1").succeeded().build(),
            pod("web-1", "web", "pod1").running().ready().build(),
        ]);

        let outcome = f
            .executor
            .execute(&request(true), DeployOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Succeeded);
        assert_eq!(f.cluster.applied_names(), vec!["migrate", "web"]);
        assert!(f.sink.contains("First deploying prerequisite roles"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_prerequisite_stops_rollout() {
        let f = fixture(true);
        f.cluster
            .set_pods(vec![pod("migrate-1", "migrate", "pod1").failed().build()]);

        let outcome = f
            .executor
            .execute(&request(true), DeployOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Failed);
        assert_eq!(f.cluster.applied_names(), vec!["migrate"]);
        assert_eq!(f.cluster.deleted_names(), vec!["migrate"]);
        assert!(f.store.previous_succeeded("shop", 99).await.unwrap().is_none());
        assert!(f.reporter.reported().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_can_be_disabled() {
        let f = fixture(false);
        f.cluster
            .set_pods(vec![pod("web-1", "web", "pod1").running().restarts(3).build()]);

        let outcome = f
            .executor
            .execute(&request(false), DeployOptions { rollback: false }, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Failed);
        assert!(f.cluster.deleted().is_empty());
        assert!(f.sink.contains("Debug:"));
        assert!(f.sink.contains("Rollback disabled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_rollout_skips_diagnostics_and_rollback() {
        let f = fixture(false);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let outcome = f
            .executor
            .execute(&request(false), DeployOptions::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Cancelled);
        assert!(!f.sink.contains("Debug:"));
        assert!(f.cluster.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_creates_nothing() {
        let service = "---
apiVersion: v1
kind: Service
metadata:
  name: web
  labels: {project: shop, role: web}
spec:
  selector: {role: web}
";
        let f = fixture_with(HashMap::from([(
            "kubernetes/web.yml".to_string(),
            format!("{WEB}{service}"),
        )]));

        let err = f
            .executor
            .execute(&request(false), DeployOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::User(_)));
        assert!(err
            .to_string()
            .contains("Service selectors missing labels: project in Service web in pod1 web"));
        assert!(f.cluster.applied().is_empty());
        assert_eq!(f.store.next_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mislabelled_role_config_is_rejected_before_fill_hides_it() {
        let mislabelled = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  labels: {role: api}
spec:
  selector:
    matchLabels: {app: web}
  template:
    metadata:
      labels: {app: web}
    spec:
      containers:
      - name: app
        image: shop/web:latest
";
        let f = fixture_with(HashMap::from([(
            "kubernetes/web.yml".to_string(),
            mislabelled.to_string(),
        )]));

        let err = f
            .executor
            .execute(&request(false), DeployOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::User(_)));
        let message = err.to_string();
        assert!(message.contains("Missing labels: project on Deployment web of role web"));
        assert!(message.contains("role on pod template of Deployment web of role web"));
        assert!(message.contains("Mismatched labels: role=api on Deployment web of role web, expected web"));
        assert!(f.cluster.applied().is_empty());
        assert_eq!(f.store.next_id().await.unwrap(), 1);
    }
}
