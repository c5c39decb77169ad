//! Deploy plan: a YAML file describing one rollout for the command line.

use crate::error::{Error, Result};
use crate::executor::DeployOptions;
use crate::release::{
    Build, DeployGroup, DeployGroupRole, DirectoryRoleConfigSource, JsonFileReleaseStore,
    ReleaseRequest, ReleaseStore, Role, StaticBuildResolver,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Release store used when a plan does not name one, relative to the plan
pub const DEFAULT_RELEASE_STORE: &str = ".deployer/releases.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPlan {
    pub project: String,
    pub git_ref: String,
    pub git_sha: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default = "default_rollback")]
    pub rollback: bool,
    #[serde(default)]
    pub blue_green: bool,
    /// Checkout holding the role config files
    pub repository: PathBuf,
    /// JSON file keeping releases between runs, so release ids keep counting up
    #[serde(default = "default_release_store")]
    pub release_store: PathBuf,
    pub roles: Vec<Role>,
    pub deploy_groups: Vec<DeployGroup>,
    pub deploy_group_roles: Vec<DeployGroupRole>,
    #[serde(default)]
    pub builds: Vec<Build>,
}

fn default_rollback() -> bool {
    true
}

fn default_release_store() -> PathBuf {
    PathBuf::from(DEFAULT_RELEASE_STORE)
}

impl DeployPlan {
    /// Load a plan; relative paths are resolved against the plan's directory
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read plan {}: {e}", path.display())))?;
        let mut plan: Self = serde_yaml::from_str(&content)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if plan.repository.is_relative() {
            plan.repository = base.join(&plan.repository);
        }
        if plan.release_store.is_relative() {
            plan.release_store = base.join(&plan.release_store);
        }

        plan.validate()?;
        debug!(path = %path.display(), project = %plan.project, "Loaded deploy plan");
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(Error::Config("plan project must not be empty".to_string()));
        }
        if self.git_sha.trim().is_empty() {
            return Err(Error::Config("plan gitSha must not be empty".to_string()));
        }
        if self.deploy_groups.is_empty() {
            return Err(Error::Config(
                "plan must name at least one deploy group".to_string(),
            ));
        }

        let groups: BTreeSet<&str> = self.deploy_groups.iter().map(|g| g.name.as_str()).collect();
        if groups.len() != self.deploy_groups.len() {
            return Err(Error::Config("deploy group names must be unique".to_string()));
        }
        let unknown: Vec<&str> = self
            .deploy_group_roles
            .iter()
            .map(|dgr| dgr.deploy_group.as_str())
            .filter(|group| !groups.contains(group))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::Config(format!(
                "deployGroupRoles reference unknown deploy groups: {}",
                unknown.join(", ")
            )));
        }
        Ok(())
    }

    pub fn request(&self) -> ReleaseRequest {
        ReleaseRequest {
            project: self.project.clone(),
            git_ref: self.git_ref.clone(),
            git_sha: self.git_sha.clone(),
            job_id: self.job_id.clone(),
            blue_green: self.blue_green,
            roles: self.roles.clone(),
            deploy_groups: self.deploy_groups.clone(),
            deploy_group_roles: self.deploy_group_roles.clone(),
        }
    }

    pub fn options(&self) -> DeployOptions {
        DeployOptions {
            rollback: self.rollback,
        }
    }

    pub fn build_resolver(&self) -> StaticBuildResolver {
        StaticBuildResolver::new(self.builds.clone())
    }

    pub fn config_source(&self) -> DirectoryRoleConfigSource {
        DirectoryRoleConfigSource::new(&self.repository)
    }

    pub fn release_store(&self) -> Arc<dyn ReleaseStore> {
        Arc::new(JsonFileReleaseStore::new(&self.release_store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::Release;
    use chrono::Utc;
    use std::collections::BTreeMap;

    const PLAN: &str = r"
project: shop
gitRef: main
gitSha: abc123
jobId: '7'
blueGreen: true
repository: checkout
releaseStore: state/releases.json
roles:
  - name: web
    configFile: kubernetes/web.yml
  - name: migrate
    configFile: kubernetes/migrate.yml
    prerequisite: true
deployGroups:
  - name: pod1
    cluster: east
    namespace: shop
deployGroupRoles:
  - deployGroup: pod1
    role: web
    replicas: 2
  - deployGroup: pod1
    role: migrate
builds:
  - imageName: shop/web
    reference: shop/web@sha256:1111
";

    #[test]
    fn test_load_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yml");
        std::fs::write(&path, PLAN).unwrap();

        let plan = DeployPlan::from_file(&path).unwrap();
        assert_eq!(plan.repository, dir.path().join("checkout"));
        assert_eq!(plan.release_store, dir.path().join("state/releases.json"));
        assert!(plan.options().rollback);

        let request = plan.request();
        assert!(request.blue_green);
        assert_eq!(request.job_id.as_deref(), Some("7"));
        assert!(request.roles[1].prerequisite);
        assert_eq!(request.deploy_group_roles[0].replicas, 2);
        assert_eq!(request.deploy_group_roles[1].replicas, 1);
    }

    #[tokio::test]
    async fn test_default_release_store_persists_ids_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yml");
        std::fs::write(&path, PLAN.replace("releaseStore: state/releases.json\n", "")).unwrap();

        let plan = DeployPlan::from_file(&path).unwrap();
        assert_eq!(plan.release_store, dir.path().join(DEFAULT_RELEASE_STORE));

        let first_run = plan.release_store();
        assert_eq!(first_run.next_id().await.unwrap(), 1);
        first_run
            .create(&Release {
                id: 1,
                project: plan.project.clone(),
                git_ref: plan.git_ref.clone(),
                git_sha: plan.git_sha.clone(),
                job_id: None,
                blue_green_color: None,
                created_at: Utc::now(),
                docs: vec![],
                role_templates: BTreeMap::new(),
            })
            .await
            .unwrap();

        let second_run = DeployPlan::from_file(&path).unwrap().release_store();
        assert_eq!(second_run.next_id().await.unwrap(), 2);
    }

    #[test]
    fn test_unknown_deploy_group_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yml");
        std::fs::write(&path, PLAN.replace("deployGroup: pod1\n    role: web", "deployGroup: pod9\n    role: web")).unwrap();

        let err = DeployPlan::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("pod9"));
    }

    #[test]
    fn test_missing_plan_file() {
        assert!(matches!(
            DeployPlan::from_file("/nonexistent/plan.yml"),
            Err(Error::Config(_))
        ));
    }
}
