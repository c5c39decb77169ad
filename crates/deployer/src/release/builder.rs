//! Assembles a Release from role configuration, deploy-group wiring and builds.

use super::model::{Build, Color, DeployGroup, DeployGroupRole, Release, ReleaseDoc, Role};
use super::store::ReleaseStore;
use super::template::{self, TemplateContext};
use crate::error::{Error, Result};
use crate::kubernetes::Resource;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Image requested for a commit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BuildSelector {
    pub image_name: String,
    pub git_sha: String,
}

/// Turns image selectors into successful builds
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BuildResolver: Send + Sync {
    async fn ensure_successful_builds(&self, selectors: &[BuildSelector]) -> Result<Vec<Build>>;
}

/// Builds known ahead of time, e.g. listed in a deploy plan
#[derive(Debug, Clone, Default)]
pub struct StaticBuildResolver {
    builds: Vec<Build>,
}

impl StaticBuildResolver {
    pub fn new(builds: Vec<Build>) -> Self {
        Self { builds }
    }
}

#[async_trait]
impl BuildResolver for StaticBuildResolver {
    async fn ensure_successful_builds(&self, selectors: &[BuildSelector]) -> Result<Vec<Build>> {
        let mut resolved = Vec::with_capacity(selectors.len());
        let mut missing = Vec::new();
        for selector in selectors {
            let found = self.builds.iter().find(|b| {
                b.image_name == selector.image_name
                    && b.git_sha.as_ref().map_or(true, |sha| *sha == selector.git_sha)
            });
            match found {
                Some(build) => resolved.push(build.clone()),
                None => missing.push(selector.image_name.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::user(format!(
                "Could not find successful builds for images: {}",
                missing.join(", ")
            )));
        }
        Ok(resolved)
    }
}

/// Role configuration files of a repository at a commit
#[async_trait]
pub trait RoleConfigSource: Send + Sync {
    async fn list_files(&self, git_sha: &str) -> Result<Vec<String>>;

    async fn read(&self, git_sha: &str, path: &str) -> Result<Option<String>>;
}

/// Reads role configs from a checked-out working tree; the commit is ignored
pub struct DirectoryRoleConfigSource {
    root: PathBuf,
}

impl DirectoryRoleConfigSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn walk(&self, dir: PathBuf, files: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RoleConfigSource for DirectoryRoleConfigSource {
    async fn list_files(&self, _git_sha: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        self.walk(self.root.clone(), &mut files).await?;
        files.sort();
        Ok(files)
    }

    async fn read(&self, _git_sha: &str, path: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.root.join(path)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// What an operator asked to roll out
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub project: String,
    pub git_ref: String,
    pub git_sha: String,
    pub job_id: Option<String>,
    pub blue_green: bool,
    pub roles: Vec<Role>,
    pub deploy_groups: Vec<DeployGroup>,
    pub deploy_group_roles: Vec<DeployGroupRole>,
}

impl ReleaseRequest {
    fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    fn roles_of(&self, deploy_group: &str) -> impl Iterator<Item = &DeployGroupRole> {
        let deploy_group = deploy_group.to_string();
        self.deploy_group_roles
            .iter()
            .filter(move |dgr| dgr.deploy_group == deploy_group)
    }
}

pub struct ReleaseBuilder<'a> {
    config_source: &'a dyn RoleConfigSource,
    build_resolver: &'a dyn BuildResolver,
    store: &'a dyn ReleaseStore,
}

impl<'a> ReleaseBuilder<'a> {
    pub fn new(
        config_source: &'a dyn RoleConfigSource,
        build_resolver: &'a dyn BuildResolver,
        store: &'a dyn ReleaseStore,
    ) -> Self {
        Self {
            config_source,
            build_resolver,
            store,
        }
    }

    /// Build the release without persisting it
    pub async fn assemble(&self, request: &ReleaseRequest) -> Result<Release> {
        let files: BTreeSet<String> = self
            .config_source
            .list_files(&request.git_sha)
            .await?
            .into_iter()
            .collect();
        verify_role_files(request, &files)?;

        let wired_roles: BTreeSet<&str> = request
            .deploy_group_roles
            .iter()
            .map(|dgr| dgr.role.as_str())
            .collect();

        let mut role_elements: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        let mut role_builds: BTreeMap<&str, Vec<Build>> = BTreeMap::new();
        for role_name in wired_roles {
            let role = request
                .role(role_name)
                .ok_or_else(|| Error::user(format!("Unknown role {role_name}")))?;
            let content = self
                .config_source
                .read(&request.git_sha, &role.config_file)
                .await?
                .ok_or_else(|| {
                    Error::user(format!(
                        "Role config file {} for role {role_name} not found",
                        role.config_file
                    ))
                })?;
            let elements = template::parse_role_config(&content).map_err(|e| {
                Error::user(format!("Invalid role config {}: {e}", role.config_file))
            })?;

            let selectors: Vec<BuildSelector> = template::image_names(&elements)
                .into_iter()
                .map(|image_name| BuildSelector {
                    image_name,
                    git_sha: request.git_sha.clone(),
                })
                .collect();
            let builds = if selectors.is_empty() {
                Vec::new()
            } else {
                self.build_resolver
                    .ensure_successful_builds(&selectors)
                    .await?
            };
            debug!(role = role_name, elements = elements.len(), builds = builds.len(), "Resolved role");
            role_elements.insert(role_name, elements);
            role_builds.insert(role_name, builds);
        }

        let id = self.store.next_id().await?;
        let blue_green_color = if request.blue_green {
            let previous = self.store.previous_succeeded(&request.project, id).await?;
            Some(
                previous
                    .and_then(|r| r.blue_green_color)
                    .map_or(Color::Blue, Color::other),
            )
        } else {
            None
        };

        let mut docs = Vec::new();
        for deploy_group in &request.deploy_groups {
            for dgr in request.roles_of(&deploy_group.name) {
                let Some(role) = request.role(&dgr.role) else {
                    continue;
                };
                let elements = role_elements.get(role.name.as_str()).map_or(&[][..], Vec::as_slice);
                let builds = role_builds.get(role.name.as_str()).map_or(&[][..], Vec::as_slice);
                let context = TemplateContext {
                    project: &request.project,
                    release_id: id,
                    role,
                    deploy_group,
                    deploy_group_role: dgr,
                    builds,
                    color: blue_green_color,
                };
                let filled = context.fill(elements)?;
                let desired_pod_count = template::desired_pod_count(&filled, dgr);
                let resources = filled
                    .into_iter()
                    .map(|manifest| Resource::from_manifest(&deploy_group.cluster, manifest))
                    .collect::<Result<Vec<_>>>()?;
                docs.push(ReleaseDoc {
                    role: role.name.clone(),
                    deploy_group: deploy_group.clone(),
                    desired_pod_count,
                    prerequisite: role.prerequisite,
                    autoscaled: role.autoscaled,
                    delete_resource: dgr.delete_resource,
                    blue_green_color,
                    resources,
                });
            }
        }

        Ok(Release {
            id,
            project: request.project.clone(),
            git_ref: request.git_ref.clone(),
            git_sha: request.git_sha.clone(),
            job_id: request.job_id.clone(),
            blue_green_color,
            created_at: Utc::now(),
            docs,
            role_templates: role_elements
                .into_iter()
                .map(|(role, elements)| (role.to_string(), elements))
                .collect(),
        })
    }

    pub async fn persist(&self, release: &Release) -> Result<()> {
        self.store.create(release).await?;
        info!(release_id = release.id, docs = release.docs.len(), "📦 Created release");
        Ok(())
    }
}

/// Every wired role needs a config file and every role with a config file
/// in the repository must be wired into each deploy group
fn verify_role_files(request: &ReleaseRequest, files: &BTreeSet<String>) -> Result<()> {
    let mut problems = Vec::new();
    for deploy_group in &request.deploy_groups {
        let wired: BTreeSet<&str> = request
            .roles_of(&deploy_group.name)
            .map(|dgr| dgr.role.as_str())
            .collect();

        let unknown: Vec<&str> = wired
            .iter()
            .copied()
            .filter(|name| request.role(name).is_none())
            .collect();
        if !unknown.is_empty() {
            problems.push(format!(
                "Deploy group {} references unknown roles: {}",
                deploy_group.name,
                unknown.join(", ")
            ));
        }

        let missing: Vec<&str> = request
            .roles
            .iter()
            .filter(|r| wired.contains(r.name.as_str()) && !files.contains(&r.config_file))
            .map(|r| r.config_file.as_str())
            .collect();
        if !missing.is_empty() {
            problems.push(format!(
                "Deploy group {} is missing role config files: {}",
                deploy_group.name,
                missing.join(", ")
            ));
        }

        let extra: Vec<&str> = request
            .roles
            .iter()
            .filter(|r| !wired.contains(r.name.as_str()) && files.contains(&r.config_file))
            .map(|r| r.name.as_str())
            .collect();
        if !extra.is_empty() {
            problems.push(format!(
                "Deploy group {} has role config files for roles it does not deploy: {}",
                deploy_group.name,
                extra.join(", ")
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::user(problems.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::store::InMemoryReleaseStore;
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

    fn source() -> MapSource {
        MapSource(HashMap::from([
            ("kubernetes/web.yml".to_string(), WEB.to_string()),
            ("kubernetes/migrate.yml".to_string(), MIGRATE.to_string()),
        ]))
    }

    fn role(name: &str, prerequisite: bool) -> Role {
        Role {
            name: name.to_string(),
            config_file: format!("kubernetes/{name}.yml"),
            prerequisite,
            autoscaled: false,
        }
    }

    fn group(name: &str) -> DeployGroup {
        DeployGroup {
            name: name.to_string(),
            cluster: "east".to_string(),
            namespace: format!("shop-{name}"),
        }
    }

    fn wire(group: &str, role: &str, replicas: u32) -> DeployGroupRole {
        DeployGroupRole {
            deploy_group: group.to_string(),
            role: role.to_string(),
            replicas,
            delete_resource: false,
        }
    }

    fn request() -> ReleaseRequest {
        ReleaseRequest {
            project: "shop".to_string(),
            git_ref: "main".to_string(),
            git_sha: "abc123".to_string(),
            job_id: Some("42".to_string()),
            blue_green: false,
            roles: vec![role("web", false), role("migrate", true)],
            deploy_groups: vec![group("pod1"), group("pod2")],
            deploy_group_roles: vec![
                wire("pod1", "web", 2),
                wire("pod1", "migrate", 1),
                wire("pod2", "web", 3),
                wire("pod2", "migrate", 1),
            ],
        }
    }

    fn web_build() -> Build {
        Build {
            image_name: "shop/web".to_string(),
            reference: "shop/web@sha256:1111".to_string(),
            git_sha: Some("abc123".to_string()),
        }
    }

    #[tokio::test]
    async fn test_assemble_builds_one_doc_per_group_and_role() {
        let mut resolver = MockBuildResolver::new();
        // once per distinct role, not per deploy group
        resolver
            .expect_ensure_successful_builds()
            .times(2)
            .returning(|_| Ok(vec![web_build()]));
        let store = InMemoryReleaseStore::new();
        let source = source();
        let builder = ReleaseBuilder::new(&source, &resolver, &store);

        let release = builder.assemble(&request()).await.unwrap();
        assert_eq!(release.id, 1);
        assert_eq!(release.docs.len(), 4);
        assert!(release.blue_green_color.is_none());

        let pod2_web = release
            .docs
            .iter()
            .find(|d| d.deploy_group.name == "pod2" && d.role == "web")
            .unwrap();
        assert_eq!(pod2_web.desired_pod_count, 3);
        assert_eq!(pod2_web.resources[0].namespace(), Some("shop-pod2"));
        assert_eq!(
            pod2_web.resources[0].manifest["spec"]["template"]["spec"]["containers"][0]["image"],
            "shop/web@sha256:1111"
        );

        let migrate = release.docs.iter().find(|d| d.role == "migrate").unwrap();
        assert!(migrate.prerequisite);
        assert_eq!(migrate.desired_pod_count, 1);

        // the role's own elements are kept unfilled for validation
        let web_templates = &release.role_templates["web"];
        assert_eq!(web_templates.len(), pod2_web.resources.len());
        assert!(web_templates[0]["metadata"].get("namespace").is_none());
        assert!(web_templates[0]["metadata"]["labels"].get("release_id").is_none());

        // assembling does not persist
        assert_eq!(store.next_id().await.unwrap(), 1);
        builder.persist(&release).await.unwrap();
        assert_eq!(store.next_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_and_extra_role_files_are_reported() {
        let mut resolver = MockBuildResolver::new();
        resolver.expect_ensure_successful_builds().never();
        let store = InMemoryReleaseStore::new();
        let source = source();
        let builder = ReleaseBuilder::new(&source, &resolver, &store);

        let mut req = request();
        req.roles.push(role("worker", false));
        req.deploy_group_roles = vec![wire("pod1", "web", 1), wire("pod1", "worker", 1)];
        req.deploy_groups.truncate(1);

        let message = builder.assemble(&req).await.unwrap_err().to_string();
        assert!(message.contains("Deploy group pod1 is missing role config files: kubernetes/worker.yml"));
        assert!(message.contains("Deploy group pod1 has role config files for roles it does not deploy: migrate"));
    }

    #[tokio::test]
    async fn test_blue_green_picks_opposite_color() {
        let resolver = StaticBuildResolver::new(vec![web_build()]);
        let store = InMemoryReleaseStore::new();
        let source = source();
        let builder = ReleaseBuilder::new(&source, &resolver, &store);
        let mut req = request();
        req.blue_green = true;

        let first = builder.assemble(&req).await.unwrap();
        assert_eq!(first.blue_green_color, Some(Color::Blue));
        builder.persist(&first).await.unwrap();
        store.mark_succeeded(first.id).await.unwrap();

        let second = builder.assemble(&req).await.unwrap();
        assert_eq!(second.blue_green_color, Some(Color::Green));
        assert!(second.docs.iter().all(|d| d.blue_green_color == Some(Color::Green)));
    }

    #[tokio::test]
    async fn test_unresolved_builds_fail() {
        let resolver = StaticBuildResolver::new(vec![]);
        let store = InMemoryReleaseStore::new();
        let source = source();
        let builder = ReleaseBuilder::new(&source, &resolver, &store);

        let err = builder.assemble(&request()).await.unwrap_err();
        assert!(matches!(err, Error::User(_)));
        assert!(err.to_string().contains("shop/web"));
    }

    #[tokio::test]
    async fn test_static_resolver_matches_commit() {
        let resolver = StaticBuildResolver::new(vec![web_build()]);
        let wrong_sha = [BuildSelector {
            image_name: "shop/web".to_string(),
            git_sha: "def456".to_string(),
        }];
        assert!(resolver.ensure_successful_builds(&wrong_sha).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("kubernetes")).unwrap();
        std::fs::write(dir.path().join("kubernetes/web.yml"), WEB).unwrap();
        std::fs::write(dir.path().join("README.md"), "shop").unwrap();

        let source = DirectoryRoleConfigSource::new(dir.path());
        assert_eq!(
            source.list_files("abc").await.unwrap(),
            vec!["README.md".to_string(), "kubernetes/web.yml".to_string()]
        );
        assert!(source.read("abc", "kubernetes/web.yml").await.unwrap().is_some());
        assert!(source.read("abc", "kubernetes/nope.yml").await.unwrap().is_none());
    }
}
