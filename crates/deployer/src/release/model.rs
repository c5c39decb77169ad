//! Release, ReleaseDoc and the configuration records they are built from.

use crate::kubernetes::Resource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Blue/green resource set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A target environment: one namespace on one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeployGroup {
    pub name: String,
    pub cluster: String,
    pub namespace: String,
}

/// A deployable component of a project, described by one config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    /// Path of the role's manifest file inside the repository
    pub config_file: String,
    /// Deployed and awaited before every other role, judged by completion
    #[serde(default)]
    pub prerequisite: bool,
    /// Pod count is managed by an autoscaler
    #[serde(default)]
    pub autoscaled: bool,
}

/// Wiring of a role into a deploy group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployGroupRole {
    pub deploy_group: String,
    pub role: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Remove the role's resources from this deploy group instead of deploying them
    #[serde(default)]
    pub delete_resource: bool,
}

fn default_replicas() -> u32 {
    1
}

/// A successfully built image for a repository commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Image name as referenced by manifests, without tag or digest
    pub image_name: String,
    /// Pullable reference, usually `repo@sha256:...`
    pub reference: String,
    #[serde(default)]
    pub git_sha: Option<String>,
}

/// One (deploy group, role) unit of a release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDoc {
    pub role: String,
    pub deploy_group: DeployGroup,
    pub desired_pod_count: u32,
    pub prerequisite: bool,
    pub autoscaled: bool,
    pub delete_resource: bool,
    pub blue_green_color: Option<Color>,
    pub resources: Vec<Resource>,
}

impl ReleaseDoc {
    pub fn cluster(&self) -> &str {
        &self.deploy_group.cluster
    }

    /// Resources applied immediately; blue/green Services wait for the traffic switch
    pub fn immediate_resources(&self) -> impl Iterator<Item = &Resource> {
        let defer_services = self.blue_green_color.is_some();
        self.resources
            .iter()
            .filter(move |r| !(defer_services && r.is_service()))
    }

    pub fn services(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(|r| r.is_service())
    }

    pub fn non_services(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(|r| !r.is_service())
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.deploy_group.name, self.role)
    }
}

/// One immutable rollout attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: u64,
    pub project: String,
    pub git_ref: String,
    pub git_sha: String,
    pub job_id: Option<String>,
    pub blue_green_color: Option<Color>,
    pub created_at: DateTime<Utc>,
    pub docs: Vec<ReleaseDoc>,
    /// Role config elements as read from the repository, keyed by role.
    /// Only present on a freshly assembled release.
    #[serde(skip)]
    pub role_templates: BTreeMap<String, Vec<Value>>,
}

impl Release {
    pub fn clusters(&self) -> BTreeSet<&str> {
        self.docs.iter().map(ReleaseDoc::cluster).collect()
    }

    pub fn deploy_group_names(&self) -> BTreeSet<&str> {
        self.docs
            .iter()
            .map(|d| d.deploy_group.name.as_str())
            .collect()
    }
}
