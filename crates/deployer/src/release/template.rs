//! Fills raw role manifests for one deploy group.

use super::model::{Build, Color, DeployGroup, DeployGroupRole, Role};
use crate::error::{Error, Result};
use crate::kubernetes::{labels, ResourceKind};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Kinds that never get a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
];

/// Everything needed to turn a role's manifests into a deploy group's manifests
pub struct TemplateContext<'a> {
    pub project: &'a str,
    pub release_id: u64,
    pub role: &'a Role,
    pub deploy_group: &'a DeployGroup,
    pub deploy_group_role: &'a DeployGroupRole,
    pub builds: &'a [Build],
    pub color: Option<Color>,
}

/// Split a multi-document YAML role config into manifests
pub fn parse_role_config(content: &str) -> Result<Vec<Value>> {
    let mut elements = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document)?;
        match value {
            Value::Null => {}
            Value::Object(_) => elements.push(value),
            _ => {
                return Err(Error::user(
                    "Role config documents must be mappings",
                ))
            }
        }
    }
    Ok(elements)
}

/// Image name without registry tag or digest
pub fn image_name(image: &str) -> &str {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment = without_digest.rfind('/').map_or(0, |i| i + 1);
    match without_digest[last_segment..].rfind(':') {
        Some(colon) => &without_digest[..last_segment + colon],
        None => without_digest,
    }
}

/// Distinct image names referenced by containers in `elements`
pub fn image_names(elements: &[Value]) -> BTreeSet<String> {
    elements
        .iter()
        .flat_map(|element| {
            pod_spec_pointers(element)
                .into_iter()
                .flat_map(move |pointer| container_images(element, pointer))
        })
        .map(|image| image_name(&image).to_string())
        .collect()
}

fn kind_of(element: &Value) -> ResourceKind {
    ResourceKind::from_kind(element["kind"].as_str().unwrap_or_default())
}

fn pod_spec_pointers(element: &Value) -> Vec<&'static str> {
    let kind = kind_of(element);
    if kind == ResourceKind::Pod {
        vec!["/spec"]
    } else if kind.has_pod_template() {
        vec!["/spec/template/spec"]
    } else {
        vec![]
    }
}

fn container_images(element: &Value, pod_spec: &str) -> Vec<String> {
    ["containers", "initContainers"]
        .iter()
        .filter_map(|field| element.pointer(&format!("{pod_spec}/{field}")))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|c| c["image"].as_str().map(str::to_string))
        .collect()
}

/// Walk `path` from `value`, creating missing mappings on the way.
/// Fails with the dotted path of the first node that exists but is not a mapping.
fn object_path<'v>(
    value: &'v mut Value,
    path: &[&str],
) -> Result<&'v mut Map<String, Value>, String> {
    let mut current = value;
    let mut walked = Vec::with_capacity(path.len());
    for key in path {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(format!("{} must be a mapping", walked.join(".")));
        };
        walked.push(*key);
        current = map.entry((*key).to_string()).or_insert(Value::Null);
    }
    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => Ok(map),
        _ => Err(format!("{} must be a mapping", walked.join("."))),
    }
}

impl TemplateContext<'_> {
    fn labels(&self, with_color: bool) -> Vec<(&'static str, String)> {
        let mut labels = vec![
            (labels::PROJECT, self.project.to_string()),
            (labels::ROLE, self.role.name.clone()),
            (labels::DEPLOY_GROUP, self.deploy_group.name.clone()),
            (labels::RELEASE_ID, self.release_id.to_string()),
        ];
        if with_color {
            if let Some(color) = self.color {
                labels.push((labels::BLUE_GREEN, color.to_string()));
            }
        }
        labels
    }

    /// Fill every element of the role for this deploy group
    pub fn fill(&self, elements: &[Value]) -> Result<Vec<Value>> {
        elements.iter().map(|e| self.fill_element(e.clone())).collect()
    }

    fn fill_element(&self, mut element: Value) -> Result<Value> {
        let kind = kind_of(&element);
        let raw_kind = element["kind"].as_str().unwrap_or_default().to_string();
        let name = element["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let malformed = |problem: String| {
            Error::user(format!(
                "{raw_kind} {name} of role {}: {problem}",
                self.role.name
            ))
        };

        self.fill_shape(&mut element, &kind, &raw_kind).map_err(malformed)?;
        for pointer in pod_spec_pointers(&element) {
            self.swap_images(&mut element, pointer)?;
        }
        Ok(element)
    }

    fn fill_shape(
        &self,
        element: &mut Value,
        kind: &ResourceKind,
        raw_kind: &str,
    ) -> Result<(), String> {
        let is_service = kind.is_service();

        let metadata = object_path(element, &["metadata"])?;
        if !CLUSTER_SCOPED_KINDS.contains(&raw_kind) {
            metadata.insert("namespace".to_string(), json!(self.deploy_group.namespace));
        }
        if let (Some(color), false) = (self.color, is_service) {
            if let Some(Value::String(name)) = metadata.get_mut("name") {
                name.push('-');
                name.push_str(color.as_str());
            }
        }
        let metadata_labels = object_path(element, &["metadata", "labels"])?;
        for (key, value) in self.labels(!is_service) {
            metadata_labels.insert(key.to_string(), json!(value));
        }

        if is_service {
            if let Some(color) = self.color {
                let selector = object_path(element, &["spec", "selector"])?;
                selector.insert(labels::BLUE_GREEN.to_string(), json!(color.as_str()));
            }
            return Ok(());
        }

        if kind.has_pod_template() {
            let pod_labels = object_path(element, &["spec", "template", "metadata", "labels"])?;
            for (key, value) in self.labels(true) {
                pod_labels.insert(key.to_string(), json!(value));
            }
            if let Some(color) = self.color {
                if let Some(Value::Object(match_labels)) =
                    element.pointer_mut("/spec/selector/matchLabels")
                {
                    match_labels.insert(labels::BLUE_GREEN.to_string(), json!(color.as_str()));
                }
            }
        }

        if kind.has_replicas() {
            object_path(element, &["spec"])?
                .insert("replicas".to_string(), json!(self.deploy_group_role.replicas));
        }
        Ok(())
    }

    fn swap_images(&self, element: &mut Value, pod_spec: &str) -> Result<()> {
        for field in ["containers", "initContainers"] {
            let Some(Value::Array(containers)) =
                element.pointer_mut(&format!("{pod_spec}/{field}"))
            else {
                continue;
            };
            for container in containers {
                let Some(image) = container["image"].as_str() else {
                    continue;
                };
                let name = image_name(image);
                let build = self
                    .builds
                    .iter()
                    .find(|b| b.image_name == name)
                    .ok_or_else(|| {
                        Error::user(format!(
                            "Did not find a build for image {name} used by role {}",
                            self.role.name
                        ))
                    })?;
                container["image"] = json!(build.reference);
            }
        }
        Ok(())
    }
}

/// Pods the role is expected to run in this deploy group
pub fn desired_pod_count(elements: &[Value], deploy_group_role: &DeployGroupRole) -> u32 {
    if deploy_group_role.delete_resource {
        return 0;
    }
    let Some(primary) = elements.iter().find(|e| kind_of(e).is_primary()) else {
        return 0;
    };
    match kind_of(primary) {
        ResourceKind::Pod => 1,
        ResourceKind::Job => primary["spec"]["completions"]
            .as_u64()
            .map_or(1, |c| c as u32),
        _ => deploy_group_role.replicas,
    }
}
