//! Consistency checks run against an assembled, unpersisted release.
//!
//! Label checks look at the role config elements as written in the
//! repository, since filling overwrites `project` and `role`. Everything else
//! is checked on the filled resources. Every check only reads the release, so
//! validating the same release twice gives the same answer.

use crate::error::{Error, Result};
use crate::kubernetes::labels;
use crate::kubernetes::ResourceKind;
use crate::release::{DeployGroupRole, Release, ReleaseDoc};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Kubernetes label value syntax
const LABEL_VALUE_PATTERN: &str = r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$";
const LABEL_VALUE_MAX_LEN: usize = 63;

/// Violations of one kind, reported as a single line
#[derive(Default)]
struct Violations {
    classes: BTreeMap<&'static str, Vec<String>>,
}

impl Violations {
    fn add(&mut self, class: &'static str, detail: String) {
        self.classes.entry(class).or_default().push(detail);
    }

    fn into_result(self) -> Result<()> {
        if self.classes.is_empty() {
            return Ok(());
        }
        let message = self
            .classes
            .into_iter()
            .map(|(class, details)| format!("{class}: {}", details.join(", ")))
            .collect::<Vec<_>>()
            .join("\n");
        Err(Error::user(message))
    }
}

pub struct TemplateValidator {
    expected_roles: BTreeMap<String, BTreeSet<String>>,
    label_value: Regex,
}

impl TemplateValidator {
    /// Validator expecting exactly the roles wired into each deploy group
    pub fn new(deploy_group_roles: &[DeployGroupRole]) -> Result<Self> {
        let mut expected_roles: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for dgr in deploy_group_roles {
            expected_roles
                .entry(dgr.deploy_group.clone())
                .or_default()
                .insert(dgr.role.clone());
        }
        let label_value = Regex::new(LABEL_VALUE_PATTERN)
            .map_err(|e| Error::Config(format!("label value pattern: {e}")))?;
        Ok(Self {
            expected_roles,
            label_value,
        })
    }

    pub fn validate(&self, release: &Release) -> Result<()> {
        let mut violations = Violations::default();
        self.check_role_sets(release, &mut violations);
        for (role, elements) in &release.role_templates {
            self.check_role_templates(&release.project, role, elements, &mut violations);
        }
        for doc in &release.docs {
            check_doc(doc, &mut violations);
        }
        check_consistency_across_groups(release, &mut violations);
        debug!(release_id = release.id, docs = release.docs.len(), "Validated release templates");
        violations.into_result()
    }

    fn check_role_sets(&self, release: &Release, violations: &mut Violations) {
        let mut actual: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for doc in &release.docs {
            actual
                .entry(doc.deploy_group.name.as_str())
                .or_default()
                .insert(doc.role.as_str());
        }

        let empty = BTreeSet::new();
        let groups: BTreeSet<&str> = actual
            .keys()
            .copied()
            .chain(self.expected_roles.keys().map(String::as_str))
            .collect();
        for group in groups {
            let present = actual.get(group).unwrap_or(&empty);
            let expected: BTreeSet<&str> = self
                .expected_roles
                .get(group)
                .map(|roles| roles.iter().map(String::as_str).collect())
                .unwrap_or_default();
            for role in expected.difference(present) {
                violations.add("Missing roles", format!("{role} in deploy group {group}"));
            }
            for role in present.difference(&expected) {
                violations.add("Extra roles", format!("{role} in deploy group {group}"));
            }
        }
    }

    /// `project` and `role` labels on every element and pod template, before filling
    fn check_role_templates(
        &self,
        project: &str,
        role: &str,
        elements: &[Value],
        violations: &mut Violations,
    ) {
        for manifest in elements {
            let kind = ResourceKind::from_kind(
                manifest.pointer("/kind").and_then(Value::as_str).unwrap_or_default(),
            );
            let name = manifest
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let element = format!("{kind} {name} of role {role}");

            self.check_labels(
                project,
                role,
                manifest.pointer("/metadata/labels"),
                &element,
                violations,
            );
            if kind.has_pod_template() {
                self.check_labels(
                    project,
                    role,
                    manifest.pointer("/spec/template/metadata/labels"),
                    &format!("pod template of {element}"),
                    violations,
                );
            }
        }
    }

    fn check_labels(
        &self,
        project: &str,
        role: &str,
        labels: Option<&Value>,
        element: &str,
        violations: &mut Violations,
    ) {
        for (key, expected) in [(labels::PROJECT, project), (labels::ROLE, role)] {
            match labels.and_then(|l| l.get(key)).and_then(Value::as_str) {
                None => violations.add("Missing labels", format!("{key} on {element}")),
                Some(value) if !self.valid_label_value(value) => violations.add(
                    "Invalid label values",
                    format!("{key}={value} on {element}"),
                ),
                Some(value) if value != expected => violations.add(
                    "Mismatched labels",
                    format!("{key}={value} on {element}, expected {expected}"),
                ),
                Some(_) => {}
            }
        }
    }

    fn valid_label_value(&self, value: &str) -> bool {
        value.len() <= LABEL_VALUE_MAX_LEN && self.label_value.is_match(value)
    }
}

/// Required fields, primaries and Service selectors of the filled resources
fn check_doc(doc: &ReleaseDoc, violations: &mut Violations) {
    let mut primaries = 0;
    for resource in &doc.resources {
        let manifest = &resource.manifest;
        let name = manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let element = format!("{} {} in {}", resource.kind, name, doc.label());

        for field in ["/apiVersion", "/kind", "/metadata/name"] {
            if manifest.pointer(field).and_then(Value::as_str).map_or(true, str::is_empty) {
                violations.add(
                    "Missing required fields",
                    format!("{} of {element}", field.trim_start_matches('/')),
                );
            }
        }

        if resource.kind.is_primary() {
            primaries += 1;
        }

        if resource.kind == ResourceKind::Service {
            let selector = manifest.pointer("/spec/selector");
            for key in [labels::PROJECT, labels::ROLE] {
                if selector.and_then(|s| s.get(key)).is_none() {
                    violations.add(
                        "Service selectors missing labels",
                        format!("{key} in {element}"),
                    );
                }
            }
        }
    }
    if primaries > 1 {
        violations.add(
            "Multiple primary resources",
            format!("{} has {primaries}", doc.label()),
        );
    }
}

/// Kinds and label keys of a role's resources, comparable across deploy groups
fn shape(doc: &ReleaseDoc) -> (Vec<String>, BTreeSet<String>) {
    let mut kinds: Vec<String> = doc
        .resources
        .iter()
        .map(|r| r.kind.as_str().to_string())
        .collect();
    kinds.sort();
    let label_keys = doc
        .resources
        .iter()
        .filter_map(|r| r.manifest.pointer("/metadata/labels").and_then(Value::as_object))
        .flat_map(|labels| labels.keys().cloned())
        .collect();
    (kinds, label_keys)
}

fn check_consistency_across_groups(release: &Release, violations: &mut Violations) {
    let mut first_seen: BTreeMap<&str, (&ReleaseDoc, (Vec<String>, BTreeSet<String>))> =
        BTreeMap::new();
    for doc in &release.docs {
        let doc_shape = shape(doc);
        match first_seen.get(doc.role.as_str()) {
            None => {
                first_seen.insert(doc.role.as_str(), (doc, doc_shape));
            }
            Some((reference, reference_shape)) => {
                if reference_shape.0 != doc_shape.0 {
                    violations.add(
                        "Resource kinds differ between deploy groups",
                        format!(
                            "role {} in {} and {}",
                            doc.role, reference.deploy_group.name, doc.deploy_group.name
                        ),
                    );
                }
                if reference_shape.1 != doc_shape.1 {
                    violations.add(
                        "Labels differ between deploy groups",
                        format!(
                            "role {} in {} and {}",
                            doc.role, reference.deploy_group.name, doc.deploy_group.name
                        ),
                    );
                }
            }
        }
    }
}
