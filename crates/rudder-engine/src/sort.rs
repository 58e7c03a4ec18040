//! Manifest splitting, hook extraction and install ordering

use rudder_core::{Capabilities, HookEvent, ReleaseHook};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Annotation binding a document to lifecycle events
pub const HOOK_ANNOTATION: &str = "helm.sh/hook";

/// Annotation ordering hooks within a phase
pub const HOOK_WEIGHT_ANNOTATION: &str = "helm.sh/hook-weight";

/// Kinds in the order they are installed; unknown kinds go last
pub const INSTALL_ORDER: &[&str] = &[
    "Namespace",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ServiceAccount",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "Job",
    "CronJob",
    "Ingress",
    "APIService",
];

fn install_rank(kind: &str) -> usize {
    INSTALL_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(INSTALL_ORDER.len())
}

/// A regular (non-hook) document
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// Template the document was rendered from
    pub source: String,
    pub content: String,
    pub kind: String,
    pub name: String,
}

/// A document bound to lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub struct HookManifest {
    pub name: String,
    pub source: String,
    pub kind: String,
    /// First declared event; hooks are ordered by it
    pub phase: HookEvent,
    pub events: Vec<HookEvent>,
    pub weight: i32,
    pub manifest: String,
}

impl HookManifest {
    pub fn to_release_hook(&self, release_name: &str) -> ReleaseHook {
        ReleaseHook {
            name: self.name.clone(),
            manifest: self.manifest.clone(),
            weight: self.weight,
            kind: self.phase,
            events: self.events.clone(),
            release_name: release_name.to_string(),
        }
    }
}

/// Rendered output split into ordered hooks and ordered manifests
#[derive(Debug, Clone, Default)]
pub struct SortedManifests {
    pub hooks: Vec<HookManifest>,
    pub manifests: Vec<Manifest>,
}

impl SortedManifests {
    /// Manifests joined into release manifest text, each preceded by its source
    pub fn manifest_text(&self) -> String {
        manifest_text(&self.manifests)
    }
}

/// Release manifest text: every document preceded by its source template
pub fn manifest_text(manifests: &[Manifest]) -> String {
    manifests
        .iter()
        .map(|m| format!("\n---\n# Source: {}\n{}", m.source, m.content))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentHead {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: Option<HeadMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct HeadMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    annotations: Option<BTreeMap<String, serde_yaml::Value>>,
}

/// Split a rendered file into its YAML documents
///
/// Documents are separated by lines holding only `---`. Blank and
/// comment-only documents are dropped.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = Vec::new();

    for line in text.lines() {
        if line.trim_end() == "---" {
            docs.push(current.join("\n"));
            current.clear();
        } else {
            current.push(line);
        }
    }
    docs.push(current.join("\n"));

    docs.into_iter()
        .filter(|doc| {
            !doc.lines()
                .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
        })
        .map(|doc| doc.trim_matches('\n').to_string())
        .collect()
}

fn annotation_text(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Classify and order every rendered document
///
/// `rendered` maps template paths to rendered text. Manifests keep render
/// order within a kind; hooks are ordered by phase then weight.
pub fn sort_manifests(
    rendered: &BTreeMap<String, String>,
    capabilities: &Capabilities,
) -> Result<SortedManifests> {
    let mut sorted = SortedManifests::default();

    for (source, text) in rendered {
        for doc in split_documents(text) {
            let head: DocumentHead =
                serde_yaml::from_str(&doc).map_err(|e| EngineError::InvalidManifest {
                    template: source.clone(),
                    message: e.to_string(),
                })?;

            let kind = head.kind.ok_or_else(|| EngineError::InvalidManifest {
                template: source.clone(),
                message: "document has no kind".to_string(),
            })?;
            let api_version = head.api_version.ok_or_else(|| EngineError::InvalidManifest {
                template: source.clone(),
                message: format!("{kind} has no apiVersion"),
            })?;

            if !capabilities.supports(&api_version) {
                return Err(EngineError::InvalidManifest {
                    template: source.clone(),
                    message: format!(
                        "apiVersion \"{api_version}\" in {kind} is not available on this cluster"
                    ),
                });
            }

            let metadata = head.metadata.unwrap_or_default();
            let name = metadata.name.unwrap_or_default();
            let annotations = metadata.annotations.unwrap_or_default();

            let Some(hook_value) = annotations.get(HOOK_ANNOTATION).and_then(annotation_text)
            else {
                sorted.manifests.push(Manifest {
                    source: source.clone(),
                    content: doc,
                    kind,
                    name,
                });
                continue;
            };

            let mut events = Vec::new();
            for raw in hook_value.split(',') {
                match HookEvent::from_str(raw) {
                    Ok(event) if !events.contains(&event) => events.push(event),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(template = %source, hook = %name, "{}", e),
                }
            }

            let Some(phase) = events.first().copied() else {
                tracing::warn!(
                    template = %source,
                    hook = %name,
                    "hook declares no known event, skipping"
                );
                continue;
            };

            let weight = annotations
                .get(HOOK_WEIGHT_ANNOTATION)
                .and_then(annotation_text)
                .and_then(|w| w.trim().parse::<i32>().ok())
                .unwrap_or(0);

            sorted.hooks.push(HookManifest {
                name,
                source: source.clone(),
                kind,
                phase,
                events,
                weight,
                manifest: doc,
            });
        }
    }

    sorted.manifests.sort_by_key(|m| install_rank(&m.kind));
    sorted.hooks.sort_by_key(|h| (h.phase, h.weight));

    Ok(sorted)
}
