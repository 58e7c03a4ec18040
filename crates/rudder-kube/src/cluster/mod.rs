//! Cluster access used by the release engine
//!
//! [`ClusterClient`] is the boundary between release bookkeeping and the live
//! cluster: applying and deleting manifests, looking up the objects a release
//! owns, scaling workloads for start/stop and computing capabilities.

mod live;
mod mock;

pub use live::KubeCluster;
pub use mock::MockCluster;

use async_trait::async_trait;
use rudder_core::{Capabilities, ReleaseResource};
use rudder_engine::sort::split_documents;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

use crate::error::{KubeError, Result};

/// Annotation remembering the replica count of a stopped workload
pub const REPLICAS_ANNOTATION: &str = "rudder.io/replicas";

/// Kinds scaled to zero by stop and restored by start
pub const SCALABLE_KINDS: &[&str] = &["Deployment", "StatefulSet", "ReplicaSet"];

/// Live object resolved from a manifest document
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub resource_version: String,
    pub object: JsonValue,
}

impl ResourceInfo {
    /// `spec.selector.matchLabels` as a label selector, if the object has one
    pub fn pod_selector(&self) -> Option<String> {
        let labels = self
            .object
            .pointer("/spec/selector/matchLabels")?
            .as_object()?;
        if labels.is_empty() {
            return None;
        }

        let selector = labels
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| format!("{}={}", k, v)))
            .collect::<Vec<_>>()
            .join(",");
        Some(selector)
    }

    pub fn to_release_resource(&self) -> ReleaseResource {
        ReleaseResource {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            resource_version: self.resource_version.clone(),
            object: self.object.to_string(),
        }
    }
}

/// Summary of apply/delete operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSummary {
    pub succeeded: Vec<String>,
    /// Failed resources with errors
    pub failed: Vec<(String, String)>,
    /// Skipped resources with reasons
    pub skipped: Vec<(String, String)>,
}

impl OperationSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if !self.succeeded.is_empty() {
            parts.push(format!("{} succeeded", self.succeeded.len()));
        }
        if !self.failed.is_empty() {
            parts.push(format!("{} failed", self.failed.len()));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }
        if parts.is_empty() {
            "No resources processed".to_string()
        } else {
            parts.join(", ")
        }
    }

    /// Turn failed entries into an error
    pub fn into_result(self, operation: &'static str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(KubeError::ResourceOperation {
            operation,
            failures: self
                .failed
                .iter()
                .map(|(name, error)| format!("{}: {}", name, error))
                .collect(),
        })
    }
}

/// Live cluster operations
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Server version and served API versions
    async fn capabilities(&self) -> Result<Capabilities>;

    /// Apply every document of a manifest, in order
    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<OperationSummary>;

    /// Delete every document of a manifest, in reverse order
    async fn delete_manifest(&self, namespace: &str, manifest: &str) -> Result<OperationSummary>;

    /// Resolve manifest documents to live objects; absent objects are skipped
    async fn build_unstructured(&self, namespace: &str, manifest: &str)
    -> Result<Vec<ResourceInfo>>;

    /// Pods selected by a workload's `spec.selector.matchLabels`
    async fn related_pods(&self, info: &ResourceInfo) -> Result<Vec<ResourceInfo>>;

    /// Scale workloads to zero, remembering their replica count
    async fn stop_resources(&self, namespace: &str, manifest: &str) -> Result<()>;

    /// Restore workloads scaled down by [`stop_resources`](Self::stop_resources)
    async fn start_resources(&self, namespace: &str, manifest: &str) -> Result<()>;
}

/// Identity of one manifest document
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DocumentRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl DocumentRef {
    /// `(group, version)` from the apiVersion
    pub fn group_version(&self) -> (String, String) {
        match self.api_version.rsplit_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        }
    }

    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", ns, self.kind, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// Parse manifest text into `(identity, object)` pairs
///
/// Empty documents are skipped; documents without `kind` or `metadata.name`
/// are rejected.
pub(crate) fn parse_documents(manifest: &str) -> Result<Vec<(DocumentRef, JsonValue)>> {
    use serde::Deserialize;

    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = JsonValue::deserialize(document)?;
        if value.is_null() {
            continue;
        }

        let field = |pointer: &str| value.pointer(pointer).and_then(JsonValue::as_str);
        let reference = DocumentRef {
            api_version: field("/apiVersion").unwrap_or_default().to_string(),
            kind: field("/kind")
                .ok_or_else(|| KubeError::InvalidManifest("document missing kind".to_string()))?
                .to_string(),
            name: field("/metadata/name")
                .ok_or_else(|| {
                    KubeError::InvalidManifest("document missing metadata.name".to_string())
                })?
                .to_string(),
            namespace: field("/metadata/namespace").map(str::to_string),
        };
        documents.push((reference, value));
    }
    Ok(documents)
}

/// Documents of `previous` with no counterpart in `current`, as manifest text
///
/// Documents match on kind, name and declared namespace.
pub(crate) fn removed_documents(previous: &str, current: &str) -> Result<String> {
    let kept: HashSet<(String, String, Option<String>)> = parse_documents(current)?
        .into_iter()
        .map(|(r, _)| (r.kind, r.name, r.namespace))
        .collect();

    let mut removed = Vec::new();
    for document in split_documents(previous) {
        let gone = parse_documents(&document)?
            .into_iter()
            .any(|(r, _)| !kept.contains(&(r.kind, r.name, r.namespace)));
        if gone {
            removed.push(document);
        }
    }
    Ok(removed.join("\n---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_documents() {
        let manifest = r#"
---
# Source: web/templates/svc.yaml
apiVersion: v1
kind: Service
metadata:
  name: web
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: other
"#;
        let docs = parse_documents(manifest).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].0.kind, "Service");
        assert_eq!(docs[0].0.group_version(), (String::new(), "v1".to_string()));
        assert_eq!(docs[1].0.display_name(), "other/Deployment/web");
        assert_eq!(
            docs[1].0.group_version(),
            ("apps".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn test_parse_documents_rejects_nameless() {
        let err = parse_documents("kind: ConfigMap\nmetadata: {}\n").unwrap_err();
        assert!(matches!(err, KubeError::InvalidManifest(_)));
    }

    #[test]
    fn test_pod_selector() {
        let info = ResourceInfo {
            group: "apps".to_string(),
            version: "v1".to_string(),
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: Some("proj".to_string()),
            resource_version: "7".to_string(),
            object: json!({"spec": {"selector": {"matchLabels": {"app": "web", "tier": "front"}}}}),
        };
        assert_eq!(info.pod_selector().as_deref(), Some("app=web,tier=front"));

        let resource = info.to_release_resource();
        assert_eq!(resource.kind, "Deployment");
        assert!(resource.object.contains("matchLabels"));
    }

    #[test]
    fn test_summary_into_result() {
        let ok = OperationSummary {
            succeeded: vec!["proj/Service/web".to_string()],
            ..Default::default()
        };
        assert_eq!(ok.summary(), "1 succeeded");
        assert!(ok.into_result("apply").is_ok());

        let failed = OperationSummary {
            failed: vec![("proj/Service/web".to_string(), "forbidden".to_string())],
            ..Default::default()
        };
        let err = failed.into_result("apply").unwrap_err();
        assert!(err.to_string().contains("proj/Service/web: forbidden"));
    }

    #[test]
    fn test_removed_documents() {
        let previous = "kind: Service\nmetadata:\n  name: web\n---\nkind: ConfigMap\nmetadata:\n  name: old\n";
        let current = "\n---\n# Source: app\nkind: Service\nmetadata:\n  name: web\n";

        let removed = removed_documents(previous, current).unwrap();
        assert_eq!(removed, "kind: ConfigMap\nmetadata:\n  name: old");
        assert!(removed_documents(current, current).unwrap().is_empty());
    }
}
