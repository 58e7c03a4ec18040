//! Release identity injection into rendered manifests

use rudder_core::ImagePullSecret;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::{EngineError, Result};

/// Label carrying the owning release name
pub const RELEASE_LABEL: &str = "rudder.io/release";

/// Label carrying the test run identifier
pub const TEST_LABEL: &str = "rudder.io/test";

/// Annotation carrying `<chart>-<version>`
pub const CHART_ANNOTATION: &str = "rudder.io/chart";

/// Kinds whose pod template lives at `spec.template`
const TEMPLATED_WORKLOADS: &[&str] = &[
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "ReplicaSet",
    "ReplicationController",
    "Job",
];

/// What to stamp on every object
#[derive(Debug, Clone)]
pub struct LabelRequest<'a> {
    pub image_pull_secrets: &'a [ImagePullSecret],
    pub release_name: &'a str,
    pub chart_name: &'a str,
    pub chart_version: &'a str,
    /// Set for chart test runs
    pub test_label: Option<&'a str>,
}

/// Adds release identity to manifest text
///
/// Implementations must be idempotent: labeling twice yields the same labels
/// and secret references as labeling once.
pub trait ManifestLabeler: Send + Sync {
    fn label_objects(&self, manifest: &str, request: &LabelRequest<'_>) -> Result<String>;
}

/// Labeler working on the parsed YAML structure
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlLabeler;

impl YamlLabeler {
    pub fn new() -> Self {
        Self
    }

    fn label_document(&self, doc: &mut Mapping, request: &LabelRequest<'_>) -> Result<()> {
        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let metadata = child_mapping(doc, "metadata")?;
        stamp_labels(metadata, request)?;
        let annotations = child_mapping(metadata, "annotations")?;
        annotations.insert(
            Value::from(CHART_ANNOTATION),
            Value::from(format!("{}-{}", request.chart_name, request.chart_version)),
        );

        if kind == "Pod" {
            if !request.image_pull_secrets.is_empty() {
                let pod_spec = child_mapping(doc, "spec")?;
                append_pull_secrets(pod_spec, request.image_pull_secrets)?;
            }
        } else if let Some(pod_template) = pod_template(doc, &kind)? {
            let pod_metadata = child_mapping(pod_template, "metadata")?;
            stamp_labels(pod_metadata, request)?;
            if !request.image_pull_secrets.is_empty() {
                let pod_spec = child_mapping(pod_template, "spec")?;
                append_pull_secrets(pod_spec, request.image_pull_secrets)?;
            }
        }

        Ok(())
    }
}

impl ManifestLabeler for YamlLabeler {
    fn label_objects(&self, manifest: &str, request: &LabelRequest<'_>) -> Result<String> {
        let mut out = Vec::new();

        for document in serde_yaml::Deserializer::from_str(manifest) {
            let mut value = Value::deserialize(document)?;
            match &mut value {
                Value::Null => continue,
                Value::Mapping(doc) => self.label_document(doc, request)?,
                _ => {
                    return Err(EngineError::Label {
                        message: "manifest document is not a mapping".to_string(),
                    });
                }
            }
            out.push(serde_yaml::to_string(&value)?);
        }

        Ok(out.join("---\n"))
    }
}

fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping> {
    let slot = parent.entry(Value::from(key)).or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Mapping(Mapping::new());
    }
    slot.as_mapping_mut().ok_or_else(|| EngineError::Label {
        message: format!("`{key}` is not a mapping"),
    })
}

fn stamp_labels(metadata: &mut Mapping, request: &LabelRequest<'_>) -> Result<()> {
    let labels = child_mapping(metadata, "labels")?;
    labels.insert(Value::from(RELEASE_LABEL), Value::from(request.release_name));
    if let Some(test_label) = request.test_label {
        labels.insert(Value::from(TEST_LABEL), Value::from(test_label));
    }
    Ok(())
}

/// The pod template of a workload, if it has one
fn pod_template<'a>(doc: &'a mut Mapping, kind: &str) -> Result<Option<&'a mut Mapping>> {
    if TEMPLATED_WORKLOADS.contains(&kind) {
        let spec = child_mapping(doc, "spec")?;
        return child_mapping(spec, "template").map(Some);
    }
    if kind == "CronJob" {
        let spec = child_mapping(doc, "spec")?;
        let job_template = child_mapping(spec, "jobTemplate")?;
        let job_spec = child_mapping(job_template, "spec")?;
        return child_mapping(job_spec, "template").map(Some);
    }
    Ok(None)
}

fn append_pull_secrets(pod_spec: &mut Mapping, secrets: &[ImagePullSecret]) -> Result<()> {
    let slot = pod_spec
        .entry(Value::from("imagePullSecrets"))
        .or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Sequence(Vec::new());
    }
    let existing = slot.as_sequence_mut().ok_or_else(|| EngineError::Label {
        message: "`imagePullSecrets` is not a list".to_string(),
    })?;

    for secret in secrets {
        let present = existing.iter().any(|entry| {
            entry.get("name").and_then(Value::as_str) == Some(secret.name.as_str())
        });
        if !present {
            let mut entry = Mapping::new();
            entry.insert(Value::from("name"), Value::from(secret.name.as_str()));
            existing.push(Value::Mapping(entry));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(secrets: &'a [ImagePullSecret], test_label: Option<&'a str>) -> LabelRequest<'a> {
        LabelRequest {
            image_pull_secrets: secrets,
            release_name: "app",
            chart_name: "web",
            chart_version: "1.0.0",
            test_label,
        }
    }

    fn parse(text: &str) -> Vec<Value> {
        serde_yaml::Deserializer::from_str(text)
            .map(|d| Value::deserialize(d).unwrap())
            .collect()
    }

    #[test]
    fn test_labels_every_document() {
        let manifest = "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: conf\n  labels:\n    tier: backend\n";
        let labeled = YamlLabeler::new().label_objects(manifest, &request(&[], None)).unwrap();
        let docs = parse(&labeled);

        assert_eq!(docs.len(), 2);
        for doc in &docs {
            assert_eq!(doc["metadata"]["labels"][RELEASE_LABEL].as_str(), Some("app"));
            assert_eq!(doc["metadata"]["annotations"][CHART_ANNOTATION].as_str(), Some("web-1.0.0"));
        }
        assert_eq!(docs[1]["metadata"]["labels"]["tier"].as_str(), Some("backend"));
    }

    #[test]
    fn test_pod_templates_get_labels_and_pull_secrets() {
        let manifest = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  template:
    spec:
      imagePullSecrets:
        - name: existing
      containers:
        - name: web
          image: nginx
---
apiVersion: batch/v1
kind: CronJob
metadata:
  name: nightly
spec:
  jobTemplate:
    spec:
      template:
        spec:
          containers: []
"#;
        let secrets = vec![ImagePullSecret::new("existing"), ImagePullSecret::new("registry")];
        let labeled = YamlLabeler::new()
            .label_objects(manifest, &request(&secrets, Some("run-1")))
            .unwrap();
        let docs = parse(&labeled);

        let template = &docs[0]["spec"]["template"];
        assert_eq!(template["metadata"]["labels"][RELEASE_LABEL].as_str(), Some("app"));
        assert_eq!(template["metadata"]["labels"][TEST_LABEL].as_str(), Some("run-1"));
        assert_eq!(template["spec"]["imagePullSecrets"].as_sequence().unwrap().len(), 2);

        let cron_template = &docs[1]["spec"]["jobTemplate"]["spec"]["template"];
        assert_eq!(cron_template["metadata"]["labels"][RELEASE_LABEL].as_str(), Some("app"));
        assert_eq!(cron_template["spec"]["imagePullSecrets"][0]["name"].as_str(), Some("existing"));
    }

    #[test]
    fn test_labeling_is_idempotent() {
        let manifest = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\nspec:\n  containers: []\n";
        let secrets = vec![ImagePullSecret::new("registry")];
        let labeler = YamlLabeler::new();

        let once = labeler.label_objects(manifest, &request(&secrets, None)).unwrap();
        let twice = labeler.label_objects(&once, &request(&secrets, None)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        let err = YamlLabeler::new()
            .label_objects("- a\n- b\n", &request(&[], None))
            .unwrap_err();
        assert!(matches!(err, EngineError::Label { .. }));
    }
}
