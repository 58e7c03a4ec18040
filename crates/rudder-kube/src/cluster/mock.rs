//! In-memory cluster for testing
//!
//! Applied documents become "live" objects keyed by kind, namespace and name,
//! so lookups, deletes and scaling behave like a tiny API server.

use async_trait::async_trait;
use rudder_core::Capabilities;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ClusterClient, OperationSummary, REPLICAS_ANNOTATION, ResourceInfo, SCALABLE_KINDS,
    parse_documents,
};
use crate::error::{KubeError, Result};

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ResourceInfo>,
    pods: HashMap<String, Vec<ResourceInfo>>,
    applied: Vec<String>,
    deleted: Vec<String>,
    fail_apply_kinds: Vec<String>,
    fail_delete: bool,
    revision: u64,
}

fn guard(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`ClusterClient`] keeping objects in memory
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
    capabilities: Capabilities,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make applying any document of `kind` fail
    pub fn fail_apply(&self, kind: &str) {
        guard(&self.state).fail_apply_kinds.push(kind.to_string());
    }

    pub fn fail_delete(&self) {
        guard(&self.state).fail_delete = true;
    }

    /// Register pods returned for a workload name
    pub fn add_pods(&self, workload: &str, pods: Vec<ResourceInfo>) {
        guard(&self.state).pods.insert(workload.to_string(), pods);
    }

    /// Display names of applied documents, in order
    pub fn applied(&self) -> Vec<String> {
        guard(&self.state).applied.clone()
    }

    /// Display names of deleted documents, in order
    pub fn deleted(&self) -> Vec<String> {
        guard(&self.state).deleted.clone()
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<ResourceInfo> {
        guard(&self.state)
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        guard(&self.state).objects.len()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.capabilities.clone())
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<OperationSummary> {
        let documents = parse_documents(manifest)?;
        let mut state = guard(&self.state);
        let mut summary = OperationSummary::default();

        for (reference, object) in documents {
            let ns = reference
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string());
            let display = format!("{}/{}/{}", ns, reference.kind, reference.name);

            if state.fail_apply_kinds.contains(&reference.kind) {
                summary.failed.push((display, "injected apply failure".to_string()));
                continue;
            }

            state.revision += 1;
            let (group, version) = reference.group_version();
            let info = ResourceInfo {
                group,
                version,
                kind: reference.kind.clone(),
                name: reference.name.clone(),
                namespace: Some(ns.clone()),
                resource_version: state.revision.to_string(),
                object,
            };
            state
                .objects
                .insert((reference.kind, ns, reference.name), info);
            state.applied.push(display.clone());
            summary.succeeded.push(display);
        }

        Ok(summary)
    }

    async fn delete_manifest(&self, namespace: &str, manifest: &str) -> Result<OperationSummary> {
        let documents = parse_documents(manifest)?;
        let mut state = guard(&self.state);
        let mut summary = OperationSummary::default();

        for (reference, _) in documents.into_iter().rev() {
            let ns = reference
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string());
            let display = format!("{}/{}/{}", ns, reference.kind, reference.name);

            if state.fail_delete {
                summary.failed.push((display, "injected delete failure".to_string()));
                continue;
            }

            match state.objects.remove(&(reference.kind, ns, reference.name)) {
                Some(_) => {
                    state.deleted.push(display.clone());
                    summary.succeeded.push(display);
                }
                None => summary.skipped.push((display, "not found".to_string())),
            }
        }

        Ok(summary)
    }

    async fn build_unstructured(
        &self,
        namespace: &str,
        manifest: &str,
    ) -> Result<Vec<ResourceInfo>> {
        let documents = parse_documents(manifest)?;
        let state = guard(&self.state);

        Ok(documents
            .into_iter()
            .filter_map(|(reference, _)| {
                let ns = reference
                    .namespace
                    .unwrap_or_else(|| namespace.to_string());
                state
                    .objects
                    .get(&(reference.kind, ns, reference.name))
                    .cloned()
            })
            .collect())
    }

    async fn related_pods(&self, info: &ResourceInfo) -> Result<Vec<ResourceInfo>> {
        if info.pod_selector().is_none() {
            return Ok(Vec::new());
        }
        Ok(guard(&self.state)
            .pods
            .get(&info.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop_resources(&self, namespace: &str, manifest: &str) -> Result<()> {
        scale(self, namespace, manifest, true)
    }

    async fn start_resources(&self, namespace: &str, manifest: &str) -> Result<()> {
        scale(self, namespace, manifest, false)
    }
}

fn scale(cluster: &MockCluster, namespace: &str, manifest: &str, stop: bool) -> Result<()> {
    let documents = parse_documents(manifest)?;
    let mut state = guard(&cluster.state);

    for (reference, _) in documents {
        if !SCALABLE_KINDS.contains(&reference.kind.as_str()) {
            continue;
        }
        let ns = reference
            .namespace
            .unwrap_or_else(|| namespace.to_string());
        let Some(info) = state
            .objects
            .get_mut(&(reference.kind, ns, reference.name))
        else {
            continue;
        };

        let object = info
            .object
            .as_object_mut()
            .ok_or_else(|| KubeError::InvalidManifest("object is not a mapping".to_string()))?;
        let current = object
            .get("spec")
            .and_then(|s| s.get("replicas"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(1);

        let annotations = object
            .entry("metadata")
            .or_insert_with(|| JsonValue::Object(Default::default()))
            .as_object_mut()
            .map(|m| {
                m.entry("annotations")
                    .or_insert_with(|| JsonValue::Object(Default::default()))
            })
            .and_then(JsonValue::as_object_mut)
            .ok_or_else(|| KubeError::InvalidManifest("metadata is not a mapping".to_string()))?;

        let replicas = if stop {
            if current == 0 {
                continue;
            }
            annotations.insert(REPLICAS_ANNOTATION.to_string(), current.to_string().into());
            0u64
        } else {
            annotations
                .remove(REPLICAS_ANNOTATION)
                .and_then(|r| r.as_str().and_then(|r| r.parse::<u64>().ok()))
                .unwrap_or(1)
        };

        let spec = object
            .entry("spec")
            .or_insert_with(|| JsonValue::Object(Default::default()));
        if let Some(spec) = spec.as_object_mut() {
            spec.insert("replicas".to_string(), replicas.into());
        }
    }
    Ok(())
}
