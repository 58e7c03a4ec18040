//! Cluster access through the Kubernetes API
//!
//! Documents are resolved through API discovery and handled as
//! `DynamicObject`s, so any kind the server knows can be applied, looked up or
//! deleted without compile-time types. Applies use Server-Side Apply.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PropagationPolicy},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use rudder_core::{Capabilities, KubeVersion};
use serde_json::{Value as JsonValue, json};
use tokio::sync::RwLock;

use super::{
    ClusterClient, DocumentRef, OperationSummary, REPLICAS_ANNOTATION, ResourceInfo,
    SCALABLE_KINDS, parse_documents,
};
use crate::error::{KubeError, Result};

/// Field manager name for Server-Side Apply
const FIELD_MANAGER: &str = "rudder";

/// Annotation to keep a resource when its release is deleted (Helm-compatible)
const RESOURCE_POLICY_ANNOTATION: &str = "helm.sh/resource-policy";
const RESOURCE_POLICY_KEEP: &str = "keep";

/// Document resolved against discovery
struct Resolved {
    reference: DocumentRef,
    object: JsonValue,
    api_resource: ApiResource,
    namespace: Option<String>,
}

impl Resolved {
    fn api(&self, client: &Client) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &self.api_resource),
            None => Api::all_with(client.clone(), &self.api_resource),
        }
    }

    fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", ns, self.reference.kind, self.reference.name),
            None => format!("{}/{}", self.reference.kind, self.reference.name),
        }
    }

    fn has_keep_policy(&self) -> bool {
        self.object
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(RESOURCE_POLICY_ANNOTATION))
            .and_then(JsonValue::as_str)
            == Some(RESOURCE_POLICY_KEEP)
    }
}

/// [`ClusterClient`] backed by a live API server
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl KubeCluster {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
        })
    }

    /// Re-run discovery, e.g. after CRDs were applied
    pub async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self.discovery.write().await = discovery;
        Ok(())
    }

    async fn lookup(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, ApiCapabilities)> {
        self.discovery.read().await.resolve_gvk(gvk)
    }

    async fn resolve(&self, namespace: &str, manifest: &str) -> Result<Vec<Resolved>> {
        let mut resolved = Vec::new();

        for (reference, object) in parse_documents(manifest)? {
            let (group, version) = reference.group_version();
            let gvk = GroupVersionKind::gvk(&group, &version, &reference.kind);

            let found = match self.lookup(&gvk).await {
                Some(found) => Some(found),
                None => {
                    self.refresh_discovery().await?;
                    self.lookup(&gvk).await
                }
            };
            let (api_resource, capabilities) = found.ok_or_else(|| {
                KubeError::InvalidManifest(format!(
                    "Unknown resource type: {}/{}",
                    reference.api_version, reference.kind
                ))
            })?;

            let namespace = (capabilities.scope == Scope::Namespaced).then(|| {
                reference
                    .namespace
                    .clone()
                    .unwrap_or_else(|| namespace.to_string())
            });

            resolved.push(Resolved {
                reference,
                object,
                api_resource,
                namespace,
            });
        }

        Ok(resolved)
    }

    async fn apply_one(&self, resource: &Resolved) -> Result<()> {
        let mut object: DynamicObject = serde_json::from_value(resource.object.clone())?;
        object.metadata.namespace = resource.namespace.clone();

        let params = PatchParams::apply(FIELD_MANAGER).force();
        resource
            .api(&self.client)
            .patch(&resource.reference.name, &params, &Patch::Apply(&object))
            .await?;
        Ok(())
    }

    async fn scale(&self, namespace: &str, manifest: &str, stop: bool) -> Result<()> {
        for resource in self.resolve(namespace, manifest).await? {
            if !SCALABLE_KINDS.contains(&resource.reference.kind.as_str()) {
                continue;
            }

            let api = resource.api(&self.client);
            let Some(live) = api.get_opt(&resource.reference.name).await? else {
                tracing::debug!(resource = %resource.display_name(), "not found, skipping scale");
                continue;
            };

            let patch = if stop {
                let replicas = live
                    .data
                    .pointer("/spec/replicas")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(1);
                if replicas == 0 {
                    continue;
                }
                stop_patch(replicas)
            } else {
                let replicas = live
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(REPLICAS_ANNOTATION))
                    .and_then(|r| r.parse::<u64>().ok())
                    .unwrap_or(1);
                start_patch(replicas)
            };

            api.patch(
                &resource.reference.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
            tracing::info!(resource = %resource.display_name(), stop, "scaled workload");
        }
        Ok(())
    }
}

fn stop_patch(replicas: u64) -> JsonValue {
    json!({
        "metadata": { "annotations": { REPLICAS_ANNOTATION: replicas.to_string() } },
        "spec": { "replicas": 0 }
    })
}

fn start_patch(replicas: u64) -> JsonValue {
    json!({
        "metadata": { "annotations": { REPLICAS_ANNOTATION: null } },
        "spec": { "replicas": replicas }
    })
}

fn resource_info(group: &str, version: &str, kind: &str, object: &DynamicObject) -> Result<ResourceInfo> {
    Ok(ResourceInfo {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
        name: object.metadata.name.clone().unwrap_or_default(),
        namespace: object.metadata.namespace.clone(),
        resource_version: object.metadata.resource_version.clone().unwrap_or_default(),
        object: serde_json::to_value(object)?,
    })
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn capabilities(&self) -> Result<Capabilities> {
        let info = self.client.apiserver_version().await?;

        let discovery = self.discovery.read().await;
        let mut api_versions = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                if group.name().is_empty() {
                    api_versions.push(version.to_string());
                } else {
                    api_versions.push(format!("{}/{}", group.name(), version));
                }
            }
        }

        Ok(Capabilities::new(
            KubeVersion::new(&info.git_version),
            api_versions,
        ))
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<OperationSummary> {
        let mut summary = OperationSummary::default();

        for resource in self.resolve(namespace, manifest).await? {
            let name = resource.display_name();
            match self.apply_one(&resource).await {
                Ok(()) => summary.succeeded.push(name),
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }

        tracing::debug!(%namespace, summary = %summary.summary(), "applied manifest");
        Ok(summary)
    }

    async fn delete_manifest(&self, namespace: &str, manifest: &str) -> Result<OperationSummary> {
        let mut summary = OperationSummary::default();
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        for resource in self.resolve(namespace, manifest).await?.iter().rev() {
            let name = resource.display_name();

            if resource.has_keep_policy() {
                summary
                    .skipped
                    .push((name, "resource-policy: keep".to_string()));
                continue;
            }

            match resource
                .api(&self.client)
                .delete(&resource.reference.name, &params)
                .await
            {
                Ok(_) => summary.succeeded.push(name),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    summary.skipped.push((name, "not found".to_string()))
                }
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }

        tracing::debug!(%namespace, summary = %summary.summary(), "deleted manifest");
        Ok(summary)
    }

    async fn build_unstructured(
        &self,
        namespace: &str,
        manifest: &str,
    ) -> Result<Vec<ResourceInfo>> {
        let mut infos = Vec::new();

        for resource in self.resolve(namespace, manifest).await? {
            let api = resource.api(&self.client);
            if let Some(live) = api.get_opt(&resource.reference.name).await? {
                let (group, version) = resource.reference.group_version();
                infos.push(resource_info(&group, &version, &resource.reference.kind, &live)?);
            }
        }

        Ok(infos)
    }

    async fn related_pods(&self, info: &ResourceInfo) -> Result<Vec<ResourceInfo>> {
        let (Some(selector), Some(namespace)) = (info.pod_selector(), info.namespace.as_deref())
        else {
            return Ok(Vec::new());
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;

        list.items
            .iter()
            .map(|pod| {
                Ok(ResourceInfo {
                    group: String::new(),
                    version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    name: pod.metadata.name.clone().unwrap_or_default(),
                    namespace: pod.metadata.namespace.clone(),
                    resource_version: pod.metadata.resource_version.clone().unwrap_or_default(),
                    object: serde_json::to_value(pod)?,
                })
            })
            .collect()
    }

    async fn stop_resources(&self, namespace: &str, manifest: &str) -> Result<()> {
        self.scale(namespace, manifest, true).await
    }

    async fn start_resources(&self, namespace: &str, manifest: &str) -> Result<()> {
        self.scale(namespace, manifest, false).await
    }
}
