//! Release engine
//!
//! [`ReleaseClient`] installs, upgrades, rolls back, deletes and inspects
//! named releases. It combines a chart source, the render pipeline, a storage
//! driver and the live cluster:
//!
//! 1. load the chart and the cluster capabilities
//! 2. first pass: scrub value expressions, render, label, restore
//! 3. second pass: render the labeled chart with the original values
//! 4. record the revision, then run hooks and apply manifests around it

use rudder_core::{
    CertManagerInfo, Chart, DeleteReleaseRequest, GetReleaseContentRequest, HookEvent,
    InstallReleaseRequest, OldEnv, Release, ReleaseHook, ReleaseResource, ReleaseStatus,
    RollbackReleaseRequest, StartReleaseRequest, StartReleaseResponse, StopReleaseRequest,
    StopReleaseResponse, TestReleaseRequest, UpgradeInfo, UpgradeReleaseRequest, Values,
};
use rudder_engine::{
    Engine, LabelRequest, ManifestLabeler, PreparedChart, RenderPipeline, RenderRequest,
    RenderedRelease, YamlLabeler,
};
use rudder_repo::ChartSource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterClient, removed_documents};
use crate::error::{KubeError, Result};
use crate::namespaces::Namespaces;
use crate::release::StoredRelease;
use crate::storage::StorageDriver;

/// Release engine settings, fixed at startup
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chart this agent is packaged as; upgrades of it skip label injection
    pub agent_chart: String,

    /// Chart of the previous generation of this agent
    pub legacy_agent_chart: String,

    pub cert_manager_chart: String,

    /// Namespace chart tests run in
    pub test_namespace: String,

    /// Upper bound for one store and cluster sequence
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_chart: "rudder-agent".to_string(),
            legacy_agent_chart: "rudder-env-agent".to_string(),
            cert_manager_chart: "cert-manager".to_string(),
            test_namespace: "rudder-test".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Label-free pass used for the agent's own chart
struct Unlabeled;

impl ManifestLabeler for Unlabeled {
    fn label_objects(
        &self,
        manifest: &str,
        _request: &LabelRequest<'_>,
    ) -> rudder_engine::Result<String> {
        Ok(manifest.to_string())
    }
}

/// High-level release operations
pub struct ReleaseClient<S: StorageDriver> {
    storage: S,
    charts: Arc<dyn ChartSource>,
    cluster: Arc<dyn ClusterClient>,
    labeler: Arc<dyn ManifestLabeler>,
    engine: Engine,
    config: EngineConfig,
    namespaces: Namespaces,
}

impl<S: StorageDriver> ReleaseClient<S> {
    pub fn new(
        storage: S,
        charts: Arc<dyn ChartSource>,
        cluster: Arc<dyn ClusterClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            charts,
            cluster,
            labeler: Arc::new(YamlLabeler::new()),
            engine: Engine::builder().strict(true).build(),
            config,
            namespaces: Namespaces::new(),
        }
    }

    pub fn with_labeler(mut self, labeler: Arc<dyn ManifestLabeler>) -> Self {
        self.labeler = labeler;
        self
    }

    /// Share a tracked namespace set with the caller
    pub fn with_namespaces(mut self, namespaces: Namespaces) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }

    // ========== Queries ==========

    /// Latest revision of every release in a namespace (all namespaces if empty)
    ///
    /// Store failures are logged and yield an empty list, so callers cannot
    /// assume the result is complete.
    pub async fn list_release(&self, namespace: &str) -> Vec<Release> {
        let scope = (!namespace.is_empty()).then_some(namespace);
        match self.storage.list(scope, false).await {
            Ok(releases) => releases.iter().map(StoredRelease::to_release).collect(),
            Err(e) => {
                tracing::warn!(%namespace, error = %e, "listing releases failed");
                Vec::new()
            }
        }
    }

    /// Latest revision without live resources
    pub async fn get_release(&self, name: &str) -> Result<Release> {
        let stored = self.bounded(self.storage.get_latest(name)).await?;
        Ok(stored.to_release())
    }

    /// A revision (latest when `version` is 0) with its live resources
    pub async fn get_release_content(&self, req: &GetReleaseContentRequest) -> Result<Release> {
        let stored = if req.version == 0 {
            self.bounded(self.storage.get_latest(&req.release_name)).await?
        } else {
            self.bounded(self.storage.get(&req.release_name, req.version))
                .await?
        };

        let mut release = stored.to_release();
        release.resources = self
            .bounded(self.resources(&stored.namespace, &stored.manifest))
            .await?;
        Ok(release)
    }

    // ========== Install ==========

    /// Render a new release and return its hooks, without touching the cluster
    pub async fn pre_install_release(&self, req: &InstallReleaseRequest) -> Result<Vec<ReleaseHook>> {
        self.ensure_absent(&req.release_name, &req.namespace).await?;

        let chart = self.load_chart(&req.repo_url, &req.chart_name, &req.chart_version).await?;
        let capabilities = self.bounded(self.cluster.capabilities()).await?;

        let rendered = self.pipeline(self.labeler.as_ref()).render(
            &chart,
            &RenderRequest {
                namespace: &req.namespace,
                release_name: &req.release_name,
                revision: 1,
                values: &req.values,
                capabilities: &capabilities,
            },
        )?;
        Ok(rendered.release_hooks(&req.release_name))
    }

    pub async fn install_release(&self, req: &InstallReleaseRequest) -> Result<Release> {
        self.install(req, None).await
    }

    // ========== Upgrade ==========

    /// Render the next revision and return its hooks
    ///
    /// Falls back to [`pre_install_release`](Self::pre_install_release) when
    /// the release does not exist.
    pub async fn pre_upgrade_release(&self, req: &UpgradeReleaseRequest) -> Result<Vec<ReleaseHook>> {
        let current = match self.find_latest(&req.release_name).await? {
            Some(current) => current,
            None => return self.pre_install_release(&req.to_install()).await,
        };

        let chart = self.load_chart(&req.repo_url, &req.chart_name, &req.chart_version).await?;
        let capabilities = self.bounded(self.cluster.capabilities()).await?;

        let rendered = self.pipeline(self.labeler.as_ref()).render(
            &chart,
            &RenderRequest {
                namespace: &req.namespace,
                release_name: &req.release_name,
                revision: current.version + 1,
                values: &req.values,
                capabilities: &capabilities,
            },
        )?;
        Ok(rendered.release_hooks(&req.release_name))
    }

    /// Upgrade a release, installing it when it does not exist
    ///
    /// A failure after the new revision was recorded returns
    /// [`KubeError::PartiallyApplied`] carrying that revision.
    pub async fn upgrade_release(&self, req: &UpgradeReleaseRequest) -> Result<Release> {
        let current = match self.find_latest(&req.release_name).await? {
            Some(current) => current,
            None => return self.install_release(&req.to_install()).await,
        };
        ensure_idle(&current)?;

        let chart = self.load_chart(&req.repo_url, &req.chart_name, &req.chart_version).await?;
        let capabilities = self.bounded(self.cluster.capabilities()).await?;
        let revision = current.version + 1;

        let labeler: &dyn ManifestLabeler = if req.chart_name == self.config.agent_chart {
            tracing::info!(release = %req.release_name, "agent chart upgrade, skipping label injection");
            &Unlabeled
        } else {
            self.labeler.as_ref()
        };

        let request = RenderRequest {
            namespace: &current.namespace,
            release_name: &req.release_name,
            revision,
            values: &req.values,
            capabilities: &capabilities,
        };
        let labels = LabelRequest {
            image_pull_secrets: &req.image_pull_secrets,
            release_name: &req.release_name,
            chart_name: &req.chart_name,
            chart_version: &req.chart_version,
            test_label: None,
        };
        let (prepared, rendered) = self.render_twice(labeler, &chart, &request, &labels)?;

        let mut next = StoredRelease::for_upgrade(
            &current,
            &req.chart_name,
            &req.chart_version,
            &req.values,
            rendered.manifest_text(),
        );
        next.hooks = rendered.release_hooks(&req.release_name);
        next.notes = prepared.notes;
        next.commit = commit_of(&req.commit);

        let next = self
            .bounded(self.commit_revision(
                Some(&current),
                next,
                HookEvent::PreUpgrade,
                HookEvent::PostUpgrade,
            ))
            .await?;

        tracing::info!(release = %next.name, revision = next.version, "upgraded release");
        Ok(self.decorate(&next).await)
    }

    // ========== Rollback ==========

    /// Roll back to `req.version`, or to the previous revision when it is 0
    pub async fn rollback_release(&self, req: &RollbackReleaseRequest) -> Result<Release> {
        let history = self.bounded(self.storage.history(&req.release_name)).await?;
        let current = history.first().ok_or_else(|| KubeError::ReleaseNotFound {
            name: req.release_name.clone(),
        })?;
        ensure_idle(current)?;

        let target = if req.version == 0 {
            history
                .get(1)
                .ok_or_else(|| KubeError::RollbackNotPossible {
                    name: req.release_name.clone(),
                    reason: "no previous revision".to_string(),
                })?
                .clone()
        } else {
            self.bounded(self.storage.get(&req.release_name, req.version))
                .await?
        };

        if target.version == current.version {
            return Err(KubeError::RollbackNotPossible {
                name: req.release_name.clone(),
                reason: format!("revision {} is already current", target.version),
            });
        }

        let next = StoredRelease::for_rollback(current, &target);
        let next = self
            .bounded(self.commit_revision(
                Some(current),
                next,
                HookEvent::PreRollback,
                HookEvent::PostRollback,
            ))
            .await?;

        tracing::info!(
            release = %next.name,
            revision = next.version,
            target = target.version,
            "rolled back release"
        );
        Ok(self.decorate(&next).await)
    }

    // ========== Delete ==========

    /// Run delete hooks, remove the release's objects and purge every revision
    pub async fn delete_release(&self, req: &DeleteReleaseRequest) -> Result<Release> {
        let mut stored = self.bounded(self.storage.get_latest(&req.release_name)).await?;

        stored.mark_deleting();
        if let Err(e) = self.storage.update(&stored).await {
            tracing::warn!(release = %stored.name, error = %e, "could not record deleting state");
        }

        self.bounded(async {
            self.run_hooks(&stored, HookEvent::PreDelete).await?;
            self.cluster
                .delete_manifest(&stored.namespace, &stored.manifest)
                .await?
                .into_result("delete")?;
            self.run_hooks(&stored, HookEvent::PostDelete).await?;
            self.storage.delete_all(&stored.name).await
        })
        .await?;

        tracing::info!(release = %stored.name, namespace = %stored.namespace, "deleted release");
        let mut release = self.decorate(&stored).await;
        release.status = ReleaseStatus::Deleted;
        Ok(release)
    }

    /// Delete every release in a namespace
    ///
    /// Each deletion is independent; failures are collected and reported
    /// together once all releases were attempted.
    pub async fn delete_namespace_releases(&self, namespace: &str) -> Result<()> {
        let releases = self.bounded(self.storage.list(Some(namespace), false)).await?;

        let mut failures = Vec::new();
        for release in releases {
            let req = DeleteReleaseRequest {
                release_name: release.name.clone(),
            };
            if let Err(e) = self.delete_release(&req).await {
                tracing::warn!(release = %release.name, error = %e, "release deletion failed");
                failures.push(format!("{}: {}", release.name, e));
            }
        }

        self.namespaces.remove(namespace);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KubeError::NamespaceCleanup {
                namespace: namespace.to_string(),
                failures,
            })
        }
    }

    // ========== Start / stop ==========

    pub async fn start_release(&self, req: &StartReleaseRequest) -> Result<StartReleaseResponse> {
        let stored = self.bounded(self.storage.get_latest(&req.release_name)).await?;
        self.bounded(
            self.cluster
                .start_resources(namespace_or(&req.namespace, &stored), &stored.manifest),
        )
        .await?;

        tracing::info!(release = %req.release_name, "started release");
        Ok(StartReleaseResponse {
            release_name: req.release_name.clone(),
        })
    }

    pub async fn stop_release(&self, req: &StopReleaseRequest) -> Result<StopReleaseResponse> {
        let stored = self.bounded(self.storage.get_latest(&req.release_name)).await?;
        self.bounded(
            self.cluster
                .stop_resources(namespace_or(&req.namespace, &stored), &stored.manifest),
        )
        .await?;

        tracing::info!(release = %req.release_name, "stopped release");
        Ok(StopReleaseResponse {
            release_name: req.release_name.clone(),
        })
    }

    // ========== Tests ==========

    /// Install a chart into the test namespace with test labels
    pub async fn execute_test(&self, req: &TestReleaseRequest) -> Result<Release> {
        let install = InstallReleaseRequest {
            repo_url: req.repo_url.clone(),
            chart_name: req.chart_name.clone(),
            chart_version: req.chart_version.clone(),
            values: req.values.clone(),
            release_name: req.release_name.clone(),
            commit: String::new(),
            namespace: self.config.test_namespace.clone(),
            image_pull_secrets: req.image_pull_secrets.clone(),
        };
        self.install(&install, Some(&req.label)).await
    }

    // ========== Housekeeping ==========

    /// Find legacy agent releases to migrate and the cert-manager release
    ///
    /// A legacy release is migratable when its `config.connect` value equals
    /// `connect_url` and its namespace is not tracked; it is stopped and
    /// reported with its `config.envId`. Releases with unreadable config are
    /// skipped and a failed stop is only logged.
    pub async fn list_agent(
        &self,
        connect_url: &str,
    ) -> Result<(UpgradeInfo, Option<CertManagerInfo>)> {
        let releases = self.bounded(self.storage.list(None, false)).await?;

        let mut upgrade = UpgradeInfo::default();
        let mut cert_manager = None;

        for release in releases {
            if release.chart_name == self.config.cert_manager_chart {
                cert_manager = Some(CertManagerInfo {
                    release_name: release.name.clone(),
                    namespace: release.namespace.clone(),
                    version: release.chart_version.clone(),
                });
                continue;
            }

            if release.chart_name != self.config.legacy_agent_chart
                || self.namespaces.contains(&release.namespace)
            {
                continue;
            }

            let values = match Values::from_yaml(&release.config) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(
                        release = %release.name,
                        namespace = %release.namespace,
                        error = %e,
                        "unreadable legacy agent config, skipping"
                    );
                    continue;
                }
            };
            if values.get_str("config.connect") != Some(connect_url) {
                continue;
            }

            if let Err(e) = self
                .bounded(
                    self.cluster
                        .stop_resources(&release.namespace, &release.manifest),
                )
                .await
            {
                tracing::warn!(
                    release = %release.name,
                    namespace = %release.namespace,
                    error = %e,
                    "failed to stop legacy agent"
                );
            }

            let env_id = values.get("config.envId").and_then(|v| {
                v.as_i64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            });
            tracing::info!(
                release = %release.name,
                namespace = %release.namespace,
                env_id = ?env_id,
                "found migratable legacy agent"
            );
            upgrade.envs.push(OldEnv {
                env_id: env_id.unwrap_or_default(),
                namespace: release.namespace.clone(),
            });
        }

        Ok((upgrade, cert_manager))
    }

    // ========== Internals ==========

    async fn install(&self, req: &InstallReleaseRequest, test_label: Option<&str>) -> Result<Release> {
        self.ensure_absent(&req.release_name, &req.namespace).await?;

        let chart = self.load_chart(&req.repo_url, &req.chart_name, &req.chart_version).await?;
        let capabilities = self.bounded(self.cluster.capabilities()).await?;

        let request = RenderRequest {
            namespace: &req.namespace,
            release_name: &req.release_name,
            revision: 1,
            values: &req.values,
            capabilities: &capabilities,
        };
        let labels = LabelRequest {
            image_pull_secrets: &req.image_pull_secrets,
            release_name: &req.release_name,
            chart_name: &req.chart_name,
            chart_version: &req.chart_version,
            test_label,
        };
        let (prepared, rendered) =
            self.render_twice(self.labeler.as_ref(), &chart, &request, &labels)?;

        let mut release = StoredRelease::for_install(
            &req.release_name,
            &req.namespace,
            &req.chart_name,
            &req.chart_version,
            &req.values,
            rendered.manifest_text(),
        );
        release.hooks = rendered.release_hooks(&req.release_name);
        release.notes = prepared.notes;
        release.commit = commit_of(&req.commit);

        let result = self
            .bounded(self.commit_revision(
                None,
                release.clone(),
                HookEvent::PreInstall,
                HookEvent::PostInstall,
            ))
            .await;

        match result {
            Ok(installed) => {
                tracing::info!(
                    release = %installed.name,
                    namespace = %installed.namespace,
                    chart = %installed.chart_name,
                    version = %installed.chart_version,
                    "installed release"
                );
                Ok(self.decorate(&installed).await)
            }
            // another install owns this name; nothing of ours to clean up
            Err(e) if e.is_conflict() => Err(e),
            Err(e) => Err(self.cleanup_install(&release, e).await),
        }
    }

    /// Purge a failed install; both errors surface if the purge fails too
    async fn cleanup_install(&self, release: &StoredRelease, source: KubeError) -> KubeError {
        tracing::warn!(release = %release.name, error = %source, "install failed, cleaning up");

        let mut manifest = release.manifest.clone();
        for hook in &release.hooks {
            manifest.push_str("\n---\n");
            manifest.push_str(&hook.manifest);
        }

        let cleanup = self.bounded(async {
            self.cluster
                .delete_manifest(&release.namespace, &manifest)
                .await?
                .into_result("delete")?;
            match self.storage.delete_all(&release.name).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        });

        match cleanup.await {
            Ok(()) => source,
            Err(cleanup) => {
                tracing::error!(release = %release.name, error = %cleanup, "cleanup failed");
                KubeError::CleanupFailed {
                    source: Box::new(source),
                    cleanup: Box::new(cleanup),
                }
            }
        }
    }

    /// Record `next`, roll it out and mark the previous revision superseded
    ///
    /// Failures after `next` was recorded mark it failed and are returned as
    /// [`KubeError::PartiallyApplied`].
    async fn commit_revision(
        &self,
        previous: Option<&StoredRelease>,
        mut next: StoredRelease,
        pre: HookEvent,
        post: HookEvent,
    ) -> Result<StoredRelease> {
        self.storage.create(&next).await?;

        let rolled_out = async {
            self.run_hooks(&next, pre).await?;
            self.cluster
                .apply_manifest(&next.namespace, &next.manifest)
                .await?
                .into_result("apply")?;

            if let Some(previous) = previous {
                let removed = removed_documents(&previous.manifest, &next.manifest)?;
                if !removed.is_empty() {
                    self.cluster
                        .delete_manifest(&next.namespace, &removed)
                        .await?
                        .into_result("delete")?;
                }
            }

            self.run_hooks(&next, post).await
        }
        .await;

        let outcome = match rolled_out {
            Ok(()) => {
                next.mark_deployed();
                self.storage.update(&next).await
            }
            Err(e) => Err(e),
        };

        if let Err(source) = outcome {
            next.mark_failed(source.to_string());
            if let Err(e) = self.storage.update(&next).await {
                tracing::warn!(release = %next.name, error = %e, "could not record failed state");
            }
            return Err(KubeError::PartiallyApplied {
                release: Box::new(next.to_release()),
                source: Box::new(source),
            });
        }

        if let Some(previous) = previous {
            let mut previous = previous.clone();
            previous.mark_superseded();
            if let Err(e) = self.storage.update(&previous).await {
                tracing::warn!(
                    release = %previous.name,
                    revision = previous.version,
                    error = %e,
                    "could not mark revision superseded"
                );
            }
        }

        Ok(next)
    }

    /// Apply the hooks bound to `event`, by ascending weight
    async fn run_hooks(&self, release: &StoredRelease, event: HookEvent) -> Result<()> {
        let mut hooks: Vec<&ReleaseHook> =
            release.hooks.iter().filter(|h| h.runs_on(event)).collect();
        hooks.sort_by_key(|h| h.weight);

        for hook in hooks {
            tracing::debug!(release = %release.name, hook = %hook.name, %event, "running hook");
            self.cluster
                .apply_manifest(&release.namespace, &hook.manifest)
                .await?
                .into_result("apply hook")?;
        }
        Ok(())
    }

    /// First pass (scrub, render, label, restore) then the second pass with
    /// the original values
    fn render_twice(
        &self,
        labeler: &dyn ManifestLabeler,
        chart: &Chart,
        request: &RenderRequest<'_>,
        labels: &LabelRequest<'_>,
    ) -> Result<(PreparedChart, RenderedRelease)> {
        let pipeline = self.pipeline(labeler);
        let prepared = pipeline.prepare(chart, request, labels)?;
        let rendered = pipeline.render(&prepared.chart, request)?;
        Ok((prepared, rendered))
    }

    fn pipeline<'a>(&'a self, labeler: &'a dyn ManifestLabeler) -> RenderPipeline<'a> {
        RenderPipeline::new(&self.engine, labeler)
    }

    async fn load_chart(&self, repo_url: &str, name: &str, version: &str) -> Result<Chart> {
        self.bounded(async {
            self.charts
                .get_chart(repo_url, name, version)
                .await
                .map_err(KubeError::from)
        })
        .await
    }

    async fn find_latest(&self, name: &str) -> Result<Option<StoredRelease>> {
        match self.bounded(self.storage.get_latest(name)).await {
            Ok(release) => Ok(Some(release)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_absent(&self, name: &str, namespace: &str) -> Result<()> {
        match self.find_latest(name).await? {
            Some(existing) => Err(KubeError::ReleaseAlreadyExists {
                name: name.to_string(),
                namespace: if existing.namespace.is_empty() {
                    namespace.to_string()
                } else {
                    existing.namespace
                },
            }),
            None => Ok(()),
        }
    }

    /// Live objects of a manifest, each workload followed by its pods
    async fn resources(&self, namespace: &str, manifest: &str) -> Result<Vec<ReleaseResource>> {
        let infos = self.cluster.build_unstructured(namespace, manifest).await?;

        let mut resources = Vec::with_capacity(infos.len());
        for info in &infos {
            resources.push(info.to_release_resource());
            for pod in self.cluster.related_pods(info).await? {
                resources.push(pod.to_release_resource());
            }
        }
        Ok(resources)
    }

    /// Public view of a revision with live resources, best effort
    async fn decorate(&self, stored: &StoredRelease) -> Release {
        let mut release = stored.to_release();
        match self
            .bounded(self.resources(&stored.namespace, &stored.manifest))
            .await
        {
            Ok(resources) => release.resources = resources,
            Err(e) => {
                tracing::warn!(release = %stored.name, error = %e, "resource lookup failed")
            }
        }
        release
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.timeout, operation).await?
    }
}

fn ensure_idle(release: &StoredRelease) -> Result<()> {
    if release.state.is_pending() && !release.state.is_stale() {
        return Err(KubeError::OperationInProgress {
            name: release.name.clone(),
            status: release.state.status_name().to_string(),
        });
    }
    Ok(())
}

fn commit_of(commit: &str) -> Option<String> {
    (!commit.is_empty()).then(|| commit.to_string())
}

fn namespace_or<'a>(requested: &'a str, stored: &'a StoredRelease) -> &'a str {
    if requested.is_empty() {
        &stored.namespace
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::error::ErrorKind;
    use crate::storage::MockStorageDriver;
    use rudder_core::{Capabilities, ChartMetadata, ImagePullSecret};
    use rudder_engine::RELEASE_LABEL;
    use rudder_repo::MemoryChartSource;

    const CONFIG_MAP: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ release.name }}-conf
data:
  app.conf: |
{{ values.conf | indent(4) }}
"#;

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release.name }}
spec:
  replicas: {{ values.replicas }}
  selector:
    matchLabels:
      app: {{ release.name }}
  template:
    spec:
      containers:
        - name: web
          image: "nginx:{{ chart.version }}"
"#;

    const HOOK: &str = r#"apiVersion: batch/v1
kind: Job
metadata:
  name: {{ release.name }}-migrate
  annotations:
    helm.sh/hook: pre-install,pre-upgrade
spec:
  template:
    spec:
      restartPolicy: Never
      containers: []
"#;

    const WORKER: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release.name }}-worker
spec:
  replicas: 1
"#;

    fn web_chart(version: &str) -> Chart {
        Chart::new(ChartMetadata::new("web", version))
            .with_values("replicas: 1\nconf: \"{{ cluster.helper }}\"\n")
            .with_template("templates/cm.yaml", CONFIG_MAP)
            .with_template("templates/deploy.yaml", DEPLOYMENT)
            .with_template("templates/job.yaml", HOOK)
    }

    fn charts() -> MemoryChartSource {
        MemoryChartSource::new()
            .with_chart(web_chart("1.0.0"))
            .with_chart(web_chart("2.0.0").with_template("templates/worker.yaml", WORKER))
            .with_chart(
                Chart::new(ChartMetadata::new("rudder-agent", "0.2.0"))
                    .with_template("templates/deploy.yaml", DEPLOYMENT)
                    .with_values("replicas: 1\n"),
            )
    }

    fn client() -> (ReleaseClient<MockStorageDriver>, MockStorageDriver, MockCluster) {
        let storage = MockStorageDriver::new();
        let cluster = MockCluster::new().with_capabilities(Capabilities::default());
        let client = ReleaseClient::new(
            storage.clone(),
            Arc::new(charts()),
            Arc::new(cluster.clone()),
            EngineConfig::default(),
        );
        (client, storage, cluster)
    }

    fn install_request(name: &str) -> InstallReleaseRequest {
        InstallReleaseRequest {
            repo_url: "https://charts.example.com".to_string(),
            chart_name: "web".to_string(),
            chart_version: "1.0.0".to_string(),
            values: "replicas: 2\n".to_string(),
            release_name: name.to_string(),
            commit: "c1".to_string(),
            namespace: "proj".to_string(),
            image_pull_secrets: vec![ImagePullSecret::new("registry")],
        }
    }

    fn upgrade_request(name: &str, version: &str, values: &str) -> UpgradeReleaseRequest {
        UpgradeReleaseRequest {
            repo_url: "https://charts.example.com".to_string(),
            chart_name: "web".to_string(),
            chart_version: version.to_string(),
            values: values.to_string(),
            release_name: name.to_string(),
            commit: "c2".to_string(),
            namespace: "proj".to_string(),
            image_pull_secrets: vec![],
        }
    }

    #[tokio::test]
    async fn test_install_records_labels_and_decorates() {
        let (client, storage, cluster) = client();

        let release = client.install_release(&install_request("app")).await.unwrap();

        assert_eq!(release.revision, 1);
        assert_eq!(release.status, ReleaseStatus::Deployed);
        assert_eq!(release.commit.as_deref(), Some("c1"));
        assert_eq!(release.config, "replicas: 2\n");
        assert!(release.manifest.contains(RELEASE_LABEL));
        assert!(release.manifest.contains("replicas: 2"));
        assert!(release.manifest.contains("name: registry"));
        assert!(release.manifest.contains("    {{ cluster.helper }}"));
        assert_eq!(release.hooks.len(), 1);

        // ConfigMap and Deployment are live, plus the hook Job
        assert_eq!(release.resources.len(), 2);
        assert_eq!(cluster.applied()[0], "proj/Job/app-migrate");
        assert!(cluster.object("Deployment", "proj", "app").is_some());

        let stored = storage.get_latest("app").await.unwrap();
        assert_eq!(stored.state.status_name(), "deployed");
    }

    #[tokio::test]
    async fn test_second_install_conflicts_without_mutation() {
        let (client, storage, _) = client();
        client.install_release(&install_request("app")).await.unwrap();

        let err = client.install_release(&install_request("app")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let stored = storage.get_latest("app").await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(storage.release_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_is_purged() {
        let (client, storage, cluster) = client();
        cluster.fail_apply("Deployment");

        let err = client.install_release(&install_request("app")).await.unwrap_err();
        assert!(matches!(err, KubeError::PartiallyApplied { .. }));
        assert_eq!(storage.release_count(), 0);
        assert!(cluster.object("ConfigMap", "proj", "app-conf").is_none());
    }

    #[tokio::test]
    async fn test_failed_cleanup_reports_both_errors() {
        let (client, storage, cluster) = client();
        cluster.fail_apply("Deployment");
        storage.fail_on("delete");

        let err = client.install_release(&install_request("app")).await.unwrap_err();
        match err {
            KubeError::CleanupFailed { source, cleanup } => {
                assert!(matches!(*source, KubeError::PartiallyApplied { .. }));
                assert!(cleanup.to_string().contains("injected delete failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_upgrades_increase_revision() {
        let (client, storage, _) = client();
        client.install_release(&install_request("app")).await.unwrap();

        for n in 0..3 {
            let values = format!("replicas: {}\n", n + 3);
            let release = client
                .upgrade_release(&upgrade_request("app", "1.0.0", &values))
                .await
                .unwrap();
            assert_eq!(release.revision, n + 2);
            assert_eq!(release.commit.as_deref(), Some("c2"));
        }

        let history = storage.history("app").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].state.status_name(), "deployed");
        assert!(history[1..].iter().all(|r| r.state.status_name() == "superseded"));
    }

    #[tokio::test]
    async fn test_upgrade_without_release_installs() {
        let (client, _, _) = client();

        let release = client
            .upgrade_release(&upgrade_request("app", "1.0.0", "replicas: 1\n"))
            .await
            .unwrap();
        assert_eq!(release.revision, 1);
        assert_eq!(release.commit.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_upgrade_deletes_removed_objects() {
        let (client, _, cluster) = client();
        client
            .upgrade_release(&upgrade_request("app", "2.0.0", "replicas: 1\n"))
            .await
            .unwrap();
        assert!(cluster.object("Deployment", "proj", "app-worker").is_some());

        client
            .upgrade_release(&upgrade_request("app", "1.0.0", "replicas: 1\n"))
            .await
            .unwrap();
        assert!(cluster.object("Deployment", "proj", "app-worker").is_none());
        assert!(cluster.object("Deployment", "proj", "app").is_some());
    }

    #[tokio::test]
    async fn test_failed_upgrade_returns_partial_release() {
        let (client, storage, cluster) = client();
        client.install_release(&install_request("app")).await.unwrap();
        cluster.fail_apply("ConfigMap");

        let err = client
            .upgrade_release(&upgrade_request("app", "1.0.0", "replicas: 5\n"))
            .await
            .unwrap_err();

        let partial = err.partial_release().unwrap();
        assert_eq!(partial.revision, 2);
        assert_eq!(partial.status, ReleaseStatus::Failed);
        assert_eq!(storage.get_latest("app").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_agent_chart_upgrade_skips_labels() {
        let (client, _, _) = client();
        let mut req = upgrade_request("agent", "0.2.0", "replicas: 1\n");
        req.chart_name = "rudder-agent".to_string();

        client.install_release(&req.to_install()).await.unwrap();
        let release = client.upgrade_release(&req).await.unwrap();

        assert_eq!(release.revision, 2);
        assert!(!release.manifest.contains(RELEASE_LABEL));
    }

    #[tokio::test]
    async fn test_pre_install_and_pre_upgrade_hooks() {
        let (client, _, cluster) = client();

        let hooks = client.pre_install_release(&install_request("app")).await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].name, "app-migrate");
        assert!(!hooks[0].manifest.contains(RELEASE_LABEL));
        assert!(cluster.applied().is_empty());

        client.install_release(&install_request("app")).await.unwrap();
        let err = client.pre_install_release(&install_request("app")).await.unwrap_err();
        assert!(err.is_conflict());

        let hooks = client
            .pre_upgrade_release(&upgrade_request("app", "1.0.0", ""))
            .await
            .unwrap();
        assert!(hooks[0].runs_on(HookEvent::PreUpgrade));
    }

    #[tokio::test]
    async fn test_rollback_to_previous() {
        let (client, _, _) = client();
        client.install_release(&install_request("app")).await.unwrap();
        client
            .upgrade_release(&upgrade_request("app", "1.0.0", "replicas: 7\n"))
            .await
            .unwrap();

        let release = client
            .rollback_release(&RollbackReleaseRequest {
                release_name: "app".to_string(),
                version: 0,
            })
            .await
            .unwrap();
        assert_eq!(release.revision, 3);
        assert_eq!(release.config, "replicas: 2\n");
        assert_eq!(release.commit.as_deref(), Some("c1"));

        let err = client
            .rollback_release(&RollbackReleaseRequest {
                release_name: "app".to_string(),
                version: 3,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::RollbackNotPossible { .. }));
    }

    #[tokio::test]
    async fn test_delete_purges_everything() {
        let (client, storage, cluster) = client();
        client.install_release(&install_request("app")).await.unwrap();

        let release = client
            .delete_release(&DeleteReleaseRequest {
                release_name: "app".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(release.status, ReleaseStatus::Deleted);
        assert_eq!(storage.release_count(), 0);
        assert!(cluster.object("Deployment", "proj", "app").is_none());

        let err = client.get_release("app").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_namespace_releases_is_per_release() {
        let (client, storage, cluster) = client();
        client.install_release(&install_request("a")).await.unwrap();
        client.install_release(&install_request("b")).await.unwrap();

        client.delete_namespace_releases("proj").await.unwrap();
        assert_eq!(storage.release_count(), 0);

        client.install_release(&install_request("c")).await.unwrap();
        client.install_release(&install_request("d")).await.unwrap();
        cluster.fail_delete();

        let err = client.delete_namespace_releases("proj").await.unwrap_err();
        match err {
            KubeError::NamespaceCleanup { failures, .. } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_and_start() {
        let (client, _, cluster) = client();
        client.install_release(&install_request("app")).await.unwrap();

        let stopped = client
            .stop_release(&StopReleaseRequest {
                release_name: "app".to_string(),
                namespace: "proj".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(stopped.release_name, "app");
        let replicas = |c: &MockCluster| {
            c.object("Deployment", "proj", "app")
                .and_then(|o| o.object.pointer("/spec/replicas").and_then(|r| r.as_u64()))
        };
        assert_eq!(replicas(&cluster), Some(0));

        client
            .start_release(&StartReleaseRequest {
                release_name: "app".to_string(),
                namespace: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(replicas(&cluster), Some(2));

        let err = client
            .stop_release(&StopReleaseRequest {
                release_name: "missing".to_string(),
                namespace: "proj".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_release_variants() {
        let (client, _, _) = client();
        client.install_release(&install_request("app")).await.unwrap();

        let plain = client.get_release("app").await.unwrap();
        assert!(plain.resources.is_empty());

        let content = client
            .get_release_content(&GetReleaseContentRequest {
                release_name: "app".to_string(),
                version: 0,
            })
            .await
            .unwrap();
        assert_eq!(content.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_list_release_tolerates_store_errors() {
        let (client, storage, _) = client();
        client.install_release(&install_request("app")).await.unwrap();

        assert_eq!(client.list_release("proj").await.len(), 1);
        assert_eq!(client.list_release("").await.len(), 1);

        storage.fail_on("list");
        assert!(client.list_release("proj").await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_test_uses_test_namespace() {
        let (client, _, cluster) = client();

        let release = client
            .execute_test(&TestReleaseRequest {
                repo_url: "https://charts.example.com".to_string(),
                chart_name: "web".to_string(),
                chart_version: "1.0.0".to_string(),
                values: String::new(),
                release_name: "app-test".to_string(),
                label: "run-42".to_string(),
                image_pull_secrets: vec![],
            })
            .await
            .unwrap();

        assert_eq!(release.namespace, "rudder-test");
        assert!(release.manifest.contains("run-42"));
        assert!(cluster.object("Deployment", "rudder-test", "app-test").is_some());
    }

    #[tokio::test]
    async fn test_list_agent_finds_legacy_and_cert_manager() {
        let mut legacy = StoredRelease::for_install(
            "env-agent",
            "old-ns",
            "rudder-env-agent",
            "0.9.0",
            "config:\n  connect: wss://hub.example.com\n  envId: 42\n",
            "",
        );
        legacy.mark_deployed();
        let mut tracked = legacy.clone();
        tracked.name = "env-agent-2".to_string();
        tracked.namespace = "tracked".to_string();
        let mut cert = StoredRelease::for_install("cm", "cert-manager", "cert-manager", "1.14.0", "", "");
        cert.mark_deployed();

        let storage = MockStorageDriver::with_releases(vec![legacy, tracked, cert]);
        let client = ReleaseClient::new(
            storage,
            Arc::new(charts()),
            Arc::new(MockCluster::new()),
            EngineConfig::default(),
        )
        .with_namespaces(["tracked"].into_iter().collect());

        let (upgrade, cert_manager) = client.list_agent("wss://hub.example.com").await.unwrap();
        assert_eq!(
            upgrade.envs,
            vec![OldEnv {
                env_id: 42,
                namespace: "old-ns".to_string()
            }]
        );
        assert_eq!(cert_manager.unwrap().version, "1.14.0");

        let (upgrade, _) = client.list_agent("wss://other").await.unwrap();
        assert!(upgrade.envs.is_empty());
    }
    #[tokio::test]
    async fn test_list_agent_survives_bad_legacy_release() {
        let mut broken = StoredRelease::for_install(
            "env-agent-broken",
            "broken-ns",
            "rudder-env-agent",
            "0.9.0",
            "config: [unclosed",
            "",
        );
        broken.mark_deployed();
        let mut unstoppable = StoredRelease::for_install(
            "env-agent-stuck",
            "stuck-ns",
            "rudder-env-agent",
            "0.9.0",
            "config:\n  connect: wss://hub.example.com\n  envId: 7\n",
            "kind: [unclosed",
        );
        unstoppable.mark_deployed();
        let mut legacy = StoredRelease::for_install(
            "env-agent",
            "old-ns",
            "rudder-env-agent",
            "0.9.0",
            "config:\n  connect: wss://hub.example.com\n  envId: 42\n",
            "",
        );
        legacy.mark_deployed();
        let mut cert = StoredRelease::for_install("cm", "cert-manager", "cert-manager", "1.14.0", "", "");
        cert.mark_deployed();

        let client = ReleaseClient::new(
            MockStorageDriver::with_releases(vec![broken, unstoppable, legacy, cert]),
            Arc::new(charts()),
            Arc::new(MockCluster::new()),
            EngineConfig::default(),
        );

        let (upgrade, cert_manager) = client.list_agent("wss://hub.example.com").await.unwrap();
        let mut namespaces: Vec<_> = upgrade.envs.iter().map(|e| e.namespace.as_str()).collect();
        namespaces.sort_unstable();
        assert_eq!(namespaces, vec!["old-ns", "stuck-ns"]);
        assert_eq!(cert_manager.unwrap().release_name, "cm");
    }
}
