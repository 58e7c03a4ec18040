//! Release reconciliation
//!
//! One pass compares a `ChartRelease` with the release recorded by the
//! release engine and emits the single packet needed to converge:
//!
//! | desired | release | packet |
//! |---------|---------|--------|
//! | absent (definition gone) | - | none |
//! | absent | absent | none |
//! | absent | present | `ReleaseDelete` command |
//! | absent | present in another namespace | `ReleaseSyncedFailed` response |
//! | no commit annotation | - | none, error |
//! | present | absent | `ReleasePreInstall` command |
//! | present | lookup failed | `ReleaseSyncedFailed` response, error |
//! | present | chart, version and values equal | `ReleaseSynced` response |
//! | present | different | `ReleasePreUpgrade` command |
//!
//! A release recorded in another namespace additionally yields a
//! `ReleaseSyncedFailed` response before the comparison continues.
//! Nothing is cached between passes.

use async_trait::async_trait;
use rudder_core::{DeleteReleaseRequest, Release};
use rudder_kube::{KubeError, ReleaseClient, StorageDriver};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Outbox;
use crate::crd::ChartRelease;
use crate::error::{AgentError, Result};
use crate::packet::{Packet, PacketType, commit_key, release_key};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const QUERY_FAILED: &str = "release query failed, check the execution backend";
const FOREIGN_NAMESPACE: &str = "release already exists in another namespace";

/// Where desired state is read from
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// The resource, or `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ChartRelease>>;

    /// Whether the ChartRelease type itself is still installed
    async fn definition_exists(&self) -> Result<bool>;
}

/// Current release state as seen by the reconciler
#[async_trait]
pub trait ReleaseLookup: Send + Sync {
    async fn get_release(&self, name: &str) -> rudder_kube::Result<Release>;
}

#[async_trait]
impl<S: StorageDriver> ReleaseLookup for ReleaseClient<S> {
    async fn get_release(&self, name: &str) -> rudder_kube::Result<Release> {
        ReleaseClient::get_release(self, name).await
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The ChartRelease type was removed; nothing to do
    DefinitionRemoved,
    /// Neither the resource nor the release exists
    Absent,
    DeleteRequested,
    /// The resource is gone and its release name belongs to another namespace
    Foreign,
    InstallRequested,
    Synced,
    UpgradeRequested,
}

pub struct Reconciler {
    desired: Arc<dyn DesiredStateSource>,
    releases: Arc<dyn ReleaseLookup>,
    outbox: Outbox,
    query_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        desired: Arc<dyn DesiredStateSource>,
        releases: Arc<dyn ReleaseLookup>,
        outbox: Outbox,
    ) -> Self {
        Self {
            desired,
            releases,
            outbox,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        tracing::debug!(%namespace, %name, "reconciling");

        let Some(resource) = self.desired.get(namespace, name).await? else {
            return self.reconcile_removed(namespace, name).await;
        };

        let Some(commit) = resource.commit() else {
            return Err(AgentError::MissingCommit {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        };
        let report_key = commit_key(namespace, name, commit);

        let release = match self.lookup(name).await {
            Ok(release) => release,
            Err(e) if e.is_not_found() => {
                let packet = Packet::encode(
                    release_key(namespace, name),
                    PacketType::ReleasePreInstall,
                    &resource.install_request()?,
                );
                self.emit_command(packet).await?;
                tracing::info!(%namespace, %name, "release missing, install requested");
                return Ok(Outcome::InstallRequested);
            }
            Err(e) => {
                tracing::warn!(%namespace, %name, error = %e, "release lookup failed");
                self.outbox
                    .respond(Packet::message(
                        report_key,
                        PacketType::ReleaseSyncedFailed,
                        QUERY_FAILED,
                    ))
                    .await?;
                return Err(e.into());
            }
        };

        if release.namespace != namespace {
            tracing::error!(
                %namespace,
                %name,
                release_namespace = %release.namespace,
                "release belongs to another namespace"
            );
            self.outbox
                .respond(Packet::message(
                    report_key.clone(),
                    PacketType::ReleaseSyncedFailed,
                    FOREIGN_NAMESPACE,
                ))
                .await?;
        }

        if release.matches(
            &resource.spec.chart_name,
            &resource.spec.chart_version,
            &resource.spec.values,
        ) {
            tracing::info!(%namespace, %name, "release unchanged");
            self.outbox
                .respond(Packet::message(report_key, PacketType::ReleaseSynced, ""))
                .await?;
            return Ok(Outcome::Synced);
        }

        let packet = Packet::encode(
            release_key(namespace, name),
            PacketType::ReleasePreUpgrade,
            &resource.upgrade_request()?,
        );
        self.emit_command(packet).await?;
        tracing::info!(%namespace, %name, revision = release.revision, "release drifted, upgrade requested");
        Ok(Outcome::UpgradeRequested)
    }

    async fn reconcile_removed(&self, namespace: &str, name: &str) -> Result<Outcome> {
        if !self.desired.definition_exists().await? {
            tracing::warn!(%namespace, %name, "ChartRelease definition removed, ignoring");
            return Ok(Outcome::DefinitionRemoved);
        }

        match self.lookup(name).await {
            Err(e) if e.is_not_found() => return Ok(Outcome::Absent),
            Err(e) => tracing::debug!(%name, error = %e, "lookup failed, requesting delete anyway"),
            Ok(release) if release.namespace != namespace => {
                tracing::error!(
                    %namespace,
                    %name,
                    release_namespace = %release.namespace,
                    "removed ChartRelease names a release in another namespace, not deleting"
                );
                self.outbox
                    .respond(Packet::message(
                        release_key(namespace, name),
                        PacketType::ReleaseSyncedFailed,
                        FOREIGN_NAMESPACE,
                    ))
                    .await?;
                return Ok(Outcome::Foreign);
            }
            Ok(_) => {}
        }

        let packet = Packet::encode(
            release_key(namespace, name),
            PacketType::ReleaseDelete,
            &DeleteReleaseRequest {
                release_name: name.to_string(),
            },
        );
        self.emit_command(packet).await?;
        tracing::info!(%namespace, %name, "ChartRelease removed, delete requested");
        Ok(Outcome::DeleteRequested)
    }

    /// Release lookup bounded by the query timeout; a timeout is transient
    async fn lookup(&self, name: &str) -> rudder_kube::Result<Release> {
        tokio::time::timeout(self.query_timeout, self.releases.get_release(name))
            .await
            .map_err(KubeError::from)?
    }

    /// Queue a command; a payload that failed to encode is never queued
    async fn emit_command(&self, packet: Result<Packet>) -> Result<()> {
        match packet {
            Ok(packet) => self.outbox.command(packet).await,
            Err(e) => {
                tracing::error!(error = %e, "command suppressed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Inbox, channels};
    use crate::crd::fixtures::chart_release;
    use rudder_core::{InstallReleaseRequest, ReleaseStatus, UpgradeReleaseRequest};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDesired {
        resources: HashMap<(String, String), ChartRelease>,
        definition_removed: bool,
    }

    #[async_trait]
    impl DesiredStateSource for FakeDesired {
        async fn get(&self, namespace: &str, name: &str) -> Result<Option<ChartRelease>> {
            Ok(self
                .resources
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn definition_exists(&self) -> Result<bool> {
            Ok(!self.definition_removed)
        }
    }

    enum Lookup {
        Found(Release),
        Missing,
        Broken,
        Hang,
    }

    struct FakeReleases {
        lookup: Lookup,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ReleaseLookup for FakeReleases {
        async fn get_release(&self, name: &str) -> rudder_kube::Result<Release> {
            *self.calls.lock().unwrap() += 1;
            match &self.lookup {
                Lookup::Found(release) => Ok(release.clone()),
                Lookup::Missing => Err(KubeError::ReleaseNotFound {
                    name: name.to_string(),
                }),
                Lookup::Broken => Err(KubeError::Storage("connection refused".to_string())),
                Lookup::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    fn release(namespace: &str, chart_version: &str, config: &str) -> Release {
        Release {
            name: "app".to_string(),
            namespace: namespace.to_string(),
            revision: 3,
            status: ReleaseStatus::Deployed,
            chart_name: "web".to_string(),
            chart_version: chart_version.to_string(),
            config: config.to_string(),
            manifest: String::new(),
            hooks: vec![],
            resources: vec![],
            commit: Some("c0".to_string()),
        }
    }

    fn setup(resource: Option<ChartRelease>, lookup: Lookup) -> (Reconciler, Inbox) {
        let mut desired = FakeDesired::default();
        if let Some(resource) = resource {
            desired.resources.insert(
                (
                    resource.metadata.namespace.clone().unwrap_or_default(),
                    resource.metadata.name.clone().unwrap_or_default(),
                ),
                resource,
            );
        }
        let releases = FakeReleases {
            lookup,
            calls: Mutex::new(0),
        };
        let (outbox, inbox) = channels(8, 8);
        let reconciler = Reconciler::new(Arc::new(desired), Arc::new(releases), outbox)
            .with_query_timeout(Duration::from_secs(1));
        (reconciler, inbox)
    }

    fn drain(inbox: &mut Inbox) -> (Vec<Packet>, Vec<Packet>) {
        let mut commands = Vec::new();
        while let Ok(p) = inbox.commands.try_recv() {
            commands.push(p);
        }
        let mut responses = Vec::new();
        while let Ok(p) = inbox.responses.try_recv() {
            responses.push(p);
        }
        (commands, responses)
    }

    #[tokio::test]
    async fn test_missing_release_requests_install() {
        let (reconciler, mut inbox) =
            setup(Some(chart_release("proj", "app", Some("c1"))), Lookup::Missing);

        let outcome = reconciler.reconcile("proj", "app").await.unwrap();
        assert_eq!(outcome, Outcome::InstallRequested);

        let (commands, responses) = drain(&mut inbox);
        assert!(responses.is_empty());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].key, "env:proj.release:app");
        assert_eq!(commands[0].packet_type, PacketType::ReleasePreInstall);

        let request: InstallReleaseRequest = commands[0].decode().unwrap();
        assert_eq!(request.chart_name, "web");
        assert_eq!(request.chart_version, "1.0.0");
        assert_eq!(request.commit, "c1");
    }

    #[tokio::test]
    async fn test_unchanged_release_reports_synced() {
        let (reconciler, mut inbox) = setup(
            Some(chart_release("proj", "app", Some("c1"))),
            Lookup::Found(release("proj", "1.0.0", "replicas: 1")),
        );

        let outcome = reconciler.reconcile("proj", "app").await.unwrap();
        assert_eq!(outcome, Outcome::Synced);

        let (commands, responses) = drain(&mut inbox);
        assert!(commands.is_empty());
        assert_eq!(
            responses,
            vec![Packet::message(
                "env:proj.release:app.commit:c1",
                PacketType::ReleaseSynced,
                ""
            )]
        );
    }

    #[tokio::test]
    async fn test_drift_requests_upgrade() {
        let (reconciler, mut inbox) = setup(
            Some(chart_release("proj", "app", Some("c1"))),
            Lookup::Found(release("proj", "1.0.0", "replicas: 2")),
        );

        assert_eq!(
            reconciler.reconcile("proj", "app").await.unwrap(),
            Outcome::UpgradeRequested
        );

        let (commands, responses) = drain(&mut inbox);
        assert!(responses.is_empty());
        assert_eq!(commands[0].packet_type, PacketType::ReleasePreUpgrade);
        let request: UpgradeReleaseRequest = commands[0].decode().unwrap();
        assert_eq!(request.values, "replicas: 1");
    }

    #[tokio::test]
    async fn test_whitespace_change_is_drift() {
        let (reconciler, _inbox) = setup(
            Some(chart_release("proj", "app", Some("c1"))),
            Lookup::Found(release("proj", "1.0.0", "replicas:  1")),
        );
        assert_eq!(
            reconciler.reconcile("proj", "app").await.unwrap(),
            Outcome::UpgradeRequested
        );
    }

    #[tokio::test]
    async fn test_missing_commit_emits_nothing() {
        let (reconciler, mut inbox) =
            setup(Some(chart_release("proj", "app", None)), Lookup::Missing);

        let err = reconciler.reconcile("proj", "app").await.unwrap_err();
        assert!(matches!(err, AgentError::MissingCommit { .. }));

        let (commands, responses) = drain(&mut inbox);
        assert!(commands.is_empty());
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_namespace_reports_and_continues() {
        let (reconciler, mut inbox) = setup(
            Some(chart_release("proj", "app", Some("c1"))),
            Lookup::Found(release("other", "1.0.0", "replicas: 1")),
        );

        let outcome = reconciler.reconcile("proj", "app").await.unwrap();
        assert_eq!(outcome, Outcome::Synced);

        let (_, responses) = drain(&mut inbox);
        let types: Vec<_> = responses.iter().map(|p| p.packet_type).collect();
        assert_eq!(
            types,
            vec![PacketType::ReleaseSyncedFailed, PacketType::ReleaseSynced]
        );
        assert_eq!(responses[0].payload, FOREIGN_NAMESPACE);
    }

    #[tokio::test]
    async fn test_lookup_failure_reports_and_errors() {
        let (reconciler, mut inbox) =
            setup(Some(chart_release("proj", "app", Some("c1"))), Lookup::Broken);

        let err = reconciler.reconcile("proj", "app").await.unwrap_err();
        assert!(err.release_kind().is_some());

        let (commands, responses) = drain(&mut inbox);
        assert!(commands.is_empty(), "a failed lookup must not look like a missing release");
        assert_eq!(responses[0].packet_type, PacketType::ReleaseSyncedFailed);
        assert_eq!(responses[0].key, "env:proj.release:app.commit:c1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_is_transient() {
        let (reconciler, mut inbox) =
            setup(Some(chart_release("proj", "app", Some("c1"))), Lookup::Hang);

        let err = reconciler.reconcile("proj", "app").await.unwrap_err();
        assert_eq!(err.release_kind(), Some(rudder_kube::ErrorKind::Transient));

        let (commands, _) = drain(&mut inbox);
        assert!(commands.is_empty());
    }

    #[tokio::test]
    async fn test_removed_resource_requests_delete() {
        let (reconciler, mut inbox) =
            setup(None, Lookup::Found(release("proj", "1.0.0", "replicas: 1")));

        assert_eq!(
            reconciler.reconcile("proj", "app").await.unwrap(),
            Outcome::DeleteRequested
        );

        let (commands, _) = drain(&mut inbox);
        assert_eq!(commands[0].packet_type, PacketType::ReleaseDelete);
        let request: DeleteReleaseRequest = commands[0].decode().unwrap();
        assert_eq!(request.release_name, "app");
    }

    #[tokio::test]
    async fn test_removed_resource_leaves_foreign_release() {
        let (reconciler, mut inbox) =
            setup(None, Lookup::Found(release("other", "1.0.0", "replicas: 1")));

        assert_eq!(
            reconciler.reconcile("proj", "app").await.unwrap(),
            Outcome::Foreign
        );

        let (commands, responses) = drain(&mut inbox);
        assert!(commands.is_empty());
        assert_eq!(
            responses,
            vec![Packet::message(
                "env:proj.release:app",
                PacketType::ReleaseSyncedFailed,
                FOREIGN_NAMESPACE
            )]
        );
    }

    #[tokio::test]
    async fn test_removed_resource_without_release_is_absent() {
        let (reconciler, mut inbox) = setup(None, Lookup::Missing);

        assert_eq!(
            reconciler.reconcile("proj", "app").await.unwrap(),
            Outcome::Absent
        );
        let (commands, responses) = drain(&mut inbox);
        assert!(commands.is_empty() && responses.is_empty());
    }

    #[tokio::test]
    async fn test_removed_definition_is_ignored() {
        let releases = Arc::new(FakeReleases {
            lookup: Lookup::Found(release("proj", "1.0.0", "")),
            calls: Mutex::new(0),
        });
        let desired = FakeDesired {
            definition_removed: true,
            ..Default::default()
        };
        let (outbox, mut inbox) = channels(8, 8);
        let reconciler = Reconciler::new(Arc::new(desired), releases.clone(), outbox);

        assert_eq!(
            reconciler.reconcile("proj", "app").await.unwrap(),
            Outcome::DefinitionRemoved
        );
        assert_eq!(*releases.calls.lock().unwrap(), 0);
        let (commands, _) = drain(&mut inbox);
        assert!(commands.is_empty());
    }

    #[tokio::test]
    async fn test_every_pass_queries_again() {
        let releases = Arc::new(FakeReleases {
            lookup: Lookup::Found(release("proj", "1.0.0", "replicas: 1")),
            calls: Mutex::new(0),
        });
        let mut desired = FakeDesired::default();
        desired.resources.insert(
            ("proj".to_string(), "app".to_string()),
            chart_release("proj", "app", Some("c1")),
        );
        let (outbox, _inbox) = channels(8, 8);
        let reconciler = Reconciler::new(Arc::new(desired), releases.clone(), outbox);

        reconciler.reconcile("proj", "app").await.unwrap();
        reconciler.reconcile("proj", "app").await.unwrap();
        assert_eq!(*releases.calls.lock().unwrap(), 2);
    }
}
