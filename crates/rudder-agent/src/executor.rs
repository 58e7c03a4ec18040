//! Command execution
//!
//! Drains the command queue in order, runs the matching release engine
//! operation and queues the outcome on the response queue. Successful
//! operations answer with the release as JSON; failures answer with a
//! [`FailureReport`].

use rudder_core::{
    DeleteReleaseRequest, InstallReleaseRequest, Release, RollbackReleaseRequest,
    StartReleaseRequest, StopReleaseRequest, TestReleaseRequest, UpgradeReleaseRequest,
};
use rudder_kube::{KubeError, ReleaseClient, StorageDriver};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channel::Outbox;
use crate::error::{AgentError, Result};
use crate::packet::{Packet, PacketType, commit_key};

/// Payload of a failure response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub message: String,

    /// Revision recorded before the failure, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<Release>,
}

impl FailureReport {
    fn from_error(error: &AgentError) -> Self {
        let release = match error {
            AgentError::Release(e) => e.partial_release().cloned(),
            _ => None,
        };
        Self {
            message: error.to_string(),
            release,
        }
    }
}

pub struct Executor<S: StorageDriver> {
    client: Arc<ReleaseClient<S>>,
    outbox: Outbox,
}

impl<S: StorageDriver> Executor<S> {
    pub fn new(client: Arc<ReleaseClient<S>>, outbox: Outbox) -> Self {
        Self { client, outbox }
    }

    /// Execute commands until the queue closes
    pub async fn run(self, mut commands: mpsc::Receiver<Packet>) -> Result<()> {
        while let Some(command) = commands.recv().await {
            for response in self.execute(&command).await {
                self.outbox.respond(response).await?;
            }
        }
        tracing::info!("command queue closed, executor stopping");
        Ok(())
    }

    /// Run one command and return its responses, in emission order
    pub async fn execute(&self, command: &Packet) -> Vec<Packet> {
        tracing::info!(key = %command.key, packet_type = %command.packet_type, "executing command");

        let mut responses = Vec::new();
        match command.packet_type {
            PacketType::ReleasePreInstall => self.install(command, &mut responses).await,
            PacketType::ReleasePreUpgrade => self.upgrade(command, &mut responses).await,
            PacketType::ReleaseRollback => {
                let outcome = async {
                    let req: RollbackReleaseRequest = command.decode()?;
                    Ok::<_, AgentError>(self.client.rollback_release(&req).await?)
                }
                .await;
                respond(
                    &mut responses,
                    &command.key,
                    outcome,
                    PacketType::ReleaseRolledBack,
                    PacketType::ReleaseRollbackFailed,
                );
            }
            PacketType::ReleaseDelete => {
                let outcome = async {
                    let req: DeleteReleaseRequest = command.decode()?;
                    Ok::<_, AgentError>(self.client.delete_release(&req).await?)
                }
                .await;
                respond(
                    &mut responses,
                    &command.key,
                    outcome,
                    PacketType::ReleaseDeleted,
                    PacketType::ReleaseDeleteFailed,
                );
            }
            PacketType::ReleaseStart => {
                let outcome = async {
                    let req: StartReleaseRequest = command.decode()?;
                    Ok::<_, AgentError>(self.client.start_release(&req).await?)
                }
                .await;
                respond(
                    &mut responses,
                    &command.key,
                    outcome,
                    PacketType::ReleaseStarted,
                    PacketType::ReleaseStartFailed,
                );
            }
            PacketType::ReleaseStop => {
                let outcome = async {
                    let req: StopReleaseRequest = command.decode()?;
                    Ok::<_, AgentError>(self.client.stop_release(&req).await?)
                }
                .await;
                respond(
                    &mut responses,
                    &command.key,
                    outcome,
                    PacketType::ReleaseStopped,
                    PacketType::ReleaseStopFailed,
                );
            }
            PacketType::ReleaseTest => {
                let outcome = async {
                    let req: TestReleaseRequest = command.decode()?;
                    Ok::<_, AgentError>(self.client.execute_test(&req).await?)
                }
                .await;
                respond(
                    &mut responses,
                    &command.key,
                    outcome,
                    PacketType::ReleaseTestRun,
                    PacketType::ReleaseTestFailed,
                );
            }
            other => {
                tracing::warn!(key = %command.key, packet_type = %other, "not a command, dropping");
            }
        }
        responses
    }

    /// Report the pre-install hooks, then install
    async fn install(&self, command: &Packet, responses: &mut Vec<Packet>) {
        let req: InstallReleaseRequest = match decode(command) {
            Ok(req) => req,
            Err(e) => return fail(responses, &command.key, PacketType::ReleaseInstallFailed, &e),
        };
        let key = report_key(&command.key, &req.namespace, &req.release_name, &req.commit);

        let outcome = async {
            let hooks = self.client.pre_install_release(&req).await?;
            push_encoded(responses, &key, PacketType::ReleaseHooks, &hooks);
            Ok::<_, KubeError>(self.client.install_release(&req).await?)
        }
        .await;
        respond(
            responses,
            &key,
            outcome.map_err(AgentError::from),
            PacketType::ReleaseInstalled,
            PacketType::ReleaseInstallFailed,
        );
    }

    /// Report the pre-upgrade hooks, then upgrade
    async fn upgrade(&self, command: &Packet, responses: &mut Vec<Packet>) {
        let req: UpgradeReleaseRequest = match decode(command) {
            Ok(req) => req,
            Err(e) => return fail(responses, &command.key, PacketType::ReleaseUpgradeFailed, &e),
        };
        let key = report_key(&command.key, &req.namespace, &req.release_name, &req.commit);

        let outcome = async {
            let hooks = self.client.pre_upgrade_release(&req).await?;
            push_encoded(responses, &key, PacketType::ReleaseHooks, &hooks);
            Ok::<_, KubeError>(self.client.upgrade_release(&req).await?)
        }
        .await;
        respond(
            responses,
            &key,
            outcome.map_err(AgentError::from),
            PacketType::ReleaseUpgraded,
            PacketType::ReleaseUpgradeFailed,
        );
    }
}

fn decode<T: DeserializeOwned>(command: &Packet) -> Result<T> {
    command.decode().inspect_err(|e| {
        tracing::error!(key = %command.key, error = %e, "undecodable command payload");
    })
}

/// Commit-scoped key for install/upgrade reports, when a commit is known
fn report_key(command_key: &str, namespace: &str, name: &str, commit: &str) -> String {
    if commit.is_empty() {
        command_key.to_string()
    } else {
        commit_key(namespace, name, commit)
    }
}

fn respond<T: Serialize>(
    responses: &mut Vec<Packet>,
    key: &str,
    outcome: Result<T>,
    success: PacketType,
    failure: PacketType,
) {
    match outcome {
        Ok(body) => push_encoded(responses, key, success, &body),
        Err(e) => fail(responses, key, failure, &e),
    }
}

fn fail(responses: &mut Vec<Packet>, key: &str, packet_type: PacketType, error: &AgentError) {
    tracing::warn!(%key, %packet_type, error = %error, "command failed");
    push_encoded(responses, key, packet_type, &FailureReport::from_error(error));
}

/// Queue an encoded response; encoding failures suppress the packet
fn push_encoded<T: Serialize>(
    responses: &mut Vec<Packet>,
    key: &str,
    packet_type: PacketType,
    body: &T,
) {
    match Packet::encode(key, packet_type, body) {
        Ok(packet) => responses.push(packet),
        Err(e) => tracing::error!(%key, error = %e, "response suppressed"),
    }
}
