//! Command and response packets
//!
//! A [`Packet`] is addressed by a key naming the release it concerns:
//! `env:<namespace>.release:<name>` for lifecycle operations and
//! `env:<namespace>.release:<name>.commit:<commit>` for sync reports. Its type
//! fixes how the payload is read; payloads are JSON text, or a plain message
//! for failure reports.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

use crate::error::{AgentError, Result};

/// Every packet type exchanged by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    // Commands
    ReleasePreInstall,
    ReleasePreUpgrade,
    ReleaseRollback,
    ReleaseDelete,
    ReleaseStart,
    ReleaseStop,
    ReleaseTest,

    // Responses
    ReleaseHooks,
    ReleaseInstalled,
    ReleaseInstallFailed,
    ReleaseUpgraded,
    ReleaseUpgradeFailed,
    ReleaseRolledBack,
    ReleaseRollbackFailed,
    ReleaseDeleted,
    ReleaseDeleteFailed,
    ReleaseStarted,
    ReleaseStartFailed,
    ReleaseStopped,
    ReleaseStopFailed,
    ReleaseTestRun,
    ReleaseTestFailed,
    ReleaseSynced,
    ReleaseSyncedFailed,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReleasePreInstall => "release_pre_install",
            Self::ReleasePreUpgrade => "release_pre_upgrade",
            Self::ReleaseRollback => "release_rollback",
            Self::ReleaseDelete => "release_delete",
            Self::ReleaseStart => "release_start",
            Self::ReleaseStop => "release_stop",
            Self::ReleaseTest => "release_test",
            Self::ReleaseHooks => "release_hooks",
            Self::ReleaseInstalled => "release_installed",
            Self::ReleaseInstallFailed => "release_install_failed",
            Self::ReleaseUpgraded => "release_upgraded",
            Self::ReleaseUpgradeFailed => "release_upgrade_failed",
            Self::ReleaseRolledBack => "release_rolled_back",
            Self::ReleaseRollbackFailed => "release_rollback_failed",
            Self::ReleaseDeleted => "release_deleted",
            Self::ReleaseDeleteFailed => "release_delete_failed",
            Self::ReleaseStarted => "release_started",
            Self::ReleaseStartFailed => "release_start_failed",
            Self::ReleaseStopped => "release_stopped",
            Self::ReleaseStopFailed => "release_stop_failed",
            Self::ReleaseTestRun => "release_test_run",
            Self::ReleaseTestFailed => "release_test_failed",
            Self::ReleaseSynced => "release_synced",
            Self::ReleaseSyncedFailed => "release_synced_failed",
        }
    }

    /// Whether this type is executed rather than reported
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ReleasePreInstall
                | Self::ReleasePreUpgrade
                | Self::ReleaseRollback
                | Self::ReleaseDelete
                | Self::ReleaseStart
                | Self::ReleaseStop
                | Self::ReleaseTest
        )
    }

    /// Whether this response reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ReleaseInstallFailed
                | Self::ReleaseUpgradeFailed
                | Self::ReleaseRollbackFailed
                | Self::ReleaseDeleteFailed
                | Self::ReleaseStartFailed
                | Self::ReleaseStopFailed
                | Self::ReleaseTestFailed
                | Self::ReleaseSyncedFailed
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command or response envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub key: String,

    #[serde(rename = "type")]
    pub packet_type: PacketType,

    #[serde(default)]
    pub payload: String,
}

impl Packet {
    /// Packet whose payload is `body` serialized as JSON
    pub fn encode<T: Serialize>(
        key: impl Into<String>,
        packet_type: PacketType,
        body: &T,
    ) -> Result<Self> {
        let payload = serde_json::to_string(body).map_err(|source| AgentError::Encode {
            packet_type: packet_type.as_str(),
            source,
        })?;
        Ok(Self {
            key: key.into(),
            packet_type,
            payload,
        })
    }

    /// Packet carrying a plain message
    pub fn message(key: impl Into<String>, packet_type: PacketType, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            packet_type,
            payload: message.into(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload).map_err(|source| AgentError::InvalidPayload {
            packet_type: self.packet_type.as_str(),
            source,
        })
    }

    pub fn address(&self) -> Option<PacketKey> {
        PacketKey::parse(&self.key)
    }
}

/// Key for lifecycle packets of a release
pub fn release_key(namespace: &str, name: &str) -> String {
    format!("env:{}.release:{}", namespace, name)
}

/// Key for sync reports tied to the commit that produced the desired state
pub fn commit_key(namespace: &str, name: &str, commit: &str) -> String {
    format!("env:{}.release:{}.commit:{}", namespace, name, commit)
}

/// Parsed packet key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketKey {
    pub namespace: String,
    pub release: String,
    pub commit: Option<String>,
}

impl PacketKey {
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("env:")?;
        let (namespace, rest) = rest.split_once(".release:")?;
        let (release, commit) = match rest.split_once(".commit:") {
            Some((release, commit)) => (release, Some(commit.to_string())),
            None => (rest, None),
        };
        if namespace.is_empty() || release.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            release: release.to_string(),
            commit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::DeleteReleaseRequest;

    #[test]
    fn test_keys() {
        assert_eq!(release_key("proj", "app"), "env:proj.release:app");
        assert_eq!(
            commit_key("proj", "app", "abc123"),
            "env:proj.release:app.commit:abc123"
        );

        let key = PacketKey::parse("env:proj.release:app.commit:abc123").unwrap();
        assert_eq!(key.namespace, "proj");
        assert_eq!(key.release, "app");
        assert_eq!(key.commit.as_deref(), Some("abc123"));

        assert_eq!(PacketKey::parse("env:proj.release:app").unwrap().commit, None);
        assert!(PacketKey::parse("release:app").is_none());
        assert!(PacketKey::parse("env:.release:app").is_none());
    }

    #[test]
    fn test_wire_format() {
        let packet = Packet::encode(
            release_key("proj", "app"),
            PacketType::ReleaseDelete,
            &DeleteReleaseRequest {
                release_name: "app".to_string(),
            },
        )
        .unwrap();

        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["type"], "release_delete");
        assert_eq!(json["payload"], r#"{"releaseName":"app"}"#);

        let request: DeleteReleaseRequest = packet.decode().unwrap();
        assert_eq!(request.release_name, "app");
    }

    #[test]
    fn test_decode_failure_names_type() {
        let packet = Packet::message("env:proj.release:app", PacketType::ReleaseDelete, "oops");
        let err = packet.decode::<DeleteReleaseRequest>().unwrap_err();
        assert!(err.to_string().contains("release_delete"));
    }

    #[test]
    fn test_classification() {
        assert!(PacketType::ReleasePreInstall.is_command());
        assert!(!PacketType::ReleaseSynced.is_command());
        assert!(PacketType::ReleaseSyncedFailed.is_failure());
        assert!(!PacketType::ReleaseInstalled.is_failure());
        assert_eq!(
            serde_json::to_string(&PacketType::ReleaseRolledBack).unwrap(),
            "\"release_rolled_back\""
        );
    }
}
