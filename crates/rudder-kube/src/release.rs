//! Stored release records and their state machine

use chrono::{DateTime, Duration, Utc};
use rudder_core::{Release, ReleaseHook, ReleaseStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default timeout for pending operations (5 minutes)
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::minutes(5);

/// One revision of a release as persisted by a storage driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRelease {
    pub name: String,

    pub namespace: String,

    /// Revision number (1-indexed, increments with each upgrade or rollback)
    pub version: u32,

    pub state: ReleaseState,

    pub chart_name: String,

    pub chart_version: String,

    /// Raw values text, exactly as requested
    pub config: String,

    /// Rendered manifest (all non-hook resources)
    pub manifest: String,

    #[serde(default)]
    pub hooks: Vec<ReleaseHook>,

    /// Commit of the desired state that produced this revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub notes: Option<String>,
}

impl StoredRelease {
    /// Create revision 1 of a new release
    pub fn for_install(
        name: impl Into<String>,
        namespace: impl Into<String>,
        chart_name: impl Into<String>,
        chart_version: impl Into<String>,
        config: impl Into<String>,
        manifest: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version: 1,
            state: ReleaseState::PendingInstall {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
            },
            chart_name: chart_name.into(),
            chart_version: chart_version.into(),
            config: config.into(),
            manifest: manifest.into(),
            hooks: Vec::new(),
            commit: None,
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            notes: None,
        }
    }

    /// Create the next revision of an existing release
    pub fn for_upgrade(
        previous: &StoredRelease,
        chart_name: impl Into<String>,
        chart_version: impl Into<String>,
        config: impl Into<String>,
        manifest: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: previous.name.clone(),
            namespace: previous.namespace.clone(),
            version: previous.version + 1,
            state: ReleaseState::PendingUpgrade {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
                previous_version: previous.version,
            },
            chart_name: chart_name.into(),
            chart_version: chart_version.into(),
            config: config.into(),
            manifest: manifest.into(),
            hooks: Vec::new(),
            commit: None,
            labels: previous.labels.clone(),
            created_at: now,
            updated_at: now,
            notes: None,
        }
    }

    /// Create a new revision that restores `target` on top of `current`
    pub fn for_rollback(current: &StoredRelease, target: &StoredRelease) -> Self {
        let now = Utc::now();
        Self {
            name: current.name.clone(),
            namespace: current.namespace.clone(),
            version: current.version + 1,
            state: ReleaseState::PendingRollback {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
                target_version: target.version,
            },
            chart_name: target.chart_name.clone(),
            chart_version: target.chart_version.clone(),
            config: target.config.clone(),
            manifest: target.manifest.clone(),
            hooks: target.hooks.clone(),
            commit: target.commit.clone(),
            labels: current.labels.clone(),
            created_at: now,
            updated_at: now,
            notes: target.notes.clone(),
        }
    }

    /// Storage key, used as the Secret name
    pub fn storage_key(&self) -> String {
        format!("rudder.release.v1.{}.v{}", self.name, self.version)
    }

    pub fn mark_deployed(&mut self) {
        self.state = ReleaseState::Deployed;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = ReleaseState::Failed {
            reason: reason.into(),
            failed_at: Utc::now(),
        };
        self.updated_at = Utc::now();
    }

    pub fn mark_superseded(&mut self) {
        self.state = ReleaseState::Superseded;
        self.updated_at = Utc::now();
    }

    pub fn mark_deleting(&mut self) {
        self.state = ReleaseState::Deleting;
        self.updated_at = Utc::now();
    }

    /// Public snapshot of this revision, without live resources
    pub fn to_release(&self) -> Release {
        Release {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            revision: self.version,
            status: self.state.status(),
            chart_name: self.chart_name.clone(),
            chart_version: self.chart_version.clone(),
            config: self.config.clone(),
            manifest: self.manifest.clone(),
            hooks: self.hooks.clone(),
            resources: Vec::new(),
            commit: self.commit.clone(),
        }
    }
}

/// Release state with timing information for transitional states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ReleaseState {
    Deployed,

    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },

    Superseded,

    /// Deletion in progress
    Deleting,

    PendingInstall {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
    },

    PendingUpgrade {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
        previous_version: u32,
    },

    PendingRollback {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
        target_version: u32,
    },
}

impl ReleaseState {
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall { .. } | Self::PendingUpgrade { .. } | Self::PendingRollback { .. }
        )
    }

    /// Whether a pending operation outlived its timeout
    pub fn is_stale(&self) -> bool {
        match self {
            Self::PendingInstall {
                started_at,
                timeout,
            }
            | Self::PendingUpgrade {
                started_at,
                timeout,
                ..
            }
            | Self::PendingRollback {
                started_at,
                timeout,
                ..
            } => Utc::now().signed_duration_since(*started_at) > *timeout,
            _ => false,
        }
    }

    pub fn status(&self) -> ReleaseStatus {
        match self {
            Self::Deployed => ReleaseStatus::Deployed,
            Self::Failed { .. } => ReleaseStatus::Failed,
            Self::Superseded => ReleaseStatus::Superseded,
            Self::Deleting => ReleaseStatus::Deleting,
            Self::PendingInstall { .. } => ReleaseStatus::PendingInstall,
            Self::PendingUpgrade { .. } => ReleaseStatus::PendingUpgrade,
            Self::PendingRollback { .. } => ReleaseStatus::PendingRollback,
        }
    }

    /// Human-readable status name, also used as a storage label
    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Deployed => "deployed",
            Self::Failed { .. } => "failed",
            Self::Superseded => "superseded",
            Self::Deleting => "deleting",
            Self::PendingInstall { .. } => "pending-install",
            Self::PendingUpgrade { .. } => "pending-upgrade",
            Self::PendingRollback { .. } => "pending-rollback",
        }
    }
}

impl std::fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason, .. } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.status_name()),
        }
    }
}

impl Default for ReleaseState {
    fn default() -> Self {
        Self::Deployed
    }
}

/// Serialization helper for chrono::Duration
mod duration_serde {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.num_seconds().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(seconds))
    }
}
