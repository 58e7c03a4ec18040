//! Release state types

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A deployed release as observed through the release store
///
/// Immutable snapshot: a new query is needed to see a newer revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,

    pub namespace: String,

    /// Monotonic per-release revision, starting at 1
    pub revision: u32,

    pub status: ReleaseStatus,

    pub chart_name: String,

    pub chart_version: String,

    /// Raw values text used for this revision
    pub config: String,

    /// Full rendered manifest text
    pub manifest: String,

    #[serde(default)]
    pub hooks: Vec<ReleaseHook>,

    /// Live cluster objects, only filled by content queries
    #[serde(default)]
    pub resources: Vec<ReleaseResource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl Release {
    /// Whether `chart name`, `chart version` and raw values all match
    pub fn matches(&self, chart_name: &str, chart_version: &str, config: &str) -> bool {
        self.chart_name == chart_name && self.chart_version == chart_version && self.config == config
    }
}

/// Release status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    Deployed,
    Deleted,
    Superseded,
    Failed,
    Deleting,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Deleted => "deleted",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle phase a hook is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    PreInstall,
    PostInstall,
    PreDelete,
    PostDelete,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    ReleaseTestSuccess,
    ReleaseTestFailure,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
            Self::PreDelete => "pre-delete",
            Self::PostDelete => "post-delete",
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
            Self::PreRollback => "pre-rollback",
            Self::PostRollback => "post-rollback",
            Self::ReleaseTestSuccess => "release-test-success",
            Self::ReleaseTestFailure => "release-test-failure",
        }
    }
}

impl FromStr for HookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pre-install" => Ok(Self::PreInstall),
            "post-install" => Ok(Self::PostInstall),
            "pre-delete" => Ok(Self::PreDelete),
            "post-delete" => Ok(Self::PostDelete),
            "pre-upgrade" => Ok(Self::PreUpgrade),
            "post-upgrade" => Ok(Self::PostUpgrade),
            "pre-rollback" => Ok(Self::PreRollback),
            "post-rollback" => Ok(Self::PostRollback),
            "test-success" | "release-test-success" | "test" => Ok(Self::ReleaseTestSuccess),
            "test-failure" | "release-test-failure" => Ok(Self::ReleaseTestFailure),
            other => Err(format!("unknown hook event '{}'", other)),
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A manifest bound to a lifecycle phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseHook {
    /// `metadata.name` of the hook object
    pub name: String,

    pub manifest: String,

    /// Ascending; ties keep render order
    #[serde(default)]
    pub weight: i32,

    /// Primary phase (first declared event)
    pub kind: HookEvent,

    #[serde(default)]
    pub events: Vec<HookEvent>,

    pub release_name: String,
}

impl ReleaseHook {
    pub fn runs_on(&self, event: HookEvent) -> bool {
        self.events.contains(&event)
    }
}

/// Read-only projection of a live object belonging to a release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub resource_version: String,
    /// Serialized live object (JSON)
    pub object: String,
}

/// Release information for templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,

    pub namespace: String,

    pub revision: u32,

    pub is_install: bool,

    pub is_upgrade: bool,

    /// Always "Rudder"
    pub service: String,
}

impl ReleaseInfo {
    /// Release info for a new install
    pub fn for_install(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision: 1,
            is_install: true,
            is_upgrade: false,
            service: "Rudder".to_string(),
        }
    }

    /// Release info for an upgrade
    pub fn for_upgrade(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            is_install: false,
            is_upgrade: true,
            service: "Rudder".to_string(),
        }
    }

    /// Install info at revision 1, upgrade info otherwise
    pub fn for_revision(name: &str, namespace: &str, revision: u32) -> Self {
        if revision <= 1 {
            Self::for_install(name, namespace)
        } else {
            Self::for_upgrade(name, namespace, revision)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_event_parse() {
        assert_eq!("pre-install".parse::<HookEvent>(), Ok(HookEvent::PreInstall));
        assert_eq!(" post-upgrade ".parse::<HookEvent>(), Ok(HookEvent::PostUpgrade));
        assert_eq!("test-success".parse::<HookEvent>(), Ok(HookEvent::ReleaseTestSuccess));
        assert_eq!(
            "release-test-failure".parse::<HookEvent>(),
            Ok(HookEvent::ReleaseTestFailure)
        );
        assert!("crd-install".parse::<HookEvent>().is_err());
    }

    #[test]
    fn test_hook_event_order_follows_lifecycle() {
        assert!(HookEvent::PreInstall < HookEvent::PostInstall);
        assert!(HookEvent::PostInstall < HookEvent::PreUpgrade);
        assert!(HookEvent::PostRollback < HookEvent::ReleaseTestSuccess);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ReleaseStatus::PendingInstall).unwrap();
        assert_eq!(json, "\"pending-install\"");
        assert_eq!(ReleaseStatus::Superseded.to_string(), "superseded");
    }

    #[test]
    fn test_release_matches() {
        let release = Release {
            name: "app".to_string(),
            namespace: "proj".to_string(),
            revision: 1,
            status: ReleaseStatus::Deployed,
            chart_name: "web".to_string(),
            chart_version: "1.0.0".to_string(),
            config: "replicas: 1".to_string(),
            manifest: String::new(),
            hooks: vec![],
            resources: vec![],
            commit: None,
        };

        assert!(release.matches("web", "1.0.0", "replicas: 1"));
        assert!(!release.matches("web", "1.0.1", "replicas: 1"));
        // raw text comparison: whitespace is drift
        assert!(!release.matches("web", "1.0.0", "replicas:  1"));
    }

    #[test]
    fn test_release_info_for_revision() {
        assert!(ReleaseInfo::for_revision("a", "ns", 1).is_install);
        let info = ReleaseInfo::for_revision("a", "ns", 4);
        assert!(info.is_upgrade);
        assert_eq!(info.revision, 4);
    }
}
