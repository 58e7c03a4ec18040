//! Request and response payloads for release operations
//!
//! These are the bodies carried inside packets; every field is serialized in
//! camelCase JSON.

use serde::{Deserialize, Serialize};

/// Reference to an image pull secret in the release namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePullSecret {
    pub name: String,
}

impl ImagePullSecret {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReleaseRequest {
    pub repo_url: String,
    pub chart_name: String,
    pub chart_version: String,
    /// Raw values text
    #[serde(default)]
    pub values: String,
    pub release_name: String,
    #[serde(default)]
    pub commit: String,
    pub namespace: String,
    #[serde(default)]
    pub image_pull_secrets: Vec<ImagePullSecret>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeReleaseRequest {
    pub repo_url: String,
    pub chart_name: String,
    pub chart_version: String,
    #[serde(default)]
    pub values: String,
    pub release_name: String,
    #[serde(default)]
    pub commit: String,
    pub namespace: String,
    #[serde(default)]
    pub image_pull_secrets: Vec<ImagePullSecret>,
}

impl UpgradeReleaseRequest {
    /// The install request used when no release exists yet
    pub fn to_install(&self) -> InstallReleaseRequest {
        InstallReleaseRequest {
            repo_url: self.repo_url.clone(),
            chart_name: self.chart_name.clone(),
            chart_version: self.chart_version.clone(),
            values: self.values.clone(),
            release_name: self.release_name.clone(),
            commit: self.commit.clone(),
            namespace: self.namespace.clone(),
            image_pull_secrets: self.image_pull_secrets.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReleaseRequest {
    pub release_name: String,
    /// Target revision; 0 rolls back to the previous one
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReleaseRequest {
    pub release_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReleaseRequest {
    pub release_name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReleaseResponse {
    pub release_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReleaseRequest {
    pub release_name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReleaseResponse {
    pub release_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetReleaseContentRequest {
    pub release_name: String,
    /// 0 means the latest revision
    #[serde(default)]
    pub version: u32,
}

/// Chart test run inside the agent's test namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReleaseRequest {
    pub repo_url: String,
    pub chart_name: String,
    pub chart_version: String,
    #[serde(default)]
    pub values: String,
    pub release_name: String,
    /// Value of the test label stamped on every object
    pub label: String,
    #[serde(default)]
    pub image_pull_secrets: Vec<ImagePullSecret>,
}

/// A legacy agent release that can be migrated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OldEnv {
    pub env_id: i64,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeInfo {
    pub envs: Vec<OldEnv>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerInfo {
    pub release_name: String,
    pub namespace: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_request_json_shape() {
        let req = InstallReleaseRequest {
            repo_url: "https://charts.example.com".to_string(),
            chart_name: "web".to_string(),
            chart_version: "1.0.0".to_string(),
            values: "replicas: 1".to_string(),
            release_name: "app".to_string(),
            commit: "abc123".to_string(),
            namespace: "proj".to_string(),
            image_pull_secrets: vec![ImagePullSecret::new("registry")],
        };

        let json: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(json["repoUrl"], "https://charts.example.com");
        assert_eq!(json["releaseName"], "app");
        assert_eq!(json["imagePullSecrets"][0]["name"], "registry");

        let back: InstallReleaseRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_upgrade_to_install_keeps_commit() {
        let req = UpgradeReleaseRequest {
            repo_url: "r".to_string(),
            chart_name: "web".to_string(),
            chart_version: "2.0.0".to_string(),
            values: String::new(),
            release_name: "app".to_string(),
            commit: "c1".to_string(),
            namespace: "proj".to_string(),
            image_pull_secrets: vec![],
        };

        let install = req.to_install();
        assert_eq!(install.commit, "c1");
        assert_eq!(install.chart_version, "2.0.0");
    }

    #[test]
    fn test_rollback_version_defaults_to_zero() {
        let req: RollbackReleaseRequest =
            serde_json::from_str(r#"{"releaseName":"app"}"#).unwrap();
        assert_eq!(req.version, 0);
    }
}
