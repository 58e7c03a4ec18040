//! ChartRelease custom resource
//!
//! The desired state of one release: which chart to deploy and with which
//! values. The commit that produced it is carried by the
//! [`COMMIT_ANNOTATION`] annotation.

use kube::{CustomResource, ResourceExt};
use rudder_core::{ImagePullSecret, InstallReleaseRequest, UpgradeReleaseRequest};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Annotation holding the commit of the desired state
pub const COMMIT_ANNOTATION: &str = "rudder.io/commit";

/// Name of the ChartRelease CustomResourceDefinition
pub const CRD_NAME: &str = "chartreleases.rudder.io";

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "rudder.io",
    version = "v1alpha1",
    kind = "ChartRelease",
    plural = "chartreleases",
    shortname = "cr",
    namespaced,
    printcolumn = r#"{"name":"Chart", "type":"string", "jsonPath":".spec.chartName"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.chartVersion"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChartReleaseSpec {
    /// Chart repository URL
    pub repo_url: String,

    pub chart_name: String,

    pub chart_version: String,

    /// Raw values text, compared byte for byte with the deployed config
    #[serde(default)]
    pub values: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<PullSecretRef>,
}

/// Reference to an image pull secret in the release namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PullSecretRef {
    pub name: String,
}

impl ChartRelease {
    /// Commit annotation, if present and non-empty
    pub fn commit(&self) -> Option<&str> {
        self.annotations()
            .get(COMMIT_ANNOTATION)
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }

    fn required_commit(&self) -> Result<&str> {
        self.commit().ok_or_else(|| AgentError::MissingCommit {
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
        })
    }

    fn pull_secrets(&self) -> Vec<ImagePullSecret> {
        self.spec
            .image_pull_secrets
            .iter()
            .map(|s| ImagePullSecret::new(&s.name))
            .collect()
    }

    pub fn install_request(&self) -> Result<InstallReleaseRequest> {
        Ok(InstallReleaseRequest {
            repo_url: self.spec.repo_url.clone(),
            chart_name: self.spec.chart_name.clone(),
            chart_version: self.spec.chart_version.clone(),
            values: self.spec.values.clone(),
            release_name: self.name_any(),
            commit: self.required_commit()?.to_string(),
            namespace: self.namespace().unwrap_or_default(),
            image_pull_secrets: self.pull_secrets(),
        })
    }

    pub fn upgrade_request(&self) -> Result<UpgradeReleaseRequest> {
        Ok(UpgradeReleaseRequest {
            repo_url: self.spec.repo_url.clone(),
            chart_name: self.spec.chart_name.clone(),
            chart_version: self.spec.chart_version.clone(),
            values: self.spec.values.clone(),
            release_name: self.name_any(),
            commit: self.required_commit()?.to_string(),
            namespace: self.namespace().unwrap_or_default(),
            image_pull_secrets: self.pull_secrets(),
        })
    }
}
