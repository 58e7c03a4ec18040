//! Template rendering context

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::chart::ChartMetadata;
use crate::release::ReleaseInfo;
use crate::values::Values;

/// Context available to all templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateContext {
    /// User values (merged)
    pub values: JsonValue,

    pub release: ReleaseInfo,

    pub chart: ChartInfo,

    pub capabilities: Capabilities,

    /// Current template info
    pub template: TemplateInfo,
}

/// Chart information for templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    pub app_version: Option<String>,
}

impl From<&ChartMetadata> for ChartInfo {
    fn from(meta: &ChartMetadata) -> Self {
        Self {
            name: meta.name.clone(),
            version: meta.version.clone(),
            app_version: meta.app_version.clone(),
        }
    }
}

/// Cluster capabilities, computed from API discovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub kube_version: KubeVersion,

    /// Available API versions (`v1`, `apps/v1`, ...)
    pub api_versions: Vec<String>,
}

impl Capabilities {
    pub fn new(kube_version: KubeVersion, mut api_versions: Vec<String>) -> Self {
        api_versions.sort();
        api_versions.dedup();
        Self {
            kube_version,
            api_versions,
        }
    }

    /// Whether an `apiVersion` is served; an empty list allows everything
    pub fn supports(&self, api_version: &str) -> bool {
        self.api_versions.is_empty() || self.api_versions.iter().any(|v| v == api_version)
    }
}

/// Kubernetes version info
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeVersion {
    pub version: String,
    pub major: String,
    pub minor: String,
}

impl Default for KubeVersion {
    fn default() -> Self {
        Self {
            version: "v1.31.0".to_string(),
            major: "1".to_string(),
            minor: "31".to_string(),
        }
    }
}

impl KubeVersion {
    pub fn new(version: &str) -> Self {
        let version = version.trim_start_matches('v');
        let parts: Vec<&str> = version.split('.').collect();

        Self {
            version: format!("v{}", version),
            major: parts.first().unwrap_or(&"1").to_string(),
            minor: parts
                .get(1)
                .map(|m| m.trim_end_matches('+'))
                .unwrap_or("31")
                .to_string(),
        }
    }
}

/// Current template information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateInfo {
    /// Template path, e.g. `web/templates/deployment.yaml`
    pub name: String,

    /// Directory holding the chart's templates
    pub base_path: String,
}

impl TemplateContext {
    pub fn new(values: Values, release: ReleaseInfo, chart: &ChartMetadata) -> Self {
        Self {
            values: values.into_inner(),
            release,
            chart: ChartInfo::from(chart),
            capabilities: Capabilities::default(),
            template: TemplateInfo::default(),
        }
    }

    pub fn with_template(mut self, name: &str, base_path: &str) -> Self {
        self.template = TemplateInfo {
            name: name.to_string(),
            base_path: base_path.to_string(),
        };
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
