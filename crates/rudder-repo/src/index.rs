//! Repository index types (Helm `index.yaml` format)

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{RepoError, Result};

/// Repository index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartIndex {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default)]
    pub generated: Option<DateTime<Utc>>,

    /// Chart versions keyed by chart name
    #[serde(default)]
    pub entries: HashMap<String, Vec<ChartEntry>>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl Default for ChartIndex {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            generated: None,
            entries: HashMap::new(),
        }
    }
}

impl ChartIndex {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RepoError::IndexParseError {
            message: e.to_string(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let yaml = std::str::from_utf8(bytes).map_err(|e| RepoError::IndexParseError {
            message: format!("Invalid UTF-8: {}", e),
        })?;
        Self::from_yaml(yaml)
    }

    /// Get a specific version of a chart
    ///
    /// A leading `v` on either side is ignored.
    pub fn get_version(&self, name: &str, version: &str) -> Option<&ChartEntry> {
        let wanted = version.trim_start_matches('v');
        self.entries
            .get(name)?
            .iter()
            .find(|e| e.version.trim_start_matches('v') == wanted)
    }

    /// Highest semver version of a chart
    pub fn get_latest(&self, name: &str) -> Option<&ChartEntry> {
        self.entries.get(name).and_then(|versions| {
            versions.iter().max_by(|a, b| {
                let va = a.parsed_version();
                let vb = b.parsed_version();
                match (va, vb) {
                    (Some(va), Some(vb)) => va.cmp(&vb),
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => a.version.cmp(&b.version),
                }
            })
        })
    }

    pub fn add_entry(&mut self, entry: ChartEntry) {
        self.entries
            .entry(entry.name.clone())
            .or_default()
            .push(entry);
    }
}

/// One chart version in the index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartEntry {
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub app_version: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Archive locations, absolute or relative to the repository URL
    #[serde(default)]
    pub urls: Vec<String>,

    /// SHA256 digest of the archive
    #[serde(default)]
    pub digest: Option<String>,

    #[serde(default)]
    pub created: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deprecated: bool,
}

impl ChartEntry {
    pub fn download_url(&self) -> Option<&str> {
        self.urls.first().map(|s| s.as_str())
    }

    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(self.version.trim_start_matches('v')).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> ChartIndex {
        let yaml = r#"
apiVersion: v1
generated: "2024-01-01T00:00:00Z"
entries:
  nginx:
    - name: nginx
      version: "15.0.0"
      appVersion: "1.25.0"
      urls:
        - https://example.com/charts/nginx-15.0.0.tgz
      digest: "sha256:abc123"
    - name: nginx
      version: "14.0.0"
      appVersion: "1.24.0"
      urls:
        - charts/nginx-14.0.0.tgz
  agent:
    - name: agent
      version: "v0.9.1"
      urls: []
"#;
        ChartIndex::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_parse_index() {
        let index = sample_index();
        assert_eq!(index.entries.len(), 2);
        assert!(index.generated.is_some());
    }

    #[test]
    fn test_get_version() {
        let index = sample_index();
        let v14 = index.get_version("nginx", "14.0.0").unwrap();
        assert_eq!(v14.app_version.as_deref(), Some("1.24.0"));
        assert_eq!(v14.download_url(), Some("charts/nginx-14.0.0.tgz"));

        assert!(index.get_version("agent", "0.9.1").is_some());
        assert!(index.get_version("nginx", "13.0.0").is_none());
        assert!(index.get_version("missing", "1.0.0").is_none());
    }

    #[test]
    fn test_get_latest() {
        let index = sample_index();
        assert_eq!(index.get_latest("nginx").unwrap().version, "15.0.0");
    }

    #[test]
    fn test_add_entry() {
        let mut index = ChartIndex::default();
        index.add_entry(ChartEntry {
            name: "web".to_string(),
            version: "1.0.0".to_string(),
            ..Default::default()
        });
        assert_eq!(index.entries["web"].len(), 1);
    }

    #[test]
    fn test_invalid_index() {
        let err = ChartIndex::from_yaml("entries: [").unwrap_err();
        assert!(matches!(err, RepoError::IndexParseError { .. }));
    }
}
