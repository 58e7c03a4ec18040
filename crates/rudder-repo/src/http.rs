//! HTTP chart repositories
//!
//! Charts are resolved through the repository's `index.yaml`, downloaded,
//! verified against the index digest and kept in memory for later requests.

use async_trait::async_trait;
use rudder_core::Chart;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{RepoError, Result};
use crate::index::{ChartEntry, ChartIndex};
use crate::source::ChartSource;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Chart source backed by Helm-style HTTP repositories
pub struct HttpChartSource {
    client: reqwest::Client,
    /// Verified archives keyed by `<repo>|<name>|<version>`
    archives: Mutex<HashMap<String, Vec<u8>>>,
}

impl HttpChartSource {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RepoError::NetworkError {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            archives: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch and parse the repository index
    pub async fn fetch_index(&self, repo_url: &str) -> Result<ChartIndex> {
        let index_url = repo_base(repo_url)?.join("index.yaml")?;
        let data = self.get_bytes(index_url).await?;
        ChartIndex::from_bytes(&data)
    }

    /// Download a chart archive and verify its digest
    pub async fn download(&self, repo_url: &str, entry: &ChartEntry) -> Result<Vec<u8>> {
        let url = entry.download_url().ok_or_else(|| RepoError::ChartNotFound {
            name: entry.name.clone(),
            repo: repo_url.to_string(),
        })?;

        let full_url = repo_base(repo_url)?.join(url)?;
        let data = self.get_bytes(full_url).await?;

        if let Some(expected_digest) = &entry.digest {
            let actual_digest = compute_digest(&data);
            if !digest_matches(expected_digest, &actual_digest) {
                return Err(RepoError::IntegrityCheckFailed {
                    name: entry.name.clone(),
                    expected: expected_digest.clone(),
                    actual: actual_digest,
                });
            }
        }

        Ok(data)
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>> {
        tracing::debug!(%url, "fetching");
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ChartSource for HttpChartSource {
    async fn get_chart(&self, repo_url: &str, name: &str, version: &str) -> Result<Chart> {
        let key = format!("{}|{}|{}", repo_url.trim_end_matches('/'), name, version);

        if let Some(data) = self.archives.lock().await.get(&key) {
            return Ok(Chart::from_archive(data)?);
        }

        let index = self.fetch_index(repo_url).await?;
        let entry = index
            .get_version(name, version)
            .ok_or_else(|| RepoError::VersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
                repo: repo_url.to_string(),
            })?;

        let data = self.download(repo_url, entry).await?;
        let chart = Chart::from_archive(&data)?;
        tracing::info!(chart = %name, %version, repo = %repo_url, "downloaded chart");

        self.archives.lock().await.insert(key, data);
        Ok(chart)
    }
}

/// Repository URL as a base for joining relative paths
fn repo_base(repo_url: &str) -> Result<Url> {
    let normalized = format!("{}/", repo_url.trim_end_matches('/'));
    Url::parse(&normalized).map_err(|e| RepoError::InvalidRepositoryUrl {
        url: repo_url.to_string(),
        reason: e.to_string(),
    })
}

/// Compute SHA256 digest of data
fn compute_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Compare digests, with or without a `sha256:` prefix
fn digest_matches(expected: &str, actual: &str) -> bool {
    let normalize = |d: &str| {
        d.trim()
            .to_lowercase()
            .trim_start_matches("sha256:")
            .trim_start_matches("sha256-")
            .to_string()
    };
    normalize(expected) == normalize(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::ChartMetadata;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn archive() -> Vec<u8> {
        Chart::new(ChartMetadata::new("web", "1.0.0"))
            .with_values("replicas: 1\n")
            .with_template("templates/svc.yaml", "kind: Service\n")
            .to_archive()
            .unwrap()
    }

    fn index(digest: &str) -> String {
        format!(
            r#"apiVersion: v1
entries:
  web:
    - name: web
      version: 1.0.0
      urls:
        - charts/web-1.0.0.tgz
      digest: "{digest}"
"#
        )
    }

    #[test]
    fn test_compute_digest() {
        let digest = compute_digest(b"hello world");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), 7 + 64);
    }

    #[test]
    fn test_digest_matches() {
        assert!(digest_matches("sha256:abc123", "sha256:ABC123"));
        assert!(digest_matches("sha256:abc123", "abc123"));
        assert!(digest_matches("sha256-abc123", "sha256:abc123"));
        assert!(!digest_matches("sha256:abc123", "sha256:xyz789"));
    }

    #[test]
    fn test_repo_base() {
        let base = repo_base("https://charts.example.com/stable").unwrap();
        assert_eq!(
            base.join("index.yaml").unwrap().as_str(),
            "https://charts.example.com/stable/index.yaml"
        );
        assert!(repo_base("not a url").is_err());
    }

    #[tokio::test]
    async fn test_get_chart_downloads_and_caches() {
        let server = MockServer::start().await;
        let data = archive();

        Mock::given(method("GET"))
            .and(path("/stable/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index(&compute_digest(&data))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stable/charts/web-1.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpChartSource::new().unwrap();
        let repo = format!("{}/stable", server.uri());

        let chart = source.get_chart(&repo, "web", "1.0.0").await.unwrap();
        assert_eq!(chart.name(), "web");
        assert_eq!(chart.templates.len(), 1);

        let cached = source.get_chart(&repo, "web", "1.0.0").await.unwrap();
        assert_eq!(cached, chart);
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index("sha256:0000")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/charts/web-1.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive()))
            .mount(&server)
            .await;

        let source = HttpChartSource::new().unwrap();
        let err = source.get_chart(&server.uri(), "web", "1.0.0").await.unwrap_err();
        assert!(matches!(err, RepoError::IntegrityCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_version_and_index() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/good/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index("sha256:0000")))
            .mount(&server)
            .await;

        let source = HttpChartSource::new().unwrap();

        let err = source
            .get_chart(&format!("{}/good", server.uri()), "web", "2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::VersionNotFound { .. }));

        let err = source
            .get_chart(&format!("{}/missing", server.uri()), "web", "1.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::HttpError { status: 404, .. }));
    }
}
