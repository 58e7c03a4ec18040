//! Kubernetes Secrets storage driver
//!
//! Each revision lives in a Secret named `rudder.release.v1.<name>.v<rev>` in
//! the release namespace, labeled `owner=rudder,name=<name>,version=<rev>`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::{BTreeMap, HashSet};

use super::{
    CompressionMethod, OWNER_LABEL, OWNER_VALUE, StorageConfig, StorageDriver,
    decode_from_storage, encode_for_storage, storage_labels,
};
use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

const COMPRESSION_LABEL: &str = "rudder.io/compression";
const SECRET_TYPE: &str = "rudder.io/release.v1";
const RELEASE_KEY: &str = "release";

/// Kubernetes Secrets storage driver
pub struct SecretsDriver {
    client: Client,
    config: StorageConfig,
}

impl SecretsDriver {
    pub fn with_client(client: Client, config: StorageConfig) -> Self {
        Self { client, config }
    }

    fn secrets_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn all_secrets(&self) -> Api<Secret> {
        Api::all(self.client.clone())
    }

    fn build_secret(&self, release: &StoredRelease, encoded: &str) -> Secret {
        let mut labels = storage_labels(release);
        labels.insert(
            COMPRESSION_LABEL.to_string(),
            self.config.compression.as_str().to_string(),
        );

        let mut data = BTreeMap::new();
        data.insert(
            RELEASE_KEY.to_string(),
            k8s_openapi::ByteString(encoded.as_bytes().to_vec()),
        );

        Secret {
            metadata: ObjectMeta {
                name: Some(release.storage_key()),
                namespace: Some(release.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    fn parse_secret(&self, secret: &Secret) -> Result<StoredRelease> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(RELEASE_KEY))
            .ok_or_else(|| KubeError::Storage("Secret missing 'release' data".to_string()))?;

        let encoded = std::str::from_utf8(&data.0)
            .map_err(|e| KubeError::Storage(format!("Invalid UTF-8 in secret: {}", e)))?;

        decode_from_storage(encoded, self.compression_of(secret))
    }

    fn compression_of(&self, secret: &Secret) -> CompressionMethod {
        secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(COMPRESSION_LABEL))
            .and_then(|c| c.parse().ok())
            .unwrap_or(self.config.compression)
    }

    /// Parse every release Secret matching a selector, newest first
    async fn select(&self, api: Api<Secret>, selector: &str) -> Result<Vec<StoredRelease>> {
        let secrets = api.list(&ListParams::default().labels(selector)).await?;

        let mut releases = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match self.parse_secret(secret) {
                Ok(release) => releases.push(release),
                Err(e) => tracing::warn!(
                    secret = secret.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "skipping unreadable release secret"
                ),
            }
        }

        releases.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(releases)
    }
}

fn release_selector(name: &str) -> String {
    format!("{}={},name={}", OWNER_LABEL, OWNER_VALUE, name)
}

#[async_trait]
impl StorageDriver for SecretsDriver {
    async fn get(&self, name: &str, version: u32) -> Result<StoredRelease> {
        let selector = format!("{},version={}", release_selector(name), version);
        self.select(self.all_secrets(), &selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: name.to_string(),
                version,
            })
    }

    async fn get_latest(&self, name: &str) -> Result<StoredRelease> {
        self.history(name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
            })
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        include_superseded: bool,
    ) -> Result<Vec<StoredRelease>> {
        let api = match namespace {
            Some(ns) => self.secrets_api(ns),
            None => self.all_secrets(),
        };
        let mut releases = self
            .select(api, &format!("{}={}", OWNER_LABEL, OWNER_VALUE))
            .await?;

        if !include_superseded {
            let mut seen = HashSet::new();
            releases.retain(|r| seen.insert(r.name.clone()));
        }

        Ok(releases)
    }

    async fn history(&self, name: &str) -> Result<Vec<StoredRelease>> {
        let releases = self.select(self.all_secrets(), &release_selector(name)).await?;

        if releases.is_empty() {
            return Err(KubeError::ReleaseNotFound {
                name: name.to_string(),
            });
        }
        Ok(releases)
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        let encoded = encode_for_storage(release, &self.config)?;
        let secret = self.build_secret(release, &encoded);

        match self
            .secrets_api(&release.namespace)
            .create(&PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        let encoded = encode_for_storage(release, &self.config)?;
        let secret = self.build_secret(release, &encoded);

        match self
            .secrets_api(&release.namespace)
            .replace(&release.storage_key(), &PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(KubeError::RevisionNotFound {
                name: release.name.clone(),
                version: release.version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str, version: u32) -> Result<StoredRelease> {
        let release = self.get(name, version).await?;

        self.secrets_api(&release.namespace)
            .delete(&release.storage_key(), &DeleteParams::default())
            .await?;

        Ok(release)
    }

    async fn delete_all(&self, name: &str) -> Result<Vec<StoredRelease>> {
        let history = self.history(name).await?;

        for release in &history {
            match self
                .secrets_api(&release.namespace)
                .delete(&release.storage_key(), &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(release = %name, revisions = history.len(), "purged release history");
        Ok(history)
    }
}
