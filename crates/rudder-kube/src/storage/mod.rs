//! Storage drivers for persisting release information
//!
//! - **Secrets** (default): one Kubernetes Secret per release revision
//! - **Mock**: in-memory, for tests
//!
//! Release names are unique across the cluster, so every lookup is keyed by
//! name alone and searches all namespaces. Bodies are JSON, compressed and
//! base64 encoded.

mod mock;
mod secrets;

pub use mock::{MockStorageDriver, OperationCounts};
pub use secrets::SecretsDriver;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

/// Maximum size of an encoded release (Kubernetes object limit is ~1MB)
pub const MAX_RESOURCE_SIZE: usize = 1_000_000;

/// Label identifying objects owned by this store
pub const OWNER_LABEL: &str = "owner";
pub const OWNER_VALUE: &str = "rudder";

/// Persists release revisions
///
/// Implementations must serialize writes per release name: two concurrent
/// `create` calls for the same revision cannot both succeed.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Get a specific revision
    async fn get(&self, name: &str, version: u32) -> Result<StoredRelease>;

    /// Get the highest revision
    async fn get_latest(&self, name: &str) -> Result<StoredRelease>;

    /// List releases, optionally scoped to one namespace
    ///
    /// Without `include_superseded` only the latest revision of each
    /// release is returned.
    async fn list(
        &self,
        namespace: Option<&str>,
        include_superseded: bool,
    ) -> Result<Vec<StoredRelease>>;

    /// All revisions of a release, newest first
    async fn history(&self, name: &str) -> Result<Vec<StoredRelease>>;

    /// Store a new revision; fails if it already exists
    async fn create(&self, release: &StoredRelease) -> Result<()>;

    /// Replace an existing revision
    async fn update(&self, release: &StoredRelease) -> Result<()>;

    /// Delete one revision
    async fn delete(&self, name: &str, version: u32) -> Result<StoredRelease>;

    /// Delete every revision of a release
    async fn delete_all(&self, name: &str) -> Result<Vec<StoredRelease>>;

    async fn exists(&self, name: &str) -> Result<bool> {
        match self.get_latest(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub compression: CompressionMethod,

    /// Encoded releases above this size are rejected
    pub max_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::default(),
            max_size: MAX_RESOURCE_SIZE,
        }
    }
}

/// Compression method for stored releases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,

    /// Gzip compression (Helm compatible)
    Gzip { level: u32 },

    Zstd { level: i32 },
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip { .. } => "gzip",
            Self::Zstd { .. } => "zstd",
        }
    }
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

impl FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip { level: 6 }),
            "zstd" => Ok(Self::Zstd { level: 3 }),
            other => Err(format!("unknown compression '{}' (none, gzip, zstd)", other)),
        }
    }
}

/// Compress data using the specified method
#[must_use = "compression result should be used"]
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| KubeError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd { level } => zstd::encode_all(std::io::Cursor::new(data), level)
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Decompress data using the specified method
#[must_use = "decompression result should be used"]
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            Ok(decompressed)
        }
        CompressionMethod::Zstd { .. } => zstd::decode_all(std::io::Cursor::new(data))
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Encode a release for storage: JSON, compressed, base64
#[must_use = "encoded data should be used for storage"]
pub fn encode_for_storage(release: &StoredRelease, config: &StorageConfig) -> Result<String> {
    let json = serde_json::to_vec(release)?;
    let compressed = compress(&json, config.compression)?;
    let encoded =
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &compressed);

    if encoded.len() > config.max_size {
        return Err(KubeError::ReleaseTooLarge {
            size: encoded.len(),
            max: config.max_size,
        });
    }
    Ok(encoded)
}

/// Decode a release stored by [`encode_for_storage`]
#[must_use = "decoded release should be used"]
pub fn decode_from_storage(data: &str, compression: CompressionMethod) -> Result<StoredRelease> {
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    let decompressed = decompress(&decoded, compression)?;
    Ok(serde_json::from_slice(&decompressed)?)
}

/// Labels for a stored release object
#[must_use = "labels should be applied to resources"]
pub fn storage_labels(release: &StoredRelease) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(OWNER_LABEL.to_string(), OWNER_VALUE.to_string());
    labels.insert("name".to_string(), release.name.clone());
    labels.insert("version".to_string(), release.version.to_string());
    labels.insert("status".to_string(), release.state.status_name().to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(manifest: &str) -> StoredRelease {
        StoredRelease::for_install("app", "proj", "web", "1.0.0", "replicas: 1", manifest)
    }

    #[test]
    fn test_encode_decode_with_each_method() {
        let release = release("apiVersion: v1\nkind: ConfigMap");

        for method in [
            CompressionMethod::None,
            CompressionMethod::Gzip { level: 6 },
            CompressionMethod::Zstd { level: 3 },
        ] {
            let config = StorageConfig {
                compression: method,
                ..Default::default()
            };
            let encoded = encode_for_storage(&release, &config).unwrap();
            let decoded = decode_from_storage(&encoded, method).unwrap();
            assert_eq!(decoded, release, "{}", method.as_str());
        }
    }

    #[test]
    fn test_oversize_release_is_rejected() {
        let release = release(&"x".repeat(4096));
        let config = StorageConfig {
            compression: CompressionMethod::None,
            max_size: 1024,
        };

        let err = encode_for_storage(&release, &config).unwrap_err();
        assert!(matches!(err, KubeError::ReleaseTooLarge { max: 1024, .. }));
    }

    #[test]
    fn test_zstd_shrinks_repetitive_manifests() {
        let release = release(&"apiVersion: v1\nkind: ConfigMap\n---\n".repeat(200));

        let plain = encode_for_storage(
            &release,
            &StorageConfig {
                compression: CompressionMethod::None,
                ..Default::default()
            },
        )
        .unwrap();
        let zstd = encode_for_storage(&release, &StorageConfig::default()).unwrap();

        assert!(zstd.len() < plain.len());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("none".parse::<CompressionMethod>(), Ok(CompressionMethod::None));
        assert_eq!(
            "GZIP".parse::<CompressionMethod>(),
            Ok(CompressionMethod::Gzip { level: 6 })
        );
        assert!("lz4".parse::<CompressionMethod>().is_err());
    }

    #[test]
    fn test_storage_labels() {
        let labels = storage_labels(&release(""));
        assert_eq!(labels.get("owner").map(String::as_str), Some("rudder"));
        assert_eq!(labels.get("name").map(String::as_str), Some("app"));
        assert_eq!(labels.get("version").map(String::as_str), Some("1"));
        assert_eq!(labels.get("status").map(String::as_str), Some("pending-install"));
    }
}
