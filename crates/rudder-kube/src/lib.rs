//! Rudder Kube - Kubernetes side of the release agent
//!
//! This crate provides:
//! - `storage`: release revisions persisted as Secrets (with an in-memory driver for tests)
//! - `cluster`: applying, deleting, inspecting and scaling manifest objects
//! - `client`: the release engine (install, upgrade, rollback, delete, start/stop)
//! - `namespaces`: the set of namespaces managed by this agent

pub mod client;
pub mod cluster;
pub mod error;
pub mod namespaces;
pub mod release;
pub mod storage;

pub use client::{EngineConfig, ReleaseClient};
pub use cluster::{ClusterClient, KubeCluster, MockCluster, OperationSummary, ResourceInfo};
pub use error::{ErrorKind, KubeError, Result};
pub use namespaces::Namespaces;
pub use release::{ReleaseState, StoredRelease};
pub use storage::{
    CompressionMethod, MockStorageDriver, SecretsDriver, StorageConfig, StorageDriver,
};
