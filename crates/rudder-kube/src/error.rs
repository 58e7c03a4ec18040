//! Error types for release storage and cluster operations

use rudder_core::{CoreError, Release};
use rudder_engine::EngineError;
use rudder_repo::RepoError;
use thiserror::Error;

/// Result type for Kubernetes operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Coarse classification used by callers to pick a recovery strategy
///
/// Callers branch on this tag, never on error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The release already exists; not retried
    Conflict,
    /// Release or object absent; a normal state
    NotFound,
    /// Store, network or timeout failure; retried by the caller
    Transient,
    /// Malformed values, templates or configuration; retrying cannot help
    Config,
    /// A mutation was partially applied
    Partial,
    Internal,
}

/// Errors that can occur during release operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KubeError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("Release not found: {name}")]
    ReleaseNotFound { name: String },

    #[error("Release {name} has no revision {version}")]
    RevisionNotFound { name: String, version: u32 },

    #[error("Release already exists: {name} in namespace {namespace}")]
    ReleaseAlreadyExists { name: String, namespace: String },

    #[error("Release {name} is busy: {status} in progress")]
    OperationInProgress { name: String, status: String },

    #[error("Cannot rollback {name}: {reason}")]
    RollbackNotPossible { name: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Release too large: {size} bytes (max: {max} bytes)")]
    ReleaseTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Render failed: {0}")]
    Template(#[from] EngineError),

    #[error("Load chart failed: {0}")]
    ChartLoad(#[from] RepoError),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to {operation} {} resource(s): {}", .failures.len(), .failures.join("; "))]
    ResourceOperation {
        operation: &'static str,
        failures: Vec<String>,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("{source}; cleanup failed: {cleanup}")]
    CleanupFailed {
        source: Box<KubeError>,
        cleanup: Box<KubeError>,
    },

    #[error("Release {} revision {} partially applied: {source}", .release.name, .release.revision)]
    PartiallyApplied {
        release: Box<Release>,
        source: Box<KubeError>,
    },

    #[error("Failed to delete {} release(s) in namespace {namespace}: {}", .failures.len(), .failures.join("; "))]
    NamespaceCleanup {
        namespace: String,
        failures: Vec<String>,
    },
}

impl KubeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Api(kube::Error::Api(resp)) if resp.code == 404 => ErrorKind::NotFound,
            Self::Api(kube::Error::Api(resp)) if resp.code == 409 => ErrorKind::Conflict,
            Self::Api(kube::Error::Api(resp)) if resp.code == 422 => ErrorKind::Config,
            Self::Api(_) => ErrorKind::Transient,
            Self::ReleaseNotFound { .. } | Self::RevisionNotFound { .. } => ErrorKind::NotFound,
            Self::ReleaseAlreadyExists { .. } | Self::OperationInProgress { .. } => {
                ErrorKind::Conflict
            }
            Self::Storage(_) | Self::Timeout(_) | Self::ResourceOperation { .. } => {
                ErrorKind::Transient
            }
            Self::ChartLoad(e) => match e {
                RepoError::NetworkError { .. } | RepoError::Timeout { .. } => ErrorKind::Transient,
                RepoError::HttpError { status, .. } if *status >= 500 => ErrorKind::Transient,
                _ => ErrorKind::Config,
            },
            Self::Template(_)
            | Self::InvalidManifest(_)
            | Self::InvalidConfig(_)
            | Self::RollbackNotPossible { .. }
            | Self::ReleaseTooLarge { .. } => ErrorKind::Config,
            Self::Serialization(_) | Self::Compression(_) => ErrorKind::Internal,
            Self::CleanupFailed { .. }
            | Self::PartiallyApplied { .. }
            | Self::NamespaceCleanup { .. } => ErrorKind::Partial,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Release state recorded before the failure, if any
    pub fn partial_release(&self) -> Option<&Release> {
        match self {
            Self::PartiallyApplied { release, .. } => Some(release),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for KubeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::InvalidManifest(err.to_string())
    }
}

impl From<CoreError> for KubeError {
    fn from(err: CoreError) -> Self {
        Self::Template(EngineError::Core(err))
    }
}

impl From<tokio::time::error::Elapsed> for KubeError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}
