//! Mock storage driver for testing
//!
//! Stores releases in memory and can be told to fail selected operations,
//! so release engine tests run without a Kubernetes cluster.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::StorageDriver;
use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

/// In-memory storage driver for testing
#[derive(Clone, Default)]
pub struct MockStorageDriver {
    /// name -> version -> release
    store: Arc<Mutex<BTreeMap<String, BTreeMap<u32, StoredRelease>>>>,
    operations: Arc<Mutex<OperationCounts>>,
    failing: Arc<Mutex<HashSet<&'static str>>>,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockStorageDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_releases(releases: Vec<StoredRelease>) -> Self {
        let driver = Self::new();
        {
            let mut store = guard(&driver.store);
            for release in releases {
                store
                    .entry(release.name.clone())
                    .or_default()
                    .insert(release.version, release);
            }
        }
        driver
    }

    /// Make an operation (`get`, `list`, `create`, `update`, `delete`) fail
    /// with a storage error until [`recover`](Self::recover) is called
    pub fn fail_on(&self, operation: &'static str) {
        guard(&self.failing).insert(operation);
    }

    pub fn recover(&self) {
        guard(&self.failing).clear();
    }

    pub fn operation_counts(&self) -> OperationCounts {
        guard(&self.operations).clone()
    }

    pub fn all_releases(&self) -> Vec<StoredRelease> {
        guard(&self.store)
            .values()
            .flat_map(|versions| versions.values())
            .cloned()
            .collect()
    }

    pub fn release_count(&self) -> usize {
        guard(&self.store).values().map(|v| v.len()).sum()
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        {
            let mut ops = guard(&self.operations);
            match operation {
                "get" => ops.gets += 1,
                "list" => ops.lists += 1,
                "create" => ops.creates += 1,
                "update" => ops.updates += 1,
                _ => ops.deletes += 1,
            }
        }

        if guard(&self.failing).contains(operation) {
            return Err(KubeError::Storage(format!("injected {} failure", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for MockStorageDriver {
    async fn get(&self, name: &str, version: u32) -> Result<StoredRelease> {
        self.check("get")?;

        guard(&self.store)
            .get(name)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: name.to_string(),
                version,
            })
    }

    async fn get_latest(&self, name: &str) -> Result<StoredRelease> {
        self.check("get")?;

        guard(&self.store)
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
            })
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        include_superseded: bool,
    ) -> Result<Vec<StoredRelease>> {
        self.check("list")?;

        let store = guard(&self.store);
        let mut releases: Vec<StoredRelease> = store
            .values()
            .flat_map(|versions| {
                let revisions: Box<dyn Iterator<Item = &StoredRelease>> = if include_superseded {
                    Box::new(versions.values().rev())
                } else {
                    Box::new(versions.values().next_back().into_iter())
                };
                revisions
            })
            .filter(|r| namespace.is_none_or(|ns| r.namespace == ns))
            .cloned()
            .collect();

        releases.sort_by(|a, b| a.name.cmp(&b.name).then(b.version.cmp(&a.version)));
        Ok(releases)
    }

    async fn history(&self, name: &str) -> Result<Vec<StoredRelease>> {
        self.check("list")?;

        guard(&self.store)
            .get(name)
            .filter(|versions| !versions.is_empty())
            .map(|versions| versions.values().rev().cloned().collect())
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
            })
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        self.check("create")?;

        let mut store = guard(&self.store);
        let versions = store.entry(release.name.clone()).or_default();
        if versions.contains_key(&release.version) {
            return Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
            });
        }
        versions.insert(release.version, release.clone());
        Ok(())
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        self.check("update")?;

        let mut store = guard(&self.store);
        let slot = store
            .get_mut(&release.name)
            .and_then(|versions| versions.get_mut(&release.version))
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: release.name.clone(),
                version: release.version,
            })?;
        *slot = release.clone();
        Ok(())
    }

    async fn delete(&self, name: &str, version: u32) -> Result<StoredRelease> {
        self.check("delete")?;

        let mut store = guard(&self.store);
        let removed = store
            .get_mut(name)
            .and_then(|versions| versions.remove(&version))
            .ok_or_else(|| KubeError::RevisionNotFound {
                name: name.to_string(),
                version,
            })?;
        if store.get(name).is_some_and(|v| v.is_empty()) {
            store.remove(name);
        }
        Ok(removed)
    }

    async fn delete_all(&self, name: &str) -> Result<Vec<StoredRelease>> {
        self.check("delete")?;

        guard(&self.store)
            .remove(name)
            .map(|versions| versions.into_values().rev().collect())
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
            })
    }
}
