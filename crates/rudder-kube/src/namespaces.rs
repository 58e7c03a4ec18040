//! Namespaces managed by this agent

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Shared set of namespaces the agent currently manages
///
/// Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl Namespaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a namespace; returns `true` if it was not tracked yet
    pub fn add(&self, namespace: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(namespace.to_string())
    }

    pub fn remove(&self, namespace: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(namespace)
    }

    /// Sorted snapshot
    pub fn list(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for Namespaces {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let namespaces = Self::new();
        for ns in iter {
            namespaces.add(ns.as_ref());
        }
        namespaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_between_clones() {
        let namespaces = Namespaces::new();
        let view = namespaces.clone();

        assert!(namespaces.add("proj"));
        assert!(!namespaces.add("proj"));
        assert!(view.contains("proj"));

        assert!(view.remove("proj"));
        assert!(!namespaces.contains("proj"));
    }

    #[test]
    fn test_from_iter_sorted() {
        let namespaces: Namespaces = ["b", "a"].into_iter().collect();
        assert_eq!(namespaces.list(), vec!["a", "b"]);
    }
}
