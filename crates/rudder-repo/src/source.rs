//! Chart source abstraction

use async_trait::async_trait;
use rudder_core::Chart;
use std::collections::HashMap;

use crate::error::{RepoError, Result};

/// Fetches and parses packaged charts
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn get_chart(&self, repo_url: &str, name: &str, version: &str) -> Result<Chart>;
}

/// In-memory chart source, keyed by `(name, version)`
#[derive(Debug, Clone, Default)]
pub struct MemoryChartSource {
    charts: HashMap<(String, String), Chart>,
}

impl MemoryChartSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chart(mut self, chart: Chart) -> Self {
        self.insert(chart);
        self
    }

    pub fn insert(&mut self, chart: Chart) {
        let key = (chart.name().to_string(), chart.version().to_string());
        self.charts.insert(key, chart);
    }
}

#[async_trait]
impl ChartSource for MemoryChartSource {
    async fn get_chart(&self, repo_url: &str, name: &str, version: &str) -> Result<Chart> {
        self.charts
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| RepoError::VersionNotFound {
                name: name.to_string(),
                version: version.to_string(),
                repo: repo_url.to_string(),
            })
    }
}
