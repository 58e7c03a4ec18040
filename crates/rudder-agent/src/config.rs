//! Agent options
//!
//! Parsed once at startup; every flag can also be set from the environment.

use clap::{Parser, ValueEnum};
use rudder_kube::{CompressionMethod, EngineConfig, StorageConfig};
use std::time::Duration;

use crate::channel::{DEFAULT_COMMAND_CAPACITY, DEFAULT_RESPONSE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "rudder-agent")]
#[command(version)]
#[command(about = "In-cluster release agent: reconciles ChartRelease resources into releases", long_about = None)]
pub struct AgentOptions {
    /// Namespace to watch (all namespaces if unset)
    #[arg(long, env = "RUDDER_NAMESPACE")]
    pub namespace: Option<String>,

    /// Command queue capacity; producers wait when it is full
    #[arg(long, env = "RUDDER_COMMAND_CAPACITY", default_value_t = DEFAULT_COMMAND_CAPACITY)]
    pub command_capacity: usize,

    /// Response queue capacity
    #[arg(long, env = "RUDDER_RESPONSE_CAPACITY", default_value_t = DEFAULT_RESPONSE_CAPACITY)]
    pub response_capacity: usize,

    /// Reconciliation workers
    #[arg(long, env = "RUDDER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Delay before a failed reconciliation is retried
    #[arg(long, env = "RUDDER_REQUEUE_SECONDS", default_value_t = 30)]
    pub requeue_seconds: u64,

    /// Upper bound for release lookups during reconciliation
    #[arg(long, env = "RUDDER_QUERY_TIMEOUT_SECONDS", default_value_t = 30)]
    pub query_timeout_seconds: u64,

    /// Upstream URL; legacy agents pointing at it are migrated on startup
    #[arg(long, env = "RUDDER_CONNECT_URL")]
    pub connect_url: Option<String>,

    /// Chart this agent is deployed from
    #[arg(long, env = "RUDDER_AGENT_CHART", default_value = "rudder-agent")]
    pub agent_chart: String,

    #[arg(long, env = "RUDDER_LEGACY_AGENT_CHART", default_value = "rudder-env-agent")]
    pub legacy_agent_chart: String,

    #[arg(long, env = "RUDDER_CERT_MANAGER_CHART", default_value = "cert-manager")]
    pub cert_manager_chart: String,

    /// Namespace chart tests run in
    #[arg(long, env = "RUDDER_TEST_NAMESPACE", default_value = "rudder-test")]
    pub test_namespace: String,

    /// Release storage compression (none, gzip, zstd)
    #[arg(long, env = "RUDDER_COMPRESSION", default_value = "zstd", value_parser = parse_compression)]
    pub compression: CompressionMethod,

    #[arg(long, env = "RUDDER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

fn parse_compression(value: &str) -> Result<CompressionMethod, String> {
    value.parse()
}

impl AgentOptions {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            agent_chart: self.agent_chart.clone(),
            legacy_agent_chart: self.legacy_agent_chart.clone(),
            cert_manager_chart: self.cert_manager_chart.clone(),
            test_namespace: self.test_namespace.clone(),
            timeout: EngineConfig::default().timeout,
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            compression: self.compression,
            ..Default::default()
        }
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }
}
