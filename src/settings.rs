use std::env;

use api::grpc::transport_channel_pool::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_GRPC_TIMEOUT, DEFAULT_POOL_SIZE};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use validator::Validate;

/// Layered configuration for the query node binary (SPEC_FULL.md §2.9):
/// a default file, an optional per-`RUN_MODE` override, an optional local
/// override never checked in, then environment variables prefixed
/// `QUERYNODE__`, in that precedence order — the same layering shape as
/// the teacher's own `Settings::new`.
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct Settings {
    #[serde(default = "default_debug")]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[validate]
    pub service: ServiceConfig,
    #[validate]
    pub node: NodeConfig,
    #[validate]
    pub segment_loader: SegmentLoaderConfig,
    #[serde(default)]
    #[validate]
    pub cluster: ClusterConfig,
}

/// RPC/HTTP listen configuration (spec.md §6.3 RPC surface, §6.4 healthz).
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct ServiceConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub grpc_port: u16,
    /// Serves the healthz probe (spec.md §6.4) and the Prometheus scrape
    /// endpoint (SPEC_FULL.md §2.13); `None` disables the HTTP surface.
    pub http_port: Option<u16>,
    pub max_workers: Option<usize>,
}

/// This node's identity and shutdown behavior (spec.md §2.8/§4.8).
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct NodeConfig {
    pub node_id: i64,
    #[serde(default = "default_graceful_stop_timeout_sec")]
    #[validate(range(min = 1))]
    pub graceful_stop_timeout_sec: u64,
    #[serde(default = "default_task_queue_capacity")]
    #[validate(range(min = 1))]
    pub task_queue_capacity: usize,
}

/// Memory admission control for `SegmentLoader` (spec.md §4.4).
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct SegmentLoaderConfig {
    #[validate(range(min = 1))]
    pub total_memory_bytes: u64,
    #[serde(default = "default_memory_threshold")]
    #[validate(custom = "validate_memory_threshold")]
    pub memory_threshold: f64,
}

/// Peer-node connection pool (spec.md §5 "Connection pools to peer nodes
/// are 1-per-node"); defaults come from `api::grpc::transport_channel_pool`.
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct ClusterConfig {
    #[serde(default)]
    #[validate]
    pub p2p: P2pConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            p2p: P2pConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct P2pConfig {
    #[serde(default = "default_grpc_timeout_ms")]
    #[validate(range(min = 1))]
    pub grpc_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connection_pool_size")]
    #[validate(range(min = 1))]
    pub connection_pool_size: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            grpc_timeout_ms: default_grpc_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connection_pool_size: default_connection_pool_size(),
        }
    }
}

fn validate_memory_threshold(value: f64) -> Result<(), validator::ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("memory_threshold must be in [0.0, 1.0]"))
    }
}

fn default_debug() -> bool {
    false
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_graceful_stop_timeout_sec() -> u64 {
    30
}

fn default_task_queue_capacity() -> usize {
    256
}

fn default_memory_threshold() -> f64 {
    0.9
}

fn default_grpc_timeout_ms() -> u64 {
    DEFAULT_GRPC_TIMEOUT.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_connection_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl Settings {
    pub fn new(config_path: Option<String>) -> Result<Self, ConfigError> {
        let config_path = config_path.unwrap_or_else(|| "config/config".into());
        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the default configuration file.
            .add_source(File::with_name(&config_path))
            // Add in the current environment file; optional so it need not
            // exist (defaults to 'development').
            .add_source(File::with_name(&format!("config/{env}")).required(false))
            // Add in a local configuration file. This file shouldn't be
            // checked into git.
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from the environment, e.g.
            // `QUERYNODE__NODE__NODE_ID=1`.
            .add_source(Environment::with_prefix("QUERYNODE").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    #[allow(dead_code)]
    pub fn validate_and_warn(&self) {
        if let Err(ref errs) = self.validate() {
            log::warn!("settings validation failed: {errs}");
        }
    }
}

/// Returns the number of actix workers to use for the healthz/metrics HTTP
/// surface, mirroring the teacher's `max_web_workers` sizing rule.
pub fn max_web_workers(settings: &Settings) -> usize {
    match settings.service.max_workers {
        Some(0) | None => {
            let num_cpu = num_cpus::get();
            std::cmp::max(1, num_cpu.saturating_sub(1))
        }
        Some(workers) => workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_threshold_out_of_range_fails_validation() {
        let config = SegmentLoaderConfig {
            total_memory_bytes: 1024,
            memory_threshold: 1.5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_threshold_in_range_passes_validation() {
        let config = SegmentLoaderConfig {
            total_memory_bytes: 1024,
            memory_threshold: 0.9,
        };
        assert!(config.validate().is_ok());
    }
}
