//! `taskmesh.toml` parsing. Every field has a default, so an empty file is a
//! valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskmesh_bus::BusConfig;
use taskmesh_orchestrator::{LoadBalancingStrategy, MasterConfig};
use taskmesh_registry::RegistryConfig;
use taskmesh_worker::{Transport, WorkerAgentConfig};
use tracing::info;

/// File looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "taskmesh.toml";

#[derive(Debug, Deserialize, Default)]
pub struct TaskmeshConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub master: MasterSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

impl TaskmeshConfig {
    /// Read an explicit path, or `taskmesh.toml` if present, or fall back to
    /// defaults.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !tokio::fs::try_exists(&fallback).await.unwrap_or(false) {
                    info!("No {DEFAULT_CONFIG_FILE} found, using defaults");
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config = Self::parse(&raw)?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

// --- [server] ---

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty leaves the control surface open.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}

// --- [master] ---

#[derive(Debug, Deserialize)]
pub struct MasterSection {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub worker_heartbeat_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub failover_enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: usize,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_concurrent_tasks: default_max_concurrent(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            worker_heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            failover_enabled: true,
            max_failures: default_max_failures(),
            failure_window_ms: default_failure_window_ms(),
        }
    }
}

impl MasterSection {
    pub fn to_master_config(&self) -> MasterConfig {
        MasterConfig {
            strategy: LoadBalancingStrategy::from_name(&self.strategy),
            max_concurrent_tasks: self.max_concurrent_tasks,
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms),
            worker_heartbeat_timeout: Duration::from_millis(self.worker_heartbeat_timeout_ms),
            failover_enabled: self.failover_enabled,
            max_failures: self.max_failures,
            failure_window: Duration::from_millis(self.failure_window_ms),
        }
    }
}

fn default_strategy() -> String {
    LoadBalancingStrategy::default().as_str().to_string()
}
fn default_max_concurrent() -> usize {
    10
}
fn default_dispatch_interval_ms() -> u64 {
    50
}
fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_max_failures() -> usize {
    3
}
fn default_failure_window_ms() -> u64 {
    60_000
}

// --- [registry] ---

#[derive(Debug, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_remove_unhealthy: bool,
    #[serde(default = "default_auto_remove_delay_ms")]
    pub auto_remove_delay_ms: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub enable_discovery: bool,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            auto_remove_unhealthy: true,
            auto_remove_delay_ms: default_auto_remove_delay_ms(),
            max_workers: 0,
            enable_discovery: true,
        }
    }
}

impl RegistrySection {
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            auto_remove_unhealthy: self.auto_remove_unhealthy,
            auto_remove_delay: Duration::from_millis(self.auto_remove_delay_ms),
            max_workers: self.max_workers,
            enable_discovery: self.enable_discovery,
        }
    }
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}
fn default_auto_remove_delay_ms() -> u64 {
    60_000
}

// --- [bus] ---

#[derive(Debug, Deserialize)]
pub struct BusSection {
    /// Start a coordinator next to the HTTP surface.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bus_host")]
    pub host: String,
    #[serde(default = "default_pub_port")]
    pub pub_port: u16,
    #[serde(default = "default_rep_port")]
    pub rep_port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_bus_host(),
            pub_port: default_pub_port(),
            rep_port: default_rep_port(),
            topic_prefix: default_topic_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BusSection {
    pub fn to_bus_config(&self) -> BusConfig {
        BusConfig {
            host: self.host.clone(),
            pub_port: self.pub_port,
            rep_port: self.rep_port,
            topic_prefix: self.topic_prefix.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..BusConfig::default()
        }
    }
}

fn default_bus_host() -> String {
    "127.0.0.1".to_string()
}
fn default_pub_port() -> u16 {
    5555
}
fn default_rep_port() -> u16 {
    5556
}
fn default_topic_prefix() -> String {
    "taskmesh".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

// --- [worker] ---

#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default = "default_worker_concurrency")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_master_url")]
    pub master_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_worker_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            capabilities: default_capabilities(),
            max_concurrent_tasks: default_worker_concurrency(),
            weight: default_weight(),
            master_url: default_master_url(),
            api_key: None,
            transport: Transport::default(),
            heartbeat_interval_ms: default_worker_heartbeat_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl WorkerSection {
    /// Agent settings; the bus endpoints come from `[bus]`.
    pub fn to_agent_config(&self, bus: &BusSection) -> WorkerAgentConfig {
        WorkerAgentConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            weight: self.weight,
            transport: self.transport,
            master_url: self.master_url.clone(),
            api_key: self.api_key.clone(),
            bus: bus.to_bus_config(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            ..WorkerAgentConfig::new(self.worker_id.clone(), self.capabilities.clone())
        }
    }
}

fn default_worker_id() -> String {
    "worker-1".to_string()
}
fn default_capabilities() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_worker_concurrency() -> usize {
    1
}
fn default_weight() -> f64 {
    1.0
}
fn default_master_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_worker_heartbeat_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
