use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use taskmesh_bus::BusConfig;
use taskmesh_core::{TaskmeshError, TaskmeshResult};

/// How the agent talks to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    Bus,
}

impl std::str::FromStr for Transport {
    type Err = TaskmeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Transport::Http),
            "bus" => Ok(Transport::Bus),
            other => Err(TaskmeshError::Config(format!("unknown transport: {other}"))),
        }
    }
}

/// Settings for one [`WorkerAgent`](crate::WorkerAgent).
#[derive(Debug, Clone)]
pub struct WorkerAgentConfig {
    /// Id to register under; must not be empty.
    pub worker_id: String,
    /// Task types advertised to the master.
    pub capabilities: Vec<String>,
    /// Tasks run at the same time. At least 1.
    pub max_concurrent_tasks: usize,
    /// Relative capacity advertised to weighted balancing.
    pub weight: f64,
    /// Address advertised in the registry.
    pub address: String,
    /// Free-form metadata sent at registration.
    pub metadata: HashMap<String, serde_json::Value>,
    /// How the agent reaches the master.
    pub transport: Transport,
    /// Root URL of the master's HTTP server.
    pub master_url: String,
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,
    /// Used when `transport` is [`Transport::Bus`].
    pub bus: BusConfig,
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,
    /// Time between polls for new work.
    pub poll_interval: Duration,
    /// Wait between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Consecutive failed reconnects before the agent gives up.
    pub max_reconnect_attempts: u32,
}

impl Default for WorkerAgentConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".into(),
            capabilities: vec!["*".into()],
            max_concurrent_tasks: 1,
            weight: 1.0,
            address: String::new(),
            metadata: HashMap::new(),
            transport: Transport::Http,
            master_url: "http://127.0.0.1:8000".into(),
            api_key: None,
            bus: BusConfig::default(),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 3,
        }
    }
}

impl WorkerAgentConfig {
    /// Defaults with the given id and capabilities.
    pub fn new<I, S>(worker_id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            worker_id: worker_id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> TaskmeshResult<()> {
        if self.worker_id.is_empty() {
            return Err(TaskmeshError::Config("worker_id cannot be empty".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(TaskmeshError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(TaskmeshError::Config(
                "poll and heartbeat intervals must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerAgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capabilities, vec!["*"]);
        assert_eq!(config.transport, Transport::Http);
    }

    #[test]
    fn test_validation() {
        let mut config = WorkerAgentConfig::new("", ["shell"]);
        assert!(config.validate().is_err());
        config.worker_id = "w1".into();
        config.max_concurrent_tasks = 0;
        assert!(matches!(config.validate(), Err(TaskmeshError::Config(_))));
    }

    #[test]
    fn test_transport_names() {
        assert_eq!("BUS".parse::<Transport>().unwrap(), Transport::Bus);
        assert!("carrier-pigeon".parse::<Transport>().is_err());
    }
}
