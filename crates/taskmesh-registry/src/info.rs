use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use taskmesh_core::protocol::RegisterWorkerRequest;
use taskmesh_core::{capability_matches, DispatchTarget, HealthStatus, WorkerStatus};

fn default_max_concurrent() -> usize {
    1
}

fn default_weight() -> f64 {
    1.0
}

/// Registration record of a remote worker.
///
/// The registry owns the authoritative copy; every accessor hands out clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    /// Unique id.
    pub worker_id: String,
    /// Task types handled. `"*"` matches everything.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Where the worker can be reached, if it says.
    #[serde(default)]
    pub address: String,
    /// Free-form worker metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Time of the latest registration.
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    /// Time of the latest heartbeat.
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
    /// Load status.
    #[serde(default)]
    pub status: WorkerStatus,
    /// Result of the latest health check.
    #[serde(default)]
    pub health_status: HealthStatus,
    /// Concurrency ceiling advertised by the worker.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Relative capacity for weighted balancing.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Tasks the worker is currently executing, as last reported.
    #[serde(default)]
    pub active_tasks: usize,
}

impl WorkerInfo {
    /// A record with defaults for everything but id and capabilities.
    pub fn new<I, S>(worker_id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            address: String::new(),
            metadata: HashMap::new(),
            registered_at: now,
            last_heartbeat: now,
            status: WorkerStatus::Idle,
            health_status: HealthStatus::Unknown,
            max_concurrent_tasks: 1,
            weight: 1.0,
            active_tasks: 0,
        }
    }

    /// Set the advertised address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Set the balancing weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Refresh the heartbeat, mark healthy, and bring an offline worker back.
    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
        self.health_status = HealthStatus::Healthy;
        if self.status == WorkerStatus::Offline {
            self.status = WorkerStatus::Idle;
        }
    }

    /// Time since the last heartbeat as seen at `now`. Zero if the clock went backwards.
    pub fn heartbeat_age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }

    /// Heartbeat freshness as of `now`.
    pub fn is_healthy_at(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.heartbeat_age_at(now) < timeout
    }

    /// Heartbeat freshness as of the current time.
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        self.is_healthy_at(timeout, Utc::now())
    }
}

impl From<RegisterWorkerRequest> for WorkerInfo {
    fn from(req: RegisterWorkerRequest) -> Self {
        let mut info = WorkerInfo::new(req.worker_id, req.capabilities)
            .with_address(req.address)
            .with_max_concurrent_tasks(req.max_concurrent_tasks)
            .with_weight(req.weight);
        info.metadata = req.metadata;
        info
    }
}

impl DispatchTarget for WorkerInfo {
    fn target_id(&self) -> &str {
        &self.worker_id
    }

    fn has_capability(&self, task_type: &str) -> bool {
        capability_matches(&self.capabilities, task_type)
    }

    fn can_accept_task(&self) -> bool {
        self.status == WorkerStatus::Idle && self.active_tasks < self.max_concurrent_tasks
    }

    fn active_task_count(&self) -> usize {
        self.active_tasks
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}
