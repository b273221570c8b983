//! Message bodies exchanged between the master and remote workers.
//!
//! The same types travel as HTTP JSON bodies and as bus envelope payloads,
//! so a worker agent can switch transport without changing its logic.

use crate::{HealthStatus, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Path prefix of the HTTP control surface.
pub const HTTP_API_PREFIX: &str = "/api/orchestration";

fn default_max_concurrent() -> usize {
    1
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_max_tasks() -> usize {
    1
}

/// Announce a remote worker to the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterWorkerRequest {
    /// Unique worker id; must not be empty.
    pub worker_id: String,
    /// Task types the worker can handle. `"*"` matches everything.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Network address the worker can be reached at, if any.
    #[serde(default)]
    pub address: String,
    /// Arbitrary worker metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Concurrency ceiling advertised by the worker.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Relative capacity for weighted balancing.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// Reply to a registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterWorkerResponse {
    /// Whether the worker is now registered.
    pub success: bool,
    /// Identity assigned to the worker.
    pub worker_id: String,
    /// Echoed address.
    #[serde(default)]
    pub address: String,
    /// Echoed capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Human-readable outcome.
    #[serde(default)]
    pub message: String,
}

/// Body for operations that only name a worker (heartbeat, unregister).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerIdRequest {
    /// Target worker.
    pub worker_id: String,
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResponse {
    /// Always true; unknown workers get a not-found error instead.
    pub success: bool,
    /// Worker that sent the heartbeat.
    pub worker_id: String,
    /// Health after the heartbeat was applied.
    pub health_status: HealthStatus,
    /// Timestamp recorded by the registry.
    pub last_heartbeat: DateTime<Utc>,
}

/// Generic boolean acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    /// Whether the operation took effect.
    pub success: bool,
    /// Human-readable outcome.
    #[serde(default)]
    pub message: String,
}

impl Ack {
    /// Build an acknowledgement.
    pub fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
        }
    }
}

/// A remote worker asking for work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollRequest {
    /// Polling worker.
    pub worker_id: String,
    /// Free slots on the worker.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

/// Work handed to a polling worker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PollResponse {
    /// Tasks now assigned to the worker.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Ids of running tasks the master wants cancelled.
    #[serde(default)]
    pub cancelled: Vec<String>,
}

/// Task submission reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitTaskResponse {
    /// Whether the task was queued.
    pub success: bool,
    /// Generated or echoed id.
    pub task_id: String,
    /// Human-readable outcome.
    #[serde(default)]
    pub message: String,
}

/// Batch submission body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchRequest {
    /// Tasks to enqueue, in order.
    pub tasks: Vec<Task>,
}

/// Batch submission reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitBatchResponse {
    /// Whether every task was queued.
    pub success: bool,
    /// Ids in submission order.
    pub task_ids: Vec<String>,
    /// Number of queued tasks.
    pub count: usize,
}

/// Cancellation body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelTaskRequest {
    /// Task to cancel.
    pub task_id: String,
}

/// Cancellation reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelTaskResponse {
    /// Whether the task was removed or signalled.
    pub success: bool,
    /// Echoed id.
    pub task_id: String,
    /// Human-readable outcome.
    #[serde(default)]
    pub message: String,
}

/// Capability lookup body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverRequest {
    /// Capability to match.
    pub capability: String,
    /// Only return healthy workers.
    #[serde(default = "default_true")]
    pub healthy_only: bool,
}

/// Multi-capability lookup body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindAllRequest {
    /// Capabilities to match.
    pub capabilities: Vec<String>,
    /// Intersection when true, union when false.
    #[serde(default)]
    pub require_all: bool,
}

/// Bus topics for the worker-facing operations and the master's broadcasts.
pub mod topics {
    /// Request: [`RegisterWorkerRequest`](super::RegisterWorkerRequest).
    pub const REGISTER: &str = "worker.register";
    /// Request: [`WorkerIdRequest`](super::WorkerIdRequest).
    pub const HEARTBEAT: &str = "worker.heartbeat";
    /// Request: [`WorkerIdRequest`](super::WorkerIdRequest).
    pub const UNREGISTER: &str = "worker.unregister";
    /// Request: [`PollRequest`](super::PollRequest).
    pub const POLL: &str = "task.poll";
    /// Request: [`TaskProgress`](crate::TaskProgress).
    pub const PROGRESS: &str = "task.progress";
    /// Request: [`TaskResult`](crate::TaskResult).
    pub const REPORT: &str = "task.report";
    /// Request: [`Task`](crate::Task).
    pub const SUBMIT: &str = "task.submit";

    /// Broadcast: a worker joined the registry.
    pub const WORKER_REGISTERED: &str = "worker_registered";
    /// Broadcast: a worker left or was removed.
    pub const WORKER_UNREGISTERED: &str = "worker_unregistered";
    /// Broadcast: a worker missed its heartbeat deadline.
    pub const WORKER_UNHEALTHY: &str = "worker_unhealthy";
}
