use crate::handler::{invoke, HandlerRegistry, ProgressReporter, TaskContext, TaskHandler};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskmesh_core::{
    capability_matches, DispatchTarget, Task, TaskResult, TaskmeshResult, WorkerStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where a pool worker actually runs its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Handlers run inside this process.
    Local,
    /// Handlers forward to a remote agent; liveness comes from its heartbeats.
    Remote,
}

struct WorkerState {
    status: WorkerStatus,
    active: BTreeSet<String>,
    tasks_completed: u64,
    tasks_failed: u64,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
}

struct WorkerProfile {
    capabilities: Vec<String>,
    weight: f64,
    max_concurrent_tasks: usize,
}

/// Serialisable view of a [`Worker`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerSnapshot {
    /// Pool id.
    pub worker_id: String,
    /// Local or remote.
    pub kind: WorkerKind,
    /// Task types handled.
    pub capabilities: Vec<String>,
    /// Load status.
    pub status: WorkerStatus,
    /// Balancing weight.
    pub weight: f64,
    /// Concurrency ceiling.
    pub max_concurrent_tasks: usize,
    /// Ids of the tasks holding a slot.
    pub active_tasks: Vec<String>,
    /// Tasks that succeeded here.
    pub tasks_completed: u64,
    /// Tasks that failed here.
    pub tasks_failed: u64,
    /// Time of the latest heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Heartbeat younger than the pool timeout.
    pub healthy: bool,
}

/// An in-process execution slot.
///
/// Identity is fixed at construction. The profile (capabilities, weight and
/// concurrency ceiling) can be refreshed in place with [`Worker::update_profile`];
/// status, the active set and counters live behind a lock so the worker can be shared through an
/// `Arc` between the pool and the executions running on it.
pub struct Worker {
    worker_id: String,
    kind: WorkerKind,
    profile: RwLock<WorkerProfile>,
    handlers: HandlerRegistry,
    state: Mutex<WorkerState>,
}

impl Worker {
    /// A local worker with weight 1 and one concurrent task.
    pub fn new<I, S>(worker_id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            worker_id: worker_id.into(),
            kind: WorkerKind::Local,
            profile: RwLock::new(WorkerProfile {
                capabilities: capabilities.into_iter().map(Into::into).collect(),
                weight: 1.0,
                max_concurrent_tasks: 1,
            }),
            handlers: HandlerRegistry::new(),
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Idle,
                active: BTreeSet::new(),
                tasks_completed: 0,
                tasks_failed: 0,
                last_heartbeat: Instant::now(),
                last_heartbeat_at: Utc::now(),
            }),
        }
    }

    /// Set the balancing weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.profile.get_mut().weight = weight;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.profile.get_mut().max_concurrent_tasks = max.max(1);
        self
    }

    /// Mark the worker local or remote.
    pub fn with_kind(mut self, kind: WorkerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Replace the handler set.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Route `task_type` to `handler`.
    pub fn with_handler(mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.register(task_type, handler);
        self
    }

    /// Route `task_type` to an async closure.
    pub fn with_handler_fn<F, Fut>(mut self, task_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskmeshResult<Value>> + Send + 'static,
    {
        self.handlers.register_fn(task_type, f);
        self
    }

    /// Pool id.
    pub fn id(&self) -> &str {
        &self.worker_id
    }

    /// Local or remote.
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Task types handled.
    pub fn capabilities(&self) -> Vec<String> {
        self.profile.read().capabilities.clone()
    }

    /// Concurrency ceiling.
    pub fn max_concurrent_tasks(&self) -> usize {
        self.profile.read().max_concurrent_tasks
    }

    /// Replace capabilities, weight and concurrency ceiling without touching
    /// the tasks already running. A lower ceiling takes effect as they finish.
    pub fn update_profile(
        &self,
        capabilities: Vec<String>,
        weight: f64,
        max_concurrent_tasks: usize,
    ) {
        {
            let mut profile = self.profile.write();
            profile.capabilities = capabilities;
            profile.weight = weight;
            profile.max_concurrent_tasks = max_concurrent_tasks.max(1);
        }
        let mut state = self.state.lock();
        if state.status != WorkerStatus::Offline {
            state.status = self.status_for_load(state.active.len());
        }
    }

    /// Current load status.
    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    /// Ids of the tasks holding a slot.
    pub fn active_tasks(&self) -> Vec<String> {
        self.state.lock().active.iter().cloned().collect()
    }

    /// Tasks that succeeded here.
    pub fn tasks_completed(&self) -> u64 {
        self.state.lock().tasks_completed
    }

    /// Tasks that failed here.
    pub fn tasks_failed(&self) -> u64 {
        self.state.lock().tasks_failed
    }

    /// Refresh liveness. An offline worker comes back according to its load.
    pub fn update_heartbeat(&self) {
        let mut state = self.state.lock();
        state.last_heartbeat = Instant::now();
        state.last_heartbeat_at = Utc::now();
        if state.status == WorkerStatus::Offline {
            state.status = self.status_for_load(state.active.len());
        }
    }

    /// Time since the latest heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        self.state.lock().last_heartbeat.elapsed()
    }

    /// Heartbeat younger than `timeout`.
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        self.heartbeat_age() < timeout
    }

    /// Mark offline. Returns false if it already was.
    pub fn mark_offline(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == WorkerStatus::Offline {
            return false;
        }
        state.status = WorkerStatus::Offline;
        true
    }

    fn status_for_load(&self, active: usize) -> WorkerStatus {
        if active >= self.max_concurrent_tasks() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        }
    }

    /// Claim a slot for `task_id` before execution starts.
    ///
    /// The dispatcher reserves synchronously so a second selection in the
    /// same tick sees the slot as taken.
    pub fn reserve(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.status != WorkerStatus::Idle
            || state.active.len() >= self.max_concurrent_tasks()
        {
            return false;
        }
        if !state.active.insert(task_id.to_string()) {
            return false;
        }
        state.status = self.status_for_load(state.active.len());
        true
    }

    /// Give back a reserved slot that was never used.
    pub fn release(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        if !state.active.remove(task_id) {
            return false;
        }
        if state.status != WorkerStatus::Offline {
            state.status = self.status_for_load(state.active.len());
        }
        true
    }

    /// Run a task whose slot was already reserved.
    ///
    /// The slot is released, the status recomputed and the heartbeat refreshed
    /// on every exit path, including the future being dropped.
    pub async fn run_claimed(
        &self,
        task: Task,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> TaskResult {
        let _guard = ExecutionGuard {
            worker: self,
            task_id: task.id.clone(),
        };
        let result = invoke(&self.handlers, task, &self.worker_id, progress, cancel).await;
        {
            let mut state = self.state.lock();
            if result.success {
                state.tasks_completed += 1;
            } else {
                state.tasks_failed += 1;
            }
        }
        result
    }

    /// Reserve a slot and run `task` to completion.
    pub async fn execute(
        &self,
        task: Task,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> TaskResult {
        if !self.reserve(&task.id) {
            warn!(worker_id = %self.worker_id, task_id = %task.id, "Worker cannot accept task");
            return TaskResult::failure(
                task.id.clone(),
                self.worker_id.clone(),
                format!("Worker {} cannot accept task", self.worker_id),
                Utc::now(),
            );
        }
        self.run_claimed(task, progress, cancel).await
    }

    /// Serialisable view with health judged against `heartbeat_timeout`.
    pub fn snapshot(&self, heartbeat_timeout: Duration) -> WorkerSnapshot {
        let state = self.state.lock();
        let profile = self.profile.read();
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            kind: self.kind,
            capabilities: profile.capabilities.clone(),
            status: state.status,
            weight: profile.weight,
            max_concurrent_tasks: profile.max_concurrent_tasks,
            active_tasks: state.active.iter().cloned().collect(),
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
            last_heartbeat: state.last_heartbeat_at,
            healthy: state.last_heartbeat.elapsed() < heartbeat_timeout,
        }
    }
}

impl DispatchTarget for Worker {
    fn target_id(&self) -> &str {
        &self.worker_id
    }

    fn has_capability(&self, task_type: &str) -> bool {
        capability_matches(&self.profile.read().capabilities, task_type)
    }

    fn can_accept_task(&self) -> bool {
        let state = self.state.lock();
        state.status == WorkerStatus::Idle && state.active.len() < self.max_concurrent_tasks()
    }

    fn active_task_count(&self) -> usize {
        self.state.lock().active.len()
    }

    fn weight(&self) -> f64 {
        self.profile.read().weight
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities())
            .field("status", &self.status())
            .finish()
    }
}

struct ExecutionGuard<'a> {
    worker: &'a Worker,
    task_id: String,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.worker.state.lock();
        state.active.remove(&self.task_id);
        state.last_heartbeat = Instant::now();
        state.last_heartbeat_at = Utc::now();
        state.status = self.worker.status_for_load(state.active.len());
    }
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers in the pool.
    pub total_workers: usize,
    /// Workers with spare slots.
    pub idle_workers: usize,
    /// Workers at their ceiling.
    pub busy_workers: usize,
    /// Workers marked offline.
    pub offline_workers: usize,
    /// Successes across the pool.
    pub total_tasks_completed: u64,
    /// Failures across the pool.
    pub total_tasks_failed: u64,
}

/// Registry of in-process workers, kept in insertion order.
pub struct WorkerPool {
    workers: RwLock<Vec<Arc<Worker>>>,
    heartbeat_timeout: Duration,
}

impl WorkerPool {
    /// An empty pool judging health against `heartbeat_timeout`.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            heartbeat_timeout,
        }
    }

    /// Heartbeat age past which a worker is unhealthy.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Add a worker, replacing any worker with the same id in place.
    pub fn add_worker(&self, worker: impl Into<Arc<Worker>>) -> Arc<Worker> {
        let worker = worker.into();
        let mut workers = self.workers.write();
        match workers.iter_mut().find(|w| w.id() == worker.id()) {
            Some(slot) => *slot = worker.clone(),
            None => workers.push(worker.clone()),
        }
        info!(worker_id = %worker.id(), kind = ?worker.kind(), "Worker added to pool");
        worker
    }

    /// Take a worker out of the pool.
    pub fn remove_worker(&self, worker_id: &str) -> Option<Arc<Worker>> {
        let mut workers = self.workers.write();
        let pos = workers.iter().position(|w| w.id() == worker_id)?;
        let removed = workers.remove(pos);
        info!(worker_id = %worker_id, "Worker removed from pool");
        Some(removed)
    }

    /// Look up a worker by id.
    pub fn get_worker(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.workers.read().iter().find(|w| w.id() == worker_id).cloned()
    }

    /// Every worker, in registration order.
    pub fn all_workers(&self) -> Vec<Arc<Worker>> {
        self.workers.read().clone()
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    /// True when the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Workers that can accept a task and whose heartbeat is fresh.
    pub fn get_available_workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .iter()
            .filter(|w| w.can_accept_task() && w.is_healthy(self.heartbeat_timeout))
            .cloned()
            .collect()
    }

    /// First available worker with the capability.
    pub fn get_worker_by_capability(&self, capability: &str) -> Option<Arc<Worker>> {
        self.get_available_workers()
            .into_iter()
            .find(|w| w.has_capability(capability))
    }

    /// Available workers having any of `capabilities`.
    pub fn get_workers_by_capabilities(&self, capabilities: &[String]) -> Vec<Arc<Worker>> {
        self.get_available_workers()
            .into_iter()
            .filter(|w| capabilities.iter().any(|c| w.has_capability(c)))
            .collect()
    }

    /// Refresh the heartbeat of every local worker.
    pub fn heartbeat_local(&self) {
        for worker in self.workers.read().iter() {
            if worker.kind() == WorkerKind::Local {
                worker.update_heartbeat();
            }
        }
    }

    /// Mark workers with an expired heartbeat offline. Returns the newly offline ids.
    pub fn run_health_check(&self) -> Vec<String> {
        let mut offlined = Vec::new();
        for worker in self.workers.read().iter() {
            if !worker.is_healthy(self.heartbeat_timeout) && worker.mark_offline() {
                warn!(worker_id = %worker.id(), "Worker heartbeat expired, marking offline");
                offlined.push(worker.id().to_string());
            }
        }
        offlined
    }

    /// One snapshot per worker.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .read()
            .iter()
            .map(|w| w.snapshot(self.heartbeat_timeout))
            .collect()
    }

    /// Counters across the pool.
    pub fn stats(&self) -> PoolStats {
        let workers = self.workers.read();
        let mut stats = PoolStats {
            total_workers: workers.len(),
            ..PoolStats::default()
        };
        for w in workers.iter() {
            match w.status() {
                WorkerStatus::Idle => stats.idle_workers += 1,
                WorkerStatus::Busy => stats.busy_workers += 1,
                WorkerStatus::Offline => stats.offline_workers += 1,
            }
            stats.total_tasks_completed += w.tasks_completed();
            stats.total_tasks_failed += w.tasks_failed();
        }
        stats
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
