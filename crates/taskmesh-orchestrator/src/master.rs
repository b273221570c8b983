use crate::balancer::{BalancerConfig, CircuitStatus, LoadBalancer, LoadBalancingStrategy};
use crate::handler::ProgressReporter;
use crate::progress::ProgressHub;
use crate::task_queue::{PriorityTaskQueue, QueueStats};
use crate::worker::{PoolStats, Worker, WorkerPool, WorkerSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskmesh_core::{
    DispatchTarget, SubscriptionId, Task, TaskProgress, TaskResult, TaskStatus, TaskmeshError,
    TaskmeshResult,
};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Master settings.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// How workers are ranked for each task.
    pub strategy: LoadBalancingStrategy,
    /// Ceiling on simultaneously running tasks. Must be at least 1.
    pub max_concurrent_tasks: usize,
    /// Idle sleep between loop iterations.
    pub dispatch_interval: Duration,
    /// Heartbeat age beyond which a pool worker is unavailable.
    pub worker_heartbeat_timeout: Duration,
    /// Open a worker's circuit after repeated failures.
    pub failover_enabled: bool,
    /// Failures that open a circuit.
    pub max_failures: usize,
    /// Window the failures are counted in.
    pub failure_window: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::LeastLoaded,
            max_concurrent_tasks: 10,
            dispatch_interval: Duration::from_millis(50),
            worker_heartbeat_timeout: Duration::from_secs(30),
            failover_enabled: true,
            max_failures: 3,
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Lifecycle notifications, consumed by the bus bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MasterEvent {
    TaskSubmitted { task_id: String, task_type: String },
    TaskCompleted { result: TaskResult },
    TaskFailed { result: TaskResult },
    TaskCancelled { task_id: String },
}

impl MasterEvent {
    /// Bus topic this event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            MasterEvent::TaskSubmitted { .. } => "task_submitted",
            MasterEvent::TaskCompleted { .. } => "task_completed",
            MasterEvent::TaskFailed { .. } => "task_failed",
            MasterEvent::TaskCancelled { .. } => "task_cancelled",
        }
    }
}

/// Aggregate returned by [`MasterAgent::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Tasks with a recorded result.
    pub total_tasks: usize,
    /// Results that succeeded.
    pub successful: usize,
    /// Results that failed.
    pub failed: usize,
    /// Tasks still queued.
    pub pending: usize,
    /// Tasks still running.
    pub active: usize,
    /// Queued tasks that can never become ready.
    pub blocked: usize,
    /// Mean duration of the recorded results, in seconds.
    pub average_duration: f64,
    /// Every recorded result by task id.
    pub results: HashMap<String, TaskResult>,
}

/// Point-in-time view of the master.
#[derive(Debug, Clone, Serialize)]
pub struct MasterStatus {
    /// One snapshot per pool worker.
    pub workers: Vec<WorkerSnapshot>,
    /// Tasks still queued.
    pub pending_tasks: usize,
    /// Tasks running now.
    pub active_tasks: usize,
    /// Tasks with a recorded result.
    pub completed_tasks: usize,
    /// Queued tasks that can never become ready.
    pub blocked_tasks: usize,
    /// Whether a dispatch loop is active.
    pub running: bool,
    /// Balancing strategy name.
    pub load_balancer_strategy: String,
    /// Master-wide concurrency ceiling.
    pub max_concurrent_tasks: usize,
    /// Circuit state per worker.
    pub circuit_breakers: HashMap<String, CircuitStatus>,
}

struct InFlight {
    task: Task,
    worker_id: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<TaskResult>,
}

/// Composes queue, pool and balancer into a dispatch loop.
///
/// Each dispatched task runs as its own tokio task; the loop never awaits a
/// single execution and instead reconciles finished handles on the next
/// iteration, before computing which tasks are ready.
pub struct MasterAgent {
    config: MasterConfig,
    queue: RwLock<PriorityTaskQueue>,
    pool: Arc<WorkerPool>,
    balancer: Arc<LoadBalancer>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    results: Mutex<HashMap<String, TaskResult>>,
    completed: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, TaskStatus>>,
    cancel_requested: Mutex<HashSet<String>>,
    progress: Arc<ProgressHub>,
    active_loops: AtomicUsize,
    events: broadcast::Sender<MasterEvent>,
}

impl MasterAgent {
    /// Build a master. Fails if `max_concurrent_tasks` is zero.
    pub fn new(config: MasterConfig) -> TaskmeshResult<Self> {
        if config.max_concurrent_tasks == 0 {
            return Err(TaskmeshError::InvalidInput(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        let balancer = LoadBalancer::new(BalancerConfig {
            strategy: config.strategy,
            failover_enabled: config.failover_enabled,
            max_failures: config.max_failures,
            failure_window: config.failure_window,
        });
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            pool: Arc::new(WorkerPool::new(config.worker_heartbeat_timeout)),
            balancer: Arc::new(balancer),
            queue: RwLock::new(PriorityTaskQueue::new()),
            in_flight: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashSet::new()),
            statuses: Mutex::new(HashMap::new()),
            cancel_requested: Mutex::new(HashSet::new()),
            progress: Arc::new(ProgressHub::new()),
            active_loops: AtomicUsize::new(0),
            events,
            config,
        })
    }

    /// Settings in use.
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// The worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The load balancer.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Progress fan-out for every task.
    pub fn progress_hub(&self) -> &Arc<ProgressHub> {
        &self.progress
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MasterEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MasterEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // --- Workers ---

    /// Add a worker to the pool, replacing one with the same id.
    pub fn register_worker(&self, worker: Worker) -> Arc<Worker> {
        self.pool.add_worker(worker)
    }

    /// Remove a worker and its circuit state.
    pub fn unregister_worker(&self, worker_id: &str) -> bool {
        self.balancer.forget(worker_id);
        self.pool.remove_worker(worker_id).is_some()
    }

    /// Pool-wide counters.
    pub fn get_worker_pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // --- Progress ---

    /// Register a progress callback. A panicking callback is isolated from the
    /// others and from the task.
    pub fn subscribe_progress<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TaskProgress) + Send + Sync + 'static,
    {
        self.progress.subscribe(callback)
    }

    /// Drop a progress subscription.
    pub fn unsubscribe_progress(&self, id: SubscriptionId) -> bool {
        self.progress.unsubscribe(id)
    }

    // --- Submission ---

    fn is_known(&self, task_id: &str) -> bool {
        self.in_flight.lock().contains_key(task_id)
            || self.results.lock().contains_key(task_id)
            || self.statuses.lock().contains_key(task_id)
    }

    /// Queue a task and return its id. Never waits for execution.
    pub async fn submit_task(&self, mut task: Task) -> TaskmeshResult<String> {
        let id = task.ensure_id().to_string();
        task.status = TaskStatus::Pending;
        let task_type = task.task_type.clone();
        {
            let mut queue = self.queue.write().await;
            if self.is_known(&id) || queue.contains(&id) {
                return Err(TaskmeshError::InvalidInput(format!(
                    "task id {id} already exists"
                )));
            }
            queue.enqueue(task)?;
        }
        self.statuses.lock().insert(id.clone(), TaskStatus::Pending);
        info!(task_id = %id, task_type = %task_type, "Task submitted");
        self.emit(MasterEvent::TaskSubmitted {
            task_id: id.clone(),
            task_type,
        });
        Ok(id)
    }

    /// Queue several tasks. Either all are accepted or none are.
    pub async fn submit_tasks(&self, tasks: Vec<Task>) -> TaskmeshResult<Vec<String>> {
        let mut tasks = tasks;
        let mut seen = HashSet::new();
        let mut queue = self.queue.write().await;
        for task in &mut tasks {
            let id = task.ensure_id().to_string();
            if !seen.insert(id.clone()) || self.is_known(&id) || queue.contains(&id) {
                return Err(TaskmeshError::InvalidInput(format!(
                    "task id {id} already exists"
                )));
            }
        }
        let mut ids = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.status = TaskStatus::Pending;
            let id = task.id.clone();
            let task_type = task.task_type.clone();
            queue.enqueue(task)?;
            self.statuses.lock().insert(id.clone(), TaskStatus::Pending);
            self.emit(MasterEvent::TaskSubmitted {
                task_id: id.clone(),
                task_type,
            });
            ids.push(id);
        }
        info!(count = ids.len(), "Task batch submitted");
        Ok(ids)
    }

    /// Cancel a pending task (guaranteed) or signal a running one (best effort).
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        if self.queue.write().await.remove(task_id) {
            self.statuses
                .lock()
                .insert(task_id.to_string(), TaskStatus::Cancelled);
            info!(task_id = %task_id, "Pending task cancelled");
            self.emit(MasterEvent::TaskCancelled {
                task_id: task_id.to_string(),
            });
            return true;
        }

        let in_flight = self.in_flight.lock();
        match in_flight.get(task_id) {
            Some(f) => {
                self.cancel_requested.lock().insert(task_id.to_string());
                f.cancel.cancel();
                info!(task_id = %task_id, worker_id = %f.worker_id, "Cancellation signalled to running task");
                true
            }
            None => false,
        }
    }

    // --- Dispatch loop ---

    /// Dispatch until the queue is empty or `timeout` elapses, then wait for
    /// everything still running and return the aggregate.
    pub async fn run(&self, timeout: Duration) -> RunSummary {
        let _loop = LoopGuard::enter(&self.active_loops);
        let deadline = Instant::now() + timeout;
        info!(timeout_ms = timeout.as_millis() as u64, "Dispatch run started");

        while Instant::now() < deadline && !self.queue.read().await.is_empty() {
            let dispatched = self.tick().await;
            let pause = if dispatched == 0 {
                self.config.dispatch_interval
            } else {
                Duration::from_millis(10)
            };
            tokio::time::sleep(pause.min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }

        self.drain().await;
        let summary = self.aggregate().await;
        info!(
            total = summary.total_tasks,
            successful = summary.successful,
            failed = summary.failed,
            pending = summary.pending,
            "Dispatch run finished"
        );
        summary
    }

    /// Dispatch continuously until `shutdown` fires, then signal and drain
    /// everything still running.
    pub async fn serve(&self, shutdown: CancellationToken) {
        let _loop = LoopGuard::enter(&self.active_loops);
        info!("Continuous dispatch started");
        loop {
            let dispatched = self.tick().await;
            let pause = if dispatched == 0 {
                self.config.dispatch_interval
            } else {
                Duration::from_millis(10)
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        for f in self.in_flight.lock().values() {
            f.cancel.cancel();
        }
        self.drain().await;
        info!("Continuous dispatch stopped");
    }

    /// One loop iteration: reconcile, refresh pool health, dispatch.
    /// Returns how many tasks were dispatched.
    pub async fn tick(&self) -> usize {
        self.reconcile().await;
        self.pool.heartbeat_local();
        self.pool.run_health_check();
        self.dispatch_ready().await
    }

    async fn reconcile(&self) {
        let finished: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock();
            let ids: Vec<String> = in_flight
                .iter()
                .filter(|(_, f)| f.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| in_flight.remove(id)).collect()
        };
        for f in finished {
            self.settle(f).await;
        }
    }

    // Entries stay in the in-flight map until finished so they remain cancellable.
    async fn drain(&self) {
        let outstanding = self.in_flight.lock().len();
        if outstanding > 0 {
            debug!(count = outstanding, "Draining in-flight tasks");
        }
        loop {
            self.reconcile().await;
            if self.in_flight.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn settle(&self, f: InFlight) {
        let InFlight {
            task,
            worker_id,
            started_at,
            handle,
            ..
        } = f;
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                let reason = if e.is_panic() {
                    "Task handler panicked"
                } else {
                    "Task execution aborted"
                };
                TaskResult::failure(&task.id, &worker_id, reason, started_at)
                    .with_retries(task.retry_count)
            }
        };
        self.record_result(result);
    }

    fn record_result(&self, result: TaskResult) {
        let task_id = result.task_id.clone();
        let cancel_requested = self.cancel_requested.lock().remove(&task_id);

        let status = if result.success {
            self.balancer.record_success(&result.worker_id);
            self.completed.lock().insert(task_id.clone());
            info!(task_id = %task_id, worker_id = %result.worker_id, duration = result.duration, "Task completed");
            TaskStatus::Completed
        } else if cancel_requested {
            info!(task_id = %task_id, worker_id = %result.worker_id, "Running task cancelled");
            TaskStatus::Cancelled
        } else {
            if self.balancer.record_failure(&result.worker_id) {
                warn!(worker_id = %result.worker_id, "Worker excluded after repeated failures");
            }
            error!(
                task_id = %task_id,
                worker_id = %result.worker_id,
                error = result.error.as_deref().unwrap_or(""),
                "Task failed"
            );
            TaskStatus::Failed
        };

        self.statuses.lock().insert(task_id.clone(), status);
        self.results.lock().insert(task_id.clone(), result.clone());
        match status {
            TaskStatus::Completed => self.emit(MasterEvent::TaskCompleted { result }),
            TaskStatus::Cancelled => self.emit(MasterEvent::TaskCancelled { task_id }),
            _ => self.emit(MasterEvent::TaskFailed { result }),
        }
    }

    async fn dispatch_ready(&self) -> usize {
        let completed = self.completed.lock().clone();
        let ready = self.queue.read().await.get_ready_tasks(&completed);
        if ready.is_empty() {
            return 0;
        }
        let mut available = self.pool.get_available_workers();
        if available.is_empty() {
            debug!(ready = ready.len(), "Ready tasks but no available workers");
            return 0;
        }

        let mut dispatched = 0;
        for candidate in ready {
            if available.is_empty()
                || self.in_flight.lock().len() >= self.config.max_concurrent_tasks
            {
                break;
            }
            let Some(worker) = self
                .balancer
                .select_worker(&available, &candidate.task_type)
                .cloned()
            else {
                continue;
            };
            if !worker.reserve(&candidate.id) {
                available.retain(|w| w.id() != worker.id());
                continue;
            }
            // Cancelled between the ready snapshot and now.
            let Some(mut task) = self.queue.write().await.take(&candidate.id) else {
                worker.release(&candidate.id);
                continue;
            };
            if !worker.can_accept_task() {
                available.retain(|w| w.id() != worker.id());
            }

            task.status = TaskStatus::Running;
            self.statuses
                .lock()
                .insert(task.id.clone(), TaskStatus::Running);
            self.launch(task, worker);
            dispatched += 1;
        }
        dispatched
    }

    fn launch(&self, task: Task, worker: Arc<Worker>) {
        let task_id = task.id.clone();
        let worker_id = worker.id().to_string();
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::new(&task_id, &worker_id, self.progress.sink());

        info!(task_id = %task_id, worker_id = %worker_id, priority = task.priority, "Task dispatched");
        let handle = {
            let task = task.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run_claimed(task, progress, cancel).await })
        };
        self.in_flight.lock().insert(
            task_id,
            InFlight {
                task,
                worker_id,
                started_at: Utc::now(),
                cancel,
                handle,
            },
        );
    }

    // --- Queries ---

    fn blocked_ids(&self, pending: &[Task]) -> Vec<String> {
        let statuses = self.statuses.lock();
        pending
            .iter()
            .filter(|t| {
                t.dependencies.iter().any(|d| {
                    matches!(
                        statuses.get(d),
                        Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled)
                    )
                })
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// Pending tasks that can never become ready because a dependency failed
    /// or was cancelled. They stay `Pending`.
    pub async fn blocked_tasks(&self) -> Vec<String> {
        let pending = self.queue.read().await.pending_tasks();
        self.blocked_ids(&pending)
    }

    /// Current status of a task, if the master has seen it.
    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        if self.queue.read().await.contains(task_id) {
            return Some(TaskStatus::Pending);
        }
        self.statuses.lock().get(task_id).copied()
    }

    /// Result of a finished task.
    pub fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.results.lock().get(task_id).cloned()
    }

    /// Every recorded result.
    pub fn get_all_results(&self) -> HashMap<String, TaskResult> {
        self.results.lock().clone()
    }

    /// Forget finished results and their dependency credit.
    pub fn clear_results(&self) -> usize {
        let mut results = self.results.lock();
        let cleared = results.len();
        {
            let mut statuses = self.statuses.lock();
            for id in results.keys() {
                statuses.remove(id);
            }
        }
        results.clear();
        self.completed.lock().clear();
        self.progress.clear();
        info!(cleared, "Results cleared");
        cleared
    }

    /// Whether a dispatch loop is active.
    pub fn is_running(&self) -> bool {
        self.active_loops.load(Ordering::SeqCst) > 0
    }

    /// Tasks running now.
    pub fn active_task_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Queue counters.
    pub async fn queue_stats(&self) -> QueueStats {
        let mut stats = self.queue.read().await.stats();
        let running = self.in_flight.lock().len();
        if running > 0 {
            stats.tasks_by_status.insert("running".into(), running);
        }
        stats
    }

    /// Queued and running tasks, optionally filtered.
    pub async fn pending_tasks(
        &self,
        status: Option<TaskStatus>,
        task_type: Option<&str>,
    ) -> Vec<Task> {
        let mut tasks = self.queue.read().await.all_tasks();
        tasks.extend(self.in_flight.lock().values().map(|f| {
            let mut t = f.task.clone();
            t.status = TaskStatus::Running;
            t
        }));
        tasks
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| task_type.map_or(true, |ty| t.task_type == ty))
            .collect()
    }

    /// Full status report.
    pub async fn get_status(&self) -> MasterStatus {
        let pending = self.queue.read().await.pending_tasks();
        let blocked = self.blocked_ids(&pending).len();
        MasterStatus {
            workers: self.pool.snapshots(),
            pending_tasks: pending.len(),
            active_tasks: self.in_flight.lock().len(),
            completed_tasks: self.results.lock().len(),
            blocked_tasks: blocked,
            running: self.is_running(),
            load_balancer_strategy: self.balancer.strategy().to_string(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            circuit_breakers: self.balancer.circuit_breaker_status(),
        }
    }

    async fn aggregate(&self) -> RunSummary {
        let pending = self.queue.read().await.pending_tasks();
        let blocked = self.blocked_ids(&pending).len();
        let results = self.results.lock().clone();
        let successful = results.values().filter(|r| r.success).count();
        let total_duration: f64 = results.values().map(|r| r.duration).sum();
        RunSummary {
            total_tasks: results.len(),
            successful,
            failed: results.len() - successful,
            pending: pending.len(),
            active: self.in_flight.lock().len(),
            blocked,
            average_duration: if results.is_empty() {
                0.0
            } else {
                total_duration / results.len() as f64
            },
            results,
        }
    }
}

struct LoopGuard<'a>(&'a AtomicUsize);

impl<'a> LoopGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::TaskContext;
    use serde_json::{json, Value};
    use taskmesh_core::TaskPriority;

    fn master() -> MasterAgent {
        MasterAgent::new(MasterConfig {
            dispatch_interval: Duration::from_millis(5),
            ..MasterConfig::default()
        })
        .unwrap()
    }

    fn echo_worker(id: &str) -> Worker {
        Worker::new(id, ["*"]).with_handler_fn("*", |ctx: TaskContext| async move {
            Ok::<_, TaskmeshError>(json!({"echo": ctx.task.payload}))
        })
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let res = MasterAgent::new(MasterConfig {
            max_concurrent_tasks: 0,
            ..MasterConfig::default()
        });
        assert!(matches!(res, Err(TaskmeshError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_submit_generates_ids_and_rejects_duplicates() {
        let m = master();
        let id = m.submit_task(Task::new("shell", json!({})).with_id("")).await.unwrap();
        assert!(!id.is_empty());
        assert!(m
            .submit_task(Task::new("shell", json!({})).with_id(id.clone()))
            .await
            .is_err());

        let batch = vec![
            Task::new("shell", json!({})).with_id("b1"),
            Task::new("shell", json!({})).with_id("b1"),
        ];
        assert!(m.submit_tasks(batch).await.is_err());
        assert_eq!(m.queue_stats().await.pending_tasks, 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_is_idempotent() {
        let m = master();
        let id = m.submit_task(Task::new("shell", json!({}))).await.unwrap();
        assert!(m.cancel_task(&id).await);
        assert!(!m.cancel_task(&id).await);
        assert_eq!(m.task_status(&id).await, Some(TaskStatus::Cancelled));
        assert!(!m.cancel_task("never-submitted").await);
    }

    #[tokio::test]
    async fn test_run_with_dependencies() {
        let m = master();
        m.register_worker(echo_worker("w1"));
        m.register_worker(echo_worker("w2"));

        m.submit_task(Task::new("a", json!(1)).with_id("a")).await.unwrap();
        m.submit_task(Task::new("b", json!(2)).with_id("b").with_dependencies(["a"]))
            .await
            .unwrap();
        m.submit_task(
            Task::new("c", json!(3))
                .with_id("c")
                .with_dependencies(["a", "b"]),
        )
        .await
        .unwrap();

        let summary = m.run(Duration::from_secs(5)).await;
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pending, 0);

        let a = m.get_task_result("a").unwrap();
        let b = m.get_task_result("b").unwrap();
        let c = m.get_task_result("c").unwrap();
        assert!(a.completed_at <= b.started_at);
        assert!(b.completed_at <= c.started_at);
        assert!(!m.is_running());
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependents() {
        let m = MasterAgent::new(MasterConfig {
            dispatch_interval: Duration::from_millis(5),
            failover_enabled: false,
            ..MasterConfig::default()
        })
        .unwrap();
        m.register_worker(Worker::new("w1", ["*"]).with_handler_fn(
            "*",
            |ctx: TaskContext| async move {
                if ctx.task.task_type == "bad" {
                    Err::<Value, _>(TaskmeshError::Handler("bad task".into()))
                } else {
                    Ok(json!(null))
                }
            },
        ));
        m.submit_task(Task::new("bad", json!({})).with_id("x")).await.unwrap();
        m.submit_task(Task::new("ok", json!({})).with_id("y").with_dependencies(["x"]))
            .await
            .unwrap();

        let summary = m.run(Duration::from_millis(300)).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.blocked, 1);
        assert_eq!(m.blocked_tasks().await, vec!["y"]);
        assert_eq!(m.task_status("y").await, Some(TaskStatus::Pending));
        assert_eq!(m.task_status("x").await, Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_timeout_produces_failed_result() {
        let m = master();
        m.register_worker(Worker::new("w1", ["*"]).with_handler_fn(
            "*",
            |_ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, TaskmeshError>(json!(null))
            },
        ));
        m.submit_task(Task::new("slow", json!({})).with_id("s").with_timeout(0.05))
            .await
            .unwrap();
        let summary = m.run(Duration::from_secs(2)).await;
        assert_eq!(summary.failed, 1);
        assert!(summary.results["s"].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let m = Arc::new(master());
        m.register_worker(Worker::new("w1", ["*"]).with_handler_fn(
            "*",
            |ctx: TaskContext| async move {
                ctx.cancel.cancelled().await;
                Err::<Value, _>(TaskmeshError::Handler("stopped".into()))
            },
        ));
        m.submit_task(Task::new("wait", json!({})).with_id("r")).await.unwrap();

        let runner = m.clone();
        let run = tokio::spawn(async move { runner.run(Duration::from_secs(5)).await });
        for _ in 0..100 {
            if m.active_task_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(m.cancel_task("r").await);
        let summary = run.await.unwrap();
        assert_eq!(summary.total_tasks, 1);
        assert_eq!(m.task_status("r").await, Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_progress_fan_out_survives_bad_subscriber() {
        let m = master();
        m.register_worker(Worker::new("w1", ["*"]).with_handler_fn(
            "*",
            |ctx: TaskContext| async move {
                ctx.progress.report(0.5, "half");
                Ok::<_, TaskmeshError>(json!(null))
            },
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        m.subscribe_progress(|_| panic!("broken subscriber"));
        let id = m.subscribe_progress(move |p| s.lock().push(p.task_id.clone()));

        m.submit_task(Task::new("p", json!({})).with_id("p1")).await.unwrap();
        let summary = m.run(Duration::from_secs(2)).await;
        assert_eq!(summary.successful, 1);
        assert_eq!(*seen.lock(), vec!["p1"]);
        assert!(m.unsubscribe_progress(id));
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let m = MasterAgent::new(MasterConfig {
            max_concurrent_tasks: 1,
            dispatch_interval: Duration::from_millis(5),
            ..MasterConfig::default()
        })
        .unwrap();
        m.register_worker(echo_worker("w1"));
        m.register_worker(echo_worker("w2"));
        for i in 0..3 {
            m.submit_task(Task::new("t", json!(i)).with_id(format!("t{i}")))
                .await
                .unwrap();
        }
        assert_eq!(m.tick().await, 1);
        assert_eq!(m.active_task_count(), 1);
        let summary = m.run(Duration::from_secs(2)).await;
        assert_eq!(summary.successful, 3);
    }

    #[tokio::test]
    async fn test_worker_filled_mid_round_is_skipped() {
        let m = master();
        m.register_worker(
            Worker::new("w1", ["*"]).with_handler_fn("*", |_ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, TaskmeshError>(Value::Null)
            }),
        );
        for i in 0..2 {
            m.submit_task(Task::new("t", json!(i)).with_id(format!("t{i}")))
                .await
                .unwrap();
        }
        assert_eq!(m.tick().await, 1);
        assert!(!m.pool().get_worker("w1").unwrap().can_accept_task());
        let summary = m.run(Duration::from_secs(2)).await;
        assert_eq!(summary.successful, 2);
    }

    #[tokio::test]
    async fn test_status_and_clear() {
        let m = master();
        m.register_worker(echo_worker("w1"));
        m.submit_task(Task::new("t", json!({})).with_priority(TaskPriority::High))
            .await
            .unwrap();
        m.run(Duration::from_secs(2)).await;

        let status = m.get_status().await;
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.completed_tasks, 1);
        assert_eq!(status.load_balancer_strategy, "least_loaded");
        assert_eq!(m.get_worker_pool_stats().total_tasks_completed, 1);

        assert_eq!(m.clear_results(), 1);
        assert!(m.get_all_results().is_empty());
        assert!(m.unregister_worker("w1"));
        assert!(!m.unregister_worker("w1"));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let m = master();
        let mut rx = m.subscribe_events();
        m.register_worker(echo_worker("w1"));
        m.submit_task(Task::new("t", json!({})).with_id("e1")).await.unwrap();
        m.run(Duration::from_secs(2)).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic(), "task_submitted");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic(), "task_completed");
    }
}
