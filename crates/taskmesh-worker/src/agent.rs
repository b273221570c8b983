use crate::client::{connect_client, MasterClient};
use crate::config::WorkerAgentConfig;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::protocol::{PollRequest, RegisterWorkerRequest};
use taskmesh_core::{Task, TaskProgress, TaskResult, TaskmeshError, TaskmeshResult};
use taskmesh_orchestrator::{
    invoke, HandlerRegistry, ProgressReporter, ProgressSink, TaskContext, TaskHandler,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the loop cadence.
const MAX_TICK: Duration = Duration::from_millis(100);
/// How long `stop` waits for cancelled tasks to report.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Built, not started.
    Initializing,
    /// Registering with the master.
    Connecting,
    /// Registered and idle.
    Registered,
    /// Running at least one task.
    Working,
    /// Lost the master, reconnecting.
    Disconnected,
    /// Terminal.
    Shutdown,
}

/// Point-in-time view of an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    /// Id the agent registers under.
    pub worker_id: String,
    /// Lifecycle state.
    pub state: AgentState,
    /// Advertised task types.
    pub capabilities: Vec<String>,
    /// Ids of the tasks running now.
    pub active_tasks: Vec<String>,
    /// Concurrency ceiling.
    pub max_concurrent_tasks: usize,
    /// Tasks that finished successfully.
    pub tasks_executed: u64,
    /// Tasks that failed, were cancelled or panicked.
    pub tasks_failed: u64,
    /// Reconnect attempts in the current outage.
    pub reconnect_attempts: u32,
}

/// A worker living in its own process.
///
/// `start` registers with the master (failure is fatal) and then loops:
/// heartbeat when due, poll when due, run claimed tasks concurrently up to
/// the configured ceiling, and cancel tasks the master asks to cancel.
/// Connectivity failures trigger bounded re-registration; once the attempts
/// are exhausted the agent shuts down for good.
pub struct WorkerAgent {
    config: WorkerAgentConfig,
    client: Arc<dyn MasterClient>,
    handlers: HandlerRegistry,
    state: Mutex<AgentState>,
    running: Mutex<HashMap<String, CancellationToken>>,
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
    reconnect_attempts: AtomicU32,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    progress_tx: mpsc::UnboundedSender<TaskProgress>,
    progress_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskProgress>>>,
}

impl WorkerAgent {
    /// An agent talking to the master through `client`. Fails on invalid config.
    pub fn new(config: WorkerAgentConfig, client: Arc<dyn MasterClient>) -> TaskmeshResult<Self> {
        config.validate()?;
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            client,
            handlers: HandlerRegistry::new(),
            state: Mutex::new(AgentState::Initializing),
            running: Mutex::new(HashMap::new()),
            tasks_executed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            progress_tx,
            progress_rx: Mutex::new(Some(progress_rx)),
        })
    }

    /// Build the agent with the client its configured transport asks for.
    pub async fn connect(config: WorkerAgentConfig) -> TaskmeshResult<Self> {
        let client = connect_client(&config).await?;
        Self::new(config, client)
    }

    /// Replace the handler set.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Route `task_type` to `handler`.
    pub fn register_handler(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        info!(task_type = %task_type, "Task handler registered");
        self.handlers.register(task_type, handler);
    }

    /// Route `task_type` to an async closure.
    pub fn register_handler_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskmeshResult<Value>> + Send + 'static,
    {
        self.handlers.register_fn(task_type, f);
    }

    /// Settings in use.
    pub fn config(&self) -> &WorkerAgentConfig {
        &self.config
    }

    /// Registered handlers.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    /// Tasks that finished successfully.
    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::SeqCst)
    }

    /// Tasks that did not.
    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::SeqCst)
    }

    /// Ids of the tasks running now.
    pub fn active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Point-in-time view for logs and the CLI.
    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            worker_id: self.config.worker_id.clone(),
            state: self.state(),
            capabilities: self.config.capabilities.clone(),
            active_tasks: self.active_tasks(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            tasks_executed: self.tasks_executed(),
            tasks_failed: self.tasks_failed(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    // --- Lifecycle ---

    /// Register and run until stopped or until reconnecting gives up.
    pub async fn start(self: &Arc<Self>) -> TaskmeshResult<()> {
        let Some(progress_rx) = self.progress_rx.lock().take() else {
            return Err(TaskmeshError::Worker("agent already started".into()));
        };
        self.set_state(AgentState::Connecting);
        info!(
            worker_id = %self.config.worker_id,
            capabilities = ?self.config.capabilities,
            transport = ?self.config.transport,
            "Worker agent starting"
        );

        if let Err(e) = self.register().await {
            error!(worker_id = %self.config.worker_id, error = %e, "Registration failed");
            self.set_state(AgentState::Disconnected);
            self.stopped.cancel();
            return Err(e);
        }

        let forwarder = tokio::spawn(forward_progress(
            self.client.clone(),
            progress_rx,
            self.shutdown.clone(),
        ));
        let outcome = self.main_loop().await;
        forwarder.abort();
        outcome
    }

    /// Cancel running tasks, unregister best-effort and enter SHUTDOWN.
    pub async fn stop(&self) {
        if self.stopped.is_cancelled() {
            return;
        }
        info!(worker_id = %self.config.worker_id, "Stopping worker agent");
        self.set_state(AgentState::Shutdown);
        // Task tokens are children of this one.
        self.shutdown.cancel();

        let deadline = Instant::now() + STOP_GRACE;
        while !self.running.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        match self.client.unregister(&self.config.worker_id).await {
            Ok(ack) => debug!(success = ack.success, "Unregistered from master"),
            Err(e) => debug!(error = %e, "Unregister failed"),
        }
        self.stopped.cancel();
        info!(
            worker_id = %self.config.worker_id,
            executed = self.tasks_executed(),
            failed = self.tasks_failed(),
            "Worker agent stopped"
        );
    }

    /// Resolves once the agent reached SHUTDOWN or failed to start.
    pub async fn wait_for_shutdown(&self) {
        self.stopped.cancelled().await;
    }

    /// Ask a running task to stop. False if it is not running here.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        match self.running.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                info!(task_id = %task_id, "Task cancellation requested");
                true
            }
            None => false,
        }
    }

    // --- Internals ---

    fn set_state(&self, next: AgentState) {
        let mut state = self.state.lock();
        if *state == AgentState::Shutdown || *state == next {
            return;
        }
        debug!(from = ?*state, to = ?next, "Agent state change");
        *state = next;
    }

    /// REGISTERED when idle, WORKING when busy; leaves other states alone.
    fn settle_state(&self) {
        let busy = !self.running.lock().is_empty();
        let mut state = self.state.lock();
        if matches!(*state, AgentState::Registered | AgentState::Working) {
            *state = if busy {
                AgentState::Working
            } else {
                AgentState::Registered
            };
        }
    }

    async fn register(&self) -> TaskmeshResult<()> {
        let request = RegisterWorkerRequest {
            worker_id: self.config.worker_id.clone(),
            capabilities: self.config.capabilities.clone(),
            address: self.config.address.clone(),
            metadata: self.config.metadata.clone(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            weight: self.config.weight,
        };
        let resp = self.client.register(&request).await?;
        if !resp.success {
            return Err(TaskmeshError::Registry(resp.message));
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        let busy = !self.running.lock().is_empty();
        self.set_state(if busy {
            AgentState::Working
        } else {
            AgentState::Registered
        });
        info!(worker_id = %self.config.worker_id, "Registered with master");
        Ok(())
    }

    async fn main_loop(self: &Arc<Self>) -> TaskmeshResult<()> {
        let tick = self
            .config
            .poll_interval
            .min(self.config.heartbeat_interval)
            .min(MAX_TICK);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heartbeat = Instant::now();
        let mut last_poll: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let Err(e) = self.step(&mut last_heartbeat, &mut last_poll).await else {
                continue;
            };
            if !e.is_connectivity() {
                warn!(error = %e, "Loop iteration failed");
                continue;
            }
            if self.reconnect(&e).await {
                last_heartbeat = Instant::now();
                continue;
            }
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let attempts = self.config.max_reconnect_attempts;
            error!(worker_id = %self.config.worker_id, attempts, "Giving up on the master");
            self.set_state(AgentState::Shutdown);
            self.shutdown.cancel();
            self.stopped.cancel();
            return Err(TaskmeshError::Worker(format!(
                "Gave up after {attempts} reconnect attempts: {e}"
            )));
        }
    }

    async fn step(
        self: &Arc<Self>,
        last_heartbeat: &mut Instant,
        last_poll: &mut Option<Instant>,
    ) -> TaskmeshResult<()> {
        let now = Instant::now();
        if now.duration_since(*last_heartbeat) >= self.config.heartbeat_interval {
            let beat = self.client.heartbeat(&self.config.worker_id).await?;
            *last_heartbeat = now;
            debug!(
                health = ?beat.health_status,
                active = self.running.lock().len(),
                "Heartbeat acknowledged"
            );
            self.settle_state();
        }

        if last_poll.map_or(true, |t| now.duration_since(t) >= self.config.poll_interval) {
            *last_poll = Some(now);
            self.poll_once().await?;
        }
        Ok(())
    }

    /// Claim work for the free slots and apply pending cancellations. Polls
    /// even with no free slot so cancellations still arrive.
    async fn poll_once(self: &Arc<Self>) -> TaskmeshResult<()> {
        let free = self
            .config
            .max_concurrent_tasks
            .saturating_sub(self.running.lock().len());
        let resp = self
            .client
            .poll(&PollRequest {
                worker_id: self.config.worker_id.clone(),
                max_tasks: free,
            })
            .await?;
        for task_id in &resp.cancelled {
            self.cancel_task(task_id);
        }
        for task in resp.tasks {
            self.spawn_task(task);
        }
        Ok(())
    }

    async fn reconnect(&self, cause: &TaskmeshError) -> bool {
        self.set_state(AgentState::Disconnected);
        warn!(worker_id = %self.config.worker_id, error = %cause, "Lost the master");
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnect_attempts {
                return false;
            }
            info!(attempt, max_attempts = self.config.max_reconnect_attempts, "Reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            if let Err(e) = self.client.reconnect().await {
                warn!(attempt, error = %e, "Reconnect failed");
                continue;
            }
            match self.register().await {
                Ok(()) => return true,
                Err(e) => warn!(attempt, error = %e, "Re-registration failed"),
            }
        }
    }

    fn spawn_task(self: &Arc<Self>, task: Task) {
        let token = self.shutdown.child_token();
        {
            let mut running = self.running.lock();
            if running.contains_key(&task.id) {
                warn!(task_id = %task.id, "Task already running here, ignoring duplicate");
                return;
            }
            running.insert(task.id.clone(), token.clone());
        }
        self.set_state(AgentState::Working);
        let agent = self.clone();
        tokio::spawn(agent.execute(task, token));
    }

    /// Run one task and report its terminal result. The slot is released
    /// only after the report so `stop` can wait for it.
    ///
    /// The handler runs on its own tokio task so a panic surfaces as a
    /// `JoinError` and becomes a failed result.
    async fn execute(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let task_id = task.id.clone();
        let worker_id = self.config.worker_id.as_str();
        let started_at = Utc::now();
        let _slot = SlotGuard {
            agent: &*self,
            task_id: task_id.clone(),
        };
        info!(task_id = %task_id, task_type = %task.task_type, "Task started");

        let progress = ProgressReporter::new(&task_id, worker_id, self.progress_sink());
        let mut handle = {
            let handlers = self.handlers.clone();
            let worker_id = worker_id.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                invoke(&handlers, task, &worker_id, progress, cancel).await
            })
        };
        let result = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) => {
                    let reason = if e.is_panic() {
                        "Task handler panicked"
                    } else {
                        "Task execution aborted"
                    };
                    error!(task_id = %task_id, "{}", reason);
                    TaskResult::failure(&task_id, worker_id, reason, started_at)
                }
            },
            _ = cancel.cancelled() => {
                handle.abort();
                TaskResult::failure(&task_id, worker_id, "Task cancelled", started_at)
            }
        };

        if result.success {
            self.tasks_executed.fetch_add(1, Ordering::SeqCst);
            info!(task_id = %task_id, duration = result.duration, "Task completed");
        } else {
            self.tasks_failed.fetch_add(1, Ordering::SeqCst);
            warn!(task_id = %task_id, error = ?result.error, "Task failed");
        }

        match self.client.report_result(&result).await {
            Ok(ack) if ack.success => debug!(task_id = %task_id, "Result reported"),
            Ok(ack) => warn!(task_id = %task_id, message = %ack.message, "Master did not take the result"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Result report failed"),
        }
    }

    fn progress_sink(&self) -> ProgressSink {
        let tx = self.progress_tx.clone();
        Arc::new(move |progress: TaskProgress| {
            // Closed only after shutdown.
            let _ = tx.send(progress);
        })
    }
}

/// Frees a task's slot on every exit path of `execute`.
struct SlotGuard<'a> {
    agent: &'a WorkerAgent,
    task_id: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.agent.running.lock().remove(&self.task_id);
        self.agent.settle_state();
    }
}

/// Forward progress reports in order. Failures are not retried.
async fn forward_progress(
    client: Arc<dyn MasterClient>,
    mut rx: mpsc::UnboundedReceiver<TaskProgress>,
    shutdown: CancellationToken,
) {
    loop {
        let progress = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(p) => p,
                None => break,
            },
        };
        if let Err(e) = client.report_progress(&progress).await {
            debug!(task_id = %progress.task_id, error = %e, "Progress report failed");
        }
    }
}
